use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::{info, Level};

use parley_core::UserId;
use parley_server::auth::TokenService;
use parley_server::shutdown::wait_for_signal;
use parley_server::config::data_dir;
use parley_server::{load_config, ServerConfig};
use parley_store::users::UserRepo;
use parley_store::Database;
use parley_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Real-time chat server")]
struct Cli {
    /// JSON config file (defaults to ~/.parley/config.json).
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP and websocket server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a user account. Without a password the account cannot log in.
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "PARLEY_USER_PASSWORD")]
        password: Option<String>,
    },
    /// Print a bearer token for an existing user.
    IssueToken {
        #[arg(long)]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(|| data_dir().join("config.json"));
    let mut config = load_config(Some(&config_path)).context("failed to load config")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        Command::CreateUser {
            username,
            email,
            password,
        } => {
            let repo = UserRepo::new(open_db(&config)?).with_hash_cost(config.password_hash_cost);
            let user = match password {
                Some(password) => repo.register(&username, &email, &password)?,
                None => repo.create(&username, &email)?,
            };
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        Command::IssueToken { user_id } => {
            let user_id = UserId::new(user_id);
            let db = open_db(&config)?;
            if !UserRepo::new(db).exists(user_id)? {
                bail!("user {user_id} does not exist");
            }
            config.validate()?;
            let secret = SecretString::from(config.jwt_secret.clone());
            let token = TokenService::new(&secret, config.token_ttl()).issue(user_id)?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let log_level: Level = config
        .log_level
        .parse()
        .with_context(|| format!("invalid log_level {:?}", config.log_level))?;
    let telemetry = init_telemetry(TelemetryConfig {
        log_level,
        format: config.log_format,
        ..TelemetryConfig::default()
    });
    let metrics = telemetry
        .metrics()
        .unwrap_or_else(|| Arc::new(MetricsRecorder::new()));

    let db = open_db(&config)?;
    info!(path = %db.path().display(), "database opened");

    let handle = parley_server::start(config, db, metrics)
        .await
        .context("failed to start server")?;
    info!(addr = %handle.addr, "parley ready");

    wait_for_signal().await;
    handle.shutdown().await;
    Ok(())
}

fn open_db(config: &ServerConfig) -> Result<Database> {
    Database::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))
}

use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

fn map_user(row: &rusqlite::Row<'_>) -> Result<User, StoreError> {
    let created_at: String = row_helpers::get(row, 3, "users", "created_at")?;
    Ok(User {
        id: UserId::new(row_helpers::get(row, 0, "users", "id")?),
        username: row_helpers::get(row, 1, "users", "username")?,
        email: row_helpers::get(row, 2, "users", "email")?,
        created_at: row_helpers::parse_timestamp(&created_at, "users", "created_at")?,
    })
}

/// Longest password bcrypt hashes without truncation.
pub const MAX_PASSWORD_BYTES: usize = 72;

/// A user row together with its stored bcrypt hash.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: User,
    password_hash: String,
}

impl Credentials {
    /// Check `password` against the stored hash. Accounts without a hash
    /// never match.
    pub fn verify(&self, password: &str) -> Result<bool, StoreError> {
        if self.password_hash.is_empty() {
            return Ok(false);
        }
        Ok(bcrypt::verify(password, &self.password_hash)?)
    }
}

pub struct UserRepo {
    db: Database,
    hash_cost: u32,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Override the bcrypt work factor used by [`UserRepo::register`].
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Create a user without a password. Emails are unique.
    #[instrument(skip(self))]
    pub fn create(&self, username: &str, email: &str) -> Result<User, StoreError> {
        self.insert(username, email, "")
    }

    /// Create a user with a bcrypt-hashed password. Blocks for the duration
    /// of the hash.
    #[instrument(skip(self, password))]
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<User, StoreError> {
        if password.is_empty() {
            return Err(StoreError::Invalid("password is required".into()));
        }
        if password.len() > MAX_PASSWORD_BYTES {
            return Err(StoreError::Invalid(format!(
                "password must be at most {MAX_PASSWORD_BYTES} bytes"
            )));
        }
        if self.find_by_email(email)?.is_some() {
            return Err(StoreError::Conflict("email is already registered".into()));
        }
        let hash = bcrypt::hash(password, self.hash_cost)?;
        self.insert(username, email, &hash)
    }

    fn insert(&self, username: &str, email: &str, password_hash: &str) -> Result<User, StoreError> {
        let username = username.trim();
        let email = email.trim().to_lowercase();
        if username.is_empty() || email.is_empty() {
            return Err(StoreError::Invalid("username and email are required".into()));
        }

        self.db.with_conn(|conn| {
            let created_at = row_helpers::now();
            let inserted = conn.execute(
                "INSERT INTO users (username, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    username,
                    email,
                    password_hash,
                    row_helpers::format_timestamp(&created_at)
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::Conflict("email is already registered".into()));
                }
                Err(e) => return Err(e.into()),
            }

            Ok(User {
                id: UserId::new(conn.last_insert_rowid()),
                username: username.to_owned(),
                email: email.clone(),
                created_at,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: UserId) -> Result<User, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, username, email, created_at FROM users WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            let user = rows.next()?.map(map_user).transpose()?;
            user.ok_or_else(|| StoreError::NotFound(format!("user {id}")))
        })
    }

    #[instrument(skip(self))]
    pub fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.trim().to_lowercase();
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, username, email, created_at FROM users WHERE email = ?1")?;
            let mut rows = stmt.query([&email])?;
            let user = rows.next()?.map(map_user).transpose()?;
            Ok(user)
        })
    }

    /// Look up a user and its password hash for login.
    #[instrument(skip(self))]
    pub fn find_credentials(&self, email: &str) -> Result<Option<Credentials>, StoreError> {
        let email = email.trim().to_lowercase();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, email, created_at, password_hash FROM users WHERE email = ?1",
            )?;
            let mut rows = stmt.query([&email])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let creds = Credentials {
                user: map_user(row)?,
                password_hash: row_helpers::get(row, 4, "users", "password_hash")?,
            };
            Ok(Some(creds))
        })
    }

    pub fn exists(&self, id: UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id.get()], |_| Ok(()))
                .optional()?
                .is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let user = repo.create("alice", "Alice@Example.com").unwrap();
        assert_eq!(user.email, "alice@example.com");

        let fetched = repo.get(user.id).unwrap();
        assert_eq!(fetched, user);
    }

    #[test]
    fn ids_are_assigned_sequentially() {
        let repo = repo();
        let a = repo.create("a", "a@x").unwrap();
        let b = repo.create("b", "b@x").unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn duplicate_email_conflicts() {
        let repo = repo();
        repo.create("alice", "alice@example.com").unwrap();
        let err = repo.create("alice2", "ALICE@example.com").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got: {err}");
    }

    #[test]
    fn blank_fields_are_rejected() {
        let err = repo().create("  ", "x@y").unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn missing_user_is_not_found() {
        let err = repo().get(UserId::new(404)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn register_hashes_and_verifies_password() {
        let repo = repo().with_hash_cost(4);
        let user = repo.register("dora", "Dora@Example.com", "hunter22").unwrap();
        assert_eq!(user.email, "dora@example.com");

        let creds = repo.find_credentials("dora@example.com").unwrap().unwrap();
        assert_eq!(creds.user, user);
        assert_ne!(creds.password_hash, "hunter22");
        assert!(creds.verify("hunter22").unwrap());
        assert!(!creds.verify("hunter23").unwrap());
    }

    #[test]
    fn register_rejects_taken_email_and_bad_passwords() {
        let repo = repo().with_hash_cost(4);
        repo.create("eve", "eve@example.com").unwrap();
        let err = repo.register("eve2", "EVE@example.com", "pw").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref m) if m == "email is already registered"));

        assert!(matches!(repo.register("f", "f@x", "").unwrap_err(), StoreError::Invalid(_)));
        let long = "x".repeat(MAX_PASSWORD_BYTES + 1);
        assert!(matches!(repo.register("f", "f@x", &long).unwrap_err(), StoreError::Invalid(_)));
    }

    #[test]
    fn passwordless_accounts_never_verify() {
        let repo = repo();
        repo.create("gus", "gus@x").unwrap();
        let creds = repo.find_credentials("gus@x").unwrap().unwrap();
        assert!(!creds.verify("").unwrap());
        assert!(repo.find_credentials("nobody@x").unwrap().is_none());
    }

    #[test]
    fn find_by_email_and_exists() {
        let repo = repo();
        let user = repo.create("bob", "bob@example.com").unwrap();
        assert_eq!(repo.find_by_email(" BOB@example.com ").unwrap(), Some(user.clone()));
        assert_eq!(repo.find_by_email("nobody@example.com").unwrap(), None);
        assert!(repo.exists(user.id).unwrap());
        assert!(!repo.exists(UserId::new(999)).unwrap());
    }
}

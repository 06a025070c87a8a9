use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::{ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Group => write!(f, "group"),
        }
    }
}

impl FromStr for ChatKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown chat kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ConversationId,
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

const CHAT_COLUMNS: &str = "c.id, c.kind, c.name, c.created_at";

fn map_chat(row: &rusqlite::Row<'_>) -> Result<Chat, StoreError> {
    let kind: String = row_helpers::get(row, 1, "chats", "kind")?;
    let created_at: String = row_helpers::get(row, 3, "chats", "created_at")?;
    Ok(Chat {
        id: ConversationId::new(row_helpers::get(row, 0, "chats", "id")?),
        kind: kind.parse().map_err(|detail| StoreError::CorruptRow {
            table: "chats",
            column: "kind",
            detail,
        })?,
        name: row_helpers::get(row, 2, "chats", "name")?,
        created_at: row_helpers::parse_timestamp(&created_at, "chats", "created_at")?,
    })
}

/// Membership check usable inside a caller's transaction.
pub(crate) fn is_member_in(
    conn: &Connection,
    chat_id: ConversationId,
    user_id: UserId,
) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2 LIMIT 1",
            [chat_id.get(), user_id.get()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub(crate) fn chat_exists_in(conn: &Connection, chat_id: ConversationId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM chats WHERE id = ?1", [chat_id.get()], |_| Ok(()))
        .optional()?
        .is_some())
}

fn require_user(conn: &Connection, user_id: UserId) -> Result<(), StoreError> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id.get()], |_| Ok(()))
        .optional()?;
    found.ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
}

fn insert_chat(
    conn: &Connection,
    kind: ChatKind,
    name: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<Chat, StoreError> {
    conn.execute(
        "INSERT INTO chats (kind, name, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![kind.to_string(), name, row_helpers::format_timestamp(&created_at)],
    )?;
    Ok(Chat {
        id: ConversationId::new(conn.last_insert_rowid()),
        kind,
        name: name.map(str::to_owned),
        created_at,
    })
}

fn add_member(
    conn: &Connection,
    chat_id: ConversationId,
    user_id: UserId,
    joined_at: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO chat_members (chat_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![chat_id.get(), user_id.get(), joined_at],
    )?;
    Ok(())
}

pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the private chat between two users, creating it if needed.
    #[instrument(skip(self), fields(user_id = %user_id, peer_id = %peer_id))]
    pub fn create_private(&self, user_id: UserId, peer_id: UserId) -> Result<Chat, StoreError> {
        if user_id == peer_id {
            return Err(StoreError::Invalid("cannot open a private chat with yourself".into()));
        }

        self.db.with_tx(|tx| {
            require_user(tx, user_id)?;
            require_user(tx, peer_id)?;

            let existing = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {CHAT_COLUMNS} FROM chats c
                     JOIN chat_members a ON a.chat_id = c.id AND a.user_id = ?1
                     JOIN chat_members b ON b.chat_id = c.id AND b.user_id = ?2
                     WHERE c.kind = 'private'
                     ORDER BY c.id
                     LIMIT 1"
                ))?;
                let mut rows = stmt.query([user_id.get(), peer_id.get()])?;
                let chat = rows.next()?.map(map_chat).transpose()?;
                chat
            };
            if let Some(chat) = existing {
                return Ok(chat);
            }

            let now = row_helpers::now();
            let joined_at = row_helpers::format_timestamp(&now);
            let chat = insert_chat(tx, ChatKind::Private, None, now)?;
            add_member(tx, chat.id, user_id, &joined_at)?;
            add_member(tx, chat.id, peer_id, &joined_at)?;
            Ok(chat)
        })
    }

    /// Create a group chat; the creator is always a member.
    #[instrument(skip(self, participants), fields(creator = %creator, participants = participants.len()))]
    pub fn create_group(
        &self,
        creator: UserId,
        name: &str,
        participants: &[UserId],
    ) -> Result<Chat, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("group name is required".into()));
        }

        self.db.with_tx(|tx| {
            require_user(tx, creator)?;
            for participant in participants {
                require_user(tx, *participant)?;
            }

            let now = row_helpers::now();
            let joined_at = row_helpers::format_timestamp(&now);
            let chat = insert_chat(tx, ChatKind::Group, Some(name), now)?;
            add_member(tx, chat.id, creator, &joined_at)?;
            for participant in participants {
                add_member(tx, chat.id, *participant, &joined_at)?;
            }
            Ok(chat)
        })
    }

    /// Chats the user belongs to, oldest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHAT_COLUMNS} FROM chats c
                 JOIN chat_members m ON m.chat_id = c.id
                 WHERE m.user_id = ?1
                 ORDER BY c.id"
            ))?;
            let mut rows = stmt.query([user_id.get()])?;
            let mut chats = Vec::new();
            while let Some(row) = rows.next()? {
                chats.push(map_chat(row)?);
            }
            Ok(chats)
        })
    }

    /// Conversation ids the user belongs to.
    pub fn conversation_ids(&self, user_id: UserId) -> Result<BTreeSet<ConversationId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT chat_id FROM chat_members WHERE user_id = ?1")?;
            let ids = stmt
                .query_map([user_id.get()], |row| row.get::<_, i64>(0))?
                .map(|id| id.map(ConversationId::new))
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn is_member(&self, chat_id: ConversationId, user_id: UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| is_member_in(conn, chat_id, user_id))
    }

    pub fn members(&self, chat_id: ConversationId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY user_id")?;
            let ids = stmt
                .query_map([chat_id.get()], |row| row.get::<_, i64>(0))?
                .map(|id| id.map(UserId::new))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    struct Fixture {
        chats: ChatRepo,
        alice: UserId,
        bob: UserId,
        carol: UserId,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        Fixture {
            alice: users.create("alice", "alice@x").unwrap().id,
            bob: users.create("bob", "bob@x").unwrap().id,
            carol: users.create("carol", "carol@x").unwrap().id,
            chats: ChatRepo::new(db),
        }
    }

    #[test]
    fn chat_kind_display_and_parse() {
        assert_eq!(ChatKind::Private.to_string(), "private");
        assert_eq!("group".parse::<ChatKind>().unwrap(), ChatKind::Group);
        assert!("channel".parse::<ChatKind>().is_err());
    }

    #[test]
    fn private_chat_adds_both_members() {
        let f = fixture();
        let chat = f.chats.create_private(f.alice, f.bob).unwrap();
        assert_eq!(chat.kind, ChatKind::Private);
        assert_eq!(f.chats.members(chat.id).unwrap(), vec![f.alice, f.bob]);
    }

    #[test]
    fn private_chat_is_reused_in_either_direction() {
        let f = fixture();
        let first = f.chats.create_private(f.alice, f.bob).unwrap();
        let again = f.chats.create_private(f.bob, f.alice).unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(f.chats.list_for_user(f.alice).unwrap().len(), 1);
    }

    #[test]
    fn private_chat_with_self_is_invalid() {
        let f = fixture();
        let err = f.chats.create_private(f.alice, f.alice).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn private_chat_with_unknown_user_is_not_found() {
        let f = fixture();
        let err = f.chats.create_private(f.alice, UserId::new(99)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(f.chats.list_for_user(f.alice).unwrap().is_empty());
    }

    #[test]
    fn group_chat_includes_creator_once() {
        let f = fixture();
        let chat = f
            .chats
            .create_group(f.alice, " team ", &[f.bob, f.carol, f.alice])
            .unwrap();
        assert_eq!(chat.name.as_deref(), Some("team"));
        assert_eq!(f.chats.members(chat.id).unwrap(), vec![f.alice, f.bob, f.carol]);
    }

    #[test]
    fn group_chat_requires_name_and_known_participants() {
        let f = fixture();
        assert!(matches!(
            f.chats.create_group(f.alice, "  ", &[f.bob]).unwrap_err(),
            StoreError::Invalid(_)
        ));
        assert!(matches!(
            f.chats.create_group(f.alice, "x", &[UserId::new(77)]).unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(f.chats.list_for_user(f.alice).unwrap().is_empty());
    }

    #[test]
    fn membership_queries() {
        let f = fixture();
        let private = f.chats.create_private(f.alice, f.bob).unwrap();
        let group = f.chats.create_group(f.bob, "g", &[f.carol]).unwrap();

        assert!(f.chats.is_member(private.id, f.alice).unwrap());
        assert!(!f.chats.is_member(private.id, f.carol).unwrap());

        let bob_convs = f.chats.conversation_ids(f.bob).unwrap();
        assert_eq!(bob_convs, [private.id, group.id].into_iter().collect());
        assert_eq!(
            f.chats.list_for_user(f.carol).unwrap().iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![group.id]
        );
    }

    #[test]
    fn chat_serializes_without_empty_name() {
        let f = fixture();
        let chat = f.chats.create_private(f.alice, f.bob).unwrap();
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["kind"], "private");
        assert!(json.get("name").is_none());
    }
}

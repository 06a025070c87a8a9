use tracing::instrument;

use parley_core::{ConversationId, Message, MessageId, UserId};

use crate::chats::{chat_exists_in, is_member_in};
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

fn map_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let created_at: String = row_helpers::get(row, 4, "messages", "created_at")?;
    Ok(Message {
        id: MessageId::new(row_helpers::get(row, 0, "messages", "id")?),
        conversation_id: ConversationId::new(row_helpers::get(row, 1, "messages", "chat_id")?),
        sender_id: UserId::new(row_helpers::get(row, 2, "messages", "sender_id")?),
        content: row_helpers::get(row, 3, "messages", "content")?,
        created_at: row_helpers::parse_timestamp(&created_at, "messages", "created_at")?,
    })
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message. Membership is checked in the same transaction as the
    /// insert.
    #[instrument(skip(self, content), fields(conversation_id = %conversation_id, sender_id = %sender_id))]
    pub fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::Invalid("content must not be empty".into()));
        }

        self.db.with_tx(|tx| {
            if !chat_exists_in(tx, conversation_id)? {
                return Err(StoreError::NotFound(format!("chat {conversation_id}")));
            }
            if !is_member_in(tx, conversation_id, sender_id)? {
                return Err(StoreError::Forbidden);
            }

            let created_at = row_helpers::now();
            tx.execute(
                "INSERT INTO messages (chat_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    conversation_id.get(),
                    sender_id.get(),
                    content,
                    row_helpers::format_timestamp(&created_at)
                ],
            )?;

            Ok(Message {
                id: MessageId::new(tx.last_insert_rowid()),
                conversation_id,
                sender_id,
                content: content.to_owned(),
                created_at,
            })
        })
    }

    /// Page of a conversation's history, newest first.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, requester = %requester))]
    pub fn list(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            if !is_member_in(conn, conversation_id, requester)? {
                return Err(StoreError::Forbidden);
            }

            let mut stmt = conn.prepare(
                "SELECT id, chat_id, sender_id, content, created_at FROM messages
                 WHERE chat_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.get(), limit, offset])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                messages.push(map_message(row)?);
            }
            Ok(messages)
        })
    }

    #[cfg(test)]
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, sender_id, content, created_at FROM messages WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.get()])?;
            let message = rows.next()?.map(map_message).transpose()?;
            message.ok_or_else(|| StoreError::NotFound(format!("message {id}")))
        })
    }
}

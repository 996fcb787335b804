//! General and regional chat rooms.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::vibecheck::VibeCheck;
use crate::vibecheck::error::{Result, VibeCheckError};
use crate::vibecheck::places::Region;
use crate::vibecheck::session::{ANONYMOUS_NAME, Session};
use crate::vibecheck::snapshot_aggregator::{RawRecord, SkipReason, ViewSubscription, parse_record};

/// How many of the most recent messages a room shows.
pub const CHAT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatRoom {
    General,
    Regional { state: String, city: String },
}

impl ChatRoom {
    pub fn regional(region: &Region) -> Self {
        ChatRoom::Regional {
            state: region.state.clone(),
            city: region.city.clone(),
        }
    }

    pub fn path(&self) -> String {
        match self {
            ChatRoom::General => "generalChat".to_string(),
            ChatRoom::Regional { state, city } => format!("regionalChats/{}/{}", state, city),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAuthor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub created_at: i64,
    pub author: ChatAuthor,
}

impl ChatMessage {
    pub fn is_from(&self, session: &Session) -> bool {
        self.author.id == session.user_id
    }
}

/// The latest `limit` valid messages of a room, oldest first.
///
/// Messages need text, a creation time and an author id.
pub fn materialize_messages(tree: &Value, limit: usize) -> Vec<ChatMessage> {
    let Some(records) = tree.as_object() else {
        return Vec::new();
    };

    let mut messages: Vec<ChatMessage> = records
        .iter()
        .filter_map(|(id, value)| match parse_message(id, value) {
            Ok((record, text)) => {
                let name = record
                    .owner
                    .and_then(|owner| owner.name)
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| ANONYMOUS_NAME.to_string());
                Some(ChatMessage {
                    id: record.id,
                    text,
                    created_at: record.created_at,
                    author: ChatAuthor {
                        id: record.owner_id,
                        name,
                    },
                })
            }
            Err(reason) => {
                tracing::debug!(
                    target: "vibecheck::chat::materialize_messages",
                    message = %id,
                    ?reason,
                    "Skipping message"
                );
                None
            }
        })
        .collect();

    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let excess = messages.len().saturating_sub(limit);
    messages.drain(..excess);
    messages
}

/// Chat records must carry text; a media payload is rejected here.
fn parse_message(id: &str, value: &Value) -> std::result::Result<(RawRecord, String), SkipReason> {
    let record = parse_record(id, None, value)?;
    let text = record
        .text()
        .map(String::from)
        .ok_or_else(|| SkipReason::InvalidField("text".to_string()))?;
    Ok((record, text))
}

/// A message about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    text: String,
}

impl OutgoingMessage {
    /// Trims `text`; blank input is refused.
    pub fn new(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VibeCheckError::InvalidInput(
                "Message text is empty".to_string(),
            ));
        }
        Ok(Self {
            text: text.to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn to_record(&self, author: &Session, created_at: i64) -> Value {
        json!({
            "text": self.text,
            "createdAt": created_at,
            "user": {
                "_id": author.user_id,
                "name": author.display_name(),
            },
        })
    }
}

impl VibeCheck {
    /// Sends `text` to `room` as `session`'s user. Returns the message key.
    pub async fn send_message(&self, session: &Session, room: &ChatRoom, text: &str) -> Result<String> {
        session.signed_in_user()?;
        let message = OutgoingMessage::new(text)?;
        let path = room.path();
        let key = self
            .writer()
            .push(&path, message.to_record(session, self.now_ms()))
            .await?;

        tracing::debug!(
            target: "vibecheck::chat::send_message",
            room = %path,
            message = %key,
            "Message sent"
        );
        Ok(key)
    }

    /// Live history of `room`, oldest message first.
    pub fn subscribe_chat(&self, room: &ChatRoom) -> ViewSubscription<Vec<ChatMessage>> {
        self.chat_rooms.subscribe(
            &room.path(),
            Arc::new(|tree: &Value, _now: i64| materialize_messages(tree, CHAT_HISTORY_LIMIT)),
        )
    }
}

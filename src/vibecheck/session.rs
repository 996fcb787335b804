use serde::{Deserialize, Serialize};

use crate::vibecheck::error::{Result, VibeCheckError};
use crate::vibecheck::places::Region;

/// Name shown for users who never filled in their profile.
pub const ANONYMOUS_NAME: &str = "Usuário Anônimo";

/// The signed-in user, passed explicitly to every operation that needs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,

    #[serde(default)]
    pub full_name: Option<String>,

    #[serde(default)]
    pub avatar: Option<String>,

    #[serde(default)]
    pub location: Option<Region>,
}

impl Session {
    /// Builds a session for `email`, deriving the database-safe user id.
    pub fn for_email(email: &str) -> Self {
        Self {
            user_id: user_id_from_email(email),
            full_name: None,
            avatar: None,
            location: None,
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn with_location(mut self, location: Region) -> Self {
        self.location = Some(location);
        self
    }

    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(ANONYMOUS_NAME)
    }

    pub fn avatar(&self) -> Option<&str> {
        self.avatar.as_deref().filter(|avatar| !avatar.is_empty())
    }

    /// The user id to write under; a blank id means nobody is signed in.
    pub fn signed_in_user(&self) -> Result<&str> {
        let user_id = self.user_id.trim();
        if user_id.is_empty() {
            return Err(VibeCheckError::NotAuthenticated);
        }
        Ok(user_id)
    }
}

/// Database keys cannot contain `. # $ [ /`; those become `,`.
pub fn user_id_from_email(email: &str) -> String {
    email
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '.' | '#' | '$' | '[' | '/' => ',',
            other => other,
        })
        .collect()
}

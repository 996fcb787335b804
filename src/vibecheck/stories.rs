//! Ephemeral photo stories.

use serde_json::{Value, json};

use crate::vibecheck::VibeCheck;
use crate::vibecheck::error::Result;
use crate::vibecheck::session::Session;
use crate::vibecheck::snapshot_aggregator::{ViewModel, ViewSubscription};

pub const STORIES_PATH: &str = "stories";

/// Stories disappear from every view this long after they are posted.
pub const STORY_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Bucket holding the stories of `user_id`.
pub fn story_bucket(user_id: &str) -> String {
    format!("{}/{}", STORIES_PATH, user_id)
}

/// A story about to be written under the author's bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryDraft {
    pub media_url: String,
    pub created_at: i64,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar: Option<String>,
}

impl StoryDraft {
    pub fn new(author: &Session, media_url: impl Into<String>, created_at: i64) -> Self {
        Self {
            media_url: media_url.into(),
            created_at,
            author_id: author.user_id.clone(),
            author_name: author.display_name().to_string(),
            author_avatar: author.avatar().map(String::from),
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.created_at + STORY_TTL_MS
    }

    pub fn bucket(&self) -> String {
        story_bucket(&self.author_id)
    }

    pub fn to_record(&self) -> Value {
        json!({
            "mediaUrl": self.media_url,
            "mediaType": "image",
            "timestamp": self.created_at,
            "createdAt": self.created_at,
            "expiresAt": self.expires_at(),
            "user": {
                "_id": self.author_id,
                "name": self.author_name,
                "avatar": self.author_avatar,
            },
        })
    }
}

impl VibeCheck {
    /// Uploads `image` and posts it as a story of `session`'s user.
    ///
    /// Returns the key of the new story.
    pub async fn post_story(
        &self,
        session: &Session,
        image: Vec<u8>,
        mime_type: &str,
    ) -> Result<String> {
        session.signed_in_user()?;
        let media_url = self.uploader()?.upload_image(image, mime_type).await?;
        let draft = StoryDraft::new(session, media_url, self.now_ms());
        let key = self.writer().push(&draft.bucket(), draft.to_record()).await?;

        tracing::info!(
            target: "vibecheck::stories::post_story",
            user = %session.user_id,
            story = %key,
            "Story posted"
        );
        Ok(key)
    }

    /// Live story bar for `viewer`. Without a session the view stays empty.
    pub fn subscribe_stories(&self, viewer: Option<&Session>) -> ViewSubscription<ViewModel> {
        self.stories.subscribe(
            viewer.map(|session| session.user_id.as_str()),
            viewer.and_then(Session::avatar),
        )
    }
}

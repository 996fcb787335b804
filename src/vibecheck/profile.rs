//! Profile fields the user edits from the app: home region and avatar.

use serde_json::{Map, Value};

use crate::vibecheck::VibeCheck;
use crate::vibecheck::error::Result;
use crate::vibecheck::places::Region;
use crate::vibecheck::session::Session;

pub const USERS_PATH: &str = "users";

pub fn user_path(user_id: &str) -> String {
    format!("{}/{}", USERS_PATH, user_id)
}

impl VibeCheck {
    /// Stores `region` as the user's location and returns the session to use
    /// from now on.
    pub async fn set_location(&self, session: &Session, region: Region) -> Result<Session> {
        let user_id = session.signed_in_user()?;

        let mut updates = Map::new();
        updates.insert(
            format!("{}/location", user_path(user_id)),
            serde_json::to_value(&region)?,
        );
        self.writer().update(updates).await?;

        tracing::info!(
            target: "vibecheck::profile::set_location",
            user = %user_id,
            city = %region.city,
            state = %region.state,
            "Location updated"
        );
        Ok(session.clone().with_location(region))
    }

    /// Uploads a new avatar and points the profile at it.
    pub async fn update_avatar(
        &self,
        session: &Session,
        image: Vec<u8>,
        mime_type: &str,
    ) -> Result<Session> {
        let user_id = session.signed_in_user()?;
        let avatar = self.uploader()?.upload_image(image, mime_type).await?;

        let mut updates = Map::new();
        updates.insert(
            format!("{}/avatar", user_path(user_id)),
            Value::String(avatar.clone()),
        );
        self.writer().update(updates).await?;

        tracing::info!(
            target: "vibecheck::profile::update_avatar",
            user = %user_id,
            "Avatar updated"
        );
        Ok(session.clone().with_avatar(avatar))
    }
}

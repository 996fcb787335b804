//! Story image hosting.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::vibecheck::error::VibeCheckError;

const DEFAULT_API_BASE: &str = "https://api.cloudinary.com";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Upload response carried no URL")]
    MissingUrl,

    #[error("Refusing to upload an empty file")]
    EmptyFile,
}

/// Hosts an image and returns its public URL.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload_image(&self, data: Vec<u8>, mime_type: &str) -> Result<String, UploadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub upload_preset: String,
    pub api_base: String,
}

impl CloudinaryConfig {
    pub fn new(cloud_name: impl Into<String>, upload_preset: impl Into<String>) -> Self {
        Self {
            cloud_name: cloud_name.into(),
            upload_preset: upload_preset.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Reads `CLOUDINARY_CLOUD_NAME`, `CLOUDINARY_UPLOAD_PRESET` and the
    /// optional `CLOUDINARY_API_BASE`, loading `.env` first if present.
    pub fn from_env() -> Result<Self, VibeCheckError> {
        dotenvy::dotenv().ok();

        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .ok_or_else(|| VibeCheckError::Configuration(format!("{} is not set", name)))
        };

        let mut config = Self::new(
            required("CLOUDINARY_CLOUD_NAME")?,
            required("CLOUDINARY_UPLOAD_PRESET")?,
        );
        if let Ok(api_base) = std::env::var("CLOUDINARY_API_BASE") {
            config.api_base = api_base;
        }
        Ok(config)
    }

    pub fn upload_url(&self) -> String {
        format!(
            "{}/v1_1/{}/image/upload",
            self.api_base.trim_end_matches('/'),
            self.cloud_name
        )
    }
}

/// Unsigned uploads to Cloudinary.
#[derive(Debug, Clone)]
pub struct CloudinaryUploader {
    config: CloudinaryConfig,
    client: reqwest::Client,
}

impl CloudinaryUploader {
    pub fn new(config: CloudinaryConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &CloudinaryConfig {
        &self.config
    }
}

#[async_trait]
impl MediaUploader for CloudinaryUploader {
    async fn upload_image(&self, data: Vec<u8>, mime_type: &str) -> Result<String, UploadError> {
        if data.is_empty() {
            return Err(UploadError::EmptyFile);
        }

        let size = data.len();
        let file = Part::bytes(data)
            .file_name(format!("story_{}.jpg", uuid::Uuid::new_v4()))
            .mime_str(mime_type)?;
        let form = Form::new()
            .part("file", file)
            .text("upload_preset", self.config.upload_preset.clone());

        tracing::debug!(
            target: "vibecheck::media_upload::upload_image",
            size,
            mime_type,
            "Uploading image"
        );

        let response = self
            .client
            .post(self.config.upload_url())
            .header(reqwest::header::ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("Failed to upload image")
                .to_string();
            tracing::warn!(
                target: "vibecheck::media_upload::upload_image",
                status = status.as_u16(),
                "Upload rejected: {}",
                message
            );
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        ["secure_url", "url"]
            .iter()
            .find_map(|field| body.get(*field).and_then(Value::as_str))
            .filter(|url| !url.is_empty())
            .map(String::from)
            .ok_or(UploadError::MissingUrl)
    }
}

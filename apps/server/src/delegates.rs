//! Standalone-server implementations of the core's delegate traits.
//!
//! Deployments embedding the core behind a database or control plane supply
//! their own; the headless server authenticates against a static key table
//! from its config file and stores thumbnails on disk.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use lucent_core::ftl::auth::verify_digest;
use lucent_core::{AuthError, ChannelAuth, IngestAuth, ThumbnailSink};

use crate::config::ChannelKeyConfig;

/// Authenticates publishers against the configured channel key table.
pub struct StaticKeyAuth {
    channels: HashMap<String, ChannelKeyConfig>,
}

impl StaticKeyAuth {
    pub fn new(channels: impl IntoIterator<Item = ChannelKeyConfig>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        }
    }
}

#[async_trait]
impl IngestAuth for StaticKeyAuth {
    async fn check_user(
        &self,
        channel_id: &str,
        nonce: &[u8],
        digest: &[u8],
    ) -> Result<ChannelAuth, AuthError> {
        let entry = self
            .channels
            .get(channel_id)
            .ok_or(AuthError::UnknownChannel)?;
        if !verify_digest(entry.key.as_bytes(), nonce, digest) {
            return Err(AuthError::DigestMismatch);
        }
        Ok(ChannelAuth {
            channel_id: entry.id.clone(),
            name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
            user_id: entry.id.clone(),
        })
    }
}

/// Writes thumbnails as JPEG files under `{work_dir}/thumbs`.
pub struct FileThumbs {
    dir: PathBuf,
}

impl FileThumbs {
    pub async fn new(work_dir: &std::path::Path) -> std::io::Result<Self> {
        let dir = work_dir.join("thumbs");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl ThumbnailSink for FileThumbs {
    async fn put(
        &self,
        channel: &str,
        jpeg: Bytes,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Channel names key the map; keep the filename boring and safe.
        let safe: String = channel
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self.dir.join(format!("{safe}.jpg"));
        tokio::fs::write(&path, &jpeg).await?;
        log::debug!("[thumbs] wrote {} ({} bytes)", path.display(), jpeg.len());
        Ok(())
    }
}

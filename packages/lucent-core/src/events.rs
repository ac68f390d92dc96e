//! Publish lifecycle notifications.
//!
//! The ingest manager reports stream starts, stops, and thumbnail updates
//! through [`PublishEvents`] without knowing how they are delivered
//! (websocket broadcast, webhook, UI frontend).

use crate::ftl::ChannelAuth;
use crate::ingest::grabber::ThumbEvent;

/// Delegate for out-of-band liveness notifications.
pub trait PublishEvents: Send + Sync {
    /// Called when a publish starts (`live` = true, no thumbnail), on every
    /// thumbnail update (`live` = true), and when it stops (`live` = false).
    fn publish_event(&self, auth: &ChannelAuth, live: bool, thumb: Option<&ThumbEvent>);
}

/// Discards all events; used by tests and minimal deployments.
pub struct NoopPublishEvents;

impl PublishEvents for NoopPublishEvents {
    fn publish_event(&self, _auth: &ChannelAuth, _live: bool, _thumb: Option<&ThumbEvent>) {}
}

/// Logs events at info level.
pub struct LogPublishEvents;

impl PublishEvents for LogPublishEvents {
    fn publish_event(&self, auth: &ChannelAuth, live: bool, thumb: Option<&ThumbEvent>) {
        match (live, thumb) {
            (true, None) => log::info!("[event] {} went live", auth.name),
            (true, Some(t)) => {
                log::info!("[event] {} thumbnail updated (bframes={})", auth.name, t.has_bframes);
            }
            (false, _) => log::info!("[event] {} went offline", auth.name),
        }
    }
}

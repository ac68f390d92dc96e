//! Core configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::QueueConfig;
use crate::web::PublishMode;

/// Configuration for the ingest and fan-out pipeline.
///
/// All fields have working defaults; deployments override what they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Opus encode bitrate for converted audio, bits per second.
    pub opus_bitrate: i32,

    /// Scratch directory (thumbnails, transient publisher state).
    pub work_dir: PathBuf,

    /// Which renditions the web publisher maintains.
    pub publish_mode: PublishMode,

    /// UDP bind address for FTL RTP ingest.
    pub rtp_listen_addr: SocketAddr,

    /// Port reported to publishers in the go-live response; 0 means the
    /// actually bound port.
    pub rtp_advertise_port: u16,

    /// Thumbnail cadence, seconds.
    pub grab_interval_secs: u64,

    /// How long a web publisher lingers after its channel goes offline,
    /// seconds.
    pub web_expiry_secs: u64,

    /// Packet-queue history retained behind the most recent keyframe,
    /// seconds.
    pub queue_retention_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            opus_bitrate: 128_000,
            work_dir: std::env::temp_dir().join("lucent"),
            publish_mode: PublishMode::default(),
            rtp_listen_addr: "0.0.0.0:8085"
                .parse()
                .expect("static socket address parses"),
            rtp_advertise_port: 0,
            grab_interval_secs: 10,
            web_expiry_secs: 60,
            queue_retention_secs: 8,
        }
    }
}

impl Config {
    #[must_use]
    pub fn grab_interval(&self) -> Duration {
        Duration::from_secs(self.grab_interval_secs)
    }

    #[must_use]
    pub fn web_expiry(&self) -> Duration {
        Duration::from_secs(self.web_expiry_secs)
    }

    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retention: Duration::from_secs(self.queue_retention_secs),
            ..QueueConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.opus_bitrate, 128_000);
        assert_eq!(c.grab_interval(), Duration::from_secs(10));
        assert_eq!(c.web_expiry(), Duration::from_secs(60));
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let c: Config = serde_json::from_str(r#"{"opus_bitrate": 96000}"#).unwrap();
        assert_eq!(c.opus_bitrate, 96_000);
        assert_eq!(c.web_expiry_secs, 60);
    }
}

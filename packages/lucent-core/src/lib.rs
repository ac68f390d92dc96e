//! Lucent Core - live-video ingest and fan-out.
//!
//! This crate accepts one inbound video+audio stream per named channel,
//! demuxes it into packetized elementary streams, and fans the packets out
//! to many concurrent subscribers while producing preview thumbnails and
//! liveness notifications.
//!
//! # Architecture
//!
//! - [`media`]: packet model, timebase math, and the bounded multi-reader
//!   packet queue every publish fans out through
//! - [`h264`]: the small slice of H.264 bitstream handling the pipeline needs
//! - [`ftl`]: FTL ingest (text handshake over TCP, RTP over UDP, deframing)
//! - [`ingest`]: the per-channel publish pipeline, thumbnail grabber, Opus
//!   conversion, and the channel map
//! - [`web`]: the in-memory chunked publisher for browser playback
//! - [`api`]: the HTTP playback surface
//! - [`events`]: publish lifecycle notification seam
//! - [`error`]: API-facing error mapping
//!
//! # Delegates
//!
//! Pieces owned by the embedding application plug in through traits:
//! [`ftl::IngestAuth`] (credential checks), [`ingest::ThumbnailSink`]
//! (thumbnail persistence), and [`events::PublishEvents`] (liveness
//! notifications).

#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod events;
pub mod ftl;
pub mod h264;
pub mod ingest;
pub mod media;
pub mod state;
pub mod web;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use error::{LucentError, LucentResult};
pub use events::{LogPublishEvents, NoopPublishEvents, PublishEvents};
pub use ftl::{AuthError, ChannelAuth, FtlServer, IngestAuth, RtpDispatcher};
pub use ingest::{ChannelInfo, IngestError, Liveness, Manager, ThumbEvent, ThumbnailSink};
pub use media::{Packet, PacketQueue, QueueConfig, StreamDescriptor};
pub use state::Config;
pub use web::PublishMode;

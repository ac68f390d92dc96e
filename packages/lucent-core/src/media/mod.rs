//! Media data model: packets, stream descriptors, and the queue fabric.
//!
//! Everything downstream of an ingest source speaks in terms of [`Packet`]
//! and [`StreamDescriptor`]: a source demuxes its wire format into packets,
//! the per-channel [`queue::PacketQueue`] fans them out, and subscribers
//! consume them through [`demux::Demuxer`] cursors.

pub mod aac;
pub mod demux;
pub mod queue;
pub mod timebase;

pub use demux::{DemuxError, DemuxEvent, Demuxer};
pub use queue::{Cursor, CursorEvent, PacketQueue, QueueConfig, QueueError};

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single demuxed media packet.
///
/// Packets are immutable once created. `pts` is monotonically non-decreasing
/// per stream after ingest; `cts` is the composition-time offset (always zero
/// for audio).
#[derive(Debug, Clone)]
pub struct Packet {
    /// Index into the queue header identifying the elementary stream.
    pub stream: usize,
    /// Presentation timestamp, relative to the start of the publish.
    pub pts: Duration,
    /// Composition-time offset (decode-to-presentation delay).
    pub cts: Duration,
    /// Whether this packet can be decoded without prior packets (IDR for H.264).
    pub is_key: bool,
    /// Encoded payload. H.264 packets carry AVCC framing.
    pub data: Bytes,
}

/// Video codec identifiers understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

/// Audio codec identifiers understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl AudioCodec {
    /// Returns the codec as a short string identifier (e.g., "aac", "opus").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "opus",
        }
    }
}

/// Parameters of a video elementary stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Sequence parameter set, raw NAL without framing.
    pub sps: Bytes,
    /// Picture parameter set, raw NAL without framing.
    pub pps: Bytes,
}

/// Parameters of an audio elementary stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDescriptor {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
    /// Decoder-specific configuration (AudioSpecificConfig for AAC, empty
    /// for Opus).
    pub config: Bytes,
}

/// Per-stream codec parameters, published once as the queue header.
///
/// A closed sum: consumers match exhaustively instead of downcasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamDescriptor {
    Video(VideoDescriptor),
    Audio(AudioDescriptor),
}

impl StreamDescriptor {
    /// Standard Opus output descriptor: 48 kHz stereo, no extra config.
    #[must_use]
    pub fn opus(channels: u8) -> Self {
        Self::Audio(AudioDescriptor {
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channels,
            config: Bytes::new(),
        })
    }

    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(self, Self::Video(_))
    }

    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self, Self::Audio(_))
    }

    /// The audio codec, if this is an audio stream.
    #[must_use]
    pub fn audio_codec(&self) -> Option<AudioCodec> {
        match self {
            Self::Audio(a) => Some(a.codec),
            Self::Video(_) => None,
        }
    }
}

/// Returns the index of the first video stream, if any.
#[must_use]
pub fn video_index(streams: &[StreamDescriptor]) -> Option<usize> {
    streams.iter().position(StreamDescriptor::is_video)
}

/// Returns the index and codec of the first audio stream, if any.
#[must_use]
pub fn audio_stream(streams: &[StreamDescriptor]) -> Option<(usize, AudioCodec)> {
    streams.iter().enumerate().find_map(|(i, s)| match s {
        StreamDescriptor::Audio(a) => Some((i, a.codec)),
        StreamDescriptor::Video(_) => None,
    })
}

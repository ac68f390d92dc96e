//! The demuxer seam between ingest sources, queues, and subscribers.
//!
//! Every packet consumer programs against [`Demuxer`]: ingest sources (the
//! FTL RTP reader) implement it over their wire format, and queue cursors
//! implement it so derived pipelines and subscribers can be fed from a queue
//! without knowing where the packets come from.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::queue::{Cursor, CursorEvent, QueueError};
use super::{Packet, StreamDescriptor};

/// Errors surfaced while demuxing a source.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The source produced bytes that do not parse as its wire format.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The source did not produce codec parameters in time.
    #[error("timed out waiting for codec data")]
    CodecDataTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One step of a demuxed sequence.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    Packet(Arc<Packet>),
    /// The reader fell behind and was resynchronized; downstream muxer state
    /// must be reset from the next keyframe.
    Discontinuity,
    /// The source is exhausted.
    End,
}

/// An ordered source of media packets with a stream header.
///
/// `streams` must be awaited once before `read`; implementations may use it
/// to drive codec-parameter discovery.
#[async_trait]
pub trait Demuxer: Send {
    async fn streams(&mut self) -> Result<Arc<[StreamDescriptor]>, DemuxError>;

    async fn read(&mut self) -> Result<DemuxEvent, DemuxError>;
}

#[async_trait]
impl Demuxer for Cursor {
    async fn streams(&mut self) -> Result<Arc<[StreamDescriptor]>, DemuxError> {
        Ok(Cursor::streams(self).await?)
    }

    async fn read(&mut self) -> Result<DemuxEvent, DemuxError> {
        Ok(match Cursor::read(self).await {
            CursorEvent::Packet(p) => DemuxEvent::Packet(p),
            CursorEvent::Discontinuity => DemuxEvent::Discontinuity,
            CursorEvent::End => DemuxEvent::End,
        })
    }
}

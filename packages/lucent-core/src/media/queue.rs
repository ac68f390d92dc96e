//! Bounded single-writer, multi-reader packet queue.
//!
//! A [`PacketQueue`] is the fan-out point of one publish: the ingest task
//! writes packets, and any number of cursors tail them independently. Writers
//! never block on readers; a reader that falls behind the retention window is
//! skipped forward to the most recent keyframe and told so through an
//! explicit [`CursorEvent::Discontinuity`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use super::{Packet, StreamDescriptor};

/// Errors produced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `write_header` was called twice.
    #[error("stream header already written")]
    HeaderAlreadyWritten,

    /// `write_header` was called with no streams.
    #[error("stream header must describe at least one stream")]
    EmptyHeader,

    /// `write_packet` was called before `write_header`.
    #[error("packet written before stream header")]
    HeaderMissing,

    /// A cursor waited for the header past the configured timeout.
    #[error("timed out waiting for stream header")]
    HeaderTimeout,

    /// The queue closed before a header was ever written.
    #[error("queue closed before stream header was written")]
    ClosedBeforeHeader,
}

/// Tuning knobs for a [`PacketQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How much history to retain behind the most recent keyframe.
    pub retention: Duration,
    /// How long `Cursor::streams` waits for the header before failing.
    pub header_timeout: Duration,
    /// Hard cap on buffered packets, for sources that never produce a
    /// keyframe. Retention normally bounds the buffer well below this.
    pub max_packets: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(8),
            header_timeout: Duration::from_secs(10),
            max_packets: 4096,
        }
    }
}

/// What a cursor observed next.
#[derive(Debug, Clone)]
pub enum CursorEvent {
    /// The next packet in order.
    Packet(Arc<Packet>),
    /// The cursor fell behind the retention window and was skipped forward
    /// to the most recent keyframe. Downstream muxers must reset.
    Discontinuity,
    /// The queue is closed and fully drained.
    End,
}

struct State {
    header: Option<Arc<[StreamDescriptor]>>,
    /// Index of the first video stream in the header, if any.
    video: Option<usize>,
    /// Absolute sequence number of `buf[0]`.
    base: u64,
    buf: VecDeque<Arc<Packet>>,
    /// Absolute sequence number of the newest retained video keyframe.
    last_key: Option<u64>,
    closed: bool,
}

impl State {
    fn end(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    fn at(&self, seq: u64) -> &Arc<Packet> {
        &self.buf[(seq - self.base) as usize]
    }
}

struct Shared {
    state: Mutex<State>,
    /// Bumped on every mutation; cursors wait on it instead of polling.
    version: watch::Sender<u64>,
    config: QueueConfig,
}

impl Shared {
    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Handle to a packet queue. Cloning shares the same underlying queue.
#[derive(Clone)]
pub struct PacketQueue {
    shared: Arc<Shared>,
}

impl PacketQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    header: None,
                    video: None,
                    base: 0,
                    buf: VecDeque::new(),
                    last_key: None,
                    closed: false,
                }),
                version,
                config,
            }),
        }
    }

    /// Whether two handles refer to the same underlying queue.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Publishes the stream header. Must be called exactly once, before any
    /// packet is written.
    pub fn write_header(&self, streams: Vec<StreamDescriptor>) -> Result<(), QueueError> {
        if streams.is_empty() {
            return Err(QueueError::EmptyHeader);
        }
        {
            let mut st = self.shared.state.lock();
            if st.header.is_some() {
                return Err(QueueError::HeaderAlreadyWritten);
            }
            st.video = super::video_index(&streams);
            st.header = Some(streams.into());
        }
        self.shared.bump();
        Ok(())
    }

    /// Appends a packet. Never blocks; writing to a closed queue is a no-op.
    pub fn write_packet(&self, pkt: impl Into<Arc<Packet>>) -> Result<(), QueueError> {
        let pkt = pkt.into();
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Ok(());
            }
            if st.header.is_none() {
                return Err(QueueError::HeaderMissing);
            }
            if pkt.is_key && Some(pkt.stream) == st.video {
                st.last_key = Some(st.end());
            }
            let newest_pts = pkt.pts;
            st.buf.push_back(pkt);
            self.evict(&mut st, newest_pts);
        }
        self.shared.bump();
        Ok(())
    }

    /// Drops packets outside the retention window.
    ///
    /// Everything from the most recent video keyframe onward is kept, plus
    /// `retention` worth of history before it. Audio-only queues retain by
    /// duration alone.
    fn evict(&self, st: &mut State, newest_pts: Duration) {
        let retention = self.shared.config.retention;
        loop {
            let Some(front) = st.buf.front() else { break };
            let aged = newest_pts.saturating_sub(front.pts) > retention;
            let over_cap = st.buf.len() > self.shared.config.max_packets;
            let evictable = match (st.video, st.last_key) {
                // Never evict the newest keyframe or anything after it.
                (Some(_), Some(lk)) => st.base < lk && (aged || over_cap),
                // No keyframe yet: only the hard cap applies.
                (Some(_), None) => over_cap,
                (None, _) => aged || over_cap,
            };
            if !evictable {
                break;
            }
            st.buf.pop_front();
            st.base += 1;
        }
    }

    /// Closes the queue. Idempotent. Readers drain the remaining packets and
    /// then observe [`CursorEvent::End`].
    pub fn close(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.shared.bump();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Resolves once the queue has been closed.
    pub async fn closed(&self) {
        let mut version = self.shared.version.subscribe();
        loop {
            if self.shared.state.lock().closed {
                return;
            }
            if version.changed().await.is_err() {
                return;
            }
        }
    }

    /// A cursor positioned at the most recent keyframe, or waiting for the
    /// next one to arrive if none is retained yet. Queues without a video
    /// stream start at the live edge.
    #[must_use]
    pub fn latest(&self) -> Cursor {
        let st = self.shared.state.lock();
        let (next, await_key) = match (st.video, st.last_key) {
            (Some(_), Some(lk)) => (lk, false),
            (Some(_), None) => (st.end(), true),
            (None, _) => (st.end(), false),
        };
        self.cursor(next, await_key)
    }

    /// A cursor positioned at the oldest retained packet.
    #[must_use]
    pub fn oldest(&self) -> Cursor {
        let next = self.shared.state.lock().base;
        self.cursor(next, false)
    }

    fn cursor(&self, next: u64, await_key: bool) -> Cursor {
        Cursor {
            shared: self.shared.clone(),
            version: self.shared.version.subscribe(),
            next,
            await_key,
        }
    }
}

/// An independent, non-restartable reader over a [`PacketQueue`].
pub struct Cursor {
    shared: Arc<Shared>,
    version: watch::Receiver<u64>,
    /// Absolute sequence number of the next packet to deliver.
    next: u64,
    /// Skip forward until a video keyframe arrives before delivering.
    await_key: bool,
}

impl Cursor {
    /// Returns the stream header, waiting for it to be written if necessary.
    ///
    /// Bounded by [`QueueConfig::header_timeout`].
    pub async fn streams(&mut self) -> Result<Arc<[StreamDescriptor]>, QueueError> {
        let header_timeout = self.shared.config.header_timeout;
        let wait = async {
            loop {
                {
                    let st = self.shared.state.lock();
                    if let Some(h) = &st.header {
                        return Ok(h.clone());
                    }
                    if st.closed {
                        return Err(QueueError::ClosedBeforeHeader);
                    }
                }
                if self.version.changed().await.is_err() {
                    return Err(QueueError::ClosedBeforeHeader);
                }
            }
        };
        timeout(header_timeout, wait)
            .await
            .map_err(|_| QueueError::HeaderTimeout)?
    }

    /// Returns the next event, suspending until a packet arrives or the
    /// queue closes.
    pub async fn read(&mut self) -> CursorEvent {
        loop {
            {
                let st = self.shared.state.lock();
                // Fell behind the retention window: skip to the most recent
                // keyframe and tell the reader to resynchronize.
                if self.next < st.base {
                    self.next = match st.last_key {
                        Some(lk) if lk >= st.base => lk,
                        _ => st.base,
                    };
                    self.await_key = false;
                    return CursorEvent::Discontinuity;
                }
                if self.await_key {
                    while self.next < st.end() {
                        let pkt = st.at(self.next);
                        if pkt.is_key && Some(pkt.stream) == st.video {
                            self.await_key = false;
                            break;
                        }
                        self.next += 1;
                    }
                }
                if !self.await_key && self.next < st.end() {
                    let pkt = st.at(self.next).clone();
                    self.next += 1;
                    return CursorEvent::Packet(pkt);
                }
                if st.closed {
                    return CursorEvent::End;
                }
            }
            // The writer half lives in the same Shared, so the sender cannot
            // be dropped while this cursor exists.
            if self.version.changed().await.is_err() {
                return CursorEvent::End;
            }
        }
    }
}

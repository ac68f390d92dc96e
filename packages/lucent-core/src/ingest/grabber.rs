//! Periodic thumbnail extraction and B-frame detection.
//!
//! Tails the ingest queue from its oldest cursor, accumulates each keyframe
//! in Annex-B form, and every `grab_interval` feeds one keyframe to an
//! external still-image encoder (ffmpeg). Non-keyframe slices are scanned
//! for B-frames, which rules a stream out for real-time playback.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::h264::{self, SliceType};
use crate::media::{DemuxError, DemuxEvent, Demuxer, Packet, StreamDescriptor, VideoDescriptor};

/// Output width of generated thumbnails; height preserves aspect.
const TARGET_WIDTH: u32 = 400;

/// How long the external encoder may take before it is killed.
const ENCODE_TIMEOUT: Duration = Duration::from_secs(5);

/// A B-frame seen within this window still marks the stream as using them.
const BFRAME_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GrabError {
    #[error("no h264 stream found")]
    NoVideo,

    #[error(transparent)]
    Source(#[from] DemuxError),
}

/// Emitted after each thumbnail is produced.
#[derive(Debug, Clone, Copy)]
pub struct ThumbEvent {
    pub at: SystemTime,
    /// Whether a B-frame was seen recently; real-time playback is only
    /// offered for streams without them.
    pub has_bframes: bool,
}

/// Persistence delegate for generated thumbnails.
#[async_trait]
pub trait ThumbnailSink: Send + Sync {
    async fn put(
        &self,
        channel: &str,
        jpeg: Bytes,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Starts the grabber over `src` and returns its event channel.
///
/// Fails if the source has no H.264 stream. The returned channel closes when
/// the source ends; events are dropped rather than queued when the consumer
/// is slow.
pub async fn grab(
    channel: String,
    mut src: impl Demuxer + 'static,
    thumbs: Arc<dyn ThumbnailSink>,
    interval: Duration,
) -> Result<mpsc::Receiver<ThumbEvent>, GrabError> {
    let streams = src.streams().await?;
    let video = streams
        .iter()
        .enumerate()
        .find_map(|(i, s)| match s {
            StreamDescriptor::Video(v) => Some((i, v.clone())),
            StreamDescriptor::Audio(_) => None,
        })
        .ok_or(GrabError::NoVideo)?;

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut grabber = Grabber {
            channel,
            video_idx: video.0,
            video: video.1,
            thumbs,
            interval,
            events: tx,
            buf: BytesMut::new(),
            key_time: Duration::ZERO,
            last_grab: None,
            last_bframe: None,
        };
        grabber.run(&mut src).await;
    });
    Ok(rx)
}

struct Grabber {
    channel: String,
    video_idx: usize,
    video: VideoDescriptor,
    thumbs: Arc<dyn ThumbnailSink>,
    interval: Duration,
    events: mpsc::Sender<ThumbEvent>,

    /// Annex-B accumulation of the keyframe in progress.
    buf: BytesMut,
    key_time: Duration,
    last_grab: Option<Instant>,
    last_bframe: Option<Duration>,
}

impl Grabber {
    async fn run(&mut self, src: &mut impl Demuxer) {
        loop {
            let pkt = match src.read().await {
                Ok(DemuxEvent::Packet(p)) => p,
                Ok(DemuxEvent::Discontinuity) => {
                    // The keyframe in progress is no longer contiguous.
                    self.buf.clear();
                    continue;
                }
                Ok(DemuxEvent::End) => return,
                Err(e) => {
                    log::error!("[grabber] {}: failed to grab frame: {e}", self.channel);
                    return;
                }
            };
            self.feed(&pkt).await;
        }
    }

    async fn feed(&mut self, pkt: &Packet) {
        if pkt.stream != self.video_idx {
            return;
        }
        // The keyframe is complete once a packet with a different role or
        // time arrives.
        if !self.buf.is_empty() && (!pkt.is_key || pkt.pts != self.key_time) {
            let due = self
                .last_grab
                .map_or(true, |t| t.elapsed() >= self.interval);
            if due {
                let raw = self.buf.clone().freeze();
                if let Err(e) = self.make_frame(raw).await {
                    log::error!("[grabber] {}: failed to make thumbnail: {e}", self.channel);
                } else {
                    self.last_grab = Some(Instant::now());
                    let event = ThumbEvent {
                        at: SystemTime::now(),
                        has_bframes: self.last_bframe.is_some(),
                    };
                    // Size-1 channel; drop when the observer is behind.
                    let _ = self.events.try_send(event);
                }
            }
            self.buf.clear();
        }
        if pkt.is_key {
            let first = self.buf.is_empty();
            h264::write_annex_b_packet(&mut self.buf, &pkt.data, first, &self.video.sps, &self.video.pps);
            self.key_time = pkt.pts;
        } else {
            self.scan_bframes(pkt);
        }
    }

    /// Looks for B-slices in a non-keyframe packet.
    fn scan_bframes(&mut self, pkt: &Packet) {
        for nalu in h264::split_avcc(&pkt.data) {
            if !h264::nal_type(nalu).is_slice() {
                continue;
            }
            if let Ok(SliceType::B) = h264::slice_type(nalu) {
                self.last_bframe = Some(pkt.pts);
            }
        }
        if let Some(last) = self.last_bframe {
            if pkt.pts.saturating_sub(last) > BFRAME_WINDOW {
                self.last_bframe = None;
            }
        }
    }

    /// Runs the external encoder on one keyframe's worth of Annex-B data.
    async fn make_frame(
        &self,
        raw: Bytes,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let width = TARGET_WIDTH;
        let height = if self.video.width > 0 {
            (TARGET_WIDTH * self.video.height / self.video.width) & !1
        } else {
            TARGET_WIDTH * 9 / 16
        };
        let size = format!("{width}x{height}");
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel",
                "warning",
                "-f",
                "h264",
                "-i",
                "-",
                "-frames:v",
                "1",
                "-s",
                size.as_str(),
                "-f",
                "mjpeg",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child.stdin.take().ok_or("encoder stdin unavailable")?;

        let encode = async move {
            // The encoder exits after one frame; a write error past that
            // point is expected.
            let _ = stdin.write_all(&raw).await;
            drop(stdin);
            child.wait_with_output().await
        };
        let output = timeout(ENCODE_TIMEOUT, encode)
            .await
            .map_err(|_| "thumbnail encoder timed out")??;
        if !output.status.success() {
            return Err(format!(
                "thumbnail encoder failed: {}\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )
            .into());
        }
        self.thumbs
            .put(&self.channel, Bytes::from(output.stdout))
            .await
    }
}

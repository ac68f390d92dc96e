//! The publish pipeline: one ingest source fanned out to every consumer.
//!
//! `Manager::publish` blocks for the lifetime of a publish. It creates the
//! ingest queue, wires up the frame grabber, the derived Opus queue and the
//! web publisher, and supervises all of them as one task group: any task
//! error cancels the rest, and closing the ingest queue unwinds every
//! consumer within a bounded time.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::events::PublishEvents;
use crate::ftl::{ChannelAuth, PublishSink};
use crate::media::{
    audio_stream, video_index, AudioCodec, Cursor, CursorEvent, DemuxError, DemuxEvent, Demuxer,
    PacketQueue, QueueError,
};
use crate::web::Publisher;

use super::grabber::{self, ThumbEvent};
use super::manager::{Channel, Liveness, Manager};
use super::opus::{self, ConvertError};
use super::GrabError;

/// Keyframes the web publisher must see before the channel reads as live.
const LIVE_KEYFRAMES: u32 = 3;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading streams: {0}")]
    Source(#[from] DemuxError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("setting up frame grabber: {0}")]
    Grabber(#[from] GrabError),

    #[error("opus conversion: {0}")]
    Convert(#[from] ConvertError),

    #[error("publish task failed: {0}")]
    Task(String),
}

impl Manager {
    /// Runs one publish to completion.
    ///
    /// Returns when the source ends, any pipeline task fails, a newer
    /// publish takes over the channel, or `cancel` fires. The channel is
    /// detached (and reads offline) before this returns, unless a newer
    /// publish already replaced it.
    pub async fn publish(
        &self,
        cancel: CancellationToken,
        auth: ChannelAuth,
        kind: &'static str,
        remote: &str,
        mut src: Box<dyn Demuxer>,
    ) -> Result<(), IngestError> {
        // Nothing is attached until the source has produced its header.
        let streams = src.streams().await?;

        let q = PacketQueue::new(self.config.queue_config());
        q.write_header(streams.to_vec())?;

        let group = cancel.child_token();

        let grab_rx = grabber::grab(
            auth.name.clone(),
            q.oldest(),
            self.thumbs.clone(),
            self.config.grab_interval(),
        )
        .await?;

        // Audio already Opus (or absent): the derived queue is the ingest
        // queue itself.
        let needs_convert = matches!(
            audio_stream(&streams),
            Some((_, codec)) if codec != AudioCodec::Opus
        );
        let (opusq, convert_src) = if needs_convert {
            (PacketQueue::new(self.config.queue_config()), Some(q.oldest()))
        } else {
            (q.clone(), None)
        };

        // Go live: install this publish on the channel, evicting any
        // previous publisher.
        let ch = self.channel_entry(&auth.name);
        let web = ch.set_stream(q.clone(), opusq.clone(), self.config.publish_mode);
        log::info!(
            "[{kind}] user {} started publishing to {} from {remote}",
            auth.user_id,
            auth.name
        );
        self.events.publish_event(&auth, true, None);

        let mut tasks: JoinSet<Result<(), IngestError>> = JoinSet::new();
        tasks.spawn(copy_stream(group.clone(), q.clone(), src));
        tasks.spawn(copy_web(ch.clone(), web, q.latest()));
        tasks.spawn(observe_grabs(
            ch.clone(),
            grab_rx,
            self.events.clone(),
            auth.clone(),
        ));
        if let Some(cur) = convert_src {
            let dest = opusq.clone();
            let bitrate = self.config.opus_bitrate;
            let token = group.clone();
            tasks.spawn(async move {
                let result = opus::convert(cur, dest.clone(), bitrate, token).await;
                dest.close();
                result.map_err(IngestError::from)
            });
        }

        // First error wins; everything else is cancelled and drained.
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) => Err(IngestError::Task(e.to_string())),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                group.cancel();
                q.close();
                opusq.close();
            }
        }
        q.close();
        opusq.close();

        log::info!("[{kind}] publish of {} stopped", auth.name);
        ch.stop_stream(&q);
        self.events.publish_event(&auth, false, None);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PublishSink for Manager {
    async fn publish(
        &self,
        auth: ChannelAuth,
        kind: &'static str,
        remote: String,
        src: Box<dyn Demuxer>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Manager::publish(self, CancellationToken::new(), auth, kind, &remote, src)
            .await
            .map_err(Into::into)
    }
}

/// Pumps the source into the ingest queue. Always closes the queue on
/// return, which unwinds every consumer.
async fn copy_stream(
    cancel: CancellationToken,
    q: PacketQueue,
    mut src: Box<dyn Demuxer>,
) -> Result<(), IngestError> {
    let result = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            // A replacement publish closes this queue out from under us;
            // stop reading promptly instead of writing into the void.
            _ = q.closed() => break Ok(()),
            ev = src.read() => ev,
        };
        match event {
            Err(e) => break Err(IngestError::Source(e)),
            Ok(DemuxEvent::End) => break Ok(()),
            // Sources feed a queue they own exclusively; nothing to reset.
            Ok(DemuxEvent::Discontinuity) => continue,
            Ok(DemuxEvent::Packet(pkt)) => {
                if let Err(e) = q.write_packet(pkt) {
                    break Err(IngestError::Queue(e));
                }
            }
        }
    };
    q.close();
    result
}

/// Feeds the web publisher from the live edge and flips the channel to Live
/// once enough keyframes have gone out.
async fn copy_web(ch: Arc<Channel>, web: Arc<Publisher>, mut cur: Cursor) -> Result<(), IngestError> {
    let streams = cur.streams().await?;
    let video = video_index(&streams);
    web.write_header(streams);
    let mut keyframes = 0u32;
    loop {
        match cur.read().await {
            CursorEvent::End => {
                web.close();
                return Ok(());
            }
            CursorEvent::Discontinuity => web.discontinuity(),
            CursorEvent::Packet(pkt) => {
                if pkt.is_key && Some(pkt.stream) == video {
                    keyframes += 1;
                    if keyframes == LIVE_KEYFRAMES && ch.liveness() == Liveness::Pending {
                        ch.set_liveness(Liveness::Live);
                    }
                }
                web.write_packet(pkt);
            }
        }
    }
}

/// Drains thumbnail events: refreshes the web-viewer census, forwards the
/// event, and records whether real-time playback can be offered.
async fn observe_grabs(
    ch: Arc<Channel>,
    mut events: mpsc::Receiver<ThumbEvent>,
    sink: Arc<dyn PublishEvents>,
    auth: ChannelAuth,
) -> Result<(), IngestError> {
    while let Some(event) = events.recv().await {
        ch.count_web_viewers();
        sink.publish_event(&auth, true, Some(&event));
        ch.set_rtc_capable(!event.has_bframes);
    }
    Ok(())
}

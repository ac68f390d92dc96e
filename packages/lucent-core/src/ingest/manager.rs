//! Per-channel state and the process-wide channel map.
//!
//! A [`Channel`] aggregates everything attached to one channel name: the
//! current ingest queue, the derived Opus queue, the web publisher handle,
//! liveness, and viewer accounting. The [`Manager`] owns the name -> channel
//! map and the periodic cleanup that frees heavy resources after a stream
//! goes offline.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::events::PublishEvents;
use crate::media::{Cursor, PacketQueue};
use crate::state::Config;
use crate::web::{PublishMode, Publisher};

use super::grabber::ThumbnailSink;

/// Hosts that fetched a web chunk within this window count as viewers.
const WEB_VIEW_TIMEOUT: Duration = Duration::from_secs(16);

/// How often offline channels are checked for expired web publishers.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(15);

/// Channel liveness, observed lock-free by the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Offline,
    Pending,
    Live,
}

impl Liveness {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Pending,
            2 => Self::Live,
            _ => Self::Offline,
        }
    }
}

/// Queue and publisher pointers, guarded by the channel lock.
#[derive(Default)]
struct Attached {
    ingest: Option<PacketQueue>,
    opus: Option<PacketQueue>,
    web: Option<Arc<Publisher>>,
    stopped_at: Option<Instant>,
}

/// Everything attached to one channel name.
pub struct Channel {
    name: String,
    attached: Mutex<Attached>,
    live: AtomicU8,
    rtc: AtomicBool,
    /// Direct (non-web) viewers.
    viewers: AtomicI64,
    web_viewers: DashMap<String, Instant>,
    web_total: AtomicI64,
}

impl Channel {
    fn new(name: String) -> Self {
        Self {
            name,
            attached: Mutex::new(Attached::default()),
            live: AtomicU8::new(Liveness::Offline as u8),
            rtc: AtomicBool::new(false),
            viewers: AtomicI64::new(0),
            web_viewers: DashMap::new(),
            web_total: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.live.load(Ordering::Acquire))
    }

    pub(crate) fn set_liveness(&self, state: Liveness) {
        self.live.store(state as u8, Ordering::Release);
    }

    /// Whether real-time playback may be offered (no B-frames observed).
    #[must_use]
    pub fn rtc_capable(&self) -> bool {
        self.rtc.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rtc_capable(&self, capable: bool) {
        self.rtc.store(capable, Ordering::Relaxed);
    }

    /// Attaches a new publish, evicting any previous one by closing its
    /// ingest queue. Returns the fresh web publisher handle.
    pub(crate) fn set_stream(
        &self,
        ingest: PacketQueue,
        opus: PacketQueue,
        mode: PublishMode,
    ) -> Arc<Publisher> {
        let mut at = self.attached.lock();
        if let Some(old) = at.ingest.take() {
            old.close();
        }
        if let Some(old) = at.web.take() {
            old.close();
        }
        let web = Arc::new(Publisher::new(mode));
        at.ingest = Some(ingest);
        at.opus = Some(opus);
        at.web = Some(web.clone());
        at.stopped_at = None;
        self.set_liveness(Liveness::Pending);
        web
    }

    /// Detaches a finished publish. No-op (returns false) when `q` is no
    /// longer the attached queue, so a late-returning publish cannot clobber
    /// its replacement.
    pub(crate) fn stop_stream(&self, q: &PacketQueue) -> bool {
        let mut at = self.attached.lock();
        match &at.ingest {
            Some(current) if current.same_queue(q) => {}
            _ => return false,
        }
        self.set_liveness(Liveness::Offline);
        at.ingest = None;
        at.opus = None;
        at.stopped_at = Some(Instant::now());
        true
    }

    /// A live-edge cursor on the raw or Opus queue, or `None` when offline.
    #[must_use]
    pub fn queue(&self, opus: bool) -> Option<Cursor> {
        let at = self.attached.lock();
        let q = if opus { at.opus.as_ref() } else { at.ingest.as_ref() };
        q.map(PacketQueue::latest)
    }

    /// The current web publisher handle, if one is attached.
    #[must_use]
    pub fn web(&self) -> Option<Arc<Publisher>> {
        self.attached.lock().web.clone()
    }

    /// Records that `host` fetched web media just now.
    pub fn web_viewed(&self, host: &str) {
        self.web_viewers.insert(host.to_owned(), Instant::now());
    }

    /// Re-counts web viewers, expiring hosts that stopped fetching.
    pub(crate) fn count_web_viewers(&self) {
        self.web_viewers
            .retain(|_, seen| seen.elapsed() <= WEB_VIEW_TIMEOUT);
        self.web_total
            .store(self.web_viewers.len() as i64, Ordering::Relaxed);
    }

    /// Direct plus web viewers.
    #[must_use]
    pub fn current_viewers(&self) -> i64 {
        self.viewers.load(Ordering::Relaxed) + self.web_total.load(Ordering::Relaxed)
    }

    /// Frees the web publisher once the channel has been offline longer
    /// than `expiry`. The channel entry itself persists.
    fn cleanup(&self, expiry: Duration) {
        let mut at = self.attached.lock();
        let expired = at
            .stopped_at
            .map_or(false, |stopped| stopped.elapsed() > expiry);
        if expired {
            if let Some(web) = at.web.take() {
                web.close();
                log::debug!("[ingest] {}: dropped web publisher", self.name);
            }
        }
    }
}

/// Counts a direct viewer on the channel for as long as it lives.
pub struct ViewerGuard {
    ch: Arc<Channel>,
}

impl ViewerGuard {
    #[must_use]
    pub fn new(ch: Arc<Channel>) -> Self {
        ch.viewers.fetch_add(1, Ordering::Relaxed);
        Self { ch }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.ch.viewers.fetch_add(-1, Ordering::Relaxed);
    }
}

/// Channel summary for the listing API.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub live: Liveness,
    pub viewers: i64,
    pub rtc_capable: bool,
}

/// Process-wide map from channel name to [`Channel`], and the entry point
/// for publishing.
pub struct Manager {
    pub(crate) config: Config,
    channels: DashMap<String, Arc<Channel>>,
    pub(crate) thumbs: Arc<dyn ThumbnailSink>,
    pub(crate) events: Arc<dyn PublishEvents>,
}

impl Manager {
    #[must_use]
    pub fn new(
        config: Config,
        thumbs: Arc<dyn ThumbnailSink>,
        events: Arc<dyn PublishEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: DashMap::new(),
            thumbs,
            events,
        })
    }

    /// Looks up an existing channel.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|c| c.value().clone())
    }

    /// Looks up or creates the channel entry for `name`.
    pub(crate) fn channel_entry(&self, name: &str) -> Arc<Channel> {
        self.channels
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Channel::new(name.to_owned())))
            .value()
            .clone()
    }

    /// A live-edge cursor on a channel's queue, or `None` when offline.
    #[must_use]
    pub fn queue(&self, name: &str, opus: bool) -> Option<Cursor> {
        self.channel(name)?.queue(opus)
    }

    /// Summaries of every known channel.
    #[must_use]
    pub fn channel_infos(&self) -> Vec<ChannelInfo> {
        self.channels
            .iter()
            .map(|entry| {
                let ch = entry.value();
                ChannelInfo {
                    name: ch.name.clone(),
                    live: ch.liveness(),
                    viewers: ch.current_viewers(),
                    rtc_capable: ch.rtc_capable(),
                }
            })
            .collect()
    }

    /// Frees expired web publishers on a fixed cadence until cancelled.
    pub async fn run_cleanup(&self, cancel: CancellationToken) {
        let expiry = self.config.web_expiry();
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for entry in self.channels.iter() {
                entry.value().cleanup(expiry);
            }
        }
    }
}

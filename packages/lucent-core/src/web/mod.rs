//! In-process web publisher: chunked fan-out for browser playback.
//!
//! The publish pipeline feeds every packet here; the publisher cuts chunks
//! at video keyframes and retains the most recent few in memory for
//! late-joining web players. Chunks are memory-only and retention is fixed
//! at [`NUM_CHUNKS`]; serialization to the wire format happens on demand in
//! [`framing`].

pub mod framing;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::media::{video_index, Packet, StreamDescriptor};

/// Finished chunks retained for late joiners.
pub const NUM_CHUNKS: usize = 5;

/// Which renditions the web publisher maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One combined chunk set with all tracks interleaved.
    #[default]
    SingleTrack,
    /// One chunk set per elementary stream.
    SeparateTracks,
    /// Both the combined set and the per-stream sets.
    SingleAndSeparate,
}

impl PublishMode {
    fn combined(self) -> bool {
        !matches!(self, Self::SeparateTracks)
    }

    fn separate(self) -> bool {
        !matches!(self, Self::SingleTrack)
    }
}

/// One keyframe-aligned run of packets.
#[derive(Debug)]
pub struct Chunk {
    pub seq: u64,
    pub start: Duration,
    pub duration: Duration,
    /// Interleaved packets; for per-track chunk sets, only that stream's.
    pub packets: Vec<Arc<Packet>>,
}

/// Manifest entry describing one available chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub seq: u64,
    pub duration_ms: u64,
}

/// The manifest served to web players.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub mode: PublishMode,
    pub tracks: usize,
    pub chunks: Vec<ChunkInfo>,
    pub discontinuities: u64,
    pub closed: bool,
}

#[derive(Default)]
struct PubState {
    header: Option<Arc<[StreamDescriptor]>>,
    video: Option<usize>,
    /// Combined chunk being accumulated.
    current: Vec<Arc<Packet>>,
    current_start: Duration,
    last_pts: Duration,
    next_seq: u64,
    combined: VecDeque<Arc<Chunk>>,
    /// Per-stream chunk sets, indexed like the header.
    per_track: Vec<VecDeque<Arc<Chunk>>>,
    discontinuities: u64,
    closed: bool,
}

/// Chunked in-memory publisher for one publish.
///
/// Single writer (the publish pipeline), many readers (HTTP handlers).
pub struct Publisher {
    mode: PublishMode,
    state: Mutex<PubState>,
}

impl Publisher {
    #[must_use]
    pub fn new(mode: PublishMode) -> Self {
        Self {
            mode,
            state: Mutex::new(PubState::default()),
        }
    }

    pub fn write_header(&self, streams: Arc<[StreamDescriptor]>) {
        let mut st = self.state.lock();
        st.video = video_index(&streams);
        st.per_track = streams.iter().map(|_| VecDeque::new()).collect();
        st.header = Some(streams);
    }

    pub fn write_packet(&self, pkt: Arc<Packet>) {
        let mut st = self.state.lock();
        if st.closed || st.header.is_none() {
            return;
        }
        let cut = pkt.is_key && Some(pkt.stream) == st.video && !st.current.is_empty();
        if cut {
            self.finish_chunk(&mut st);
        }
        if st.current.is_empty() {
            st.current_start = pkt.pts;
        }
        st.last_pts = pkt.pts.max(st.last_pts);
        st.current.push(pkt);
    }

    /// The feed resynchronized; the chunk in progress is not contiguous
    /// with what follows and is dropped.
    pub fn discontinuity(&self) {
        let mut st = self.state.lock();
        st.current.clear();
        st.discontinuities += 1;
    }

    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        if !st.current.is_empty() {
            self.finish_chunk(&mut st);
        }
        st.closed = true;
    }

    fn finish_chunk(&self, st: &mut PubState) {
        let packets = std::mem::take(&mut st.current);
        let seq = st.next_seq;
        st.next_seq += 1;
        let start = st.current_start;
        let duration = st.last_pts.saturating_sub(start);
        if self.mode.combined() {
            push_bounded(
                &mut st.combined,
                Arc::new(Chunk {
                    seq,
                    start,
                    duration,
                    packets: packets.clone(),
                }),
            );
        }
        if self.mode.separate() {
            for (track, set) in st.per_track.iter_mut().enumerate() {
                let only: Vec<_> = packets
                    .iter()
                    .filter(|p| p.stream == track)
                    .cloned()
                    .collect();
                push_bounded(
                    set,
                    Arc::new(Chunk {
                        seq,
                        start,
                        duration,
                        packets: only,
                    }),
                );
            }
        }
    }

    #[must_use]
    pub fn header(&self) -> Option<Arc<[StreamDescriptor]>> {
        self.state.lock().header.clone()
    }

    #[must_use]
    pub fn manifest(&self) -> Manifest {
        let st = self.state.lock();
        let source: &VecDeque<Arc<Chunk>> = if self.mode.combined() {
            &st.combined
        } else {
            st.per_track.first().unwrap_or(&st.combined)
        };
        Manifest {
            mode: self.mode,
            tracks: st.per_track.len(),
            chunks: source
                .iter()
                .map(|c| ChunkInfo {
                    seq: c.seq,
                    duration_ms: c.duration.as_millis() as u64,
                })
                .collect(),
            discontinuities: st.discontinuities,
            closed: st.closed,
        }
    }

    /// Fetches a retained chunk; `track` selects a single-track rendition
    /// when the mode maintains them.
    #[must_use]
    pub fn chunk(&self, seq: u64, track: Option<usize>) -> Option<Arc<Chunk>> {
        let st = self.state.lock();
        let set = match track {
            None if self.mode.combined() => &st.combined,
            None => return None,
            Some(t) if self.mode.separate() => st.per_track.get(t)?,
            Some(_) => return None,
        };
        set.iter().find(|c| c.seq == seq).cloned()
    }
}

fn push_bounded(set: &mut VecDeque<Arc<Chunk>>, chunk: Arc<Chunk>) {
    if set.len() >= NUM_CHUNKS {
        set.pop_front();
    }
    set.push_back(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{StreamDescriptor, VideoCodec, VideoDescriptor};
    use bytes::Bytes;

    fn header() -> Arc<[StreamDescriptor]> {
        vec![
            StreamDescriptor::Video(VideoDescriptor {
                codec: VideoCodec::H264,
                width: 64,
                height: 64,
                sps: Bytes::new(),
                pps: Bytes::new(),
            }),
            StreamDescriptor::opus(2),
        ]
        .into()
    }

    fn packet(stream: usize, ms: u64, key: bool) -> Arc<Packet> {
        Arc::new(Packet {
            stream,
            pts: Duration::from_millis(ms),
            cts: Duration::ZERO,
            is_key: key,
            data: Bytes::from_static(&[0xab]),
        })
    }

    fn feed_gops(p: &Publisher, gops: u64) {
        for g in 0..gops {
            let base = g * 100;
            p.write_packet(packet(0, base, true));
            p.write_packet(packet(1, base + 10, false));
            p.write_packet(packet(0, base + 50, false));
        }
    }

    #[test]
    fn chunks_cut_on_keyframes() {
        let p = Publisher::new(PublishMode::SingleTrack);
        p.write_header(header());
        feed_gops(&p, 3);
        // Two complete chunks; the third GOP is still accumulating.
        let m = p.manifest();
        assert_eq!(m.chunks.len(), 2);
        assert_eq!(m.chunks[0].seq, 0);
        assert_eq!(p.chunk(0, None).unwrap().packets.len(), 3);
        p.close();
        assert_eq!(p.manifest().chunks.len(), 3);
    }

    #[test]
    fn retention_is_bounded() {
        let p = Publisher::new(PublishMode::SingleTrack);
        p.write_header(header());
        feed_gops(&p, 10);
        let m = p.manifest();
        assert_eq!(m.chunks.len(), NUM_CHUNKS);
        // Oldest chunks were dropped.
        assert_eq!(m.chunks[0].seq, 4);
        assert!(p.chunk(0, None).is_none());
    }

    #[test]
    fn separate_tracks_split_by_stream() {
        let p = Publisher::new(PublishMode::SingleAndSeparate);
        p.write_header(header());
        feed_gops(&p, 2);
        p.close();
        let combined = p.chunk(0, None).unwrap();
        assert_eq!(combined.packets.len(), 3);
        let video = p.chunk(0, Some(0)).unwrap();
        assert!(video.packets.iter().all(|pkt| pkt.stream == 0));
        assert_eq!(video.packets.len(), 2);
        let audio = p.chunk(0, Some(1)).unwrap();
        assert_eq!(audio.packets.len(), 1);
    }

    #[test]
    fn single_track_mode_has_no_separate_renditions() {
        let p = Publisher::new(PublishMode::SingleTrack);
        p.write_header(header());
        feed_gops(&p, 2);
        p.close();
        assert!(p.chunk(0, Some(0)).is_none());
    }

    #[test]
    fn discontinuity_drops_the_partial_chunk() {
        let p = Publisher::new(PublishMode::SingleTrack);
        p.write_header(header());
        p.write_packet(packet(0, 0, true));
        p.write_packet(packet(0, 50, false));
        p.discontinuity();
        p.close();
        let m = p.manifest();
        assert_eq!(m.chunks.len(), 0);
        assert_eq!(m.discontinuities, 1);
    }
}

//! Derived-queue audio conversion to Opus.
//!
//! When a publisher's audio track is not already Opus, the channel carries a
//! second queue whose audio has been decoded by an external transcoder and
//! re-encoded as 20 ms Opus frames, with the video packets copied through
//! untouched. Real-time subscribers consume this queue.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::media::aac::{AacError, AudioSpecificConfig};
use crate::media::{
    AudioCodec, DemuxError, DemuxEvent, Demuxer, Packet, PacketQueue, QueueError, StreamDescriptor,
};

/// Opus frame duration; 960 samples at 48 kHz.
const FRAME_DURATION: Duration = Duration::from_millis(20);
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: usize = 2;
const SAMPLES_PER_FRAME: usize = 960;
/// Upper bound on one encoded Opus frame, per RFC 6716.
const MAX_OPUS_FRAME: usize = 1275;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no audio stream found")]
    NoAudio,

    #[error("unsupported audio codec {0}")]
    UnsupportedCodec(&'static str),

    #[error(transparent)]
    Aac(#[from] AacError),

    #[error(transparent)]
    Source(#[from] DemuxError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("audio transcoder: {0}")]
    Process(#[from] std::io::Error),

    #[error("opus encoder: {0}")]
    Encoder(#[from] opus::Error),
}

/// The converter's plan for a header: the audio stream index, its parsed
/// config, and the rewritten descriptor list.
pub(crate) fn plan_streams(
    streams: &[StreamDescriptor],
) -> Result<(usize, AudioSpecificConfig, Vec<StreamDescriptor>), ConvertError> {
    let mut audio = None;
    let mut out = Vec::with_capacity(streams.len());
    for (i, s) in streams.iter().enumerate() {
        match s {
            StreamDescriptor::Audio(a) => {
                if audio.is_some() {
                    // Only one audio track per publish.
                    return Err(ConvertError::UnsupportedCodec("multiple audio streams"));
                }
                if a.codec != AudioCodec::Aac {
                    return Err(ConvertError::UnsupportedCodec(a.codec.as_str()));
                }
                audio = Some((i, AudioSpecificConfig::parse(&a.config)?));
                out.push(StreamDescriptor::opus(CHANNELS as u8));
            }
            video => out.push(video.clone()),
        }
    }
    let (idx, config) = audio.ok_or(ConvertError::NoAudio)?;
    Ok((idx, config, out))
}

/// Converts the audio track of `src` to Opus, writing the result (and the
/// pass-through video) to `dest`.
///
/// Runs until the source ends or `cancel` fires; the external decoder is
/// killed either way. The caller closes `dest`.
pub async fn convert(
    mut src: impl Demuxer,
    dest: PacketQueue,
    bitrate: i32,
    cancel: CancellationToken,
) -> Result<(), ConvertError> {
    let streams = src.streams().await?;
    let (audio_idx, config, out_streams) = plan_streams(&streams)?;
    dest.write_header(out_streams)?;

    let mut child = Command::new("ffmpeg")
        .args([
            "-loglevel",
            "warning",
            "-f",
            "aac",
            "-i",
            "-",
            "-f",
            "s16le",
            "-ar",
            "48000",
            "-ac",
            "2",
            "-",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("transcoder stdin unavailable"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("transcoder stdout unavailable"))?;

    // Feed: audio re-muxed as ADTS into the decoder, video copied through.
    let feed_dest = dest.clone();
    let feed = async move {
        loop {
            match src.read().await? {
                DemuxEvent::End => break,
                // ADTS frames are self-delimiting; the decoder resyncs on
                // its own after a gap.
                DemuxEvent::Discontinuity => continue,
                DemuxEvent::Packet(pkt) => {
                    if pkt.stream == audio_idx {
                        let header = config.adts_header(pkt.data.len())?;
                        stdin.write_all(&header).await?;
                        stdin.write_all(&pkt.data).await?;
                    } else {
                        feed_dest.write_packet(pkt)?;
                    }
                }
            }
        }
        drop(stdin);
        Ok::<(), ConvertError>(())
    };

    // Encode: fixed 20 ms PCM frames from the decoder into Opus packets
    // with monotonic timestamps starting at zero.
    let encode_dest = dest.clone();
    let encode = async move {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Audio)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;
        let mut pcm = vec![0u8; SAMPLES_PER_FRAME * CHANNELS * 2];
        let mut samples = vec![0i16; SAMPLES_PER_FRAME * CHANNELS];
        let mut out = vec![0u8; MAX_OPUS_FRAME];
        let mut pts = Duration::ZERO;
        loop {
            match stdout.read_exact(&mut pcm).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(ConvertError::Process(e)),
            }
            for (sample, bytes) in samples.iter_mut().zip(pcm.chunks_exact(2)) {
                *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            }
            let n = encoder.encode(&samples, &mut out)?;
            encode_dest.write_packet(Packet {
                stream: audio_idx,
                pts,
                cts: Duration::ZERO,
                is_key: false,
                data: bytes::Bytes::copy_from_slice(&out[..n]),
            })?;
            pts += FRAME_DURATION;
        }
        Ok::<(), ConvertError>(())
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = async { futures::try_join!(feed, encode).map(|_| ()) } => r,
    };
    // Stop the decoder whether we finished or were cancelled.
    let _ = child.kill().await;
    let _ = child.wait().await;
    result
}

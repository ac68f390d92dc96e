//! RTP payload deframing into elementary-stream packets.
//!
//! H.264 payloads follow RFC 6184: single NAL units pass through, FU-A
//! fragments are reassembled, STAP-A aggregates are split. SPS/PPS are
//! captured as codec data rather than emitted. Opus payloads are already
//! complete packets. Sender timestamps are extended from 32 to 64 bits and
//! converted to durations at the codec clock rate.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::h264;
use crate::media::timebase::from_ticks;
use crate::media::{StreamDescriptor, VideoCodec, VideoDescriptor};

#[derive(Debug, Error)]
pub enum DeframeError {
    #[error("rtp packet truncated")]
    RtpTruncated,

    #[error("unsupported rtp version {0}")]
    RtpVersion(u8),

    #[error("h264 payload too short")]
    PayloadTooShort,

    #[error("parsing sps: {0}")]
    Sps(#[from] h264::H264Error),
}

/// A parsed RTP packet. The payload excludes header, extensions and padding.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: Bytes,
}

/// Parses an RTP datagram (RFC 3550 fixed header, CSRC list, one extension
/// header, trailing padding).
pub fn parse_rtp(d: &[u8]) -> Result<RtpPacket, DeframeError> {
    if d.len() < 12 {
        return Err(DeframeError::RtpTruncated);
    }
    let version = d[0] >> 6;
    if version != 2 {
        return Err(DeframeError::RtpVersion(version));
    }
    let has_padding = d[0] & 0x20 != 0;
    let has_extension = d[0] & 0x10 != 0;
    let csrc_count = usize::from(d[0] & 0x0f);
    let marker = d[1] & 0x80 != 0;
    let payload_type = d[1] & 0x7f;
    let sequence = BigEndian::read_u16(&d[2..4]);
    let timestamp = BigEndian::read_u32(&d[4..8]);
    let ssrc = BigEndian::read_u32(&d[8..12]);

    let mut offset = 12 + csrc_count * 4;
    if has_extension {
        if d.len() < offset + 4 {
            return Err(DeframeError::RtpTruncated);
        }
        let words = usize::from(BigEndian::read_u16(&d[offset + 2..offset + 4]));
        offset += 4 + words * 4;
    }
    let mut end = d.len();
    if has_padding {
        let pad = usize::from(d[end - 1]);
        if pad == 0 || offset + pad > end {
            return Err(DeframeError::RtpTruncated);
        }
        end -= pad;
    }
    if offset > end {
        return Err(DeframeError::RtpTruncated);
    }
    Ok(RtpPacket {
        payload_type,
        sequence,
        timestamp,
        ssrc,
        marker,
        payload: Bytes::copy_from_slice(&d[offset..end]),
    })
}

/// An elementary-stream packet reconstructed from RTP payloads, before the
/// stream index and timestamps are attached.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub data: Bytes,
    pub is_key: bool,
}

/// Payload parser for one elementary stream.
///
/// A closed sum over the supported payload shapes, matched exhaustively.
pub enum Parser {
    H264(H264Parser),
    /// Payload passes through unchanged; the descriptor is known up front.
    Null { info: StreamDescriptor },
}

impl Parser {
    fn parse_frame(&mut self, payload: &[u8], out: &mut Vec<ParsedPacket>) -> Result<(), DeframeError> {
        match self {
            Self::H264(p) => p.parse_frame(payload, out),
            Self::Null { .. } => {
                out.push(ParsedPacket {
                    data: Bytes::copy_from_slice(payload),
                    is_key: false,
                });
                Ok(())
            }
        }
    }

    fn codec_data(&self) -> Result<Option<StreamDescriptor>, DeframeError> {
        match self {
            Self::H264(p) => p.codec_data(),
            Self::Null { info } => Ok(Some(info.clone())),
        }
    }

    fn reset_fragment(&mut self) {
        if let Self::H264(p) = self {
            p.fbuf.clear();
        }
    }
}

/// RFC 6184 depacketizer state for one H.264 stream.
#[derive(Default)]
pub struct H264Parser {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    fbuf: BytesMut,
}

impl H264Parser {
    fn parse_frame(&mut self, packet: &[u8], out: &mut Vec<ParsedPacket>) -> Result<(), DeframeError> {
        if packet.len() < 2 {
            return Err(DeframeError::PayloadTooShort);
        }
        match h264::UnitType::from_header(packet[0]) {
            h264::UnitType::Sps => {
                self.sps = Some(Bytes::copy_from_slice(packet));
                Ok(())
            }
            h264::UnitType::Pps => {
                self.pps = Some(Bytes::copy_from_slice(packet));
                Ok(())
            }
            h264::UnitType::FuA => {
                let (indicator, header) = (packet[0], packet[1]);
                if header & 0x80 != 0 {
                    // Start bit: reconstruct the original NAL header.
                    self.fbuf.clear();
                    self.fbuf.put_u8(indicator & 0xe0 | header & 0x1f);
                }
                // A fragment without a preceding start (lost packet) is
                // dropped; the buffer stays empty until the next start bit.
                if !self.fbuf.is_empty() {
                    self.fbuf.put_slice(&packet[2..]);
                    if header & 0x40 != 0 {
                        let nalu = self.fbuf.split().freeze();
                        return self.parse_frame(&nalu, out);
                    }
                }
                Ok(())
            }
            h264::UnitType::StapA => {
                let mut rest = &packet[1..];
                while rest.len() >= 2 {
                    let size = usize::from(BigEndian::read_u16(&rest[..2]));
                    if size + 2 > rest.len() {
                        break;
                    }
                    self.parse_frame(&rest[2..2 + size], out)?;
                    rest = &rest[2 + size..];
                }
                Ok(())
            }
            unit => {
                out.push(ParsedPacket {
                    data: h264::nalu_to_avcc(packet),
                    is_key: unit == h264::UnitType::Idr,
                });
                Ok(())
            }
        }
    }

    fn codec_data(&self) -> Result<Option<StreamDescriptor>, DeframeError> {
        let (Some(sps), Some(pps)) = (&self.sps, &self.pps) else {
            return Ok(None);
        };
        let info = h264::parse_sps(sps)?;
        Ok(Some(StreamDescriptor::Video(VideoDescriptor {
            codec: VideoCodec::H264,
            width: info.width,
            height: info.height,
            sps: sps.clone(),
            pps: pps.clone(),
        })))
    }
}

/// Per-stream RTP deframer: sequence tracking, 64-bit timestamp extension,
/// and payload parsing.
pub struct Deframer {
    pub ssrc: u32,
    pub payload_type: u8,
    clock_rate: u64,
    parser: Parser,

    base_ts: u64,
    last_ts: u32,
    last_seq: Option<u16>,
    gaps: u64,
}

impl Deframer {
    /// H.264 deframer at the fixed 90 kHz RTP clock.
    #[must_use]
    pub fn h264(ssrc: u32, payload_type: u8) -> Self {
        Self::new(ssrc, payload_type, 90_000, Parser::H264(H264Parser::default()))
    }

    /// Opus deframer at the fixed 48 kHz RTP clock.
    #[must_use]
    pub fn opus(ssrc: u32, payload_type: u8) -> Self {
        Self::new(
            ssrc,
            payload_type,
            48_000,
            Parser::Null {
                info: StreamDescriptor::opus(2),
            },
        )
    }

    fn new(ssrc: u32, payload_type: u8, clock_rate: u64, parser: Parser) -> Self {
        Self {
            ssrc,
            payload_type,
            clock_rate,
            parser,
            base_ts: 0,
            last_ts: 0,
            last_seq: None,
            gaps: 0,
        }
    }

    /// Codec parameters, once enough of the stream has been seen.
    pub fn codec_data(&self) -> Result<Option<StreamDescriptor>, DeframeError> {
        self.parser.codec_data()
    }

    /// Number of sequence gaps observed so far.
    #[must_use]
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Feeds one RTP packet, appending any completed elementary-stream
    /// packets to `out`. Returns the presentation time shared by all of
    /// them.
    pub fn deframe(
        &mut self,
        pkt: &RtpPacket,
        out: &mut Vec<ParsedPacket>,
    ) -> Result<Duration, DeframeError> {
        if let Some(last) = self.last_seq {
            let delta = pkt.sequence.wrapping_sub(last) as i16;
            if delta != 1 {
                log::debug!("[ftl] ssrc {} sequence delta {}", self.ssrc, delta);
                self.gaps += 1;
                // A gap invalidates any partially assembled fragment.
                self.parser.reset_fragment();
            }
        }
        self.last_seq = Some(pkt.sequence);

        let ts = self.extend_timestamp(pkt.timestamp);
        let time = from_ticks(ts, self.clock_rate);
        self.parser.parse_frame(&pkt.payload, out)?;
        Ok(time)
    }

    /// Extends a wrapping 32-bit sender timestamp to 64 bits.
    fn extend_timestamp(&mut self, ts: u32) -> u64 {
        if ts < self.last_ts && ts < 1 << 31 {
            self.base_ts += 1 << 32;
        }
        self.last_ts = ts;
        self.base_ts + u64::from(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(seq: u16, ts: u32, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            payload_type: 96,
            sequence: seq,
            timestamp: ts,
            ssrc: 1,
            marker: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn parses_minimal_rtp_header() {
        let mut d = vec![0x80, 0x60, 0x12, 0x34, 0, 0, 0, 100, 0, 0, 0, 7];
        d.extend_from_slice(&[0xaa, 0xbb]);
        let p = parse_rtp(&d).unwrap();
        assert_eq!(p.payload_type, 0x60);
        assert_eq!(p.sequence, 0x1234);
        assert_eq!(p.timestamp, 100);
        assert_eq!(p.ssrc, 7);
        assert_eq!(p.payload.as_ref(), &[0xaa, 0xbb]);
    }

    #[test]
    fn strips_extension_and_padding() {
        // Extension (1 word) and 2 bytes of padding around a 3-byte payload.
        let mut d = vec![0xb0, 0x60, 0, 1, 0, 0, 0, 1, 0, 0, 0, 7];
        d.extend_from_slice(&[0xbe, 0xde, 0, 1, 1, 2, 3, 4]); // extension
        d.extend_from_slice(&[0xaa, 0xbb, 0xcc]); // payload
        d.extend_from_slice(&[0, 2]); // padding
        let p = parse_rtp(&d).unwrap();
        assert_eq!(p.payload.as_ref(), &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn rejects_non_rtp() {
        assert!(matches!(
            parse_rtp(&[0x41; 12]),
            Err(DeframeError::RtpVersion(1))
        ));
        assert!(matches!(parse_rtp(&[0x80; 4]), Err(DeframeError::RtpTruncated)));
    }

    #[test]
    fn reassembles_fu_a_fragments() {
        let mut def = Deframer::h264(1, 96);
        let mut out = Vec::new();
        // IDR NAL 0x65 01 02 03 04 05 fragmented into three FU-A packets.
        def.deframe(&rtp(10, 1000, &[0x7c, 0x85, 0x01, 0x02]), &mut out)
            .unwrap();
        assert!(out.is_empty());
        def.deframe(&rtp(11, 1000, &[0x7c, 0x05, 0x03]), &mut out).unwrap();
        assert!(out.is_empty());
        def.deframe(&rtp(12, 1000, &[0x7c, 0x45, 0x04, 0x05]), &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_key);
        assert_eq!(
            out[0].data.as_ref(),
            &[0, 0, 0, 6, 0x65, 0x01, 0x02, 0x03, 0x04, 0x05]
        );
    }

    #[test]
    fn fragment_without_start_is_dropped() {
        let mut def = Deframer::h264(1, 96);
        let mut out = Vec::new();
        def.deframe(&rtp(10, 0, &[0x7c, 0x45, 0x04, 0x05]), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn sequence_gap_resets_fragment_in_progress() {
        let mut def = Deframer::h264(1, 96);
        let mut out = Vec::new();
        def.deframe(&rtp(10, 0, &[0x7c, 0x85, 0x01]), &mut out).unwrap();
        // Packet 11 lost; the end fragment must not complete the NAL.
        def.deframe(&rtp(12, 0, &[0x7c, 0x45, 0x03]), &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(def.gaps(), 1);
    }

    #[test]
    fn sequence_wrap_is_not_a_gap() {
        let mut def = Deframer::opus(2, 97);
        let mut out = Vec::new();
        def.deframe(&rtp(0xffff, 0, &[0x01]), &mut out).unwrap();
        def.deframe(&rtp(0x0000, 960, &[0x02]), &mut out).unwrap();
        assert_eq!(def.gaps(), 0);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn stap_a_splits_aggregated_nals() {
        let mut def = Deframer::h264(1, 96);
        let mut out = Vec::new();
        // STAP-A carrying SPS (64x64 baseline), PPS and a small IDR.
        let sps = [0x67, 0x42, 0x00, 0x1e, 0xf4, 0x21, 0x32];
        let pps = [0x68, 0xce, 0x38, 0x80];
        let idr = [0x65, 0xaa, 0xbb];
        let mut stap = vec![0x78];
        for nal in [&sps[..], &pps[..], &idr[..]] {
            stap.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            stap.extend_from_slice(nal);
        }
        def.deframe(&rtp(1, 0, &stap), &mut out).unwrap();
        // SPS and PPS became codec data, only the IDR was emitted.
        assert_eq!(out.len(), 1);
        assert!(out[0].is_key);
        match def.codec_data().unwrap() {
            Some(StreamDescriptor::Video(v)) => {
                assert_eq!((v.width, v.height), (64, 64));
                assert_eq!(v.sps.as_ref(), sps);
                assert_eq!(v.pps.as_ref(), pps);
            }
            other => panic!("expected video codec data, got {other:?}"),
        }
    }

    #[test]
    fn timestamps_extend_across_wrap() {
        let mut def = Deframer::h264(1, 96);
        let inputs = [1u32, 2, 0xffff_ffff, 4, 5];
        let expect = [1u64, 2, 0xffff_ffff, 0x1_0000_0004, 0x1_0000_0005];
        for (ts, want) in inputs.into_iter().zip(expect) {
            assert_eq!(def.extend_timestamp(ts), want);
        }
    }

    #[test]
    fn wrapped_timestamps_produce_increasing_times() {
        let mut def = Deframer::opus(2, 97);
        let mut out = Vec::new();
        let before = def.deframe(&rtp(1, 0xffff_fff0, &[0x01]), &mut out).unwrap();
        let after = def.deframe(&rtp(2, 0x0000_0010, &[0x02]), &mut out).unwrap();
        assert!(after > before);
        assert_eq!(after - before, from_ticks(0x20, 48_000));
    }
}

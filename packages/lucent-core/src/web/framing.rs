//! Wire framing for packet streams served over HTTP.
//!
//! A stream is a header record followed by packet records; a discontinuity
//! record tells the player to reset its decoder state and expect a fresh
//! header. All integers are big-endian.
//!
//! ```text
//! record   := type:u8 length:u32 body
//! header   := 'H' length json(stream descriptors)
//! packet   := 'P' length stream:u8 flags:u8 pts_ns:u64 cts_ns:u64 payload
//! discont  := 'D' 0
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::{Packet, StreamDescriptor};

const RECORD_HEADER: u8 = b'H';
const RECORD_PACKET: u8 = b'P';
const RECORD_DISCONTINUITY: u8 = b'D';

const FLAG_KEYFRAME: u8 = 0x01;

/// Serializes the stream-descriptor header record.
pub fn header_record(streams: &[StreamDescriptor]) -> Bytes {
    // Descriptor lists are small and serde-friendly; JSON keeps the wire
    // format inspectable for web players.
    let body = serde_json::to_vec(streams).unwrap_or_default();
    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u8(RECORD_HEADER);
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    out.freeze()
}

/// Serializes one packet record.
pub fn packet_record(pkt: &Packet) -> Bytes {
    let body_len = 1 + 1 + 8 + 8 + pkt.data.len();
    let mut out = BytesMut::with_capacity(5 + body_len);
    out.put_u8(RECORD_PACKET);
    out.put_u32(body_len as u32);
    out.put_u8(pkt.stream as u8);
    out.put_u8(if pkt.is_key { FLAG_KEYFRAME } else { 0 });
    out.put_u64(pkt.pts.as_nanos() as u64);
    out.put_u64(pkt.cts.as_nanos() as u64);
    out.put_slice(&pkt.data);
    out.freeze()
}

/// Serializes a discontinuity marker.
pub fn discontinuity_record() -> Bytes {
    let mut out = BytesMut::with_capacity(5);
    out.put_u8(RECORD_DISCONTINUITY);
    out.put_u32(0);
    out.freeze()
}

/// Serializes a whole chunk: header record plus every packet record.
pub fn chunk_body(streams: &[StreamDescriptor], packets: &[std::sync::Arc<Packet>]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(&header_record(streams));
    for pkt in packets {
        out.put_slice(&packet_record(pkt));
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn streams() -> Vec<StreamDescriptor> {
        vec![StreamDescriptor::opus(2)]
    }

    #[test]
    fn header_record_is_parseable_json() {
        let rec = header_record(&streams());
        assert_eq!(rec[0], b'H');
        let len = u32::from_be_bytes([rec[1], rec[2], rec[3], rec[4]]) as usize;
        assert_eq!(rec.len(), 5 + len);
        let parsed: serde_json::Value = serde_json::from_slice(&rec[5..]).unwrap();
        assert_eq!(parsed[0]["kind"], "audio");
    }

    #[test]
    fn packet_record_layout() {
        let pkt = Packet {
            stream: 1,
            pts: Duration::from_nanos(7),
            cts: Duration::ZERO,
            is_key: true,
            data: Bytes::from_static(&[0xaa, 0xbb]),
        };
        let rec = packet_record(&pkt);
        assert_eq!(rec[0], b'P');
        let len = u32::from_be_bytes([rec[1], rec[2], rec[3], rec[4]]) as usize;
        assert_eq!(len, 20);
        assert_eq!(rec[5], 1); // stream
        assert_eq!(rec[6], FLAG_KEYFRAME);
        assert_eq!(rec[7..15], 7u64.to_be_bytes()); // pts
        assert_eq!(&rec[23..], &[0xaa, 0xbb]);
    }

    #[test]
    fn chunk_body_concatenates_records() {
        let pkt = Arc::new(Packet {
            stream: 0,
            pts: Duration::ZERO,
            cts: Duration::ZERO,
            is_key: false,
            data: Bytes::from_static(&[0x01]),
        });
        let body = chunk_body(&streams(), &[pkt.clone(), pkt]);
        assert_eq!(body[0], b'H');
        let hlen = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        assert_eq!(body[5 + hlen], b'P');
    }
}

//! H.264 bitstream helpers.
//!
//! Covers the small surface the pipeline needs: NAL unit classification,
//! AVCC and Annex-B framing, pixel dimensions out of an SPS, and the slice
//! type of a coded slice (for B-frame detection). Parsing follows ITU-T
//! H.264 section 7.3; only the fields on the path to the needed values are
//! decoded.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum H264Error {
    #[error("NAL unit truncated")]
    Truncated,

    #[error("exp-golomb code exceeds 32 bits")]
    BadGolomb,

    #[error("unsupported SPS field: {0}")]
    UnsupportedSps(&'static str),
}

/// NAL unit types (ITU-T H.264 table 7-1 plus the RFC 6184 framing types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
    NonIdr,
    PartitionA,
    PartitionB,
    PartitionC,
    Idr,
    Sei,
    Sps,
    Pps,
    AccessDelimiter,
    EndSequence,
    EndStream,
    Filler,
    StapA,
    StapB,
    Mtap16,
    Mtap24,
    FuA,
    FuB,
    Other(u8),
}

impl UnitType {
    #[must_use]
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1f {
            1 => Self::NonIdr,
            2 => Self::PartitionA,
            3 => Self::PartitionB,
            4 => Self::PartitionC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessDelimiter,
            10 => Self::EndSequence,
            11 => Self::EndStream,
            12 => Self::Filler,
            24 => Self::StapA,
            25 => Self::StapB,
            26 => Self::Mtap16,
            27 => Self::Mtap24,
            28 => Self::FuA,
            29 => Self::FuB,
            t => Self::Other(t),
        }
    }

    /// Whether this is a coded slice of a picture (types 1 through 5).
    #[must_use]
    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            Self::NonIdr | Self::PartitionA | Self::PartitionB | Self::PartitionC | Self::Idr
        )
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonIdr => "Sli",
            Self::PartitionA => "Pa",
            Self::PartitionB => "Pb",
            Self::PartitionC => "Pc",
            Self::Idr => "IDR",
            Self::Sei => "SEI",
            Self::Sps => "SPS",
            Self::Pps => "PPS",
            Self::AccessDelimiter => "aud",
            Self::EndSequence => "EOQ",
            Self::EndStream => "EOS",
            Self::Filler => "fil",
            Self::StapA => "ST-A",
            Self::StapB => "ST-B",
            Self::Mtap16 => "MT-16",
            Self::Mtap24 => "MT-24",
            Self::FuA => "FU-A",
            Self::FuB => "FU-B",
            Self::Other(t) => return write!(f, "{t}"),
        };
        f.write_str(s)
    }
}

/// Classifies a raw NAL by its first byte.
#[must_use]
pub fn nal_type(nalu: &[u8]) -> UnitType {
    match nalu.first() {
        Some(&b) => UnitType::from_header(b),
        None => UnitType::Other(0),
    }
}

/// Wraps a raw NAL in AVCC framing (4-byte big-endian length prefix).
#[must_use]
pub fn nalu_to_avcc(nalu: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(4 + nalu.len());
    b.put_u32(nalu.len() as u32);
    b.put_slice(nalu);
    b.freeze()
}

/// Iterates the NALs of an AVCC-framed buffer. Stops at the first
/// inconsistent length prefix.
pub fn split_avcc(mut data: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    std::iter::from_fn(move || {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return None;
        }
        let (nalu, rest) = data[4..].split_at(len);
        data = rest;
        Some(nalu)
    })
}

/// Appends NALs with Annex-B start codes.
pub fn write_annex_b<'a>(buf: &mut BytesMut, nalus: impl IntoIterator<Item = &'a [u8]>) {
    for nalu in nalus {
        buf.put_slice(&[0, 0, 1]);
        buf.put_slice(nalu);
    }
}

/// Appends an AVCC-framed packet in Annex-B form, prefixing SPS and PPS when
/// the packet is a keyframe so the output is independently decodable.
pub fn write_annex_b_packet(buf: &mut BytesMut, data: &[u8], is_key: bool, sps: &[u8], pps: &[u8]) {
    if is_key {
        write_annex_b(buf, [sps, pps]);
    }
    write_annex_b(buf, split_avcc(data));
}

/// Slice types of a coded picture (H.264 table 7-6, collapsed mod 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

/// Reads the slice type from the header of a coded-slice NAL.
pub fn slice_type(nalu: &[u8]) -> Result<SliceType, H264Error> {
    if nalu.len() < 2 {
        return Err(H264Error::Truncated);
    }
    let mut r = BitReader::new(&nalu[1..]);
    r.read_ue()?; // first_mb_in_slice
    match r.read_ue()? % 5 {
        0 => Ok(SliceType::P),
        1 => Ok(SliceType::B),
        2 => Ok(SliceType::I),
        3 => Ok(SliceType::Sp),
        _ => Ok(SliceType::Si),
    }
}

/// The SPS fields the pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// Parses pixel dimensions out of a sequence parameter set.
///
/// `nalu` is the raw SPS NAL including its header byte; emulation-prevention
/// bytes are removed before bit parsing.
pub fn parse_sps(nalu: &[u8]) -> Result<SpsInfo, H264Error> {
    if nalu.len() < 4 {
        return Err(H264Error::Truncated);
    }
    let rbsp = strip_emulation_prevention(&nalu[1..]);
    if rbsp.len() < 4 {
        return Err(H264Error::Truncated);
    }
    let profile_idc = rbsp[0];
    let level_idc = rbsp[2];
    let mut r = BitReader::new(&rbsp[3..]);
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1u32;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()? == 1;
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    match r.read_ue()? {
        0 => {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.read_bit()?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let n = r.read_ue()?;
            for _ in 0..n {
                r.read_se()?;
            }
        }
        _ => {}
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bit()? == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let chroma_array_type = if separate_colour_plane {
        0
    } else {
        chroma_format_idc
    };
    let (sub_width_c, sub_height_c) = match chroma_array_type {
        0 => (1, 1),
        1 => (2, 2),
        2 => (2, 1),
        3 => (1, 1),
        _ => return Err(H264Error::UnsupportedSps("chroma_format_idc")),
    };
    let frame_height_mult = 2 - frame_mbs_only;
    let crop_unit_x = sub_width_c;
    let crop_unit_y = sub_height_c * frame_height_mult;

    let width = pic_width_in_mbs * 16 - crop_unit_x * (crop_left + crop_right);
    let height = pic_height_in_map_units * 16 * frame_height_mult
        - crop_unit_y * (crop_top + crop_bottom);

    Ok(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), H264Error> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Removes 0x03 emulation-prevention bytes from an RBSP.
fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0u32;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// MSB-first bit reader with Exp-Golomb support.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read_bit(&mut self) -> Result<u32, H264Error> {
        let byte = self.data.get(self.bit / 8).ok_or(H264Error::Truncated)?;
        let v = u32::from(byte >> (7 - self.bit % 8)) & 1;
        self.bit += 1;
        Ok(v)
    }

    /// Unsigned Exp-Golomb (ue(v)).
    fn read_ue(&mut self) -> Result<u32, H264Error> {
        let mut zeros = 0;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(H264Error::BadGolomb);
            }
        }
        let mut v: u32 = 1;
        for _ in 0..zeros {
            v = v << 1 | self.read_bit()?;
        }
        Ok(v - 1)
    }

    /// Signed Exp-Golomb (se(v)).
    fn read_se(&mut self) -> Result<i32, H264Error> {
        let ue = self.read_ue()?;
        let k = (ue as i64 + 1) / 2;
        Ok(if ue % 2 == 1 { k as i32 } else { -(k as i32) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MSB-first bit writer for synthesizing test bitstreams.
    struct BitWriter {
        bytes: Vec<u8>,
        bit: usize,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        fn put_bit(&mut self, v: u32) {
            if self.bit % 8 == 0 {
                self.bytes.push(0);
            }
            if v != 0 {
                let i = self.bit / 8;
                self.bytes[i] |= 1 << (7 - self.bit % 8);
            }
            self.bit += 1;
        }

        fn put_bits(&mut self, v: u32, n: usize) {
            for i in (0..n).rev() {
                self.put_bit(v >> i & 1);
            }
        }

        fn put_ue(&mut self, v: u32) {
            let coded = v + 1;
            let bits = 32 - coded.leading_zeros() as usize;
            self.put_bits(0, bits - 1);
            self.put_bits(coded, bits);
        }

        fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit plus alignment.
            self.put_bit(1);
            while self.bit % 8 != 0 {
                self.put_bit(0);
            }
            self.bytes
        }
    }

    /// Synthesizes a baseline-profile SPS for the given macroblock layout.
    fn make_sps(width_mbs: u32, height_mbs: u32, crop_right: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type
        w.put_ue(0); // log2_max_pic_order_cnt_lsb_minus4
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(0); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(width_mbs - 1);
        w.put_ue(height_mbs - 1);
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(1); // direct_8x8_inference_flag
        if crop_right != 0 || crop_bottom != 0 {
            w.put_bit(1);
            w.put_ue(0);
            w.put_ue(crop_right);
            w.put_ue(0);
            w.put_ue(crop_bottom);
        } else {
            w.put_bit(0);
        }
        w.put_bit(0); // vui_parameters_present_flag
        let body = w.finish();

        // NAL header, profile 66 (baseline), constraint flags, level 3.0.
        let mut sps = vec![0x67, 66, 0x00, 30];
        sps.extend_from_slice(&body);
        sps
    }

    #[test]
    fn sps_dimensions_uncropped() {
        let sps = make_sps(40, 30, 0, 0);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
        assert_eq!(info.profile_idc, 66);
    }

    #[test]
    fn sps_dimensions_cropped() {
        // 1920x1080: 120x68 macroblocks, 8 luma lines cropped off the bottom
        // (4 crop units at 4:2:0).
        let sps = make_sps(120, 68, 0, 4);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn avcc_round_trip() {
        let nalu = [0x65u8, 1, 2, 3];
        let framed = nalu_to_avcc(&nalu);
        assert_eq!(&framed[..4], &[0, 0, 0, 4]);
        let split: Vec<_> = split_avcc(&framed).collect();
        assert_eq!(split, vec![&nalu[..]]);
    }

    #[test]
    fn annex_b_prefixes_parameter_sets_on_keyframes() {
        let sps = [0x67u8, 66];
        let pps = [0x68u8, 0xce];
        let idr = nalu_to_avcc(&[0x65, 0xaa]);
        let mut buf = BytesMut::new();
        write_annex_b_packet(&mut buf, &idr, true, &sps, &pps);
        assert_eq!(
            buf.as_ref(),
            &[0, 0, 1, 0x67, 66, 0, 0, 1, 0x68, 0xce, 0, 0, 1, 0x65, 0xaa][..]
        );
    }

    #[test]
    fn slice_type_reads_b_slices() {
        // first_mb_in_slice = 0 (bit 1), slice_type = 1 (B) -> bits 010.
        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(1);
        let mut nalu = vec![0x41];
        nalu.extend_from_slice(&w.finish());
        assert_eq!(slice_type(&nalu).unwrap(), SliceType::B);
    }

    #[test]
    fn slice_type_reads_p_slices() {
        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(0);
        let mut nalu = vec![0x41];
        nalu.extend_from_slice(&w.finish());
        assert_eq!(slice_type(&nalu).unwrap(), SliceType::P);
    }

    #[test]
    fn emulation_prevention_is_stripped() {
        assert_eq!(
            strip_emulation_prevention(&[0x00, 0x00, 0x03, 0x01]),
            vec![0x00, 0x00, 0x01]
        );
        // 0x03 not preceded by two zeros is kept.
        assert_eq!(
            strip_emulation_prevention(&[0x00, 0x03, 0x00]),
            vec![0x00, 0x03, 0x00]
        );
    }
}

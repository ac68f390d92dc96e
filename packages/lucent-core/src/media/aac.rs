//! Minimal AAC plumbing for the Opus conversion path.
//!
//! The converter re-muxes the source AAC track into ADTS so an external
//! decoder can consume it from a pipe. Only the parts of the
//! AudioSpecificConfig needed to build ADTS headers are parsed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AacError {
    #[error("AudioSpecificConfig too short")]
    ConfigTooShort,

    #[error("unsupported sampling frequency index {0}")]
    BadFrequencyIndex(u8),

    #[error("AAC frame too large for ADTS ({0} bytes)")]
    FrameTooLarge(usize),
}

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// ADTS frame length is a 13-bit field including the 7-byte header.
const MAX_ADTS_FRAME: usize = (1 << 13) - 1;

/// The parts of an MPEG-4 AudioSpecificConfig needed for ADTS framing.
#[derive(Debug, Clone, Copy)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
    frequency_index: u8,
    channel_config: u8,
}

impl AudioSpecificConfig {
    /// Parses the leading fields of an AudioSpecificConfig.
    ///
    /// Layout: 5 bits object type, 4 bits frequency index (15 = 24-bit
    /// explicit rate), 4 bits channel configuration.
    pub fn parse(data: &[u8]) -> Result<Self, AacError> {
        if data.len() < 2 {
            return Err(AacError::ConfigTooShort);
        }
        let object_type = data[0] >> 3;
        let frequency_index = (data[0] & 0x07) << 1 | data[1] >> 7;
        let (sample_rate, channel_bit_offset) = if frequency_index == 15 {
            if data.len() < 5 {
                return Err(AacError::ConfigTooShort);
            }
            let rate = u32::from(data[1] & 0x7f) << 17
                | u32::from(data[2]) << 9
                | u32::from(data[3]) << 1
                | u32::from(data[4] >> 7);
            (rate, 33usize)
        } else {
            let rate = *SAMPLE_RATES
                .get(frequency_index as usize)
                .ok_or(AacError::BadFrequencyIndex(frequency_index))?;
            (rate, 9usize)
        };
        let channel_config = read4(data, channel_bit_offset);
        Ok(Self {
            object_type,
            sample_rate,
            channels: channel_config,
            frequency_index,
            channel_config,
        })
    }

    /// Builds the 7-byte ADTS header (no CRC) for a raw AAC frame.
    pub fn adts_header(&self, payload_len: usize) -> Result<[u8; 7], AacError> {
        let frame_len = payload_len + 7;
        if frame_len > MAX_ADTS_FRAME {
            return Err(AacError::FrameTooLarge(payload_len));
        }
        // ADTS cannot carry an explicit sample rate; index 15 has no ADTS
        // representation and such streams are rejected upstream.
        if self.frequency_index == 15 {
            return Err(AacError::BadFrequencyIndex(15));
        }
        let profile = self.object_type.saturating_sub(1) & 0x03;
        let len = frame_len as u16;
        Ok([
            0xff,
            0xf1,
            profile << 6 | (self.frequency_index & 0x0f) << 2 | self.channel_config >> 2,
            (self.channel_config & 0x03) << 6 | (len >> 11) as u8,
            (len >> 3) as u8,
            ((len & 0x07) << 5) as u8 | 0x1f,
            0xfc,
        ])
    }
}

/// Reads four bits starting at `bit` from `data`.
fn read4(data: &[u8], bit: usize) -> u8 {
    let mut v = 0u8;
    for i in 0..4 {
        let idx = bit + i;
        let byte = data.get(idx / 8).copied().unwrap_or(0);
        v = v << 1 | (byte >> (7 - idx % 8)) & 1;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aac_lc_48k_stereo() {
        // Object type 2 (LC), frequency index 3 (48 kHz), 2 channels:
        // 00010 0011 0010 000 -> 0x11 0x90
        let cfg = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 2);
    }

    #[test]
    fn parses_aac_lc_44100_stereo() {
        // Object type 2, frequency index 4 (44.1 kHz), 2 channels:
        // 00010 0100 0010 000 -> 0x12 0x10
        let cfg = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.channels, 2);
    }

    #[test]
    fn adts_header_round_trips_fields() {
        let cfg = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        let hdr = cfg.adts_header(100).unwrap();
        assert_eq!(hdr[0], 0xff);
        assert_eq!(hdr[1], 0xf1);
        // Profile = object type - 1 = 1 (AAC LC).
        assert_eq!(hdr[2] >> 6, 1);
        // Frequency index 3.
        assert_eq!(hdr[2] >> 2 & 0x0f, 3);
        // Channel configuration 2 spans bytes 2 and 3.
        assert_eq!((hdr[2] & 0x01) << 2 | hdr[3] >> 6, 2);
        // Frame length = 107.
        let len = u16::from(hdr[3] & 0x03) << 11 | u16::from(hdr[4]) << 3 | u16::from(hdr[5] >> 5);
        assert_eq!(len, 107);
    }

    #[test]
    fn rejects_truncated_config() {
        assert!(matches!(
            AudioSpecificConfig::parse(&[0x11]),
            Err(AacError::ConfigTooShort)
        ));
    }
}

// src/stun/channel_data.rs
//! ChannelData framing (RFC 5766 Section 11.4) and packet classification
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Channel Number        |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /                       Application Data                        /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::HEADER_SIZE;
use crate::error::StunError;

/// Lowest valid channel number
pub const CHANNEL_MIN: u16 = 0x4000;

/// Highest valid channel number
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// ChannelData header size
pub const CHANNEL_HEADER_SIZE: usize = 4;

/// What an inbound packet looks like on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Leading bits `00`: STUN message
    Stun,
    /// Leading bits `01`: ChannelData frame
    ChannelData,
    /// Anything else, dropped
    Unknown,
}

/// Classify a packet by its first two bits
pub fn classify(raw: &[u8]) -> PacketKind {
    match raw.first().map(|b| b >> 6) {
        Some(0b00) if raw.len() >= HEADER_SIZE => PacketKind::Stun,
        Some(0b01) if raw.len() >= CHANNEL_HEADER_SIZE => PacketKind::ChannelData,
        _ => PacketKind::Unknown,
    }
}

/// Check a channel number against the valid range
pub fn is_valid_channel(channel: u16) -> bool {
    (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel)
}

/// A decoded ChannelData frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: u16,
    pub data: Bytes,
}

impl ChannelData {
    pub fn new(channel: u16, data: impl Into<Bytes>) -> Self {
        Self {
            channel,
            data: data.into(),
        }
    }

    /// Decode a frame. Trailing padding beyond the length field is accepted.
    pub fn decode(raw: &[u8]) -> Result<Self, StunError> {
        if raw.len() < CHANNEL_HEADER_SIZE {
            return Err(StunError::MalformedChannelData("frame too short".into()));
        }

        let channel = u16::from_be_bytes([raw[0], raw[1]]);
        if !is_valid_channel(channel) {
            return Err(StunError::MalformedChannelData(format!(
                "invalid channel number 0x{:04X}",
                channel
            )));
        }

        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if raw.len() - CHANNEL_HEADER_SIZE < length {
            return Err(StunError::MalformedChannelData(format!(
                "length {} exceeds frame of {} bytes",
                length,
                raw.len() - CHANNEL_HEADER_SIZE
            )));
        }

        Ok(Self {
            channel,
            data: Bytes::copy_from_slice(&raw[CHANNEL_HEADER_SIZE..CHANNEL_HEADER_SIZE + length]),
        })
    }

    /// Encode a frame; stream transports require padding to 4 bytes
    pub fn encode(&self, pad: bool) -> Result<Bytes, StunError> {
        if self.data.len() > u16::MAX as usize {
            return Err(StunError::TooLarge(self.data.len()));
        }

        let padding = if pad { (4 - self.data.len() % 4) % 4 } else { 0 };
        let mut buf = BytesMut::with_capacity(CHANNEL_HEADER_SIZE + self.data.len() + padding);
        buf.put_u16(self.channel);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.put_bytes(0, padding);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[0x00; 20]), PacketKind::Stun);
        assert_eq!(classify(&[0x00; 8]), PacketKind::Unknown);
        assert_eq!(classify(&[0x40, 0x01, 0x00, 0x00]), PacketKind::ChannelData);
        assert_eq!(classify(&[0x80, 0x00, 0x00, 0x00]), PacketKind::Unknown);
        assert_eq!(classify(&[]), PacketKind::Unknown);
    }

    #[test]
    fn test_channel_data_encode_decode() {
        let frame = ChannelData::new(0x4001, Bytes::from_static(b"hello"));

        let unpadded = frame.encode(false).unwrap();
        assert_eq!(unpadded.len(), 9);
        assert_eq!(&unpadded[..4], &[0x40, 0x01, 0x00, 0x05]);

        let padded = frame.encode(true).unwrap();
        assert_eq!(padded.len(), 12);

        assert_eq!(ChannelData::decode(&unpadded).unwrap(), frame);
        assert_eq!(ChannelData::decode(&padded).unwrap(), frame);
    }

    #[test]
    fn test_channel_data_rejects_bad_frames() {
        assert!(ChannelData::decode(&[0x40, 0x01]).is_err());
        assert!(ChannelData::decode(&[0x40, 0x01, 0x00, 0x08, 1, 2]).is_err());
        assert!(ChannelData::decode(&[0x80, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_channel_range() {
        assert!(is_valid_channel(0x4000));
        assert!(is_valid_channel(0x7FFF));
        assert!(!is_valid_channel(0x3FFF));
        assert!(!is_valid_channel(0x8000));
    }
}

// src/stun/framing.rs
//! Stream framing for TURN over TCP (RFC 5766 Section 2.1)
//!
//! A TCP connection carries back-to-back STUN messages and ChannelData
//! frames. STUN messages are self-delimiting through their length field;
//! ChannelData frames are padded to a multiple of four bytes on streams.

use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

use super::channel_data::CHANNEL_HEADER_SIZE;
use super::protocol::{HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Splits a TCP byte stream into individual STUN / ChannelData frames
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnFrameCodec;

impl TurnFrameCodec {
    /// Length of the frame at the start of `buf`, if enough bytes are buffered
    /// to know it
    fn frame_len(buf: &[u8]) -> io::Result<Option<usize>> {
        let Some(first) = buf.first() else {
            return Ok(None);
        };

        match first >> 6 {
            0b00 => {
                if buf.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                Ok(Some(HEADER_SIZE + len))
            }
            0b01 => {
                if buf.len() < CHANNEL_HEADER_SIZE {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                Ok(Some(CHANNEL_HEADER_SIZE + len + (4 - len % 4) % 4))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unframeable leading byte 0x{:02X}", first),
            )),
        }
    }
}

impl Decoder for TurnFrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame_len) = Self::frame_len(src)? else {
            return Ok(None);
        };

        if frame_len > MAX_MESSAGE_SIZE + HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", frame_len),
            ));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frame_len)))
    }
}

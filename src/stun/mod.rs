// src/stun/mod.rs
//! STUN message codec with TURN extensions
//!
//! - [`protocol`]: header, method/class packing, MESSAGE-INTEGRITY, FINGERPRINT
//! - [`attributes`]: typed attribute values
//! - [`channel_data`]: ChannelData frames and packet classification
//! - [`framing`]: stream framing for TCP connections

pub mod attributes;
pub mod channel_data;
pub mod framing;
pub mod protocol;

pub use attributes::{
    Attribute, AttributeType, AttributeValue, FAMILY_IPV4, FAMILY_IPV6, PROTO_UDP,
};
pub use channel_data::{classify, is_valid_channel, ChannelData, PacketKind, CHANNEL_MAX, CHANNEL_MIN};
pub use framing::TurnFrameCodec;
pub use protocol::{
    Message, MessageClass, MessageHeader, MessageType, Method, TransactionId, HEADER_SIZE,
    MAGIC_COOKIE, MAX_MESSAGE_SIZE,
};

// src/stun/protocol.rs
//! STUN message framing (RFC 5389) with the TURN methods of RFC 5766
//!
//! `Message::decode` is a pure transform from bytes to a structured message.
//! Header problems surface as [`StunError::Malformed`] (the caller drops the
//! packet); attribute problems carry the parsed header so the caller can still
//! answer with 400 or 420.

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use std::net::SocketAddr;

use super::attributes::{Attribute, AttributeType, AttributeValue};
use crate::error::StunError;

/// STUN magic cookie as defined in RFC 5389
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Maximum STUN message size
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// FINGERPRINT is CRC-32 XOR-ed with this constant ("STUN")
const FINGERPRINT_XOR: u32 = 0x5354554E;

/// Size of a MESSAGE-INTEGRITY attribute including its header
const INTEGRITY_ATTR_SIZE: usize = 4 + 20;

/// Size of a FINGERPRINT attribute including its header
const FINGERPRINT_ATTR_SIZE: usize = 4 + 4;

type HmacSha1 = Hmac<Sha1>;

/// STUN/TURN methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    /// Any other 12-bit method
    Unknown(u16),
}

impl Method {
    /// Map a 12-bit method number
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x001 => Self::Binding,
            0x003 => Self::Allocate,
            0x004 => Self::Refresh,
            0x006 => Self::Send,
            0x007 => Self::Data,
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            other => Self::Unknown(other & 0x0FFF),
        }
    }

    /// 12-bit method number
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
            Self::ChannelBind => 0x009,
            Self::Unknown(raw) => *raw & 0x0FFF,
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// Method and class packed into the 14-bit message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub const BINDING_REQUEST: Self = Self::new(Method::Binding, MessageClass::Request);
    pub const ALLOCATE_REQUEST: Self = Self::new(Method::Allocate, MessageClass::Request);
    pub const REFRESH_REQUEST: Self = Self::new(Method::Refresh, MessageClass::Request);
    pub const CREATE_PERMISSION_REQUEST: Self =
        Self::new(Method::CreatePermission, MessageClass::Request);
    pub const CHANNEL_BIND_REQUEST: Self = Self::new(Method::ChannelBind, MessageClass::Request);
    pub const SEND_INDICATION: Self = Self::new(Method::Send, MessageClass::Indication);
    pub const DATA_INDICATION: Self = Self::new(Method::Data, MessageClass::Indication);

    pub const fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    /// Same method, success response class
    pub fn success(&self) -> Self {
        Self::new(self.method, MessageClass::SuccessResponse)
    }

    /// Same method, error response class
    pub fn error(&self) -> Self {
        Self::new(self.method, MessageClass::ErrorResponse)
    }

    /// Encode according to RFC 5389 Section 6
    pub fn to_u16(&self) -> u16 {
        let method = self.method.as_u16();
        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;

        let class_bits = match self.class {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        };

        m0 | m1 | m2 | class_bits
    }

    /// Decode from the raw 16-bit type field (top two bits already checked)
    pub fn from_u16(value: u16) -> Self {
        let class = match value & 0x0110 {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        };

        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);

        Self::new(Method::from_u16(method), class)
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate new random transaction ID with cryptographically secure RNG
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed 20-byte STUN header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    /// Length of the attribute section in bytes
    pub length: u16,
    pub transaction_id: TransactionId,
}

impl MessageHeader {
    /// Parse and validate the header of `raw`.
    ///
    /// `raw` must hold exactly one message: the length field has to match
    /// the remaining bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, StunError> {
        if raw.len() < HEADER_SIZE {
            return Err(StunError::Malformed(format!(
                "message too short: {} bytes",
                raw.len()
            )));
        }

        let msg_type_raw = u16::from_be_bytes([raw[0], raw[1]]);
        if msg_type_raw & 0xC000 != 0 {
            return Err(StunError::Malformed(format!(
                "leading bits not zero: 0x{:04X}",
                msg_type_raw
            )));
        }

        let length = u16::from_be_bytes([raw[2], raw[3]]);
        if length % 4 != 0 {
            return Err(StunError::Malformed(format!(
                "length {} not a multiple of 4",
                length
            )));
        }

        let magic = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if magic != MAGIC_COOKIE {
            return Err(StunError::Malformed(format!(
                "invalid magic cookie 0x{:08X}",
                magic
            )));
        }

        if raw.len() - HEADER_SIZE != length as usize {
            return Err(StunError::Malformed(format!(
                "invalid message length: header says {}, got {}",
                length,
                raw.len() - HEADER_SIZE
            )));
        }

        let mut tid = [0u8; 12];
        tid.copy_from_slice(&raw[8..HEADER_SIZE]);

        Ok(Self {
            message_type: MessageType::from_u16(msg_type_raw),
            length,
            transaction_id: TransactionId::from_bytes(tid),
        })
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Create new STUN message
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Add attribute to message
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Builder flavour of [`Message::add_attribute`]
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Get attribute by type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Get all attributes of a type
    pub fn get_attributes(&self, attr_type: AttributeType) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.attr_type == attr_type)
    }

    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    fn text(&self, attr_type: AttributeType) -> Option<&str> {
        match &self.get_attribute(attr_type)?.value {
            AttributeValue::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.text(AttributeType::Username)
    }

    pub fn realm(&self) -> Option<&str> {
        self.text(AttributeType::Realm)
    }

    pub fn nonce(&self) -> Option<&str> {
        self.text(AttributeType::Nonce)
    }

    pub fn lifetime(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Lifetime)?.value {
            AttributeValue::Lifetime(secs) => Some(secs),
            _ => None,
        }
    }

    pub fn channel_number(&self) -> Option<u16> {
        match self.get_attribute(AttributeType::ChannelNumber)?.value {
            AttributeValue::ChannelNumber(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn requested_transport(&self) -> Option<u8> {
        match self.get_attribute(AttributeType::RequestedTransport)?.value {
            AttributeValue::RequestedTransport(protocol) => Some(protocol),
            _ => None,
        }
    }

    pub fn requested_address_family(&self) -> Option<u8> {
        match self.get_attribute(AttributeType::RequestedAddressFamily)?.value {
            AttributeValue::RequestedAddressFamily(family) => Some(family),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.get_attribute(AttributeType::Data)?.value {
            AttributeValue::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<u16> {
        match self.get_attribute(AttributeType::ErrorCode)?.value {
            AttributeValue::ErrorCode { code, .. } => Some(code),
            _ => None,
        }
    }

    /// First address carried by an address-valued attribute
    pub fn address(&self, attr_type: AttributeType) -> Option<SocketAddr> {
        match self.get_attribute(attr_type)?.value {
            AttributeValue::Address(addr) => Some(addr),
            _ => None,
        }
    }

    /// All XOR-PEER-ADDRESS values, in order
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.get_attributes(AttributeType::XorPeerAddress)
            .filter_map(|a| match a.value {
                AttributeValue::Address(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    /// Encode message to bytes.
    ///
    /// MESSAGE-INTEGRITY and FINGERPRINT attributes present in `attributes`
    /// are skipped and regenerated: integrity when `integrity_key` is given,
    /// fingerprint when requested.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_u16(self.message_type.to_u16());
        buf.put_u16(0); // Message length (will be set later)
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            if matches!(
                attr.attr_type,
                AttributeType::MessageIntegrity | AttributeType::Fingerprint
            ) {
                continue;
            }
            attr.encode(&mut buf, &self.transaction_id);
        }

        if let Some(key) = integrity_key {
            // Length must cover the MESSAGE-INTEGRITY attribute itself
            let length = buf.len() - HEADER_SIZE + INTEGRITY_ATTR_SIZE;
            set_length(&mut buf, length)?;

            let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::InvalidKey)?;
            mac.update(&buf);
            let digest = mac.finalize().into_bytes();

            buf.put_u16(AttributeType::MessageIntegrity.as_u16());
            buf.put_u16(20);
            buf.put_slice(&digest);
        }

        if fingerprint {
            let length = buf.len() - HEADER_SIZE + FINGERPRINT_ATTR_SIZE;
            set_length(&mut buf, length)?;

            let checksum = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;

            buf.put_u16(AttributeType::Fingerprint.as_u16());
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        let length = buf.len() - HEADER_SIZE;
        set_length(&mut buf, length)?;

        Ok(buf.freeze())
    }

    /// Decode message from bytes
    pub fn decode(raw: &[u8]) -> Result<Self, StunError> {
        let header = MessageHeader::parse(raw)?;

        let mut attributes = Vec::new();
        let mut unknown_required = Vec::new();
        let mut pos = HEADER_SIZE;
        let mut seen_integrity = false;

        while pos < raw.len() {
            if raw.len() - pos < 4 {
                return Err(StunError::Malformed("incomplete attribute header".into()));
            }

            let attr_type_raw = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
            let attr_len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
            let value_start = pos + 4;
            let padded_len = attr_len + (4 - attr_len % 4) % 4;

            if raw.len() - value_start < padded_len {
                return Err(StunError::Malformed(format!(
                    "attribute 0x{:04X} overruns message",
                    attr_type_raw
                )));
            }

            let value = &raw[value_start..value_start + attr_len];
            pos = value_start + padded_len;

            let attr_type = AttributeType::from_u16(attr_type_raw);

            // Only FINGERPRINT may follow MESSAGE-INTEGRITY; anything else is ignored
            if seen_integrity && attr_type != AttributeType::Fingerprint {
                continue;
            }

            if let AttributeType::Unknown(raw_type) = attr_type {
                if attr_type.is_comprehension_required() {
                    unknown_required.push(raw_type);
                    continue;
                }
            }

            let attr = Attribute::decode(attr_type_raw, value, &header.transaction_id).map_err(
                |reason| StunError::BadAttribute {
                    header,
                    attr_type: attr_type_raw,
                    reason,
                },
            )?;

            match attr_type {
                AttributeType::MessageIntegrity => seen_integrity = true,
                AttributeType::Fingerprint => {
                    attributes.push(attr);
                    break;
                }
                _ => {}
            }

            attributes.push(attr);
        }

        if !unknown_required.is_empty() {
            return Err(StunError::UnknownAttributes {
                header,
                attrs: unknown_required,
            });
        }

        Ok(Self {
            message_type: header.message_type,
            transaction_id: header.transaction_id,
            attributes,
        })
    }

    /// Verify MESSAGE-INTEGRITY against the raw bytes this message was decoded from
    pub fn verify_integrity(&self, raw: &[u8], key: &[u8]) -> bool {
        let expected = match self.get_attribute(AttributeType::MessageIntegrity) {
            Some(Attribute { value: AttributeValue::MessageIntegrity(mac), .. }) => mac,
            _ => return false,
        };

        let Some(integrity_pos) = find_attribute_position(raw, AttributeType::MessageIntegrity) else {
            return false;
        };

        // Length field must point to the end of MESSAGE-INTEGRITY
        let mut prefix = raw[..integrity_pos].to_vec();
        let adjusted = (integrity_pos - HEADER_SIZE + INTEGRITY_ATTR_SIZE) as u16;
        prefix[2..4].copy_from_slice(&adjusted.to_be_bytes());

        let Ok(mut mac) = HmacSha1::new_from_slice(key) else {
            return false;
        };
        mac.update(&prefix);
        mac.verify_slice(expected).is_ok()
    }

    /// Verify FINGERPRINT; messages without one pass
    pub fn verify_fingerprint(&self, raw: &[u8]) -> Result<(), StunError> {
        let expected = match self.get_attribute(AttributeType::Fingerprint) {
            Some(Attribute { value: AttributeValue::Fingerprint(crc), .. }) => *crc,
            _ => return Ok(()),
        };

        let fingerprint_pos = find_attribute_position(raw, AttributeType::Fingerprint)
            .ok_or(StunError::FingerprintCheckFailed)?;

        let mut prefix = raw[..fingerprint_pos].to_vec();
        let adjusted = (fingerprint_pos - HEADER_SIZE + FINGERPRINT_ATTR_SIZE) as u16;
        prefix[2..4].copy_from_slice(&adjusted.to_be_bytes());

        if crc32fast::hash(&prefix) ^ FINGERPRINT_XOR == expected {
            Ok(())
        } else {
            Err(StunError::FingerprintCheckFailed)
        }
    }
}

fn set_length(buf: &mut BytesMut, len: usize) -> Result<(), StunError> {
    if HEADER_SIZE + len > MAX_MESSAGE_SIZE {
        return Err(StunError::TooLarge(HEADER_SIZE + len));
    }
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

/// Find attribute position in raw message
fn find_attribute_position(raw: &[u8], attr_type: AttributeType) -> Option<usize> {
    let mut pos = HEADER_SIZE;

    while pos + 4 <= raw.len() {
        let attr = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;

        if attr == attr_type.as_u16() {
            return Some(pos);
        }

        pos += 4 + len;
        pos += (4 - (len % 4)) % 4; // Padding
    }

    None
}

// src/stun/attributes.rs
//! STUN and TURN attributes (RFC 5389 Section 15, RFC 5766 Section 14, RFC 6156)
//!
//! Every attribute is a TLV: 16-bit type, 16-bit value length, value padded
//! to a 4-byte boundary. Address-valued attributes come in a plain and an
//! XOR-ed flavour; the attribute type decides which encoding is used.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::{TransactionId, MAGIC_COOKIE};

/// Maximum USERNAME length in bytes (RFC 5389 Section 15.3)
pub const MAX_USERNAME_LEN: usize = 512;

/// Maximum REALM / NONCE / SOFTWARE length in bytes
pub const MAX_TEXT_LEN: usize = 763;

/// IANA protocol number for UDP, used by REQUESTED-TRANSPORT
pub const PROTO_UDP: u8 = 17;

/// REQUESTED-ADDRESS-FAMILY value for IPv4
pub const FAMILY_IPV4: u8 = 0x01;

/// REQUESTED-ADDRESS-FAMILY value for IPv6
pub const FAMILY_IPV6: u8 = 0x02;

/// STUN/TURN attribute types understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    MappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ChannelNumber,
    Lifetime,
    XorPeerAddress,
    Data,
    Realm,
    Nonce,
    XorRelayedAddress,
    RequestedAddressFamily,
    EvenPort,
    RequestedTransport,
    DontFragment,
    XorMappedAddress,
    ReservationToken,
    Software,
    AlternateServer,
    Fingerprint,
    /// Anything else, kept by raw type
    Unknown(u16),
}

impl AttributeType {
    /// Map a raw wire type to an attribute type
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0017 => Self::RequestedAddressFamily,
            0x0018 => Self::EvenPort,
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x0020 => Self::XorMappedAddress,
            0x0022 => Self::ReservationToken,
            0x8022 => Self::Software,
            0x8023 => Self::AlternateServer,
            0x8028 => Self::Fingerprint,
            other => Self::Unknown(other),
        }
    }

    /// Raw wire type
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::MappedAddress => 0x0001,
            Self::Username => 0x0006,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::UnknownAttributes => 0x000A,
            Self::ChannelNumber => 0x000C,
            Self::Lifetime => 0x000D,
            Self::XorPeerAddress => 0x0012,
            Self::Data => 0x0013,
            Self::Realm => 0x0014,
            Self::Nonce => 0x0015,
            Self::XorRelayedAddress => 0x0016,
            Self::RequestedAddressFamily => 0x0017,
            Self::EvenPort => 0x0018,
            Self::RequestedTransport => 0x0019,
            Self::DontFragment => 0x001A,
            Self::XorMappedAddress => 0x0020,
            Self::ReservationToken => 0x0022,
            Self::Software => 0x8022,
            Self::AlternateServer => 0x8023,
            Self::Fingerprint => 0x8028,
            Self::Unknown(raw) => *raw,
        }
    }

    /// Check if attribute is comprehension-required
    pub fn is_comprehension_required(&self) -> bool {
        self.as_u16() < 0x8000
    }

    fn is_xor_address(&self) -> bool {
        matches!(
            self,
            Self::XorMappedAddress | Self::XorPeerAddress | Self::XorRelayedAddress
        )
    }
}

/// Decoded attribute values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Transport address; XOR-ed on the wire for the XOR-* types
    Address(SocketAddr),
    /// USERNAME, REALM, NONCE, SOFTWARE
    Text(String),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    ChannelNumber(u16),
    /// Seconds
    Lifetime(u32),
    Data(Bytes),
    /// IANA protocol number
    RequestedTransport(u8),
    RequestedAddressFamily(u8),
    /// R bit
    EvenPort(bool),
    ReservationToken([u8; 8]),
    DontFragment,
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    Raw(Vec<u8>),
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub value: AttributeValue,
}

impl Attribute {
    /// Create new attribute
    pub fn new(attr_type: AttributeType, value: AttributeValue) -> Self {
        Self { attr_type, value }
    }

    pub fn username(name: impl Into<String>) -> Self {
        Self::new(AttributeType::Username, AttributeValue::Text(name.into()))
    }

    pub fn realm(realm: impl Into<String>) -> Self {
        Self::new(AttributeType::Realm, AttributeValue::Text(realm.into()))
    }

    pub fn nonce(nonce: impl Into<String>) -> Self {
        Self::new(AttributeType::Nonce, AttributeValue::Text(nonce.into()))
    }

    pub fn software(software: impl Into<String>) -> Self {
        Self::new(AttributeType::Software, AttributeValue::Text(software.into()))
    }

    pub fn error_code(code: u16, reason: impl Into<String>) -> Self {
        Self::new(
            AttributeType::ErrorCode,
            AttributeValue::ErrorCode { code, reason: reason.into() },
        )
    }

    pub fn xor_mapped_address(addr: SocketAddr) -> Self {
        Self::new(AttributeType::XorMappedAddress, AttributeValue::Address(addr))
    }

    pub fn xor_peer_address(addr: SocketAddr) -> Self {
        Self::new(AttributeType::XorPeerAddress, AttributeValue::Address(addr))
    }

    pub fn xor_relayed_address(addr: SocketAddr) -> Self {
        Self::new(AttributeType::XorRelayedAddress, AttributeValue::Address(addr))
    }

    pub fn lifetime(secs: u32) -> Self {
        Self::new(AttributeType::Lifetime, AttributeValue::Lifetime(secs))
    }

    pub fn channel_number(channel: u16) -> Self {
        Self::new(AttributeType::ChannelNumber, AttributeValue::ChannelNumber(channel))
    }

    pub fn data(data: impl Into<Bytes>) -> Self {
        Self::new(AttributeType::Data, AttributeValue::Data(data.into()))
    }

    pub fn requested_transport(protocol: u8) -> Self {
        Self::new(
            AttributeType::RequestedTransport,
            AttributeValue::RequestedTransport(protocol),
        )
    }

    pub fn requested_address_family(family: u8) -> Self {
        Self::new(
            AttributeType::RequestedAddressFamily,
            AttributeValue::RequestedAddressFamily(family),
        )
    }

    pub fn unknown_attributes(attrs: Vec<u16>) -> Self {
        Self::new(
            AttributeType::UnknownAttributes,
            AttributeValue::UnknownAttributes(attrs),
        )
    }

    /// Encode attribute with padding into `buf`
    pub fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        let start_pos = buf.len();

        buf.put_u16(self.attr_type.as_u16());
        buf.put_u16(0); // Length placeholder

        match &self.value {
            AttributeValue::Address(addr) => {
                encode_address(buf, addr, self.attr_type.is_xor_address(), tid);
            }
            AttributeValue::Text(text) => buf.put_slice(text.as_bytes()),
            AttributeValue::ErrorCode { code, reason } => {
                buf.put_u16(0); // Reserved
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            AttributeValue::UnknownAttributes(attrs) => {
                for attr in attrs {
                    buf.put_u16(*attr);
                }
            }
            AttributeValue::ChannelNumber(channel) => {
                buf.put_u16(*channel);
                buf.put_u16(0); // RFFU
            }
            AttributeValue::Lifetime(secs) => buf.put_u32(*secs),
            AttributeValue::Data(data) => buf.put_slice(data),
            AttributeValue::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_slice(&[0, 0, 0]);
            }
            AttributeValue::RequestedAddressFamily(family) => {
                buf.put_u8(*family);
                buf.put_slice(&[0, 0, 0]);
            }
            AttributeValue::EvenPort(reserve) => {
                buf.put_u8(if *reserve { 0x80 } else { 0 });
            }
            AttributeValue::ReservationToken(token) => buf.put_slice(token),
            AttributeValue::DontFragment => {}
            AttributeValue::MessageIntegrity(mac) => buf.put_slice(mac),
            AttributeValue::Fingerprint(crc) => buf.put_u32(*crc),
            AttributeValue::Raw(data) => buf.put_slice(data),
        }

        let value_len = buf.len() - start_pos - 4;
        buf[start_pos + 2..start_pos + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - (value_len % 4)) % 4;
        buf.put_bytes(0, padding);
    }

    /// Decode a single attribute value.
    ///
    /// The error is a reason string; the message decoder wraps it together
    /// with the header so a 400 can still be answered.
    pub fn decode(raw_type: u16, value: &[u8], tid: &TransactionId) -> Result<Self, String> {
        let attr_type = AttributeType::from_u16(raw_type);

        let value = match attr_type {
            AttributeType::MappedAddress | AttributeType::AlternateServer => {
                AttributeValue::Address(decode_address(value, false, tid)?)
            }
            AttributeType::XorMappedAddress
            | AttributeType::XorPeerAddress
            | AttributeType::XorRelayedAddress => {
                AttributeValue::Address(decode_address(value, true, tid)?)
            }
            AttributeType::Username => AttributeValue::Text(decode_text(value, MAX_USERNAME_LEN, "USERNAME")?),
            AttributeType::Realm => AttributeValue::Text(decode_text(value, MAX_TEXT_LEN, "REALM")?),
            AttributeType::Nonce => AttributeValue::Text(decode_text(value, MAX_TEXT_LEN, "NONCE")?),
            AttributeType::Software => AttributeValue::Text(decode_text(value, MAX_TEXT_LEN, "SOFTWARE")?),
            AttributeType::ErrorCode => {
                if value.len() < 4 {
                    return Err("ERROR-CODE too short".into());
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                AttributeValue::ErrorCode { code: class * 100 + number, reason }
            }
            AttributeType::UnknownAttributes => {
                if value.len() % 2 != 0 {
                    return Err("UNKNOWN-ATTRIBUTES has odd length".into());
                }
                AttributeValue::UnknownAttributes(
                    value.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect(),
                )
            }
            AttributeType::ChannelNumber => {
                let v = fixed::<4>(value, "CHANNEL-NUMBER")?;
                AttributeValue::ChannelNumber(u16::from_be_bytes([v[0], v[1]]))
            }
            AttributeType::Lifetime => {
                AttributeValue::Lifetime(u32::from_be_bytes(fixed::<4>(value, "LIFETIME")?))
            }
            AttributeType::Data => AttributeValue::Data(Bytes::copy_from_slice(value)),
            AttributeType::RequestedTransport => {
                AttributeValue::RequestedTransport(fixed::<4>(value, "REQUESTED-TRANSPORT")?[0])
            }
            // Unsupported families are refused at allocation time with 440
            AttributeType::RequestedAddressFamily => AttributeValue::RequestedAddressFamily(
                fixed::<4>(value, "REQUESTED-ADDRESS-FAMILY")?[0],
            ),
            AttributeType::EvenPort => {
                AttributeValue::EvenPort(fixed::<1>(value, "EVEN-PORT")?[0] & 0x80 != 0)
            }
            AttributeType::ReservationToken => {
                AttributeValue::ReservationToken(fixed::<8>(value, "RESERVATION-TOKEN")?)
            }
            AttributeType::DontFragment => {
                if !value.is_empty() {
                    return Err("DONT-FRAGMENT must be empty".into());
                }
                AttributeValue::DontFragment
            }
            AttributeType::MessageIntegrity => {
                AttributeValue::MessageIntegrity(fixed::<20>(value, "MESSAGE-INTEGRITY")?)
            }
            AttributeType::Fingerprint => {
                AttributeValue::Fingerprint(u32::from_be_bytes(fixed::<4>(value, "FINGERPRINT")?))
            }
            AttributeType::Unknown(_) => AttributeValue::Raw(value.to_vec()),
        };

        Ok(Self { attr_type, value })
    }
}

fn fixed<const N: usize>(value: &[u8], name: &str) -> Result<[u8; N], String> {
    value
        .try_into()
        .map_err(|_| format!("{} must be {} bytes, got {}", name, N, value.len()))
}

fn decode_text(value: &[u8], max_len: usize, name: &str) -> Result<String, String> {
    if value.len() > max_len {
        return Err(format!("{} longer than {} bytes", name, max_len));
    }
    String::from_utf8(value.to_vec()).map_err(|e| format!("invalid {}: {}", name, e))
}

/// Encode a transport address, XOR-ed with the magic cookie and transaction ID
fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    buf.put_u8(0); // Reserved

    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, tid);
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, tid);
            }
            buf.put_slice(&octets);
        }
    }
}

fn decode_address(value: &[u8], xor: bool, tid: &TransactionId) -> Result<SocketAddr, String> {
    if value.len() < 4 {
        return Err("address too short".into());
    }

    let family = value[1];
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = if xor {
        raw_port ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        raw_port
    };

    let ip = match (family, value.len()) {
        (FAMILY_IPV4, 8) => {
            let mut octets: [u8; 4] = [value[4], value[5], value[6], value[7]];
            if xor {
                xor_in_place(&mut octets, tid);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (FAMILY_IPV6, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                xor_in_place(&mut octets, tid);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        (FAMILY_IPV4, _) | (FAMILY_IPV6, _) => {
            return Err(format!("address length {} does not match family", value.len()));
        }
        _ => return Err(format!("invalid address family 0x{:02X}", family)),
    };

    Ok(SocketAddr::new(ip, port))
}

/// XOR address bytes with the magic cookie followed by the transaction ID
fn xor_in_place(octets: &mut [u8], tid: &TransactionId) {
    let magic = MAGIC_COOKIE.to_be_bytes();
    let key = magic.iter().chain(tid.as_bytes().iter());
    for (byte, k) in octets.iter_mut().zip(key) {
        *byte ^= k;
    }
}

// src/error.rs
//! Error types for the TURN engine
//!
//! Two layers:
//! - [`StunError`] is produced by the message codec. It separates framing
//!   failures (the packet is dropped) from attribute failures inside an
//!   otherwise valid header (answered with 400 or 420).
//! - [`TurnError`] is produced by the engine. Every protocol-visible variant
//!   maps to a STUN error code through [`TurnError::error_code`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::stun::MessageHeader;

/// Result alias used across the engine
pub type TurnResult<T> = Result<T, TurnError>;

/// Codec errors following RFC 5389 framing rules
#[derive(Debug, Error)]
pub enum StunError {
    /// Top-level framing is broken: short header, bad magic cookie, length
    /// mismatch or non-zero leading bits. No transaction ID can be trusted.
    #[error("malformed STUN message: {0}")]
    Malformed(String),

    /// The header parsed but an attribute did not
    #[error("bad attribute 0x{attr_type:04X}: {reason}")]
    BadAttribute {
        /// Header of the offending message, used to echo the transaction ID
        header: MessageHeader,
        /// Raw attribute type
        attr_type: u16,
        /// Human readable reason
        reason: String,
    },

    /// Comprehension-required attributes the codec does not understand
    #[error("unknown comprehension-required attributes: {attrs:04X?}")]
    UnknownAttributes {
        /// Header of the offending message
        header: MessageHeader,
        /// Raw types of the unknown attributes
        attrs: Vec<u16>,
    },

    /// ChannelData framing is broken
    #[error("malformed ChannelData: {0}")]
    MalformedChannelData(String),

    /// Message does not fit the 16-bit length field
    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    /// FINGERPRINT present but wrong
    #[error("FINGERPRINT check failed")]
    FingerprintCheckFailed,

    /// HMAC key rejected by the MAC implementation
    #[error("invalid integrity key")]
    InvalidKey,
}

impl StunError {
    /// Header of the message the error belongs to, when one could be parsed
    pub fn header(&self) -> Option<&MessageHeader> {
        match self {
            StunError::BadAttribute { header, .. } | StunError::UnknownAttributes { header, .. } => {
                Some(header)
            }
            _ => None,
        }
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum TurnError {
    /// Codec failure
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request carried no credentials
    #[error("authentication required")]
    AuthenticationRequired,

    /// Nonce unknown, expired or issued to another client
    #[error("stale nonce")]
    StaleNonce,

    /// Credentials were present but did not verify
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request authenticated as a different user than the allocation owner
    #[error("wrong credentials for allocation owned by {owner}")]
    WrongCredentials {
        /// Username that created the allocation
        owner: String,
    },

    /// Request is syntactically fine but semantically invalid
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Allocation quota reached
    #[error("allocation quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No relay port could be bound
    #[error("relay ports exhausted after {attempts} attempts")]
    PortExhausted {
        /// Bind attempts made
        attempts: u32,
    },

    /// Allocation missing, or conflicting with the request parameters
    #[error("allocation mismatch: {0}")]
    AllocationMismatch(String),

    /// Requested address family cannot be served
    #[error("address family not supported")]
    AddressFamilyMismatch,

    /// Peer address family differs from the relayed address family
    #[error("peer address family mismatch: {0}")]
    PeerAddressFamilyMismatch(SocketAddr),

    /// REQUESTED-TRANSPORT other than UDP
    #[error("unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// Channel number outside 0x4000..=0x7FFF
    #[error("invalid channel number 0x{0:04X}")]
    InvalidChannelNumber(u16),

    /// Channel number already bound to another peer
    #[error("channel 0x{channel:04X} already bound to {peer}")]
    ChannelNumberInUse {
        /// Channel number requested
        channel: u16,
        /// Peer currently bound to it
        peer: SocketAddr,
    },

    /// Peer already bound to another channel number
    #[error("peer {peer} already bound to channel 0x{channel:04X}")]
    PeerAlreadyBound {
        /// Peer address requested
        peer: SocketAddr,
        /// Channel currently bound to it
        channel: u16,
    },

    /// No permission installed for the peer
    #[error("no permission for peer {0}")]
    PermissionDenied(IpAddr),

    /// Relay socket already closed
    #[error("relay socket {0} is closed")]
    RelayClosed(SocketAddr),

    /// Server already stopped
    #[error("server already stopped")]
    AlreadyStopped,
}

impl TurnError {
    /// STUN error code and reason phrase for protocol-visible errors.
    ///
    /// Returns `None` for transport and lifecycle failures, which are never
    /// answered on the wire.
    pub fn error_code(&self) -> Option<(u16, &'static str)> {
        let code = match self {
            TurnError::Stun(StunError::BadAttribute { .. }) => (400, "Bad Request"),
            TurnError::Stun(StunError::UnknownAttributes { .. }) => (420, "Unknown Attribute"),
            TurnError::Stun(_) => return None,
            TurnError::BadRequest(_)
            | TurnError::InvalidChannelNumber(_)
            | TurnError::ChannelNumberInUse { .. }
            | TurnError::PeerAlreadyBound { .. } => (400, "Bad Request"),
            TurnError::AuthenticationRequired | TurnError::Unauthorized(_) => (401, "Unauthorized"),
            TurnError::PermissionDenied(_) => (403, "Forbidden"),
            TurnError::AllocationMismatch(_) => (437, "Allocation Mismatch"),
            TurnError::StaleNonce => (438, "Stale Nonce"),
            TurnError::AddressFamilyMismatch => (440, "Address Family not Supported"),
            TurnError::WrongCredentials { .. } => (441, "Wrong Credentials"),
            TurnError::UnsupportedTransport(_) => (442, "Unsupported Transport Protocol"),
            TurnError::PeerAddressFamilyMismatch(_) => (443, "Peer Address Family Mismatch"),
            TurnError::QuotaExceeded(_) => (486, "Allocation Quota Reached"),
            TurnError::PortExhausted { .. } => (508, "Insufficient Capacity"),
            TurnError::Io(_)
            | TurnError::Configuration(_)
            | TurnError::RelayClosed(_)
            | TurnError::AlreadyStopped => return None,
        };
        Some(code)
    }

    /// Whether the error response must carry a fresh REALM and NONCE
    pub fn needs_challenge(&self) -> bool {
        matches!(
            self,
            TurnError::AuthenticationRequired | TurnError::Unauthorized(_) | TurnError::StaleNonce
        )
    }
}

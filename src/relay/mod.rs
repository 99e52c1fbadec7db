// src/relay/mod.rs
//! Relay address generation
//!
//! A [`RelayAddressGenerator`] hands out a bound UDP socket for every new
//! allocation together with the transport address advertised to the client
//! in XOR-RELAYED-ADDRESS. Two strategies are provided:
//!
//! - [`StaticRelayGenerator`]: OS-chosen ephemeral port, fixed public IP
//! - [`PortRangeRelayGenerator`]: random port from a configured range,
//!   retrying on bind conflicts

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{TurnError, TurnResult};
use crate::stun::PROTO_UDP;

/// Freshly bound relay socket and the address advertised for it
#[derive(Debug)]
pub struct RelayBinding {
    pub socket: UdpSocket,
    pub relay_addr: SocketAddr,
}

/// Produces relay transport addresses for new allocations
#[async_trait]
pub trait RelayAddressGenerator: Send + Sync + fmt::Debug {
    /// Check the configuration before the server starts
    fn validate(&self) -> TurnResult<()>;

    /// IP advertised in XOR-RELAYED-ADDRESS
    fn relay_ip(&self) -> IpAddr;

    /// Bind a new relay socket for `protocol` (IANA protocol number)
    async fn allocate_relay(&self, protocol: u8) -> TurnResult<RelayBinding>;
}

fn check_protocol(protocol: u8) -> TurnResult<()> {
    if protocol == PROTO_UDP {
        Ok(())
    } else {
        Err(TurnError::UnsupportedTransport(protocol))
    }
}

fn check_bind_family(relay_ip: IpAddr, bind_ip: IpAddr) -> TurnResult<()> {
    if relay_ip.is_ipv4() != bind_ip.is_ipv4() {
        return Err(TurnError::Configuration(format!(
            "relay IP {} and bind IP {} belong to different address families",
            relay_ip, bind_ip
        )));
    }
    Ok(())
}

/// Binds ephemeral ports on `bind_ip` and advertises them on `public_ip`
#[derive(Debug, Clone)]
pub struct StaticRelayGenerator {
    public_ip: IpAddr,
    bind_ip: IpAddr,
    max_attempts: u32,
}

impl StaticRelayGenerator {
    pub fn new(public_ip: IpAddr, bind_ip: IpAddr, max_attempts: u32) -> Self {
        Self {
            public_ip,
            bind_ip,
            max_attempts,
        }
    }
}

#[async_trait]
impl RelayAddressGenerator for StaticRelayGenerator {
    fn validate(&self) -> TurnResult<()> {
        if self.public_ip.is_unspecified() {
            return Err(TurnError::Configuration(
                "relay public IP must not be unspecified".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(TurnError::Configuration("max bind attempts must be positive".into()));
        }
        check_bind_family(self.public_ip, self.bind_ip)
    }

    fn relay_ip(&self) -> IpAddr {
        self.public_ip
    }

    async fn allocate_relay(&self, protocol: u8) -> TurnResult<RelayBinding> {
        check_protocol(protocol)?;

        for attempt in 1..=self.max_attempts {
            match UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await {
                Ok(socket) => {
                    let port = socket.local_addr()?.port();
                    return Ok(RelayBinding {
                        socket,
                        relay_addr: SocketAddr::new(self.public_ip, port),
                    });
                }
                Err(e) => {
                    warn!("Relay bind attempt {} on {} failed: {}", attempt, self.bind_ip, e);
                }
            }
        }

        Err(TurnError::PortExhausted {
            attempts: self.max_attempts,
        })
    }
}

/// Picks random ports from `min_port..=max_port`
#[derive(Debug, Clone)]
pub struct PortRangeRelayGenerator {
    relay_ip: IpAddr,
    bind_ip: IpAddr,
    min_port: u16,
    max_port: u16,
    max_attempts: u32,
}

impl PortRangeRelayGenerator {
    pub fn new(relay_ip: IpAddr, bind_ip: IpAddr, min_port: u16, max_port: u16, max_attempts: u32) -> Self {
        Self {
            relay_ip,
            bind_ip,
            min_port,
            max_port,
            max_attempts,
        }
    }
}

#[async_trait]
impl RelayAddressGenerator for PortRangeRelayGenerator {
    fn validate(&self) -> TurnResult<()> {
        if self.relay_ip.is_unspecified() {
            return Err(TurnError::Configuration("relay IP must not be unspecified".into()));
        }
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(TurnError::Configuration(format!(
                "invalid relay port range {}-{}",
                self.min_port, self.max_port
            )));
        }
        if self.max_attempts == 0 {
            return Err(TurnError::Configuration("max bind attempts must be positive".into()));
        }
        check_bind_family(self.relay_ip, self.bind_ip)
    }

    fn relay_ip(&self) -> IpAddr {
        self.relay_ip
    }

    async fn allocate_relay(&self, protocol: u8) -> TurnResult<RelayBinding> {
        check_protocol(protocol)?;

        for attempt in 1..=self.max_attempts {
            let port = rand::thread_rng().gen_range(self.min_port..=self.max_port);

            match UdpSocket::bind(SocketAddr::new(self.bind_ip, port)).await {
                Ok(socket) => {
                    return Ok(RelayBinding {
                        socket,
                        relay_addr: SocketAddr::new(self.relay_ip, port),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("Relay port {} in use (attempt {})", port, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TurnError::PortExhausted {
            attempts: self.max_attempts,
        })
    }
}

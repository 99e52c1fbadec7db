// src/allocation/mod.rs
//! Allocation table for the TURN relay
//!
//! Implements:
//! - RFC 5766 Section 5: allocations keyed by the client 5-tuple
//! - RFC 5766 Section 6/7: creation, refresh, refresh-to-zero deletion
//! - Relay address index for peer-to-client routing
//! - Total and per-user quotas
//!
//! Locking: the table map sits behind a single `RwLock` (one writer at a
//! time); each allocation guards its lifetime and permission state with its
//! own `Mutex`, so operations on one allocation are serialized without
//! blocking the others.

pub mod permission;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::error::{TurnError, TurnResult};
use crate::relay::RelayAddressGenerator;
use crate::stun::{FAMILY_IPV4, FAMILY_IPV6};

pub use permission::{ChannelBinding, PermissionState};

/// Transport between client and server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "udp"),
            TransportProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Client address, server address and transport identifying an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: TransportProtocol,
}

impl FiveTuple {
    pub fn new(client: SocketAddr, server: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            client,
            server,
            protocol,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}->{}", self.protocol, self.client, self.server)
    }
}

/// Lifetimes and quotas applied by the table
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    pub default_lifetime: Duration,
    pub max_lifetime: Duration,
    pub permission_lifetime: Duration,
    pub channel_lifetime: Duration,
    /// 0 disables the limit
    pub max_allocations: usize,
    /// 0 disables the limit
    pub max_allocations_per_user: usize,
    /// Attempts at obtaining a relay address not owned by a live allocation
    pub max_relay_attempts: u32,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            permission_lifetime: Duration::from_secs(300),
            channel_lifetime: Duration::from_secs(600),
            max_allocations: 0,
            max_allocations_per_user: 0,
            max_relay_attempts: 10,
        }
    }
}

impl AllocationPolicy {
    /// Lifetime granted for a requested LIFETIME value
    ///
    /// Absent → default; below default → default; above maximum → maximum.
    pub fn clamp_lifetime(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_lifetime)
            .max(self.default_lifetime)
            .min(self.max_lifetime)
    }
}

#[derive(Debug)]
struct AllocationState {
    expires_at: Instant,
    refreshed_at: Instant,
    peers: PermissionState,
}

/// A relayed transport address reserved for one client
pub struct Allocation {
    five_tuple: FiveTuple,
    relay_addr: SocketAddr,
    username: String,
    protocol: u8,
    created_at: Instant,
    permission_lifetime: Duration,
    channel_lifetime: Duration,
    state: Mutex<AllocationState>,
    /// `None` once closed
    socket: Mutex<Option<Arc<UdpSocket>>>,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl Allocation {
    #[allow(clippy::too_many_arguments)]
    fn new(
        five_tuple: FiveTuple,
        relay_addr: SocketAddr,
        username: String,
        protocol: u8,
        socket: UdpSocket,
        lifetime: Duration,
        policy: &AllocationPolicy,
        now: Instant,
    ) -> Self {
        Self {
            five_tuple,
            relay_addr,
            username,
            protocol,
            created_at: now,
            permission_lifetime: policy.permission_lifetime,
            channel_lifetime: policy.channel_lifetime,
            state: Mutex::new(AllocationState {
                expires_at: now + lifetime,
                refreshed_at: now,
                peers: PermissionState::new(),
            }),
            socket: Mutex::new(Some(Arc::new(socket))),
            relay_task: Mutex::new(None),
        }
    }

    pub fn five_tuple(&self) -> &FiveTuple {
        &self.five_tuple
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Requested transport (IANA protocol number)
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn refreshed_at(&self) -> Instant {
        self.state.lock().refreshed_at
    }

    pub fn expires_at(&self) -> Instant {
        self.state.lock().expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// Time left before expiry
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    fn set_lifetime(&self, lifetime: Duration, now: Instant) {
        let mut state = self.state.lock();
        state.expires_at = now + lifetime;
        state.refreshed_at = now;
    }

    pub fn create_permission(&self, peer_ip: IpAddr, now: Instant) {
        self.state
            .lock()
            .peers
            .create_permission(peer_ip, now, self.permission_lifetime);
    }

    pub fn has_permission(&self, peer_ip: IpAddr, now: Instant) -> bool {
        self.state.lock().peers.has_permission(peer_ip, now)
    }

    pub fn bind_channel(&self, channel: u16, peer: SocketAddr, now: Instant) -> TurnResult<()> {
        self.state.lock().peers.bind_channel(
            channel,
            peer,
            now,
            self.channel_lifetime,
            self.permission_lifetime,
        )
    }

    pub fn peer_for_channel(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        self.state.lock().peers.peer_for_channel(channel, now)
    }

    pub fn channel_for_peer(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        self.state.lock().peers.channel_for_peer(peer, now)
    }

    /// Drop expired permissions and channel bindings
    pub fn sweep(&self, now: Instant) -> (usize, usize) {
        self.state.lock().peers.sweep(now)
    }

    /// Relay socket, or `RelayClosed` once the allocation is gone
    pub fn socket(&self) -> TurnResult<Arc<UdpSocket>> {
        self.socket
            .lock()
            .clone()
            .ok_or(TurnError::RelayClosed(self.relay_addr))
    }

    /// Relay `data` to `peer`; requires a live permission for the peer IP
    pub async fn send_to_peer(&self, data: &[u8], peer: SocketAddr, now: Instant) -> TurnResult<usize> {
        let socket = self.socket()?;
        if !self.has_permission(peer.ip(), now) {
            return Err(TurnError::PermissionDenied(peer.ip()));
        }
        Ok(socket.send_to(data, peer).await?)
    }

    /// Hand over the task reading from the relay socket; it is aborted on close
    pub fn attach_relay_task(&self, handle: JoinHandle<()>) {
        if self.is_closed() {
            handle.abort();
            return;
        }
        if let Some(previous) = self.relay_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }

    /// Release the relay socket. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let Some(socket) = self.socket.lock().take() else {
            return false;
        };
        drop(socket);

        if let Some(task) = self.relay_task.lock().take() {
            task.abort();
        }
        true
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("five_tuple", &self.five_tuple)
            .field("relay_addr", &self.relay_addr)
            .field("username", &self.username)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Parameters of an Allocate request that reached the table
#[derive(Debug, Clone)]
pub struct AllocateRequest<'a> {
    pub five_tuple: FiveTuple,
    pub username: &'a str,
    /// REQUESTED-TRANSPORT
    pub protocol: u8,
    /// LIFETIME, if present
    pub lifetime: Option<Duration>,
    /// REQUESTED-ADDRESS-FAMILY, if present
    pub address_family: Option<u8>,
}

/// Result of [`AllocationTable::allocate`]
#[derive(Debug, Clone)]
pub enum AllocateOutcome {
    /// A new allocation with a fresh relay socket
    Created(Arc<Allocation>),
    /// Retransmitted Allocate for a live allocation with matching parameters
    Existing(Arc<Allocation>),
}

impl AllocateOutcome {
    pub fn allocation(&self) -> &Arc<Allocation> {
        match self {
            AllocateOutcome::Created(a) | AllocateOutcome::Existing(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, AllocateOutcome::Created(_))
    }
}

#[derive(Default)]
struct TableInner {
    allocations: HashMap<FiveTuple, Arc<Allocation>>,
    relays: HashMap<SocketAddr, FiveTuple>,
    per_user: HashMap<String, usize>,
}

impl TableInner {
    fn insert(&mut self, allocation: Arc<Allocation>) {
        self.relays
            .insert(allocation.relay_addr, allocation.five_tuple);
        *self
            .per_user
            .entry(allocation.username.clone())
            .or_insert(0) += 1;
        self.allocations.insert(allocation.five_tuple, allocation);
    }

    fn remove(&mut self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let allocation = self.allocations.remove(five_tuple)?;
        self.relays.remove(&allocation.relay_addr);
        if let Some(count) = self.per_user.get_mut(&allocation.username) {
            *count -= 1;
            if *count == 0 {
                self.per_user.remove(&allocation.username);
            }
        }
        Some(allocation)
    }

    fn user_count(&self, username: &str) -> usize {
        self.per_user.get(username).copied().unwrap_or(0)
    }
}

/// All live allocations of the server
pub struct AllocationTable {
    policy: AllocationPolicy,
    inner: RwLock<TableInner>,
}

impl AllocationTable {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(TableInner::default()),
        }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Create an allocation for `request.five_tuple`, or return the live one
    /// when the request repeats its parameters.
    #[instrument(skip(self, request, generator), fields(five_tuple = %request.five_tuple), level = "debug")]
    pub async fn allocate(
        &self,
        request: AllocateRequest<'_>,
        generator: &dyn RelayAddressGenerator,
        now: Instant,
    ) -> TurnResult<AllocateOutcome> {
        let existing = self.lookup_by_client(&request.five_tuple, now);
        if let Some(existing) = existing {
            return Self::reuse(existing, &request);
        }

        if let Some(family) = request.address_family {
            let relay_family = match generator.relay_ip() {
                IpAddr::V4(_) => FAMILY_IPV4,
                IpAddr::V6(_) => FAMILY_IPV6,
            };
            if family != relay_family {
                return Err(TurnError::AddressFamilyMismatch);
            }
        }

        self.check_quota(&self.inner.read(), request.username)?;

        let lifetime = self.policy.clamp_lifetime(request.lifetime);

        for _ in 0..self.policy.max_relay_attempts {
            let binding = generator.allocate_relay(request.protocol).await?;

            let mut inner = self.inner.write();

            // Another worker may have won the race for this 5-tuple
            if let Some(existing) = inner.allocations.get(&request.five_tuple).cloned() {
                if !existing.is_expired(now) {
                    return Self::reuse(existing, &request);
                }
                inner.remove(&request.five_tuple);
                existing.close();
            }

            self.check_quota(&inner, request.username)?;

            if inner.relays.contains_key(&binding.relay_addr) {
                debug!("Relay address {} already in use, retrying", binding.relay_addr);
                continue;
            }

            let allocation = Arc::new(Allocation::new(
                request.five_tuple,
                binding.relay_addr,
                request.username.to_string(),
                request.protocol,
                binding.socket,
                lifetime,
                &self.policy,
                now,
            ));
            inner.insert(allocation.clone());

            info!(
                "Allocation created: {} -> {} (user: {}, lifetime: {:?})",
                request.five_tuple, binding.relay_addr, request.username, lifetime
            );
            return Ok(AllocateOutcome::Created(allocation));
        }

        Err(TurnError::PortExhausted {
            attempts: self.policy.max_relay_attempts,
        })
    }

    fn reuse(existing: Arc<Allocation>, request: &AllocateRequest<'_>) -> TurnResult<AllocateOutcome> {
        if existing.username != request.username || existing.protocol != request.protocol {
            return Err(TurnError::AllocationMismatch(format!(
                "{} already holds an allocation with different parameters",
                request.five_tuple
            )));
        }
        debug!("Returning existing allocation for {}", request.five_tuple);
        Ok(AllocateOutcome::Existing(existing))
    }

    fn check_quota(&self, inner: &TableInner, username: &str) -> TurnResult<()> {
        if self.policy.max_allocations > 0 && inner.allocations.len() >= self.policy.max_allocations {
            return Err(TurnError::QuotaExceeded(format!(
                "server limit of {} allocations reached",
                self.policy.max_allocations
            )));
        }

        if self.policy.max_allocations_per_user > 0
            && inner.user_count(username) >= self.policy.max_allocations_per_user
        {
            return Err(TurnError::QuotaExceeded(format!(
                "user {} has reached allocation limit ({})",
                username, self.policy.max_allocations_per_user
            )));
        }

        Ok(())
    }

    /// Extend the allocation, or delete it when `requested` is zero.
    ///
    /// Returns the granted lifetime (zero after deletion).
    pub fn refresh(
        &self,
        five_tuple: &FiveTuple,
        requested: Option<Duration>,
        now: Instant,
    ) -> TurnResult<Duration> {
        let allocation = self.lookup_by_client(five_tuple, now).ok_or_else(|| {
            TurnError::AllocationMismatch(format!("no allocation for {}", five_tuple))
        })?;

        if requested == Some(Duration::ZERO) {
            self.remove(five_tuple);
            return Ok(Duration::ZERO);
        }

        let lifetime = self.policy.clamp_lifetime(requested);
        allocation.set_lifetime(lifetime, now);
        debug!("Refreshed allocation {} with lifetime {:?}", five_tuple, lifetime);
        Ok(lifetime)
    }

    /// Live allocation owned by `five_tuple`
    pub fn lookup_by_client(&self, five_tuple: &FiveTuple, now: Instant) -> Option<Arc<Allocation>> {
        self.inner
            .read()
            .allocations
            .get(five_tuple)
            .filter(|allocation| !allocation.is_expired(now))
            .cloned()
    }

    /// Live allocation whose relayed address is `relay_addr`
    pub fn lookup_by_relay(&self, relay_addr: SocketAddr, now: Instant) -> Option<Arc<Allocation>> {
        let inner = self.inner.read();
        let five_tuple = inner.relays.get(&relay_addr)?;
        inner
            .allocations
            .get(five_tuple)
            .filter(|allocation| !allocation.is_expired(now))
            .cloned()
    }

    /// Remove the allocation and close its relay socket
    pub fn remove(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let allocation = self.inner.write().remove(five_tuple)?;
        allocation.close();
        info!("Allocation deleted: {} -> {}", five_tuple, allocation.relay_addr);
        Some(allocation)
    }

    /// Remove expired allocations and sweep permissions of the remaining ones.
    ///
    /// Returns the number of allocations removed.
    pub fn expire_sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Allocation>> = {
            let mut inner = self.inner.write();
            let keys: Vec<FiveTuple> = inner
                .allocations
                .iter()
                .filter(|(_, allocation)| allocation.is_expired(now))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| inner.remove(key)).collect()
        };

        for allocation in &expired {
            allocation.close();
            info!(
                "Allocation expired: {} -> {}",
                allocation.five_tuple, allocation.relay_addr
            );
        }

        let live: Vec<Arc<Allocation>> = self.inner.read().allocations.values().cloned().collect();
        for allocation in live {
            let (permissions, channels) = allocation.sweep(now);
            if permissions + channels > 0 {
                debug!(
                    "Swept {} permissions and {} channels from {}",
                    permissions, channels, allocation.five_tuple
                );
            }
        }

        expired.len()
    }

    /// Remove every allocation, closing all relay sockets
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Allocation>> = {
            let mut inner = self.inner.write();
            inner.relays.clear();
            inner.per_user.clear();
            inner.allocations.drain().map(|(_, allocation)| allocation).collect()
        };

        for allocation in &drained {
            allocation.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().allocations.is_empty()
    }

    /// Live allocations created by `username`
    pub fn user_allocation_count(&self, username: &str) -> usize {
        self.inner.read().user_count(username)
    }
}

impl fmt::Debug for AllocationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTable")
            .field("policy", &self.policy)
            .field("allocations", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::StaticRelayGenerator;
    use crate::stun::PROTO_UDP;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn generator() -> StaticRelayGenerator {
        StaticRelayGenerator::new(LOCALHOST, LOCALHOST, 5)
    }

    fn tuple(port: u16) -> FiveTuple {
        FiveTuple::new(
            SocketAddr::new("192.0.2.1".parse().unwrap(), port),
            "127.0.0.1:3478".parse().unwrap(),
            TransportProtocol::Udp,
        )
    }

    fn request(five_tuple: FiveTuple, username: &str) -> AllocateRequest<'_> {
        AllocateRequest {
            five_tuple,
            username,
            protocol: PROTO_UDP,
            lifetime: None,
            address_family: None,
        }
    }

    #[test]
    fn test_clamp_lifetime() {
        let policy = AllocationPolicy::default();
        assert_eq!(policy.clamp_lifetime(None), Duration::from_secs(600));
        assert_eq!(policy.clamp_lifetime(Some(Duration::from_secs(30))), Duration::from_secs(600));
        assert_eq!(policy.clamp_lifetime(Some(Duration::from_secs(1200))), Duration::from_secs(1200));
        assert_eq!(policy.clamp_lifetime(Some(Duration::from_secs(99999))), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_allocate_and_lookup() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let now = Instant::now();

        let outcome = table.allocate(request(tuple(1000), "alice"), &generator(), now).await.unwrap();
        assert!(outcome.is_created());
        let allocation = outcome.allocation().clone();

        assert_eq!(table.len(), 1);
        assert_eq!(allocation.username(), "alice");
        assert_eq!(allocation.remaining(now), Duration::from_secs(600));
        assert!(table.lookup_by_client(&tuple(1000), now).is_some());
        assert!(table.lookup_by_relay(allocation.relay_addr(), now).is_some());
        assert!(table.lookup_by_client(&tuple(1001), now).is_none());
    }

    #[tokio::test]
    async fn test_same_tuple_returns_existing_or_mismatch() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let now = Instant::now();

        let first = table.allocate(request(tuple(1000), "alice"), &generator(), now).await.unwrap();
        let again = table.allocate(request(tuple(1000), "alice"), &generator(), now).await.unwrap();
        assert!(!again.is_created());
        assert_eq!(first.allocation().relay_addr(), again.allocation().relay_addr());

        let err = table.allocate(request(tuple(1000), "bob"), &generator(), now).await.unwrap_err();
        assert!(matches!(err, TurnError::AllocationMismatch(_)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_addresses_unique() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let now = Instant::now();
        let mut relays = HashSet::new();

        for port in 0..8 {
            let outcome = table.allocate(request(tuple(2000 + port), "alice"), &generator(), now).await.unwrap();
            assert!(relays.insert(outcome.allocation().relay_addr()));
        }
        assert_eq!(table.len(), 8);
    }

    #[tokio::test]
    async fn test_quotas() {
        let policy = AllocationPolicy {
            max_allocations: 3,
            max_allocations_per_user: 2,
            ..AllocationPolicy::default()
        };
        let table = AllocationTable::new(policy);
        let now = Instant::now();

        table.allocate(request(tuple(1), "alice"), &generator(), now).await.unwrap();
        table.allocate(request(tuple(2), "alice"), &generator(), now).await.unwrap();
        assert!(matches!(
            table.allocate(request(tuple(3), "alice"), &generator(), now).await,
            Err(TurnError::QuotaExceeded(_))
        ));

        table.allocate(request(tuple(4), "bob"), &generator(), now).await.unwrap();
        assert!(matches!(
            table.allocate(request(tuple(5), "carol"), &generator(), now).await,
            Err(TurnError::QuotaExceeded(_))
        ));
        assert_eq!(table.user_allocation_count("alice"), 2);
    }

    #[tokio::test]
    async fn test_address_family_mismatch() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let mut req = request(tuple(1), "alice");
        req.address_family = Some(FAMILY_IPV6);

        assert!(matches!(
            table.allocate(req, &generator(), Instant::now()).await,
            Err(TurnError::AddressFamilyMismatch)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_address_family_is_unsupported() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let mut req = request(tuple(1), "alice");
        req.address_family = Some(0x03);

        let err = table.allocate(req, &generator(), Instant::now()).await.unwrap_err();
        assert!(matches!(err, TurnError::AddressFamilyMismatch));
        assert_eq!(err.error_code().map(|(code, _)| code), Some(440));
    }

    #[tokio::test]
    async fn test_refresh_and_delete() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let now = Instant::now();
        let outcome = table.allocate(request(tuple(1), "alice"), &generator(), now).await.unwrap();
        let allocation = outcome.allocation().clone();

        let later = now + Duration::from_secs(500);
        let granted = table.refresh(&tuple(1), Some(Duration::from_secs(900)), later).unwrap();
        assert_eq!(granted, Duration::from_secs(900));
        assert!(table.lookup_by_client(&tuple(1), now + Duration::from_secs(1300)).is_some());

        assert_eq!(table.refresh(&tuple(1), Some(Duration::ZERO), later).unwrap(), Duration::ZERO);
        assert!(table.is_empty());
        assert!(allocation.is_closed());
        assert!(matches!(allocation.socket(), Err(TurnError::RelayClosed(_))));
        assert!(table.lookup_by_relay(allocation.relay_addr(), later).is_none());

        assert!(matches!(
            table.refresh(&tuple(1), None, later),
            Err(TurnError::AllocationMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_sweep() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let now = Instant::now();
        let short = table.allocate(request(tuple(1), "alice"), &generator(), now).await.unwrap();
        let mut long_req = request(tuple(2), "alice");
        long_req.lifetime = Some(Duration::from_secs(1800));
        table.allocate(long_req, &generator(), now).await.unwrap();

        assert_eq!(table.expire_sweep(now + Duration::from_secs(599)), 0);
        assert_eq!(table.expire_sweep(now + Duration::from_secs(600)), 1);
        assert_eq!(table.len(), 1);
        assert!(short.allocation().is_closed());
        assert_eq!(table.user_allocation_count("alice"), 1);
    }

    #[tokio::test]
    async fn test_send_requires_permission_and_open_socket() {
        let table = AllocationTable::new(AllocationPolicy::default());
        let now = Instant::now();
        let outcome = table.allocate(request(tuple(1), "alice"), &generator(), now).await.unwrap();
        let allocation = outcome.allocation().clone();

        let peer = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        assert!(matches!(
            allocation.send_to_peer(b"hi", peer_addr, now).await,
            Err(TurnError::PermissionDenied(_))
        ));

        allocation.create_permission(peer_addr.ip(), now);
        assert_eq!(allocation.send_to_peer(b"hi", peer_addr, now).await.unwrap(), 2);

        assert_eq!(table.close_all(), 1);
        assert!(matches!(
            allocation.send_to_peer(b"hi", peer_addr, now).await,
            Err(TurnError::RelayClosed(_))
        ));
        assert!(!allocation.close());
    }
}

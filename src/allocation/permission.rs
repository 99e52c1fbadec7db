// src/allocation/permission.rs
//! Permissions and channel bindings of a single allocation
//!
//! Implements:
//! - RFC 5766 Section 8: permissions keyed by peer IP (port ignored)
//! - RFC 5766 Section 11: channel bindings, one channel per peer and one
//!   peer per channel
//!
//! Expired entries are ignored by every lookup and dropped by [`PermissionState::sweep`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{TurnError, TurnResult};
use crate::stun::is_valid_channel;

/// A live channel binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: u16,
    pub peer: SocketAddr,
    pub expires_at: Instant,
}

impl ChannelBinding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Permission and channel tables, owned by one allocation
#[derive(Debug, Default)]
pub struct PermissionState {
    permissions: HashMap<IpAddr, Instant>,
    channels: HashMap<u16, ChannelBinding>,
    peer_channels: HashMap<SocketAddr, u16>,
}

impl PermissionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh the permission for `peer_ip`
    pub fn create_permission(&mut self, peer_ip: IpAddr, now: Instant, lifetime: Duration) {
        self.permissions.insert(peer_ip, now + lifetime);
    }

    pub fn has_permission(&self, peer_ip: IpAddr, now: Instant) -> bool {
        self.permissions
            .get(&peer_ip)
            .map_or(false, |expires_at| now < *expires_at)
    }

    /// Bind `channel` to `peer` or refresh an identical binding.
    ///
    /// Binding also installs or refreshes the permission for the peer IP.
    pub fn bind_channel(
        &mut self,
        channel: u16,
        peer: SocketAddr,
        now: Instant,
        channel_lifetime: Duration,
        permission_lifetime: Duration,
    ) -> TurnResult<()> {
        if !is_valid_channel(channel) {
            return Err(TurnError::InvalidChannelNumber(channel));
        }

        self.drop_expired_channels(now);

        if let Some(existing) = self.channels.get(&channel) {
            if existing.peer != peer {
                return Err(TurnError::ChannelNumberInUse {
                    channel,
                    peer: existing.peer,
                });
            }
        }

        if let Some(&bound) = self.peer_channels.get(&peer) {
            if bound != channel {
                return Err(TurnError::PeerAlreadyBound {
                    peer,
                    channel: bound,
                });
            }
        }

        self.channels.insert(
            channel,
            ChannelBinding {
                channel,
                peer,
                expires_at: now + channel_lifetime,
            },
        );
        self.peer_channels.insert(peer, channel);
        self.create_permission(peer.ip(), now, permission_lifetime);

        Ok(())
    }

    /// Peer bound to `channel`, if the binding is live
    pub fn peer_for_channel(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        self.channels
            .get(&channel)
            .filter(|binding| !binding.is_expired(now))
            .map(|binding| binding.peer)
    }

    /// Channel bound to `peer`, if the binding is live
    pub fn channel_for_peer(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        let channel = *self.peer_channels.get(&peer)?;
        self.peer_for_channel(channel, now).map(|_| channel)
    }

    fn drop_expired_channels(&mut self, now: Instant) -> usize {
        let expired: Vec<ChannelBinding> = self
            .channels
            .values()
            .filter(|binding| binding.is_expired(now))
            .copied()
            .collect();

        for binding in &expired {
            self.channels.remove(&binding.channel);
            self.peer_channels.remove(&binding.peer);
            debug!("Channel 0x{:04X} -> {} expired", binding.channel, binding.peer);
        }
        expired.len()
    }

    /// Drop expired permissions and channel bindings.
    ///
    /// Returns `(permissions, channels)` removed.
    pub fn sweep(&mut self, now: Instant) -> (usize, usize) {
        let before = self.permissions.len();
        self.permissions.retain(|_, expires_at| now < *expires_at);
        let permissions = before - self.permissions.len();

        (permissions, self.drop_expired_channels(now))
    }

    pub fn permission_count(&self) -> usize {
        self.permissions.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERM: Duration = Duration::from_secs(300);
    const CHAN: Duration = Duration::from_secs(600);

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_permission_ignores_port_and_expires() {
        let mut state = PermissionState::new();
        let now = Instant::now();
        state.create_permission("198.51.100.1".parse().unwrap(), now, PERM);

        assert!(state.has_permission(peer("198.51.100.1:1").ip(), now));
        assert!(state.has_permission(peer("198.51.100.1:65000").ip(), now + Duration::from_secs(299)));
        assert!(!state.has_permission("198.51.100.1".parse().unwrap(), now + PERM));
        assert!(!state.has_permission("198.51.100.2".parse().unwrap(), now));
    }

    #[test]
    fn test_permission_refresh_extends_lifetime() {
        let mut state = PermissionState::new();
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        let now = Instant::now();

        state.create_permission(ip, now, PERM);
        state.create_permission(ip, now + Duration::from_secs(200), PERM);
        assert!(state.has_permission(ip, now + Duration::from_secs(450)));
        assert_eq!(state.permission_count(), 1);
    }

    #[test]
    fn test_bind_channel_installs_permission() {
        let mut state = PermissionState::new();
        let now = Instant::now();
        let p = peer("198.51.100.1:5000");

        state.bind_channel(0x4001, p, now, CHAN, PERM).unwrap();
        assert_eq!(state.peer_for_channel(0x4001, now), Some(p));
        assert_eq!(state.channel_for_peer(p, now), Some(0x4001));
        assert!(state.has_permission(p.ip(), now));
    }

    #[test]
    fn test_channel_conflicts() {
        let mut state = PermissionState::new();
        let now = Instant::now();
        let p1 = peer("198.51.100.1:5000");
        let p2 = peer("198.51.100.2:5000");

        state.bind_channel(0x4001, p1, now, CHAN, PERM).unwrap();

        // same pair refreshes
        state.bind_channel(0x4001, p1, now, CHAN, PERM).unwrap();

        assert!(matches!(
            state.bind_channel(0x4001, p2, now, CHAN, PERM),
            Err(TurnError::ChannelNumberInUse { channel: 0x4001, .. })
        ));
        assert!(matches!(
            state.bind_channel(0x4002, p1, now, CHAN, PERM),
            Err(TurnError::PeerAlreadyBound { channel: 0x4001, .. })
        ));
        assert!(matches!(
            state.bind_channel(0x3FFF, p2, now, CHAN, PERM),
            Err(TurnError::InvalidChannelNumber(0x3FFF))
        ));
    }

    #[test]
    fn test_expired_channel_can_be_rebound() {
        let mut state = PermissionState::new();
        let now = Instant::now();
        let p1 = peer("198.51.100.1:5000");
        let p2 = peer("198.51.100.2:5000");

        state.bind_channel(0x4001, p1, now, CHAN, PERM).unwrap();
        let later = now + CHAN;
        assert_eq!(state.peer_for_channel(0x4001, later), None);

        state.bind_channel(0x4001, p2, later, CHAN, PERM).unwrap();
        assert_eq!(state.peer_for_channel(0x4001, later), Some(p2));
        assert_eq!(state.channel_for_peer(p1, later), None);
    }

    #[test]
    fn test_sweep() {
        let mut state = PermissionState::new();
        let now = Instant::now();
        state.bind_channel(0x4001, peer("198.51.100.1:5000"), now, CHAN, PERM).unwrap();
        state.create_permission("198.51.100.9".parse().unwrap(), now + Duration::from_secs(400), PERM);

        assert_eq!(state.sweep(now + Duration::from_secs(350)), (1, 0));
        assert_eq!(state.sweep(now + CHAN), (0, 1));
        assert_eq!(state.channel_count(), 0);
        assert_eq!(state.permission_count(), 1);
    }
}

// src/auth/nonce.rs
//! Nonce issuing and validation
//!
//! Nonces are random tokens remembered together with the client IP they were
//! issued to and their issue time. A nonce is accepted until it expires; a
//! nonce the server does not know, or one presented from a different IP, is
//! treated as stale so the client simply retries with the fresh one.
//!
//! The store is bounded: once `capacity` nonces are outstanding, expired
//! entries are dropped and then the oldest ones are evicted.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use rand::RngCore;
use tracing::debug;

/// Default bound on outstanding nonces
pub const DEFAULT_NONCE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct IssuedNonce {
    client_ip: IpAddr,
    issued_at: Instant,
}

/// Nonce manager for secure nonce generation and validation
#[derive(Debug)]
pub struct NonceManager {
    issued: DashMap<String, IssuedNonce>,
    lifetime: Duration,
    capacity: usize,
}

impl NonceManager {
    pub fn new(lifetime: Duration) -> Self {
        Self::with_capacity(lifetime, DEFAULT_NONCE_CAPACITY)
    }

    /// Manager holding at most `capacity` outstanding nonces (at least one)
    pub fn with_capacity(lifetime: Duration, capacity: usize) -> Self {
        Self {
            issued: DashMap::new(),
            lifetime,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Generate new nonce for client
    pub fn issue(&self, client_ip: IpAddr, now: Instant) -> String {
        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        let nonce = URL_SAFE_NO_PAD.encode(random);

        if self.issued.len() >= self.capacity {
            self.make_room(now);
        }

        self.issued.insert(
            nonce.clone(),
            IssuedNonce {
                client_ip,
                issued_at: now,
            },
        );
        nonce
    }

    /// Whether `nonce` is live and was issued to `client_ip`
    pub fn is_valid(&self, nonce: &str, client_ip: IpAddr, now: Instant) -> bool {
        let Some(entry) = self.issued.get(nonce).map(|e| *e.value()) else {
            return false;
        };

        if now.saturating_duration_since(entry.issued_at) >= self.lifetime {
            self.issued.remove(nonce);
            return false;
        }

        entry.client_ip == client_ip
    }

    /// Drop expired nonces, then evict the oldest until an eighth of the
    /// capacity is free so a flood does not rescan the map on every issue
    fn make_room(&self, now: Instant) {
        self.sweep(now);

        let target = self.capacity - self.capacity / 8 - 1;
        let excess = self.issued.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut entries: Vec<(String, Instant)> = self
            .issued
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().issued_at))
            .collect();
        entries.sort_by_key(|(_, issued_at)| *issued_at);

        for (nonce, _) in entries.into_iter().take(excess) {
            self.issued.remove(&nonce);
        }
        debug!("Nonce store full, evicted {} oldest nonces", excess);
    }

    /// Drop expired nonces, returning how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.issued.len();
        self.issued
            .retain(|_, entry| now.saturating_duration_since(entry.issued_at) < self.lifetime);
        before - self.issued.len()
    }

    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "198.51.100.7";

    #[test]
    fn test_issue_and_validate() {
        let manager = NonceManager::new(Duration::from_secs(600));
        let now = Instant::now();
        let ip: IpAddr = IP.parse().unwrap();

        let nonce = manager.issue(ip, now);
        assert!(!nonce.is_empty());
        assert!(manager.is_valid(&nonce, ip, now + Duration::from_secs(10)));
        assert!(!manager.is_valid("not-a-nonce", ip, now));
    }

    #[test]
    fn test_nonce_bound_to_client_ip() {
        let manager = NonceManager::new(Duration::from_secs(600));
        let now = Instant::now();
        let nonce = manager.issue(IP.parse().unwrap(), now);
        assert!(!manager.is_valid(&nonce, "203.0.113.9".parse().unwrap(), now));
    }

    #[test]
    fn test_nonce_expiry_and_sweep() {
        let manager = NonceManager::new(Duration::from_secs(60));
        let now = Instant::now();
        let ip: IpAddr = IP.parse().unwrap();

        let old = manager.issue(ip, now);
        let fresh = manager.issue(ip, now + Duration::from_secs(50));

        let later = now + Duration::from_secs(61);
        assert!(!manager.is_valid(&old, ip, later));
        assert!(manager.is_valid(&fresh, ip, later));

        assert_eq!(manager.sweep(now + Duration::from_secs(200)), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_nonces_are_unique() {
        let manager = NonceManager::new(Duration::from_secs(60));
        let now = Instant::now();
        let ip: IpAddr = IP.parse().unwrap();
        assert_ne!(manager.issue(ip, now), manager.issue(ip, now));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_nonce_store_is_bounded() {
        let manager = NonceManager::with_capacity(Duration::from_secs(600), 64);
        let now = Instant::now();

        let first = manager.issue(IP.parse().unwrap(), now);
        for i in 0..5_000u32 {
            let ip = IpAddr::from((0x0A00_0000 + i).to_be_bytes());
            manager.issue(ip, now + Duration::from_millis(u64::from(i) + 1));
            assert!(manager.len() <= manager.capacity());
        }

        // Oldest entries go first, recent ones survive
        assert!(!manager.is_valid(&first, IP.parse().unwrap(), now));
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let recent = manager.issue(ip, now + Duration::from_secs(10));
        assert!(manager.is_valid(&recent, ip, now + Duration::from_secs(10)));
    }
}

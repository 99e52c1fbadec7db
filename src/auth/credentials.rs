// src/auth/credentials.rs
//! Credential store for the long-term credential mechanism (RFC 5389 Section 10.2)
//!
//! The engine never sees plaintext passwords. An [`AuthHandler`] maps a
//! username and realm to the derived key `MD5(username ":" realm ":" password)`.

use std::collections::HashMap;
use std::net::SocketAddr;

use md5::{Digest, Md5};

/// 16-byte long-term key
pub type AuthKey = [u8; 16];

/// Derive the long-term key from username, realm and password
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> AuthKey {
    let input = format!("{}:{}:{}", username, realm, password);
    Md5::digest(input.as_bytes()).into()
}

/// Pluggable key lookup
///
/// Called for every authenticated request. Returning `None` rejects the
/// user with 401.
pub trait AuthHandler: Send + Sync {
    /// Look up the long-term key for `username` in `realm`
    fn auth_key(&self, username: &str, realm: &str, src: SocketAddr) -> Option<AuthKey>;
}

impl<F> AuthHandler for F
where
    F: Fn(&str, &str, SocketAddr) -> Option<AuthKey> + Send + Sync,
{
    fn auth_key(&self, username: &str, realm: &str, src: SocketAddr) -> Option<AuthKey> {
        self(username, realm, src)
    }
}

/// In-memory store of pre-derived keys for a single realm
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    realm: String,
    keys: HashMap<String, AuthKey>,
}

impl StaticCredentials {
    /// Create an empty store for `realm`
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            keys: HashMap::new(),
        }
    }

    /// Derive keys for a list of `(username, password)` pairs
    pub fn from_passwords<'a, I>(realm: impl Into<String>, users: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut store = Self::new(realm);
        for (username, password) in users {
            let key = generate_auth_key(username, &store.realm, password);
            store.keys.insert(username.to_string(), key);
        }
        store
    }

    /// Add a pre-derived key
    pub fn with_key(mut self, username: impl Into<String>, key: AuthKey) -> Self {
        self.keys.insert(username.into(), key);
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl AuthHandler for StaticCredentials {
    fn auth_key(&self, username: &str, realm: &str, _src: SocketAddr) -> Option<AuthKey> {
        if realm != self.realm {
            return None;
        }
        self.keys.get(username).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_generate_auth_key_rfc_vector() {
        // RFC 5389 Section 15.4: MD5("user:realm:pass")
        let key = generate_auth_key("user", "realm", "pass");
        assert_eq!(
            key,
            [
                0x84, 0x93, 0xfb, 0xc5, 0x3b, 0xa5, 0x82, 0xfb, 0x4c, 0x04, 0x4c, 0x45, 0x6b, 0xdc,
                0x40, 0xeb
            ]
        );
    }

    #[test]
    fn test_static_credentials_lookup() {
        let store = StaticCredentials::from_passwords("example.org", [("alice", "pw1"), ("bob", "pw2")]);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.auth_key("alice", "example.org", src()),
            Some(generate_auth_key("alice", "example.org", "pw1"))
        );
        assert_eq!(store.auth_key("alice", "other.org", src()), None);
        assert_eq!(store.auth_key("carol", "example.org", src()), None);
    }

    #[test]
    fn test_closure_handler() {
        let key = generate_auth_key("alice", "r", "p");
        let handler = move |user: &str, _realm: &str, _src: SocketAddr| {
            (user == "alice").then_some(key)
        };
        assert_eq!(handler.auth_key("alice", "r", src()), Some(key));
        assert_eq!(handler.auth_key("bob", "r", src()), None);
    }
}

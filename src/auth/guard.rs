// src/auth/guard.rs
//! Long-term credential verification for TURN requests
//!
//! Every request other than Binding passes through [`AuthGuard::verify`]:
//!
//! ```text
//! request ──► no MESSAGE-INTEGRITY ─────────────► 401 + REALM + NONCE
//!        │
//!        ├──► missing USERNAME/REALM/NONCE ─────► 400
//!        ├──► unknown or expired NONCE ─────────► 438 + REALM + NONCE
//!        ├──► unknown user / integrity mismatch ► 401 + REALM + NONCE
//!        └──► verified ─────────────────────────► handler, response signed with the key
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::credentials::{AuthHandler, AuthKey};
use super::nonce::NonceManager;
use crate::error::{TurnError, TurnResult};
use crate::stun::{Attribute, AttributeType, Message};

/// Identity established for a request that passed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub username: String,
    pub realm: String,
    pub key: AuthKey,
}

pub struct AuthGuard {
    realm: String,
    handler: Arc<dyn AuthHandler>,
    nonces: NonceManager,
}

impl AuthGuard {
    pub fn new(
        realm: impl Into<String>,
        handler: Arc<dyn AuthHandler>,
        nonce_lifetime: Duration,
        max_nonces: usize,
    ) -> Self {
        Self {
            realm: realm.into(),
            handler,
            nonces: NonceManager::with_capacity(nonce_lifetime, max_nonces),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Verify the long-term credentials carried by `msg`.
    ///
    /// `raw` is the exact datagram or frame `msg` was decoded from; the
    /// integrity check runs over those bytes.
    pub fn verify(
        &self,
        msg: &Message,
        raw: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> TurnResult<Verified> {
        if !msg.has_attribute(AttributeType::MessageIntegrity) {
            return Err(TurnError::AuthenticationRequired);
        }

        let (Some(username), Some(realm), Some(nonce)) = (msg.username(), msg.realm(), msg.nonce())
        else {
            return Err(TurnError::BadRequest(
                "MESSAGE-INTEGRITY without USERNAME, REALM and NONCE".into(),
            ));
        };

        if !self.nonces.is_valid(nonce, src.ip(), now) {
            debug!("Stale nonce from {}", src);
            return Err(TurnError::StaleNonce);
        }

        if realm != self.realm {
            return Err(TurnError::Unauthorized(format!("unknown realm {}", realm)));
        }

        let Some(key) = self.handler.auth_key(username, realm, src) else {
            return Err(TurnError::Unauthorized(format!("unknown user {}", username)));
        };

        if !msg.verify_integrity(raw, &key) {
            return Err(TurnError::Unauthorized(format!(
                "integrity check failed for {}",
                username
            )));
        }

        Ok(Verified {
            username: username.to_string(),
            realm: realm.to_string(),
            key,
        })
    }

    /// REALM and a freshly issued NONCE for a challenge response
    pub fn challenge(&self, client_ip: IpAddr, now: Instant) -> [Attribute; 2] {
        [
            Attribute::realm(self.realm.clone()),
            Attribute::nonce(self.nonces.issue(client_ip, now)),
        ]
    }

    /// Drop expired nonces
    pub fn sweep(&self, now: Instant) -> usize {
        self.nonces.sweep(now)
    }

    pub fn nonce_count(&self) -> usize {
        self.nonces.len()
    }
}

impl std::fmt::Debug for AuthGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGuard")
            .field("realm", &self.realm)
            .field("nonces", &self.nonces.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_auth_key, StaticCredentials};
    use crate::stun::{MessageType, TransactionId, PROTO_UDP};

    const REALM: &str = "example.org";

    fn guard() -> AuthGuard {
        let creds = StaticCredentials::from_passwords(REALM, [("alice", "pw1")]);
        AuthGuard::new(REALM, Arc::new(creds), Duration::from_secs(600), 1_000)
    }

    fn src() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    fn nonce_of(challenge: &[Attribute; 2]) -> String {
        match &challenge[1].value {
            crate::stun::AttributeValue::Text(nonce) => nonce.clone(),
            other => panic!("unexpected nonce value {:?}", other),
        }
    }

    fn signed_allocate(user: &str, realm: &str, nonce: &str, password: &str) -> (Message, Vec<u8>) {
        let msg = Message::new(MessageType::ALLOCATE_REQUEST, TransactionId::new())
            .with(Attribute::requested_transport(PROTO_UDP))
            .with(Attribute::username(user))
            .with(Attribute::realm(realm))
            .with(Attribute::nonce(nonce));
        let key = generate_auth_key(user, realm, password);
        let raw = msg.encode(Some(&key), true).unwrap().to_vec();
        (Message::decode(&raw).unwrap(), raw)
    }

    #[test]
    fn test_unsigned_request_is_challenged() {
        let guard = guard();
        let msg = Message::new(MessageType::ALLOCATE_REQUEST, TransactionId::new())
            .with(Attribute::requested_transport(PROTO_UDP));
        let raw = msg.encode(None, false).unwrap();

        let err = guard.verify(&msg, &raw, src(), Instant::now()).unwrap_err();
        assert!(matches!(err, TurnError::AuthenticationRequired));
        assert!(err.needs_challenge());
    }

    #[test]
    fn test_valid_credentials_verify() {
        let guard = guard();
        let now = Instant::now();
        let nonce = nonce_of(&guard.challenge(src().ip(), now));

        let (msg, raw) = signed_allocate("alice", REALM, &nonce, "pw1");
        let verified = guard.verify(&msg, &raw, src(), now).unwrap();
        assert_eq!(verified.username, "alice");
        assert_eq!(verified.key, generate_auth_key("alice", REALM, "pw1"));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let guard = guard();
        let now = Instant::now();
        let nonce = nonce_of(&guard.challenge(src().ip(), now));

        let (msg, raw) = signed_allocate("alice", REALM, &nonce, "wrong");
        let err = guard.verify(&msg, &raw, src(), now).unwrap_err();
        assert!(matches!(err, TurnError::Unauthorized(_)));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let guard = guard();
        let now = Instant::now();
        let nonce = nonce_of(&guard.challenge(src().ip(), now));

        let (msg, raw) = signed_allocate("mallory", REALM, &nonce, "pw1");
        assert!(matches!(
            guard.verify(&msg, &raw, src(), now),
            Err(TurnError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_nonce_is_stale() {
        let guard = guard();
        let now = Instant::now();
        let nonce = nonce_of(&guard.challenge(src().ip(), now));

        let (msg, raw) = signed_allocate("alice", REALM, &nonce, "pw1");
        let later = now + Duration::from_secs(601);
        assert!(matches!(
            guard.verify(&msg, &raw, src(), later),
            Err(TurnError::StaleNonce)
        ));

        let (msg, raw) = signed_allocate("alice", REALM, "never-issued", "pw1");
        assert!(matches!(
            guard.verify(&msg, &raw, src(), now),
            Err(TurnError::StaleNonce)
        ));
    }

    #[test]
    fn test_integrity_without_identity_is_bad_request() {
        let guard = guard();
        let msg = Message::new(MessageType::REFRESH_REQUEST, TransactionId::new());
        let raw = msg.encode(Some(b"0123456789abcdef"), false).unwrap();
        let msg = Message::decode(&raw).unwrap();

        assert!(matches!(
            guard.verify(&msg, &raw, src(), Instant::now()),
            Err(TurnError::BadRequest(_))
        ));
    }

    #[test]
    fn test_challenge_flood_stays_bounded() {
        let creds = StaticCredentials::from_passwords(REALM, [("alice", "pw1")]);
        let guard = AuthGuard::new(REALM, Arc::new(creds), Duration::from_secs(600), 32);
        let now = Instant::now();

        for i in 0..2_000u32 {
            let ip = IpAddr::from((0xC633_6400 + i).to_be_bytes());
            guard.challenge(ip, now);
        }
        assert!(guard.nonce_count() <= 32);

        // A nonce issued after the flood still verifies
        let nonce = nonce_of(&guard.challenge(src().ip(), now));
        let (msg, raw) = signed_allocate("alice", REALM, &nonce, "pw1");
        assert!(guard.verify(&msg, &raw, src(), now).is_ok());
    }
}

// src/auth/mod.rs
//! Long-term credential authentication

pub mod credentials;
pub mod guard;
pub mod nonce;

pub use credentials::{generate_auth_key, AuthHandler, AuthKey, StaticCredentials};
pub use guard::{AuthGuard, Verified};
pub use nonce::{NonceManager, DEFAULT_NONCE_CAPACITY};

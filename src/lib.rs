//! TURN relay server library (lib.rs)
//!
//! Relay engine implementing TURN (RFC 5766/8656) over UDP and TCP with the
//! STUN long-term credential mechanism.
//!
//! ```text
//! listener ─► stun codec ─► dispatcher ─► auth guard ─► allocation table
//!                               │                            │
//!                               └── ChannelData / Send ──► relay socket ─► peer
//! ```

#![warn(clippy::all)]

pub mod allocation;
pub mod auth;
pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod stun;

pub use allocation::{Allocation, AllocationPolicy, AllocationTable, FiveTuple, TransportProtocol};
pub use auth::{generate_auth_key, AuthHandler, AuthKey, StaticCredentials};
pub use config::{parse_users, RelayConfig, ServerConfig};
pub use error::{StunError, TurnError, TurnResult};
pub use relay::{PortRangeRelayGenerator, RelayAddressGenerator, StaticRelayGenerator};
pub use server::{Listeners, TurnServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system
///
/// `RUST_LOG` takes precedence over `level` (trace/debug/info/warn/error).
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of the runtime
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .try_init();
}

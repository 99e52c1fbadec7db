// src/server/mod.rs
//! TURN server lifecycle
//!
//! [`TurnServer::start`] binds the listeners and spawns:
//! - the UDP receive loop and TCP accept loop ([`listener`])
//! - one relay task per allocation, forwarding peer traffic to the client
//! - a sweep task expiring allocations, permissions, channels and nonces
//!
//! All tasks are tracked and observe one cancellation token, so
//! [`TurnServer::stop`] returns only after every socket is released.

pub mod dispatch;
pub mod listener;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::allocation::{Allocation, AllocationTable};
use crate::auth::{AuthGuard, AuthHandler};
use crate::config::ServerConfig;
use crate::error::{TurnError, TurnResult};
use crate::relay::RelayAddressGenerator;
use crate::stun::{Attribute, ChannelData, Message, MessageType, TransactionId, MAX_MESSAGE_SIZE};

use listener::ClientSink;
pub use listener::Listeners;

/// State shared by every listener, worker and relay task
pub(crate) struct ServerContext {
    pub(crate) software: String,
    pub(crate) allocations: AllocationTable,
    pub(crate) auth: AuthGuard,
    pub(crate) relay: Arc<dyn RelayAddressGenerator>,
    pub(crate) max_udp_workers: usize,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl ServerContext {
    /// Start forwarding peer traffic arriving on the allocation's relay socket
    pub(crate) fn spawn_relay(self: &Arc<Self>, allocation: Arc<Allocation>, sink: ClientSink) {
        let Ok(socket) = allocation.socket() else {
            return;
        };

        let ctx = self.clone();
        let task_allocation = allocation.clone();
        let handle = self
            .tasks
            .spawn(async move { ctx.relay_loop(task_allocation, socket, sink).await });
        allocation.attach_relay_task(handle);
    }

    async fn relay_loop(&self, allocation: Arc<Allocation>, socket: Arc<UdpSocket>, sink: ClientSink) {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let relay_addr = allocation.relay_addr();

        loop {
            let (size, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Relay socket {} receive failed: {}", relay_addr, e);
                        break;
                    }
                },
            };

            let now = Instant::now();
            if allocation.is_closed() {
                break;
            }
            if allocation.is_expired(now) {
                trace!("Dropping {} bytes from {} for expired {}", size, peer, relay_addr);
                continue;
            }
            if !allocation.has_permission(peer.ip(), now) {
                trace!("Dropping {} bytes from {} without permission", size, peer);
                continue;
            }

            let payload = Bytes::copy_from_slice(&buf[..size]);
            let frame = match allocation.channel_for_peer(peer, now) {
                Some(channel) => ChannelData::new(channel, payload).encode(sink.is_stream()),
                None => Message::new(MessageType::DATA_INDICATION, TransactionId::new())
                    .with(Attribute::xor_peer_address(peer))
                    .with(Attribute::data(payload))
                    .encode(None, false),
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Cannot frame data from {}: {}", peer, e);
                    continue;
                }
            };

            if let Err(e) = sink.send(frame).await {
                if sink.is_stream() {
                    warn!("Client of {} is gone: {}", relay_addr, e);
                    break;
                }
                debug!("Failed to deliver data to client of {}: {}", relay_addr, e);
            }
        }

        debug!("Relay task for {} ended", relay_addr);
    }

    fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let ctx = self.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let expired = ctx.allocations.expire_sweep(now);
                        let nonces = ctx.auth.sweep(now);
                        if expired + nonces > 0 {
                            debug!("Sweep removed {} allocations and {} nonces", expired, nonces);
                        }
                    }
                }
            }
        });
    }
}

/// A running TURN server
pub struct TurnServer {
    ctx: Arc<ServerContext>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    stopped: AtomicBool,
}

impl TurnServer {
    /// Bind the configured listeners and start serving
    pub async fn start(config: ServerConfig, auth_handler: Arc<dyn AuthHandler>) -> TurnResult<Self> {
        config.validate()?;
        let listeners = Listeners::bind(config.listen_addr(), config.enable_udp, config.enable_tcp).await?;
        let relay = config.relay.build(config.max_bind_attempts);
        Self::start_with_listeners(listeners, config, auth_handler, relay)
    }

    /// Serve on already bound listeners with a custom relay generator
    pub fn start_with_listeners(
        listeners: Listeners,
        config: ServerConfig,
        auth_handler: Arc<dyn AuthHandler>,
        relay: Arc<dyn RelayAddressGenerator>,
    ) -> TurnResult<Self> {
        relay.validate()?;
        if listeners.udp.is_none() && listeners.tcp.is_none() {
            return Err(TurnError::Configuration("no listener to serve on".into()));
        }

        let ctx = Arc::new(ServerContext {
            software: config.software.clone(),
            allocations: AllocationTable::new(config.allocation_policy()),
            auth: AuthGuard::new(
                config.realm.clone(),
                auth_handler,
                config.nonce_lifetime,
                config.max_nonces,
            ),
            relay,
            max_udp_workers: config.max_udp_workers.max(1),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let udp_addr = match listeners.udp {
            Some(socket) => Some(listener::spawn_udp(&ctx, socket)?),
            None => None,
        };
        let tcp_addr = match listeners.tcp {
            Some(tcp) => Some(listener::spawn_tcp(&ctx, tcp)?),
            None => None,
        };

        ctx.spawn_sweeper(config.sweep_interval);

        info!(
            "TURN server started (realm: {}, relay: {})",
            config.realm,
            ctx.relay.relay_ip()
        );

        Ok(Self {
            ctx,
            udp_addr,
            tcp_addr,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.ctx.allocations.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop listening, close every relay socket and wait for all tasks.
    ///
    /// Safe to call concurrently; every call after the first returns
    /// [`TurnError::AlreadyStopped`] without side effects.
    pub async fn stop(&self) -> TurnResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(TurnError::AlreadyStopped);
        }

        info!("Stopping TURN server");
        self.ctx.shutdown.cancel();
        let released = self.ctx.allocations.close_all();

        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;

        info!("TURN server stopped, {} allocations released", released);
        Ok(())
    }
}

impl Drop for TurnServer {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.ctx.shutdown.cancel();
            self.ctx.allocations.close_all();
        }
    }
}

impl std::fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnServer")
            .field("udp_addr", &self.udp_addr)
            .field("tcp_addr", &self.tcp_addr)
            .field("allocations", &self.allocation_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

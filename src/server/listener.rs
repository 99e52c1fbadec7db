// src/server/listener.rs
//! Transport endpoints
//!
//! UDP: one receive loop per socket fans datagrams out to a worker task per
//! client source address, so requests from one client are handled in order
//! while different clients proceed concurrently. Workers exit after a
//! period of silence. Past the configured worker limit, packets from new
//! sources are served directly on the receive loop.
//!
//! TCP: one task per accepted connection. Frames are split by
//! [`TurnFrameCodec`]; writes go through a queue drained by a writer task so
//! responses and relayed data never interleave mid-frame.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, trace, warn};

use super::ServerContext;
use crate::allocation::{FiveTuple, TransportProtocol};
use crate::error::TurnResult;
use crate::stun::{TurnFrameCodec, MAX_MESSAGE_SIZE};

const UDP_WORKER_QUEUE: usize = 128;
const UDP_WORKER_IDLE: Duration = Duration::from_secs(60);
const UDP_WORKER_PRUNE: Duration = Duration::from_secs(30);
const TCP_WRITE_QUEUE: usize = 256;

/// Sockets the server accepts clients on
#[derive(Debug, Default)]
pub struct Listeners {
    pub udp: Option<UdpSocket>,
    pub tcp: Option<TcpListener>,
}

impl Listeners {
    /// Bind UDP and/or TCP on `addr`. Failure here is fatal for the server.
    pub async fn bind(addr: SocketAddr, udp: bool, tcp: bool) -> TurnResult<Self> {
        let udp = if udp {
            Some(UdpSocket::bind(addr).await.map_err(|e| {
                error!("Failed to bind UDP listener on {}: {}", addr, e);
                e
            })?)
        } else {
            None
        };

        let tcp = if tcp {
            Some(TcpListener::bind(addr).await.map_err(|e| {
                error!("Failed to bind TCP listener on {}: {}", addr, e);
                e
            })?)
        } else {
            None
        };

        Ok(Self { udp, tcp })
    }
}

/// Write path back to a client
#[derive(Debug, Clone)]
pub(crate) enum ClientSink {
    Udp {
        socket: Arc<UdpSocket>,
        client: SocketAddr,
    },
    Tcp {
        tx: mpsc::Sender<Bytes>,
    },
}

impl ClientSink {
    /// Stream transports need padded ChannelData
    pub(crate) fn is_stream(&self) -> bool {
        matches!(self, ClientSink::Tcp { .. })
    }

    pub(crate) async fn send(&self, frame: Bytes) -> io::Result<()> {
        match self {
            ClientSink::Udp { socket, client } => socket.send_to(&frame, *client).await.map(|_| ()),
            ClientSink::Tcp { tx } => tx
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")),
        }
    }
}

/// Start the UDP receive loop, returning the bound address
pub(crate) fn spawn_udp(ctx: &Arc<ServerContext>, socket: UdpSocket) -> io::Result<SocketAddr> {
    let local = socket.local_addr()?;
    let socket = Arc::new(socket);
    let task_ctx = ctx.clone();
    ctx.tasks.spawn(async move { udp_loop(task_ctx, socket, local).await });
    info!("UDP listener started on {}", local);
    Ok(local)
}

/// Start the TCP accept loop, returning the bound address
pub(crate) fn spawn_tcp(ctx: &Arc<ServerContext>, listener: TcpListener) -> io::Result<SocketAddr> {
    let local = listener.local_addr()?;
    let task_ctx = ctx.clone();
    ctx.tasks.spawn(async move { tcp_accept_loop(task_ctx, listener, local).await });
    info!("TCP listener started on {}", local);
    Ok(local)
}

async fn udp_loop(ctx: Arc<ServerContext>, socket: Arc<UdpSocket>, local: SocketAddr) {
    let mut workers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut prune = tokio::time::interval(UDP_WORKER_PRUNE);
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        let (size, src) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = prune.tick() => {
                workers.retain(|_, tx| !tx.is_closed());
                continue;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive error on {}: {}", local, e);
                    continue;
                }
            },
        };

        let packet = Bytes::copy_from_slice(&buf[..size]);
        let packet = match workers.get(&src) {
            Some(tx) => match tx.try_send(packet) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => {
                    trace!("Worker queue for {} full, dropping packet", src);
                    continue;
                }
                Err(TrySendError::Closed(packet)) => packet,
            },
            None => packet,
        };

        if workers.len() >= ctx.max_udp_workers {
            workers.retain(|_, tx| !tx.is_closed());
        }
        if workers.len() >= ctx.max_udp_workers {
            // Worker table full: serve on the receive loop itself
            trace!("UDP worker limit reached, serving {} inline", src);
            let five_tuple = FiveTuple::new(src, local, TransportProtocol::Udp);
            let sink = ClientSink::Udp {
                socket: socket.clone(),
                client: src,
            };
            ctx.serve(&packet, five_tuple, &sink).await;
            continue;
        }

        let tx = spawn_udp_worker(&ctx, socket.clone(), local, src);
        if tx.try_send(packet).is_err() {
            trace!("Fresh worker for {} rejected packet", src);
        }
        workers.insert(src, tx);
    }

    debug!("UDP listener on {} stopped", local);
}

fn spawn_udp_worker(
    ctx: &Arc<ServerContext>,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    client: SocketAddr,
) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(UDP_WORKER_QUEUE);
    let ctx = ctx.clone();

    ctx.tasks.clone().spawn(async move {
        let five_tuple = FiveTuple::new(client, local, TransportProtocol::Udp);
        let sink = ClientSink::Udp { socket, client };
        trace!("UDP worker for {} started", client);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return,
                next = tokio::time::timeout(UDP_WORKER_IDLE, rx.recv()) => match next {
                    Ok(Some(packet)) => ctx.serve(&packet, five_tuple, &sink).await,
                    _ => break,
                },
            }
        }

        // Idle: stop accepting, then finish what is already queued
        rx.close();
        while let Ok(packet) = rx.try_recv() {
            ctx.serve(&packet, five_tuple, &sink).await;
        }
        trace!("UDP worker for {} exited", client);
    });

    tx
}

async fn tcp_accept_loop(ctx: Arc<ServerContext>, listener: TcpListener, local: SocketAddr) {
    loop {
        let (stream, client) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TCP accept error on {}: {}", local, e);
                    continue;
                }
            },
        };

        debug!("Accepted TCP connection from {}", client);
        let conn_ctx = ctx.clone();
        ctx.tasks
            .spawn(async move { tcp_connection(conn_ctx, stream, client, local).await });
    }

    debug!("TCP listener on {} stopped", local);
}

async fn tcp_connection(ctx: Arc<ServerContext>, stream: TcpStream, client: SocketAddr, local: SocketAddr) {
    let five_tuple = FiveTuple::new(client, local, TransportProtocol::Tcp);
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(TCP_WRITE_QUEUE);

    let writer_shutdown = ctx.shutdown.clone();
    ctx.tasks.spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = write_half.write_all(&frame).await {
                debug!("TCP write to {} failed: {}", client, e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let sink = ClientSink::Tcp { tx };
    let mut frames = FramedRead::new(read_half, TurnFrameCodec);

    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => ctx.serve(&frame, five_tuple, &sink).await,
            Some(Err(e)) => {
                debug!("Closing TCP connection from {}: {}", client, e);
                break;
            }
            None => break,
        }
    }

    // An allocation made over TCP lives only as long as its connection
    ctx.allocations.remove(&five_tuple);
    debug!("TCP connection from {} closed", client);
}

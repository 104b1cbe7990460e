//! The channel transport seam: how a shell/control/iopub/stdin channel is
//! physically reached, kept abstract so the rest of the crate never touches
//! a socket type directly.
//!
//! The real implementation, [`ZmqChannelTransport`], is grounded on
//! `driver_zeromq.rs`'s socket setup: a `DealerSocket` for shell/control/
//! stdin, a `SubSocket` (subscribed to everything) for iopub. Heartbeat is
//! deliberately not wired up here — it stays out of core scope alongside the
//! rest of the liveness-probing story, which instead uses the dual-channel
//! handshake in [`crate::handshake`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use zeromq::{Socket, SocketRecv, SocketSend};

use crate::connection::ConnectionProfile;
use crate::Error;

/// Which of a kernel's channels a [`Channel`] speaks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Request/reply channel for execute, inspect, complete, and friends.
    Shell,
    /// Out-of-band request/reply channel for interrupt and shutdown.
    Control,
    /// Broadcast channel for status, stream, and display output.
    Iopub,
    /// Channel the kernel uses to request input from the frontend.
    Stdin,
}

/// One open multipart-message channel to a kernel.
///
/// Implementations carry their own internal buffering; callers are expected
/// to drive `send_multipart`/`recv_multipart` from a single task per
/// direction, matching the per-channel `tokio::select!` loops used
/// throughout this crate.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a raw multipart message (already wire-encoded) on this channel.
    async fn send_multipart(&self, parts: Vec<Bytes>) -> Result<(), Error>;

    /// Receive the next raw multipart message on this channel, blocking
    /// until one arrives or the channel closes.
    async fn recv_multipart(&self) -> Result<Vec<Bytes>, Error>;
}

/// A way of opening channels to a kernel's connection profile.
///
/// `identity` is the routing identity to prefix outgoing frames with, used
/// by the session fan-out to multiplex several client sessions over one
/// kernel-facing dealer socket; `None` lets the transport pick its own.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open the given channel against `profile`.
    async fn connect(
        &self,
        channel: ChannelId,
        profile: &ConnectionProfile,
        identity: Option<&[u8]>,
    ) -> Result<Box<dyn Channel>, Error>;
}

/// A [`ChannelTransport`] backed by real ZeroMQ sockets.
#[derive(Debug, Default)]
pub struct ZmqChannelTransport;

#[async_trait]
impl ChannelTransport for ZmqChannelTransport {
    async fn connect(
        &self,
        channel: ChannelId,
        profile: &ConnectionProfile,
        identity: Option<&[u8]>,
    ) -> Result<Box<dyn Channel>, Error> {
        let port = match channel {
            ChannelId::Shell => profile.shell_port,
            ChannelId::Control => profile.control_port,
            ChannelId::Iopub => profile.iopub_port,
            ChannelId::Stdin => profile.stdin_port,
        };
        let addr = format!("{}://{}:{}", profile.transport, profile.host, port);

        match channel {
            ChannelId::Iopub => {
                let mut socket = zeromq::SubSocket::new();
                socket.connect(&addr).await?;
                socket.subscribe("").await?;
                Ok(Box::new(ZmqSubChannel {
                    socket: tokio::sync::Mutex::new(socket),
                }))
            }
            ChannelId::Shell | ChannelId::Control | ChannelId::Stdin => {
                // `identity` distinguishes client sessions at the routing
                // layer the session fan-out builds on top (msg_id/session
                // matching in `correlator`/`fanout`), not at the ZMTP socket
                // level; a single dealer socket per channel is sufficient
                // here, matching `driver_zeromq.rs`.
                let _ = identity;
                let mut socket = zeromq::DealerSocket::new();
                socket.connect(&addr).await?;
                Ok(Box::new(ZmqDealerChannel {
                    socket: tokio::sync::Mutex::new(socket),
                }))
            }
        }
    }
}

/// A dealer-backed channel (shell, control, stdin): bidirectional
/// request/reply.
struct ZmqDealerChannel {
    socket: tokio::sync::Mutex<zeromq::DealerSocket>,
}

#[async_trait]
impl Channel for ZmqDealerChannel {
    async fn send_multipart(&self, parts: Vec<Bytes>) -> Result<(), Error> {
        let msg = zeromq::ZmqMessage::try_from(parts)
            .map_err(|err| Error::MalformedFrame(err.to_string()))?;
        self.socket.lock().await.send(msg).await?;
        Ok(())
    }

    async fn recv_multipart(&self) -> Result<Vec<Bytes>, Error> {
        let msg = self.socket.lock().await.recv().await?;
        Ok(msg.into_vec())
    }
}

/// A sub-backed channel (iopub): receive-only broadcast.
struct ZmqSubChannel {
    socket: tokio::sync::Mutex<zeromq::SubSocket>,
}

#[async_trait]
impl Channel for ZmqSubChannel {
    async fn send_multipart(&self, _parts: Vec<Bytes>) -> Result<(), Error> {
        Err(Error::KernelConnect("iopub is a receive-only channel".into()))
    }

    async fn recv_multipart(&self) -> Result<Vec<Bytes>, Error> {
        let msg = self.socket.lock().await.recv().await?;
        Ok(msg.into_vec())
    }
}

/// An in-memory [`ChannelTransport`] double for tests: each `(channel,
/// identity)` pair gets its own pair of unbounded queues, one in each
/// direction, so a test can drive both sides of a conversation without a
/// real kernel process.
#[derive(Default)]
pub struct MockChannelTransport {
    channels: DashMap<(ChannelId, Vec<u8>), MockChannel>,
}

impl MockChannelTransport {
    /// Create an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the peer-facing half of a channel previously opened via
    /// [`ChannelTransport::connect`], so a test can inject kernel-side
    /// messages and observe what the driver sent.
    pub fn peer(&self, channel: ChannelId, identity: &[u8]) -> MockChannel {
        self.channels
            .entry((channel, identity.to_vec()))
            .or_insert_with(MockChannel::new_pair)
            .clone()
    }
}

#[async_trait]
impl ChannelTransport for MockChannelTransport {
    async fn connect(
        &self,
        channel: ChannelId,
        _profile: &ConnectionProfile,
        identity: Option<&[u8]>,
    ) -> Result<Box<dyn Channel>, Error> {
        let key = (channel, identity.unwrap_or(b"").to_vec());
        let mock = self.channels.entry(key).or_insert_with(MockChannel::new_pair).clone();
        Ok(Box::new(mock))
    }
}

/// A single in-memory channel: what's sent on one side arrives on the
/// other. Clonable handles share the same pair of queues.
#[derive(Clone)]
pub struct MockChannel {
    outbound: async_channel::Sender<Vec<Bytes>>,
    outbound_rx: async_channel::Receiver<Vec<Bytes>>,
    inbound: async_channel::Sender<Vec<Bytes>>,
    inbound_rx: async_channel::Receiver<Vec<Bytes>>,
}

impl MockChannel {
    fn new_pair() -> Self {
        let (outbound, outbound_rx) = async_channel::unbounded();
        let (inbound, inbound_rx) = async_channel::unbounded();
        Self {
            outbound,
            outbound_rx,
            inbound,
            inbound_rx,
        }
    }

    /// Push a message as if the kernel (peer) sent it; the connected
    /// [`Channel`]'s `recv_multipart` will yield it.
    pub async fn push_from_peer(&self, parts: Vec<Bytes>) {
        let _ = self.inbound.send(parts).await;
    }

    /// Pop the next message the connected [`Channel`] sent, as the kernel
    /// (peer) would observe it.
    pub async fn recv_sent(&self) -> Option<Vec<Bytes>> {
        self.outbound_rx.recv().await.ok()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send_multipart(&self, parts: Vec<Bytes>) -> Result<(), Error> {
        self.outbound.send(parts).await.map_err(|_| Error::ChannelClosed)
    }

    async fn recv_multipart(&self) -> Result<Vec<Bytes>, Error> {
        self.inbound_rx.recv().await.map_err(|_| Error::ChannelClosed)
    }
}

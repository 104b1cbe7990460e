//! A bidirectional protocol driver for Jupyter kernels.
//!
//! This crate bridges a running kernel process, reached over the four
//! asynchronous message channels described by the [Jupyter messaging
//! protocol](https://jupyter-client.readthedocs.io/en/stable/messaging.html),
//! to two kinds of clients: a headless *driver* that executes cells on behalf
//! of a collaborative document ([`execute`]), and a *server* that proxies raw
//! protocol frames between the kernel and one or more client sessions
//! ([`fanout`]).
//!
//! Capabilities that belong to a surrounding application — authentication,
//! HTTP routing, kernelspec discovery beyond the locator contract, process
//! spawning beyond the launcher contract, and CRDT document internals — are
//! consumed as injected traits rather than implemented here. See
//! [`supervisor`], [`execute::CellDocument`], and [`transport`] for those
//! seams.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::io;

pub mod connection;
pub mod correlator;
pub mod entity;
pub mod environment;
pub mod execute;
pub mod fanout;
pub mod handshake;
pub mod helpers;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod wire;

/// Errors raised anywhere in the kernel protocol driver.
///
/// Listener tasks log-and-continue on the per-frame variants
/// ([`Error::SignatureMismatch`], [`Error::MalformedFrame`]); supervisor-level
/// errors are surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernelspec locator could not find a kernel by that name.
    #[error("no such kernelspec: {0}")]
    KernelspecMissing(String),

    /// An error occurred while starting or managing a subprocess.
    #[error("failed to run subprocess: {0}")]
    Subprocess(io::Error),

    /// Could not connect to the kernel.
    #[error("could not connect to the kernel: {0}")]
    KernelConnect(String),

    /// Disconnected while communicating with a kernel.
    #[error("disconnected from the kernel")]
    KernelDisconnect,

    /// The on-disk connection descriptor was missing required fields or
    /// could not be parsed.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// A frame's HMAC signature did not match its contents.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// A frame was missing the `<IDS|MSG>` delimiter or contained invalid
    /// JSON.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The handshake did not complete within the deadline.
    #[error("kernel did not become ready in time")]
    StartupTimeout,

    /// A cell execution did not complete within the deadline.
    #[error("execution timed out")]
    ExecutionTimeout,

    /// The transport reported end-of-stream.
    #[error("channel closed")]
    ChannelClosed,

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Error while deserializing a message.
    #[error("could not deserialize message: {0}")]
    DeserializeMessage(String),

    /// Error originating from ZeroMQ.
    #[error("zeromq: {0}")]
    Zmq(#[from] zeromq::ZmqError),
}

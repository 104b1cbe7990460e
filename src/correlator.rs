//! Request/reply correlation across the shell, control, iopub, and stdin
//! channels.
//!
//! Generalizes `KernelConnection`/`PendingRequest` — which tracks a single
//! oneshot reply per outstanding shell/control request and shares one iopub
//! receiver across all callers — into the three-queue
//! design `driver.py`'s `execute_requests: Dict[str, Dict[str, Queue]]`
//! needs: each in-flight request gets its own reply queue (for the shell or
//! control reply), its own iopub queue (for streamed output), and its own
//! stdin queue (for `input_request`), all keyed by `msg_id` in a `DashMap`.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::connection::ConnectionProfile;
use crate::transport::{Channel, ChannelId, ChannelTransport};
use crate::wire::{codec, KernelMessage, KernelMessageType, Reply};
use crate::Error;

struct PendingQueues {
    reply_tx: async_channel::Sender<KernelMessage>,
    iopub_tx: async_channel::Sender<KernelMessage>,
    stdin_tx: async_channel::Sender<KernelMessage>,
}

/// Routes replies and streamed output back to whichever in-flight request
/// they belong to, and dispatches `comm_open`/`comm_msg` iopub traffic to a
/// shared queue.
pub struct RequestCorrelator {
    key: String,
    shell: Arc<dyn Channel>,
    control: Arc<dyn Channel>,
    stdin: Arc<dyn Channel>,
    pending: Arc<DashMap<String, PendingQueues>>,
    comm_rx: async_channel::Receiver<KernelMessage>,
    signal: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

impl RequestCorrelator {
    /// Connect all four channels against `profile` and start the listener
    /// tasks that demultiplex replies to pending requests.
    pub async fn connect(
        transport: &dyn ChannelTransport,
        profile: &ConnectionProfile,
        identity: &[u8],
    ) -> Result<Self, Error> {
        let shell: Arc<dyn Channel> =
            Arc::from(transport.connect(ChannelId::Shell, profile, Some(identity)).await?);
        let control: Arc<dyn Channel> =
            Arc::from(transport.connect(ChannelId::Control, profile, None).await?);
        let iopub: Arc<dyn Channel> =
            Arc::from(transport.connect(ChannelId::Iopub, profile, None).await?);
        let stdin: Arc<dyn Channel> =
            Arc::from(transport.connect(ChannelId::Stdin, profile, Some(identity)).await?);

        let pending: Arc<DashMap<String, PendingQueues>> = Arc::new(DashMap::new());
        let (comm_tx, comm_rx) = async_channel::unbounded();
        let signal = CancellationToken::new();

        let key = profile.key.clone();
        spawn_reply_listener(shell.clone(), pending.clone(), signal.clone(), key.clone());
        spawn_reply_listener(control.clone(), pending.clone(), signal.clone(), key.clone());
        spawn_stdin_listener(stdin.clone(), pending.clone(), signal.clone(), key.clone());
        spawn_iopub_listener(iopub, pending.clone(), comm_tx, signal.clone(), key.clone());

        let drop_guard = Arc::new(signal.clone().drop_guard());
        Ok(Self {
            key: profile.key.clone(),
            shell,
            control,
            stdin,
            pending,
            comm_rx,
            signal,
            _drop_guard: drop_guard,
        })
    }

    /// Register a new in-flight request, returning a handle with its three
    /// private queues. Dropping the handle removes the entry from the
    /// shared map, mirroring `PendingRequest`'s `Drop` impl.
    pub fn install(&self, msg_id: String) -> PendingRequest {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        let (iopub_tx, iopub_rx) = async_channel::unbounded();
        let (stdin_tx, stdin_rx) = async_channel::unbounded();
        self.pending.insert(
            msg_id.clone(),
            PendingQueues {
                reply_tx,
                iopub_tx,
                stdin_tx,
            },
        );
        PendingRequest {
            pending: self.pending.clone(),
            msg_id,
            reply_rx,
            iopub_rx,
            stdin_rx,
            stdin_channel: self.stdin.clone(),
            key: self.key.clone(),
        }
    }

    /// Send a message on the shell channel, signed with the connection key.
    pub async fn send_shell<T: Serialize>(&self, msg: &KernelMessage<T>) -> Result<(), Error> {
        let frames = codec::encode(msg, &self.key, &[])?;
        self.shell.send_multipart(frames).await
    }

    /// Send a message on the control channel, signed with the connection key.
    pub async fn send_control<T: Serialize>(&self, msg: &KernelMessage<T>) -> Result<(), Error> {
        let frames = codec::encode(msg, &self.key, &[])?;
        self.control.send_multipart(frames).await
    }

    /// Send a message on the stdin channel, signed with the connection key.
    pub async fn send_stdin<T: Serialize>(&self, msg: &KernelMessage<T>) -> Result<(), Error> {
        let frames = codec::encode(msg, &self.key, &[])?;
        self.stdin.send_multipart(frames).await
    }

    /// The shared queue of `comm_open`/`comm_msg` iopub messages, for the
    /// comm dispatch described in [`crate::execute`]'s `CommHandler`.
    pub fn comm_messages(&self) -> async_channel::Receiver<KernelMessage> {
        self.comm_rx.clone()
    }

    /// Stop the listener tasks. Idempotent.
    pub fn close(&self) {
        self.signal.cancel();
    }
}

/// Listener for a dealer-backed reply channel (shell or control): every
/// reply carries a `parent_header.msg_id` identifying the request it
/// answers, routed into that request's reply queue.
fn spawn_reply_listener(
    channel: Arc<dyn Channel>,
    pending: Arc<DashMap<String, PendingQueues>>,
    signal: CancellationToken,
    key: String,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = channel.recv_multipart() => {
                    match result {
                        Ok(frames) => route_reply(&frames, &pending, &key),
                        Err(_) => break,
                    }
                }
                _ = signal.cancelled() => break,
            }
        }
    });
}

fn route_reply(frames: &[Bytes], pending: &DashMap<String, PendingQueues>, key: &str) {
    let Some(header) = codec::peek_parent_header(frames) else {
        debug!("shell/control message with no parent header, dropping");
        return;
    };
    let Some(entry) = pending.get(&header.msg_id) else {
        debug!(msg_id = %header.msg_id, "shell/control reply for unknown request, dropping");
        return;
    };
    match codec::decode(frames, key) {
        Ok(msg) => {
            let _ = entry.reply_tx.try_send(msg);
        }
        Err(err) => debug!(%err, "shell/control reply failed signature check, dropping"),
    }
}

/// Listener for the stdin channel: `input_request` messages are routed by
/// `parent_header.msg_id` into that request's stdin queue, matching
/// `driver.py::listen_stdin`.
fn spawn_stdin_listener(
    channel: Arc<dyn Channel>,
    pending: Arc<DashMap<String, PendingQueues>>,
    signal: CancellationToken,
    key: String,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = channel.recv_multipart() => {
                    match result {
                        Ok(frames) => route_reply_to_stdin(&frames, &pending, &key),
                        Err(_) => break,
                    }
                }
                _ = signal.cancelled() => break,
            }
        }
    });
}

fn route_reply_to_stdin(frames: &[Bytes], pending: &DashMap<String, PendingQueues>, key: &str) {
    let Some(header) = codec::peek_parent_header(frames) else {
        debug!("stdin message with no parent header, dropping");
        return;
    };
    let Some(entry) = pending.get(&header.msg_id) else {
        debug!(msg_id = %header.msg_id, "stdin message for unknown request, dropping");
        return;
    };
    match codec::decode(frames, key) {
        Ok(msg) => {
            let _ = entry.stdin_tx.try_send(msg);
        }
        Err(err) => debug!(%err, "stdin message failed signature check, dropping"),
    }
}

/// Listener for the iopub broadcast channel: `comm_open`/`comm_msg` go to
/// the shared comm queue; everything else is routed by `parent_header.msg_id`
/// into that request's iopub queue, matching `driver.py::listen_iopub`.
fn spawn_iopub_listener(
    channel: Arc<dyn Channel>,
    pending: Arc<DashMap<String, PendingQueues>>,
    comm_tx: async_channel::Sender<KernelMessage>,
    signal: CancellationToken,
    key: String,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = channel.recv_multipart() => {
                    match result {
                        Ok(frames) => route_iopub(&frames, &pending, &comm_tx, &key),
                        Err(_) => break,
                    }
                }
                _ = signal.cancelled() => break,
            }
        }
    });
}

fn route_iopub(
    frames: &[Bytes],
    pending: &DashMap<String, PendingQueues>,
    comm_tx: &async_channel::Sender<KernelMessage>,
    key: &str,
) {
    let Some(msg_type) = codec::peek_msg_type(frames) else {
        debug!("iopub message with no parseable header, dropping");
        return;
    };
    let Ok(msg) = codec::decode(frames, key) else {
        debug!("iopub message failed signature check or decode, dropping");
        return;
    };
    if matches!(msg_type, KernelMessageType::CommOpen | KernelMessageType::CommMsg) {
        let _ = comm_tx.try_send(msg);
        return;
    }
    let Some(parent) = &msg.parent_header else {
        debug!("iopub message with no parent header, dropping");
        return;
    };
    if let Some(entry) = pending.get(&parent.msg_id) {
        let _ = entry.iopub_tx.try_send(msg);
    }
}

/// A handle to a single in-flight request's three private queues. Dropping
/// it removes the request's entry from the correlator's shared map.
pub struct PendingRequest {
    pending: Arc<DashMap<String, PendingQueues>>,
    msg_id: String,
    reply_rx: async_channel::Receiver<KernelMessage>,
    iopub_rx: async_channel::Receiver<KernelMessage>,
    stdin_rx: async_channel::Receiver<KernelMessage>,
    stdin_channel: Arc<dyn Channel>,
    key: String,
}

impl PendingRequest {
    /// Receive the next iopub message addressed to this request.
    pub async fn recv_iopub(&self) -> Result<KernelMessage, Error> {
        self.iopub_rx.recv().await.map_err(|_| Error::KernelDisconnect)
    }

    /// Send a reply on the stdin channel (`input_reply`), signed with the
    /// connection key. Owned independently of [`RequestCorrelator`]'s
    /// lifetime so it can be used from the detached tasks `execute`
    /// spawns when `wait` is false.
    pub async fn send_stdin<T: Serialize>(&self, msg: &KernelMessage<T>) -> Result<(), Error> {
        let frames = codec::encode(msg, &self.key, &[])?;
        self.stdin_channel.send_multipart(frames).await
    }

    /// Receive the shell or control reply to this request.
    pub async fn recv_reply<U: DeserializeOwned>(&self) -> Result<KernelMessage<Reply<U>>, Error> {
        self.reply_rx
            .recv()
            .await
            .map_err(|_| Error::KernelDisconnect)?
            .into_typed()
    }

    /// Receive the shell or control reply to this request without unpacking
    /// a `status`-tagged [`Reply`] envelope, for message types like
    /// `is_complete_reply` whose own `status` field isn't the `ok`/`error`/
    /// `aborted` envelope tag.
    pub async fn recv_reply_raw<U: DeserializeOwned>(&self) -> Result<KernelMessage<U>, Error> {
        self.reply_rx
            .recv()
            .await
            .map_err(|_| Error::KernelDisconnect)?
            .into_typed()
    }

    /// Receive the next stdin message (`input_request`) for this request.
    pub async fn recv_stdin(&self) -> Result<KernelMessage, Error> {
        self.stdin_rx.recv().await.map_err(|_| Error::KernelDisconnect)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.pending.remove(&self.msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockChannelTransport;
    use crate::wire::KernelMessageType;

    fn test_profile() -> ConnectionProfile {
        serde_json::from_value(serde_json::json!({
            "signature_scheme": "hmac-sha256",
            "key": "k",
            "transport": "tcp",
            "ip": "127.0.0.1",
            "shell_port": 0,
            "iopub_port": 0,
            "stdin_port": 0,
            "control_port": 0,
            "hb_port": 0,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn routes_shell_reply_to_the_right_pending_request() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();

        let request = KernelMessage::new(KernelMessageType::KernelInfoRequest, "sess", serde_json::json!({}));
        let pending = correlator.install(request.header.msg_id.clone());

        let reply = KernelMessage::reply_to(
            &request,
            KernelMessageType::KernelInfoReply,
            serde_json::json!({"status": "ok"}),
        );
        let frames = codec::encode(&reply, "k", &[]).unwrap();
        let shell_peer = transport.peer(ChannelId::Shell, b"id");
        shell_peer.push_from_peer(frames).await;

        let received = pending.recv_reply::<serde_json::Value>().await.unwrap();
        assert_eq!(received.parent_header.unwrap().msg_id, request.header.msg_id);
    }

    #[tokio::test]
    async fn dropping_pending_request_removes_it_from_the_map() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();
        let msg_id = "abc".to_string();
        {
            let _pending = correlator.install(msg_id.clone());
            assert!(correlator.pending.contains_key(&msg_id));
        }
        assert!(!correlator.pending.contains_key(&msg_id));
    }

    #[tokio::test]
    async fn comm_open_routes_to_the_shared_comm_queue_not_a_pending_request() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();

        let mut comm_open = KernelMessage::new(
            KernelMessageType::CommOpen,
            "sess",
            serde_json::json!({"comm_id": "c1"}),
        );
        comm_open.header.msg_id = "comm-msg".into();
        let frames = codec::encode(&comm_open, "k", &[]).unwrap();
        let iopub_peer = transport.peer(ChannelId::Iopub, b"");
        iopub_peer.push_from_peer(frames).await;

        let comm_rx = correlator.comm_messages();
        let received = comm_rx.recv().await.unwrap();
        assert_eq!(received.header.msg_type, KernelMessageType::CommOpen);
    }
}

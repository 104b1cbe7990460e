//! Multiplexing a single kernel's shell/control/iopub channels across many
//! client sessions.
//!
//! Grounded line-for-line on `kernel_server/server.py`'s `KernelServer`:
//! `listen_web` relays a session's own shell/control traffic to the kernel;
//! `listen_shell`/`listen_control` route each reply back to the session
//! named in its `parent_header.session`; `listen_iopub` broadcasts every
//! iopub message to all connected sessions. The Python leaves message
//! filtering as a dangling `# FIXME: add back message filtering` — wired
//! back in here as [`Filter`], checked against every outgoing message
//! before it reaches a session.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::connection::ConnectionProfile;
use crate::transport::{Channel, ChannelId, ChannelTransport};
use crate::wire::{codec, KernelMessageType};
use crate::Error;

/// A connected client, abstracted so the fan-out doesn't depend on any
/// particular websocket library. `send_bundle` is handed the
/// [`codec::encode_bundle`]-framed payload exactly as it should go out over
/// the wire.
#[async_trait]
pub trait ClientSession: Send + Sync {
    /// The session id this client identifies itself with; matches the
    /// `session` field client-originated messages carry in their header, so
    /// shell/control replies can be routed back to the right client.
    fn session_id(&self) -> &str;

    /// Deliver a framed bundle to the client.
    async fn send_bundle(&self, bundle: Vec<u8>) -> Result<(), Error>;
}

/// Which message types a session is allowed to receive. Checked against
/// every message the fan-out would otherwise deliver.
#[derive(Debug, Clone)]
pub enum Filter {
    /// No filtering; every message type is delivered.
    AllowAll,
    /// Only the named message types are delivered; everything else is
    /// dropped.
    Allow(HashSet<String>),
    /// Every message type is delivered except the named ones.
    Block(HashSet<String>),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::AllowAll
    }
}

impl Filter {
    /// Whether `msg_type` should be delivered under this filter.
    pub fn allows(&self, msg_type: &KernelMessageType) -> bool {
        let Some(name) = msg_type_name(msg_type) else {
            return true;
        };
        match self {
            Filter::AllowAll => true,
            Filter::Allow(set) => set.contains(&name),
            Filter::Block(set) => !set.contains(&name),
        }
    }
}

fn msg_type_name(msg_type: &KernelMessageType) -> Option<String> {
    serde_json::to_value(msg_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
}

struct Subscriber {
    filter: Filter,
    outbox: async_channel::Sender<Vec<u8>>,
    _drop_guard: DropGuard,
}

/// Relays raw wire frames between one kernel's channels and however many
/// client sessions are attached to it.
pub struct SessionFanout {
    key: String,
    shell: Arc<dyn Channel>,
    control: Arc<dyn Channel>,
    sessions: Arc<DashMap<String, Subscriber>>,
    signal: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

impl SessionFanout {
    /// Connect the kernel-facing shell/control/iopub channels and start the
    /// listener tasks that relay between them and whatever sessions join.
    pub async fn connect(transport: &dyn ChannelTransport, profile: &ConnectionProfile) -> Result<Self, Error> {
        let shell: Arc<dyn Channel> = Arc::from(transport.connect(ChannelId::Shell, profile, None).await?);
        let control: Arc<dyn Channel> = Arc::from(transport.connect(ChannelId::Control, profile, None).await?);
        let iopub: Arc<dyn Channel> = Arc::from(transport.connect(ChannelId::Iopub, profile, None).await?);

        let sessions: Arc<DashMap<String, Subscriber>> = Arc::new(DashMap::new());
        let signal = CancellationToken::new();

        spawn_reply_relay("shell", shell.clone(), sessions.clone(), signal.clone());
        spawn_reply_relay("control", control.clone(), sessions.clone(), signal.clone());
        spawn_iopub_relay(iopub, sessions.clone(), signal.clone());

        let drop_guard = Arc::new(signal.clone().drop_guard());
        Ok(Self {
            key: profile.key.clone(),
            shell,
            control,
            sessions,
            signal,
            _drop_guard: drop_guard,
        })
    }

    /// How many sessions are currently attached, matching
    /// `KernelServer.connections`.
    pub fn connections(&self) -> usize {
        self.sessions.len()
    }

    /// Attach a session, matching `KernelServer.serve`'s
    /// `self.sessions[session_id] = websocket`. Replaces any existing
    /// session registered under the same id.
    ///
    /// Each session gets its own ordered outbox and a single dedicated
    /// delivery task, so that concurrent broadcasts from the iopub relay
    /// (spec.md §8 invariant 7) can never reorder themselves racing to
    /// the same socket the way one detached task per message would.
    pub fn join(&self, session_id: String, session: Arc<dyn ClientSession>, filter: Filter) {
        let (outbox, inbox) = async_channel::unbounded::<Vec<u8>>();
        let signal = CancellationToken::new();
        let drop_guard = signal.clone().drop_guard();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    bundle = inbox.recv() => {
                        match bundle {
                            Ok(bundle) => {
                                if let Err(err) = session.send_bundle(bundle).await {
                                    debug!(%err, "failed to deliver message to session");
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = signal.cancelled() => break,
                }
            }
        });
        self.sessions.insert(
            session_id,
            Subscriber {
                filter,
                outbox,
                _drop_guard: drop_guard,
            },
        );
    }

    /// Detach a session, matching `del self.sessions[session_id]`.
    pub fn leave(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Relay a client-originated bundle to the kernel, matching
    /// `listen_web`: `channel` must be `"shell"` or `"control"`; any other
    /// value is a protocol violation from the client. The client never
    /// holds the shared key, so its frames are re-signed with it before
    /// being forwarded.
    pub async fn route_incoming(&self, channel: &str, frames: Vec<Bytes>) -> Result<(), Error> {
        let target = match channel {
            "shell" => &self.shell,
            "control" => &self.control,
            other => return Err(Error::MalformedFrame(format!("client sent to unknown channel {other:?}"))),
        };
        let signed = codec::resign(&frames, &self.key)?;
        target.send_multipart(signed).await
    }

    /// Decode a client-facing bundle and relay it, combining
    /// [`codec::decode_bundle`] with [`Self::route_incoming`].
    pub async fn route_incoming_bundle(&self, bundle: &[u8]) -> Result<(), Error> {
        let (channel, frames) = codec::decode_bundle(bundle)
            .ok_or_else(|| Error::MalformedFrame("invalid client bundle".into()))?;
        self.route_incoming(&channel, frames).await
    }

    /// The connection's signing key, for callers that need to re-sign or
    /// inspect frames outside the relay path.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop the listener tasks. Idempotent.
    pub fn close(&self) {
        self.signal.cancel();
    }
}

/// Listener for a dealer-backed reply channel (shell or control): each
/// reply's `parent_header.session` names the client session to deliver it
/// to, matching `listen_shell`/`listen_control`.
fn spawn_reply_relay(
    channel_name: &'static str,
    channel: Arc<dyn Channel>,
    sessions: Arc<DashMap<String, Subscriber>>,
    signal: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = channel.recv_multipart() => {
                    match result {
                        Ok(frames) => deliver_to_owner(channel_name, &frames, &sessions),
                        Err(_) => break,
                    }
                }
                _ = signal.cancelled() => break,
            }
        }
    });
}

fn deliver_to_owner(channel_name: &str, frames: &[Bytes], sessions: &DashMap<String, Subscriber>) {
    let Some(parent) = codec::peek_parent_header(frames) else {
        debug!(channel = channel_name, "reply with no parent header, dropping");
        return;
    };
    let Some(subscriber) = sessions.get(&parent.session) else {
        debug!(channel = channel_name, session = %parent.session, "reply for unknown session, dropping");
        return;
    };
    let Some(msg_type) = codec::peek_msg_type(frames) else {
        return;
    };
    if !subscriber.filter.allows(&msg_type) {
        return;
    }
    let bundle = codec::encode_bundle(channel_name, frames);
    if subscriber.outbox.try_send(bundle).is_err() {
        debug!(channel = channel_name, session = %parent.session, "session outbox closed, dropping");
    }
}

/// Listener for the iopub broadcast channel: every message goes to every
/// attached session whose filter allows it, matching `listen_iopub`.
fn spawn_iopub_relay(channel: Arc<dyn Channel>, sessions: Arc<DashMap<String, Subscriber>>, signal: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = channel.recv_multipart() => {
                    match result {
                        Ok(frames) => broadcast(&frames, &sessions),
                        Err(_) => break,
                    }
                }
                _ = signal.cancelled() => break,
            }
        }
    });
}

fn broadcast(frames: &[Bytes], sessions: &DashMap<String, Subscriber>) {
    let Some(msg_type) = codec::peek_msg_type(frames) else {
        debug!("iopub message with no parseable header, dropping");
        return;
    };
    let bundle = codec::encode_bundle("iopub", frames);
    for entry in sessions.iter() {
        if !entry.filter.allows(&msg_type) {
            continue;
        }
        if entry.outbox.try_send(bundle.clone()).is_err() {
            debug!("session outbox closed, dropping broadcast message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockChannelTransport;
    use crate::wire::{codec as wire_codec, KernelMessage, KernelMessageType};

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

    struct RecordingSession {
        id: String,
        received: async_channel::Sender<Vec<u8>>,
    }

    #[async_trait]
    impl ClientSession for RecordingSession {
        fn session_id(&self) -> &str {
            &self.id
        }

        async fn send_bundle(&self, bundle: Vec<u8>) -> Result<(), Error> {
            let _ = self.received.send(bundle).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shell_reply_routes_only_to_owning_session() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let fanout = SessionFanout::connect(&transport, &profile).await.unwrap();

        let (tx_a, rx_a) = async_channel::unbounded();
        let (tx_b, rx_b) = async_channel::unbounded();
        fanout.join(
            "session-a".into(),
            Arc::new(RecordingSession { id: "session-a".into(), received: tx_a }),
            Filter::AllowAll,
        );
        fanout.join(
            "session-b".into(),
            Arc::new(RecordingSession { id: "session-b".into(), received: tx_b }),
            Filter::AllowAll,
        );
        assert_eq!(fanout.connections(), 2);

        let request = KernelMessage::new(KernelMessageType::KernelInfoRequest, "session-a", serde_json::json!({}));
        let reply = KernelMessage::reply_to(&request, KernelMessageType::KernelInfoReply, serde_json::json!({}));
        let frames = wire_codec::encode(&reply, "k", &[]).unwrap();
        let shell_peer = transport.peer(crate::transport::ChannelId::Shell, b"");
        shell_peer.push_from_peer(frames).await;

        let bundle = rx_a.recv().await.unwrap();
        let (channel, _) = wire_codec::decode_bundle(&bundle).unwrap();
        assert_eq!(channel, "shell");

        let other_session_result = tokio::time::timeout(std::time::Duration::from_millis(50), rx_b.recv()).await;
        assert!(other_session_result.is_err(), "reply should not be delivered to a non-owning session");
    }

    #[tokio::test]
    async fn iopub_broadcasts_to_every_session_honoring_its_filter() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let fanout = SessionFanout::connect(&transport, &profile).await.unwrap();

        let (tx_allow, rx_allow) = async_channel::unbounded();
        let (tx_block, rx_block) = async_channel::unbounded();
        fanout.join(
            "allow".into(),
            Arc::new(RecordingSession { id: "allow".into(), received: tx_allow }),
            Filter::AllowAll,
        );
        let mut blocked = HashSet::new();
        blocked.insert("stream".to_string());
        fanout.join(
            "block".into(),
            Arc::new(RecordingSession { id: "block".into(), received: tx_block }),
            Filter::Block(blocked),
        );

        let status = KernelMessage::new(KernelMessageType::Stream, "kernel", serde_json::json!({"name": "stdout", "text": "hi"}));
        let frames = wire_codec::encode(&status, "k", &[]).unwrap();
        let iopub_peer = transport.peer(crate::transport::ChannelId::Iopub, b"");
        iopub_peer.push_from_peer(frames).await;

        let bundle = rx_allow.recv().await.unwrap();
        let (channel, _) = wire_codec::decode_bundle(&bundle).unwrap();
        assert_eq!(channel, "iopub");

        let blocked_result = tokio::time::timeout(std::time::Duration::from_millis(50), rx_block.recv()).await;
        assert!(blocked_result.is_err(), "blocked session should not receive a stream message");
    }

    #[tokio::test]
    async fn route_incoming_resigns_with_the_shared_key_clients_never_see() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let fanout = SessionFanout::connect(&transport, &profile).await.unwrap();

        let request = KernelMessage::new(KernelMessageType::ExecuteRequest, "sess", serde_json::json!({"code": "1"}));
        // A client has no access to "k", the real shared key.
        let client_frames = wire_codec::encode(&request, "whatever-the-client-made-up", &[]).unwrap();

        fanout.route_incoming("shell", client_frames).await.unwrap();

        let shell_peer = transport.peer(crate::transport::ChannelId::Shell, b"");
        let forwarded = shell_peer.recv_sent().await.unwrap();
        // The kernel, which does hold "k", must accept what was forwarded.
        let decoded = wire_codec::decode(&forwarded, "k").unwrap();
        assert_eq!(decoded.header.msg_id, request.header.msg_id);
    }

    #[tokio::test]
    async fn route_incoming_rejects_unknown_channel_names() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let fanout = SessionFanout::connect(&transport, &profile).await.unwrap();
        let result = fanout.route_incoming("iopub", vec![]).await;
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn iopub_broadcast_preserves_emission_order_per_session() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let fanout = SessionFanout::connect(&transport, &profile).await.unwrap();

        let (tx, rx) = async_channel::unbounded();
        fanout.join(
            "session".into(),
            Arc::new(RecordingSession { id: "session".into(), received: tx }),
            Filter::AllowAll,
        );

        let iopub_peer = transport.peer(crate::transport::ChannelId::Iopub, b"");
        for i in 0..20 {
            let msg = KernelMessage::new(
                KernelMessageType::Stream,
                "kernel",
                serde_json::json!({"name": "stdout", "text": i.to_string()}),
            );
            let frames = wire_codec::encode(&msg, "k", &[]).unwrap();
            iopub_peer.push_from_peer(frames).await;
        }

        for i in 0..20 {
            let bundle = rx.recv().await.unwrap();
            let (_, frames) = wire_codec::decode_bundle(&bundle).unwrap();
            let decoded = wire_codec::decode(&frames, "k").unwrap();
            assert_eq!(decoded.content["text"], i.to_string(), "messages must arrive in kernel emission order");
        }
    }
}

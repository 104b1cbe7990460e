//! High-level request/reply helpers over a [`RequestCorrelator`], for
//! callers that want a single round trip rather than going through the full
//! [`crate::execute::ExecutionEngine`].
//!
//! Grounded on `backend/commands.rs`'s `kernel_info`/`run_cell`: a request is
//! sent, a single reply is awaited, and the reply's `status` field is
//! unpacked into either the success payload or an error, exactly as
//! `commands::kernel_info` does with `Reply::Ok`/`Reply::Error`/`Reply::Abort`.

use crate::correlator::RequestCorrelator;
use crate::wire::{
    CompleteReply, CompleteRequest, HistoryReply, HistoryRequest, InspectReply, InspectRequest,
    InterruptReply, InterruptRequest, IsCompleteReply, IsCompleteRequest, KernelInfoReply,
    KernelInfoRequest, KernelMessage, KernelMessageType, Reply, ShutdownReply, ShutdownRequest,
};
use crate::Error;

async fn call_shell<T, U>(correlator: &RequestCorrelator, session: &str, msg_type: KernelMessageType, content: T) -> Result<U, Error>
where
    T: serde::Serialize,
    U: serde::de::DeserializeOwned,
{
    let request = KernelMessage::new(msg_type, session, content);
    let pending = correlator.install(request.header.msg_id.clone());
    correlator.send_shell(&request).await?;
    let reply = pending.recv_reply::<U>().await?;
    match reply.content {
        Reply::Ok(value) => Ok(value),
        Reply::Error(_) | Reply::Abort => Err(Error::KernelDisconnect),
    }
}

async fn call_control<T, U>(correlator: &RequestCorrelator, session: &str, msg_type: KernelMessageType, content: T) -> Result<U, Error>
where
    T: serde::Serialize,
    U: serde::de::DeserializeOwned,
{
    let request = KernelMessage::new(msg_type, session, content);
    let pending = correlator.install(request.header.msg_id.clone());
    correlator.send_control(&request).await?;
    let reply = pending.recv_reply::<U>().await?;
    match reply.content {
        Reply::Ok(value) => Ok(value),
        Reply::Error(_) | Reply::Abort => Err(Error::KernelDisconnect),
    }
}

/// Fetch the kernel's implementation and language info.
pub async fn kernel_info(correlator: &RequestCorrelator, session: &str) -> Result<KernelInfoReply, Error> {
    call_shell(correlator, session, KernelMessageType::KernelInfoRequest, KernelInfoRequest {}).await
}

/// Introspect a piece of code at a cursor position (documentation lookup).
pub async fn inspect(
    correlator: &RequestCorrelator,
    session: &str,
    code: &str,
    cursor_pos: u32,
    detail_level: u8,
) -> Result<InspectReply, Error> {
    call_shell(
        correlator,
        session,
        KernelMessageType::InspectRequest,
        InspectRequest {
            code: code.to_string(),
            cursor_pos,
            detail_level,
        },
    )
    .await
}

/// Request completions for a piece of code at a cursor position.
pub async fn complete(
    correlator: &RequestCorrelator,
    session: &str,
    code: &str,
    cursor_pos: u32,
) -> Result<CompleteReply, Error> {
    call_shell(
        correlator,
        session,
        KernelMessageType::CompleteRequest,
        CompleteRequest {
            code: code.to_string(),
            cursor_pos,
        },
    )
    .await
}

/// Check whether a piece of code is a complete, executable statement.
///
/// Unlike the other request types here, `is_complete_reply` has no
/// `Reply<T>` status envelope: its own `status` field carries the
/// completeness verdict (`"complete"`, `"incomplete"`, etc), not an
/// `ok`/`error`/`aborted` tag.
pub async fn is_complete(correlator: &RequestCorrelator, session: &str, code: &str) -> Result<IsCompleteReply, Error> {
    let request = KernelMessage::new(
        KernelMessageType::IsCompleteRequest,
        session,
        IsCompleteRequest { code: code.to_string() },
    );
    let pending = correlator.install(request.header.msg_id.clone());
    correlator.send_shell(&request).await?;
    let reply = pending.recv_reply_raw::<IsCompleteReply>().await?;
    Ok(reply.content)
}

/// Fetch execution history from the kernel.
pub async fn history(correlator: &RequestCorrelator, session: &str, request: HistoryRequest) -> Result<HistoryReply, Error> {
    call_shell(correlator, session, KernelMessageType::HistoryRequest, request).await
}

/// Interrupt the kernel's current execution, over the control channel.
pub async fn interrupt(correlator: &RequestCorrelator, session: &str) -> Result<InterruptReply, Error> {
    call_control(correlator, session, KernelMessageType::InterruptRequest, InterruptRequest {}).await
}

/// Request a graceful kernel shutdown, over the control channel.
pub async fn shutdown(correlator: &RequestCorrelator, session: &str, restart: bool) -> Result<ShutdownReply, Error> {
    call_control(correlator, session, KernelMessageType::ShutdownRequest, ShutdownRequest { restart }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionProfile;
    use crate::transport::{ChannelId, MockChannelTransport};
    use crate::wire::codec;

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
    async fn kernel_info_unpacks_an_ok_reply() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();
        let shell_peer = transport.peer(ChannelId::Shell, b"id");

        let responder = tokio::spawn(async move {
            let sent = shell_peer.recv_sent().await.unwrap();
            let request: KernelMessage = codec::decode(&sent, "k").unwrap();
            let reply = KernelMessage::reply_to(
                &request,
                KernelMessageType::KernelInfoReply,
                serde_json::json!({
                    "status": "ok",
                    "protocol_version": "5.3",
                    "implementation": "python",
                    "implementation_version": "1.0",
                    "language_info": {
                        "name": "python",
                        "version": "3.11",
                        "mimetype": "text/x-python",
                        "file_extension": ".py",
                        "nbconvert_exporter": "python",
                    },
                    "banner": "",
                }),
            );
            let frames = codec::encode(&reply, "k", &[]).unwrap();
            shell_peer.push_from_peer(frames).await;
        });

        let info = kernel_info(&correlator, "sess").await.unwrap();
        assert_eq!(info.implementation, "python");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn kernel_info_maps_error_status_to_disconnect() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();
        let shell_peer = transport.peer(ChannelId::Shell, b"id");

        let responder = tokio::spawn(async move {
            let sent = shell_peer.recv_sent().await.unwrap();
            let request: KernelMessage = codec::decode(&sent, "k").unwrap();
            let reply = KernelMessage::reply_to(
                &request,
                KernelMessageType::KernelInfoReply,
                serde_json::json!({"status": "error", "ename": "RuntimeError", "evalue": "boom", "traceback": []}),
            );
            let frames = codec::encode(&reply, "k", &[]).unwrap();
            shell_peer.push_from_peer(frames).await;
        });

        let result = kernel_info(&correlator, "sess").await;
        assert!(matches!(result, Err(Error::KernelDisconnect)));
        responder.await.unwrap();
    }
}

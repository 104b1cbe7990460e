//! The dual-channel handshake: waiting for a kernel to finish starting up
//! before any caller treats it as usable.
//!
//! Grounded line-for-line on `driver.py::_wait_for_ready` (the
//! `kernel_server/server.py` copy implements the same probe but without the
//! deadline-aware retry loop, so the driver's version is the one carried
//! forward here). A `kernel_info_request` alone isn't sufficient: some
//! kernels reply on shell before their iopub socket is actually subscribed
//! to, so a reply with no iopub activity within a short window is treated as
//! not-yet-ready and the probe is retried.

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::correlator::RequestCorrelator;
use crate::wire::{KernelInfoRequest, KernelMessage, KernelMessageType};
use crate::Error;

/// How long to wait for iopub activity after a `kernel_info_reply`, before
/// concluding the kernel isn't ready yet and retrying. Matches `driver.py`'s
/// literal `0.2` second per-attempt iopub probe.
const IOPUB_PROBE: Duration = Duration::from_millis(200);

/// Block until the kernel answers on both shell and iopub, or `deadline`
/// elapses.
///
/// `session` identifies the caller for the probe messages it sends; it need
/// not match any particular request already in flight.
pub async fn wait_until_ready(
    correlator: &RequestCorrelator,
    session: &str,
    deadline: Duration,
) -> Result<(), Error> {
    let start = Instant::now();
    loop {
        let remaining = deadline.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(Error::StartupTimeout);
        }

        let request = KernelMessage::new(KernelMessageType::KernelInfoRequest, session, KernelInfoRequest {});
        let pending = correlator.install(request.header.msg_id.clone());
        correlator.send_shell(&request).await?;

        let reply = timeout(remaining, pending.recv_reply::<serde_json::Value>()).await;
        let Ok(Ok(_reply)) = reply else {
            continue;
        };

        if timeout(IOPUB_PROBE, pending.recv_iopub()).await.is_ok() {
            return Ok(());
        }
        // Kernel answered on shell but iopub hasn't caught up yet; retry.
    }
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
    async fn ready_once_both_shell_and_iopub_respond() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();

        let shell_peer = transport.peer(ChannelId::Shell, b"id");
        let iopub_peer = transport.peer(ChannelId::Iopub, b"");

        let responder = tokio::spawn(async move {
            let sent = shell_peer.recv_sent().await.unwrap();
            let request: KernelMessage = codec::decode(&sent, "k").unwrap();
            let reply = KernelMessage::reply_to(
                &request,
                KernelMessageType::KernelInfoReply,
                serde_json::json!({"status": "ok"}),
            );
            let frames = codec::encode(&reply, "k", &[]).unwrap();
            shell_peer.push_from_peer(frames).await;

            let status = KernelMessage::reply_to(
                &request,
                KernelMessageType::Status,
                serde_json::json!({"execution_state": "idle"}),
            );
            let frames = codec::encode(&status, "k", &[]).unwrap();
            iopub_peer.push_from_peer(frames).await;
        });

        wait_until_ready(&correlator, "test", Duration::from_secs(2)).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn times_out_when_nothing_responds() {
        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();

        let result = wait_until_ready(&correlator, "test", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::StartupTimeout)));
    }
}

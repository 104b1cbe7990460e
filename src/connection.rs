//! The connection profile: the immutable record of ports, host, and signing
//! key that a driver and a kernel process agree on, persisted as an on-disk
//! descriptor.

use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::net::TcpListener;

use crate::Error;

/// The five channel ports a kernel listens on, plus host/transport/key,
/// matching the on-disk connection descriptor fields 1:1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// HMAC signature algorithm name, e.g. `"hmac-sha256"`.
    pub signature_scheme: String,

    /// The shared secret key used to sign and verify wire frames.
    pub key: String,

    /// The socket transport, e.g. `"tcp"`.
    pub transport: String,

    /// The host or IP address the kernel's sockets are bound to.
    #[serde(rename = "ip")]
    pub host: String,

    /// Port for the shell channel.
    pub shell_port: u16,
    /// Port for the iopub channel.
    pub iopub_port: u16,
    /// Port for the stdin channel.
    pub stdin_port: u16,
    /// Port for the control channel.
    pub control_port: u16,
    /// Port for the heartbeat channel (out of scope for the core driver).
    pub hb_port: u16,

    /// The kernelspec name this connection was allocated for, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kernel_name: Option<String>,
}

impl ConnectionProfile {
    /// Allocate a fresh profile: bind five ephemeral TCP sockets transiently
    /// to discover free ports, release them, and generate a random 128-bit
    /// signing key.
    pub async fn allocate(kernel_name: Option<String>) -> Result<Self, Error> {
        let (shell_port, iopub_port, stdin_port, control_port, hb_port) = tokio::try_join!(
            available_port(),
            available_port(),
            available_port(),
            available_port(),
            available_port(),
        )?;

        let mut key_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let key = key_bytes.iter().map(|b| format!("{b:02x}")).collect();

        Ok(Self {
            signature_scheme: "hmac-sha256".to_string(),
            key,
            transport: "tcp".to_string(),
            host: "127.0.0.1".to_string(),
            shell_port,
            iopub_port,
            stdin_port,
            control_port,
            hb_port,
            kernel_name,
        })
    }

    /// Read an existing connection descriptor from disk.
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = fs::read(path.as_ref())
            .await
            .map_err(|err| Error::InvalidDescriptor(err.to_string()))?;
        serde_json::from_slice(&contents).map_err(|err| Error::InvalidDescriptor(err.to_string()))
    }

    /// Write the connection descriptor atomically: write to a temporary
    /// file in the same directory, then rename it into place.
    pub async fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let body = json!({
            "ip": self.host,
            "transport": self.transport,
            "signature_scheme": self.signature_scheme,
            "key": self.key,
            "shell_port": self.shell_port,
            "iopub_port": self.iopub_port,
            "stdin_port": self.stdin_port,
            "control_port": self.control_port,
            "hb_port": self.hb_port,
            "kernel_name": self.kernel_name,
        });
        fs::write(&tmp_path, body.to_string())
            .await
            .map_err(|err| Error::InvalidDescriptor(err.to_string()))?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|err| Error::InvalidDescriptor(err.to_string()))?;
        Ok(())
    }

    /// Delete the on-disk descriptor, ignoring "already gone".
    pub async fn remove(path: impl AsRef<Path>) -> Result<(), Error> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::InvalidDescriptor(err.to_string())),
        }
    }
}

async fn available_port() -> Result<u16, Error> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| Error::KernelConnect(format!("could not get available port: {err}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|_| Error::KernelConnect("tcp listener has no local address".into()))
}

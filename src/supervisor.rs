//! Starting, stopping, and restarting a kernel subprocess.
//!
//! Grounded on `backend/local.rs::LocalKernel` for connection-file plumbing
//! and argv substitution, and on `driver.py`'s `start`/`stop`/`restart` for
//! the sequencing. An older `server/kernel.rs` (superseded by, but still
//! present alongside, `backend/local.rs`) sends `SIGINT` before killing;
//! the currently-active `backend/local.rs::LocalKernel::kill` regressed to
//! a bare `SIGKILL`. We restore the two-step interrupt-then-kill sequence
//! here since a clean `SIGINT` gives a well-behaved kernel a chance to
//! flush before the harder `SIGKILL`.

use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::warn;

use crate::connection::ConnectionProfile;
use crate::correlator::RequestCorrelator;
use crate::environment::KernelSpec;
use crate::transport::ChannelTransport;
use crate::Error;

/// How a kernel subprocess is launched, injected so tests can substitute a
/// fake process instead of actually spawning one.
#[async_trait::async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launch `argv[0]` with the remaining elements as arguments, in
    /// `cwd` if given, with `env` merged into the subprocess environment.
    async fn launch(
        &self,
        argv: &[String],
        cwd: Option<&str>,
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<Box<dyn LaunchedProcess>, Error>;
}

/// A running kernel subprocess, abstracted so `KernelSupervisor` doesn't
/// depend on `tokio::process` directly.
#[async_trait::async_trait]
pub trait LaunchedProcess: Send + Sync {
    /// The OS process id, used to send signals.
    fn pid(&self) -> Option<u32>;

    /// Returns `true` if the process has not yet exited.
    fn is_alive(&mut self) -> bool;

    /// Forcibly terminate the process and wait for it to exit.
    async fn kill(&mut self) -> Result<(), Error>;
}

/// The real launcher, spawning via `tokio::process::Command` exactly as
/// `backend/local.rs::LocalKernel::start` does.
#[derive(Debug, Default)]
pub struct TokioProcessLauncher;

#[async_trait::async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(
        &self,
        argv: &[String],
        cwd: Option<&str>,
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<Box<dyn LaunchedProcess>, Error> {
        if argv.is_empty() {
            return Err(Error::KernelConnect("kernel spec has no argv".into()));
        }
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .kill_on_drop(true)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .envs(env);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let child = command.spawn().map_err(Error::Subprocess)?;
        Ok(Box::new(TokioProcess { child }))
    }
}

struct TokioProcess {
    child: Child,
}

#[async_trait::async_trait]
impl LaunchedProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn kill(&mut self) -> Result<(), Error> {
        if let Some(pid) = self.pid() {
            if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!(%err, "SIGINT failed, proceeding straight to SIGKILL");
            }
        }
        self.child.kill().await.map_err(Error::Subprocess)
    }
}

/// Owns a kernel subprocess's lifecycle: the connection profile, the
/// process handle, and the correlator built on top of its channels.
pub struct KernelSupervisor {
    spec: KernelSpec,
    kernel_cwd: Option<String>,
    connection_file_path: std::path::PathBuf,
    launcher: Box<dyn ProcessLauncher>,
    transport: Box<dyn ChannelTransport>,
    session_id: String,
    process: Option<Box<dyn LaunchedProcess>>,
    profile: Option<ConnectionProfile>,
    correlator: Option<RequestCorrelator>,
}

impl KernelSupervisor {
    /// Create a supervisor for `spec`, writing its connection file under
    /// `connection_file_path` once started.
    pub fn new(
        spec: KernelSpec,
        kernel_cwd: Option<String>,
        connection_file_path: std::path::PathBuf,
        launcher: Box<dyn ProcessLauncher>,
        transport: Box<dyn ChannelTransport>,
    ) -> Self {
        Self {
            spec,
            kernel_cwd,
            connection_file_path,
            launcher,
            transport,
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            process: None,
            profile: None,
            correlator: None,
        }
    }

    /// The connection profile of the currently running kernel, if started.
    pub fn profile(&self) -> Option<&ConnectionProfile> {
        self.profile.as_ref()
    }

    /// The request correlator for the currently running kernel, if started.
    pub fn correlator(&self) -> Option<&RequestCorrelator> {
        self.correlator.as_ref()
    }

    /// Launch the kernel subprocess and connect its channels.
    ///
    /// Matches `driver.py::start`/`connect`: allocate a fresh connection
    /// profile, write the descriptor, launch the process substituting
    /// `{connection_file}` in argv, then connect the correlator.
    pub async fn start(&mut self) -> Result<(), Error> {
        let profile = ConnectionProfile::allocate(Some(self.spec.display_name.clone())).await?;
        profile.write(&self.connection_file_path).await?;

        let connection_file = self.connection_file_path.to_string_lossy().into_owned();
        let argv: Vec<String> = self
            .spec
            .argv
            .iter()
            .map(|arg| arg.replace("{connection_file}", &connection_file))
            .collect();

        let process = self
            .launcher
            .launch(&argv, self.kernel_cwd.as_deref(), &self.spec.env)
            .await?;

        let correlator = RequestCorrelator::connect(
            self.transport.as_ref(),
            &profile,
            self.session_id.as_bytes(),
        )
        .await?;

        self.process = Some(process);
        self.profile = Some(profile);
        self.correlator = Some(correlator);
        Ok(())
    }

    /// Interrupt then kill the kernel subprocess, tear down the correlator's
    /// listener tasks, and remove the connection descriptor. Idempotent.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if let Some(correlator) = self.correlator.take() {
            correlator.close();
        }
        if let Some(mut process) = self.process.take() {
            process.kill().await?;
        }
        self.profile = None;
        ConnectionProfile::remove(&self.connection_file_path).await?;
        Ok(())
    }

    /// Stop the kernel and start a fresh one with a newly allocated
    /// connection profile, per `driver.py::restart`.
    pub async fn restart(&mut self) -> Result<(), Error> {
        self.stop().await?;
        self.start().await
    }

    /// Whether the underlying process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().map(|p| p.is_alive()).unwrap_or(false)
    }
}

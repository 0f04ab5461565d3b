//! Kernel process lifecycle
//!
//! Functions for spawning the kernel process, connecting its ZeroMQ
//! channels and waiting for the ready handshake.
//!
//! ```text
//!   spawn_kernel ──► Channels::connect ──► wait_for_ready
//!        │                  │                    │
//!   Child process     shell / iopub /      kernel_info_request probes until
//!   (kill_on_drop)    control sockets      a shell reply AND an iopub message
//!                     (retried, then one   parented by a probe arrive
//!                     task per socket)
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};
use zeromq::{DealerSocket, Socket, SubSocket, ZmqError};

use super::channel::Channel;
use super::connection::ConnectionInfo;
use super::spec::LaunchCommand;
use super::wire::{JupyterMessage, Signer};
use super::KernelError;

/// Upper bound for a single connect attempt
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between failed connect attempts
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

fn channel_err(e: ZmqError) -> KernelError {
    KernelError::Channel(e.to_string())
}

/// Spawn the kernel process described by `cmd`
///
/// The environment's `bin/` directory is put first on `PATH` so anything
/// the kernel shells out to resolves inside the isolated environment.
/// Kernel stdout/stderr are forwarded to the log at debug level.
///
/// # Arguments
/// * `cmd` - Resolved launch command (spec or direct fallback)
/// * `env_prefix` - Root of the isolated environment
pub fn spawn_kernel(cmd: &LaunchCommand, env_prefix: &Path) -> Result<Child, KernelError> {
    let bin_dir = env_prefix.join("bin");
    let path = match std::env::var_os("PATH") {
        Some(existing) => {
            let mut dirs = vec![bin_dir];
            dirs.extend(std::env::split_paths(&existing));
            std::env::join_paths(dirs).map_err(|e| KernelError::Launch {
                program: cmd.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?
        }
        None => bin_dir.into_os_string(),
    };

    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .envs(&cmd.env)
        .env("PATH", path)
        .env("VIRTUAL_ENV", env_prefix)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| KernelError::Launch {
            program: cmd.program.clone(),
            source,
        })?;

    debug!(pid = ?child.id(), program = %cmd.program, "Kernel process spawned");

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stream = "stdout", line = %line, "Kernel output");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stream = "stderr", line = %line, "Kernel output");
            }
        });
    }

    Ok(child)
}

/// Fail if the kernel process has already exited
pub(crate) fn ensure_running(child: &mut Child) -> Result<(), KernelError> {
    match child.try_wait() {
        Ok(Some(status)) => Err(KernelError::Unavailable(format!(
            "kernel process exited during startup ({})",
            status
        ))),
        Ok(None) => Ok(()),
        Err(e) => Err(KernelError::Unavailable(format!(
            "cannot query kernel process: {}",
            e
        ))),
    }
}

/// The three client channels talking to one kernel
pub struct Channels {
    pub shell: Channel,
    pub iopub: Channel,
    pub control: Channel,
}

impl Channels {
    /// Connect every channel, retrying until `deadline`
    pub async fn connect(
        info: &ConnectionInfo,
        child: &mut Child,
        deadline: Instant,
    ) -> Result<Self, KernelError> {
        let mut shell = DealerSocket::new();
        connect_with_retry(&mut shell, &info.endpoint(info.shell_port), child, deadline).await?;

        let mut iopub = SubSocket::new();
        connect_with_retry(&mut iopub, &info.endpoint(info.iopub_port), child, deadline).await?;
        iopub.subscribe("").await.map_err(channel_err)?;

        let mut control = DealerSocket::new();
        connect_with_retry(&mut control, &info.endpoint(info.control_port), child, deadline).await?;

        Ok(Self::from_sockets(shell, iopub, control))
    }

    /// Hand connected sockets over to their channel tasks
    pub fn from_sockets(shell: DealerSocket, iopub: SubSocket, control: DealerSocket) -> Self {
        Self {
            shell: Channel::spawn("shell", shell),
            iopub: Channel::spawn("iopub", iopub),
            control: Channel::spawn("control", control),
        }
    }

    /// Close all sockets, returning the errors encountered (if any)
    pub async fn close(self) -> Vec<String> {
        let mut errors = Vec::new();
        for channel in [self.shell, self.iopub, self.control] {
            let name = channel.name();
            errors.extend(channel.close().await.into_iter().map(|e| format!("{}: {}", name, e)));
        }
        errors
    }
}

/// Connect a socket, retrying while the kernel is still binding its ports
async fn connect_with_retry<S: Socket>(
    socket: &mut S,
    endpoint: &str,
    child: &mut Child,
    deadline: Instant,
) -> Result<(), KernelError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let last_error = match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, socket.connect(endpoint)).await {
            Ok(Ok(())) => {
                debug!(endpoint = %endpoint, attempt, "Channel connected");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect attempt timed out".to_string(),
        };

        if attempt == 1 {
            debug!(endpoint = %endpoint, error = %last_error, "Connect attempt failed, retrying");
        }
        ensure_running(child)?;
        if Instant::now() + CONNECT_RETRY_DELAY >= deadline {
            return Err(KernelError::Unavailable(format!(
                "cannot connect to {} after {} attempts: {}",
                endpoint, attempt, last_error
            )));
        }
        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
    }
}

/// Wait until the kernel answers on shell and publishes on iopub
///
/// A `kernel_info_request` probe is sent every `probe_interval`. The
/// handshake completes once a `kernel_info_reply` to one of the probes
/// arrives on shell and an iopub message parented by one of the probes
/// is observed, which proves the SUB subscription is live.
///
/// # Returns
/// Ok(()) once ready, `KernelError::Unavailable` on deadline or process exit
pub async fn wait_for_ready(
    channels: &mut Channels,
    signer: &Signer,
    session: &str,
    child: &mut Child,
    deadline: Instant,
    probe_interval: Duration,
) -> Result<(), KernelError> {
    let mut probes: HashSet<String> = HashSet::new();
    let mut got_reply = false;
    let mut got_iopub = false;

    loop {
        ensure_running(child)?;
        let now = Instant::now();
        if now >= deadline {
            return Err(KernelError::Unavailable(format!(
                "no ready handshake before deadline (shell reply: {}, iopub: {})",
                got_reply, got_iopub
            )));
        }

        let probe = JupyterMessage::request(session, "kernel_info_request", json!({}));
        probes.insert(probe.msg_id().to_string());
        channels.shell.send(probe.to_frames(signer)?).await?;

        let window_end = (now + probe_interval).min(deadline);
        loop {
            let next = tokio::select! {
                r = channels.shell.recv() => Some((true, r)),
                r = channels.iopub.recv() => Some((false, r)),
                _ = tokio::time::sleep_until(window_end) => None,
            };
            let Some((from_shell, received)) = next else {
                break;
            };

            let msg = match JupyterMessage::from_frames(received?, signer) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "Dropping invalid kernel message during handshake");
                    continue;
                }
            };
            let answers_probe = msg.parent_msg_id().is_some_and(|id| probes.contains(id));
            if !answers_probe {
                continue;
            }

            if from_shell && msg.msg_type() == "kernel_info_reply" {
                got_reply = true;
            } else if !from_shell {
                got_iopub = true;
            }

            if got_reply && got_iopub {
                debug!(probes = probes.len(), "Kernel handshake complete");
                return Ok(());
            }
        }
    }
}

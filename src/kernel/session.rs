//! Kernel session - one supervised kernel process and its channels
//!
//! Each KernelSession tracks one kernel throughout its lifecycle:
//! Starting -> Ready -> (Dead | Closed)
//!
//! `submit` is the protocol pump. It sends one `execute_request` and reads
//! iopub until the kernel reports idle for that request. Messages whose
//! parent is a different request are dropped, so output from an earlier
//! request can never leak into the current one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::connection::{connection_file_path, ConnectionInfo};
use super::lifecycle::{spawn_kernel, wait_for_ready, Channels};
use super::output::{classify, IopubUpdate, OutputEvent};
use super::spec::{InterruptMode, LaunchCommand, LaunchSource};
use super::wire::{JupyterMessage, Signer};
use super::KernelError;
use crate::metrics::{KERNEL_DEATHS, KERNEL_STARTS};

/// Timing knobs for a kernel session
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Deadline for the ready handshake
    pub ready_timeout: Duration,
    /// How often the handshake re-sends `kernel_info_request`
    pub probe_interval: Duration,
    /// Wait per iopub poll while a request is in flight
    pub poll_timeout: Duration,
    /// Consecutive lapsed polls with a dead kernel before giving up
    pub dead_poll_budget: u32,
    /// Wait for the shell reply after idle (and for interrupt replies)
    pub reply_timeout: Duration,
    /// Wait for the process to exit after kill
    pub shutdown_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(10),
            dead_poll_budget: 2,
            reply_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// A running kernel process with connected channels
pub struct KernelSession {
    kernel_id: String,
    session_id: String,
    child: Child,
    pid: Option<u32>,
    channels: Option<Channels>,
    signer: Signer,
    connection_file: PathBuf,
    interrupt_mode: InterruptMode,
    source: LaunchSource,
    config: KernelConfig,
    alive: bool,
}

impl KernelSession {
    /// Launch a kernel and block until it completes the ready handshake
    ///
    /// On any failure the partially started process is killed and the
    /// connection file removed before the error is returned.
    ///
    /// # Arguments
    /// * `spec_name` - Kernel spec registered for the environment
    /// * `env_prefix` - Root of the isolated environment
    /// * `search_dirs` - Jupyter data directories to look for the spec in
    /// * `config` - Timeouts
    pub async fn start(
        spec_name: &str,
        env_prefix: &Path,
        search_dirs: &[PathBuf],
        config: KernelConfig,
    ) -> Result<Self, KernelError> {
        let kernel_id = Uuid::now_v7().to_string();
        let info = ConnectionInfo::allocate(spec_name)?;
        let connection_file = connection_file_path(&super::connection::runtime_dir(), &kernel_id);
        info.write_to(&connection_file)?;

        let python = env_prefix.join("bin").join("python");
        let cmd = LaunchCommand::resolve(spec_name, &python, search_dirs, &connection_file);

        let child = match spawn_kernel(&cmd, env_prefix) {
            Ok(child) => child,
            Err(e) => {
                remove_connection_file(&connection_file);
                return Err(e);
            }
        };
        let pid = child.id();
        let signer = Signer::new(&info.key)?;

        let mut session = Self {
            kernel_id,
            session_id: Uuid::new_v4().to_string(),
            child,
            pid,
            channels: None,
            signer,
            connection_file,
            interrupt_mode: cmd.interrupt_mode,
            source: cmd.source,
            config,
            alive: false,
        };

        // Drop kills the child and removes the connection file on error
        let deadline = Instant::now() + session.config.ready_timeout;
        let mut channels = Channels::connect(&info, &mut session.child, deadline).await?;
        let handshake = wait_for_ready(
            &mut channels,
            &session.signer,
            &session.session_id,
            &mut session.child,
            deadline,
            session.config.probe_interval,
        )
        .await;
        session.channels = Some(channels);
        if let Err(e) = handshake {
            session.shutdown().await;
            return Err(e);
        }

        session.alive = true;
        KERNEL_STARTS.with_label_values(&[session.source.label()]).inc();
        info!(
            kernel_id = %session.kernel_id,
            pid = ?session.pid,
            source = session.source.label(),
            "Kernel ready"
        );
        Ok(session)
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn launch_source(&self) -> &LaunchSource {
        &self.source
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    /// OS process id of the kernel
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the kernel process is running and the session usable
    pub fn is_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(kernel_id = %self.kernel_id, %status, "Kernel process has exited");
                false
            }
            Err(e) => {
                warn!(kernel_id = %self.kernel_id, error = %e, "Cannot query kernel process");
                false
            }
        }
    }

    /// Execute `code` and collect its output events in emission order
    ///
    /// Blocks until the kernel reports idle for this request. If polls
    /// lapse repeatedly while the kernel process is dead, a synthetic
    /// `KernelDied` error event is appended and the session is marked dead.
    pub async fn submit(&mut self, code: &str) -> Result<Vec<OutputEvent>, KernelError> {
        if !self.is_alive() {
            return Err(KernelError::NotRunning);
        }
        let channels = self.channels.as_mut().ok_or(KernelError::NotRunning)?;

        let request = JupyterMessage::request(
            &self.session_id,
            "execute_request",
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
        .with_msg_id(Uuid::now_v7().to_string());
        let request_id = request.msg_id().to_string();

        channels.shell.send(request.to_frames(&self.signer)?).await?;
        debug!(kernel_id = %self.kernel_id, request_id = %request_id, "execute_request sent");

        let mut events = Vec::new();
        let mut lapses: u32 = 0;

        loop {
            let polled = tokio::time::timeout(self.config.poll_timeout, channels.iopub.recv()).await;
            let raw = match polled {
                Ok(received) => received?,
                Err(_) => {
                    let exited = !matches!(self.child.try_wait(), Ok(None));
                    if !exited {
                        lapses = 0;
                        trace!(request_id = %request_id, "Still waiting on kernel");
                        continue;
                    }
                    lapses += 1;
                    if lapses >= self.config.dead_poll_budget {
                        warn!(kernel_id = %self.kernel_id, request_id = %request_id, "Kernel died during execution");
                        self.alive = false;
                        KERNEL_DEATHS.inc();
                        events.push(OutputEvent::kernel_died());
                        return Ok(events);
                    }
                    continue;
                }
            };
            lapses = 0;

            let msg = match JupyterMessage::from_frames(raw, &self.signer) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "Dropping invalid iopub message");
                    continue;
                }
            };
            if msg.parent_msg_id() != Some(request_id.as_str()) {
                trace!(msg_type = msg.msg_type(), "Ignoring iopub message for another request");
                continue;
            }

            match classify(msg.msg_type(), &msg.content) {
                IopubUpdate::Event(event) => events.push(event),
                IopubUpdate::Idle => break,
                IopubUpdate::Busy | IopubUpdate::Ignored => {}
            }
        }

        self.drain_reply(&request_id, "execute_reply").await;
        Ok(events)
    }

    /// Read the shell reply for `request_id` so replies never pile up
    async fn drain_reply(&mut self, request_id: &str, reply_type: &str) {
        if !matches!(self.child.try_wait(), Ok(None)) {
            debug!(request_id = %request_id, "Kernel process gone, not waiting for a reply");
            return;
        }
        let Some(channels) = self.channels.as_mut() else {
            return;
        };
        let deadline = Instant::now() + self.config.reply_timeout;
        loop {
            let received = match tokio::time::timeout_at(deadline, channels.shell.recv()).await {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    warn!(error = %e, "Shell channel error while draining reply");
                    return;
                }
                Err(_) => {
                    debug!(request_id = %request_id, reply_type, "No shell reply within reply timeout");
                    return;
                }
            };
            match JupyterMessage::from_frames(received, &self.signer) {
                Ok(msg) if msg.parent_msg_id() == Some(request_id) && msg.msg_type() == reply_type => {
                    trace!(status = ?msg.content.get("status"), "Shell reply drained");
                    return;
                }
                Ok(msg) => trace!(msg_type = msg.msg_type(), "Skipping stale shell message"),
                Err(e) => warn!(error = %e, "Dropping invalid shell message"),
            }
        }
    }

    /// Interrupt whatever the kernel is currently executing
    pub async fn interrupt(&mut self) -> Result<(), KernelError> {
        if !self.is_alive() {
            return Err(KernelError::NotRunning);
        }
        match self.interrupt_mode {
            InterruptMode::Signal => {
                let pid = self.pid.ok_or(KernelError::NotRunning)?;
                let pid = i32::try_from(pid)
                    .map_err(|_| KernelError::Interrupt(format!("pid {} out of range", pid)))?;
                kill(Pid::from_raw(pid), Signal::SIGINT)
                    .map_err(|e| KernelError::Interrupt(e.to_string()))?;
                info!(kernel_id = %self.kernel_id, "Sent SIGINT to kernel");
            }
            InterruptMode::Message => {
                let channels = self.channels.as_mut().ok_or(KernelError::NotRunning)?;
                let request = JupyterMessage::request(&self.session_id, "interrupt_request", json!({}));
                channels.control.send(request.to_frames(&self.signer)?).await?;
                let deadline = Instant::now() + self.config.reply_timeout;
                match tokio::time::timeout_at(deadline, channels.control.recv()).await {
                    Ok(Ok(_)) => info!(kernel_id = %self.kernel_id, "Kernel acknowledged interrupt"),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => debug!(kernel_id = %self.kernel_id, "No interrupt_reply within reply timeout"),
                }
            }
        }
        Ok(())
    }

    /// Close channels, kill the process and remove the connection file
    ///
    /// Every step is attempted regardless of earlier failures. Calling
    /// this again after the first time is a no-op.
    pub async fn shutdown(&mut self) {
        if let Some(channels) = self.channels.take() {
            for error in channels.close().await {
                warn!(kernel_id = %self.kernel_id, error = %error, "Failed to close kernel channel");
            }
        }

        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.start_kill() {
                warn!(kernel_id = %self.kernel_id, error = %e, "Failed to kill kernel process");
            }
            match tokio::time::timeout(self.config.shutdown_timeout, self.child.wait()).await {
                Ok(Ok(status)) => debug!(kernel_id = %self.kernel_id, %status, "Kernel process exited"),
                Ok(Err(e)) => warn!(kernel_id = %self.kernel_id, error = %e, "Failed to reap kernel process"),
                Err(_) => warn!(kernel_id = %self.kernel_id, "Kernel process did not exit after kill"),
            }
        }

        remove_connection_file(&self.connection_file);

        if self.alive {
            info!(kernel_id = %self.kernel_id, "Kernel shut down");
        }
        self.alive = false;
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
        remove_connection_file(&self.connection_file);
    }
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("kernel_id", &self.kernel_id)
            .field("pid", &self.pid)
            .field("source", &self.source)
            .field("alive", &self.alive)
            .finish()
    }
}

fn remove_connection_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove connection file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::Value;
    use tokio::process::Command;
    use zeromq::{Endpoint, PubSocket, RouterSocket, Socket, SocketRecv, SocketSend};

    use crate::kernel::wire::Header;

    const KEY: &str = "in-process-kernel-key";

    fn port_of(endpoint: &Endpoint) -> u16 {
        match endpoint {
            Endpoint::Tcp(_, port) => *port,
            other => panic!("expected a tcp endpoint, got {other}"),
        }
    }

    fn message(parent_header: Value, msg_type: &str, content: Value) -> JupyterMessage {
        JupyterMessage {
            header: Header::new("in-process-kernel", msg_type),
            parent_header,
            metadata: json!({}),
            content,
        }
    }

    fn child_of(request: &JupyterMessage, msg_type: &str, content: Value) -> JupyterMessage {
        message(serde_json::to_value(&request.header).unwrap(), msg_type, content)
    }

    async fn publish(iopub: &mut PubSocket, signer: &Signer, msg: JupyterMessage) {
        iopub.send(msg.to_frames(signer).unwrap()).await.unwrap();
    }

    async fn reply(socket: &mut RouterSocket, identity: Bytes, signer: &Signer, msg: JupyterMessage) {
        let mut frames = msg.to_frames(signer).unwrap();
        frames.push_front(identity);
        socket.send(frames).await.unwrap();
    }

    /// Kernel stand-in speaking just enough of the protocol
    ///
    /// Every `execute_request` is preceded on iopub by output parented to an
    /// earlier request and by a message signed with the wrong key. Code
    /// `die` prints, then SIGKILLs `pid` without ever going idle; any other
    /// code is echoed back as the execute result, followed after idle by a
    /// late stream message.
    async fn serve(mut shell: RouterSocket, mut iopub: PubSocket, mut control: RouterSocket, pid: Option<u32>) {
        let signer = Signer::new(KEY).unwrap();
        let forger = Signer::new("not-the-key").unwrap();
        loop {
            let (from_shell, received) = tokio::select! {
                r = shell.recv() => (true, r),
                r = control.recv() => (false, r),
            };
            let Ok(raw) = received else { return };
            let identity = raw.get(0).unwrap().clone();
            let request = JupyterMessage::from_frames(raw, &signer).unwrap();

            match request.msg_type() {
                "kernel_info_request" => {
                    publish(&mut iopub, &signer, child_of(&request, "status", json!({"execution_state": "busy"}))).await;
                    reply(&mut shell, identity, &signer, child_of(&request, "kernel_info_reply", json!({"status": "ok"}))).await;
                }
                "execute_request" => {
                    let code = request.content["code"].as_str().unwrap_or_default().to_string();
                    let earlier = json!({"msg_id": "earlier-request", "msg_type": "execute_request"});
                    publish(&mut iopub, &signer, message(earlier.clone(), "stream", json!({"name": "stdout", "text": "stale\n"}))).await;
                    publish(&mut iopub, &signer, message(earlier, "status", json!({"execution_state": "idle"}))).await;
                    publish(&mut iopub, &forger, child_of(&request, "stream", json!({"name": "stdout", "text": "forged\n"}))).await;
                    publish(&mut iopub, &signer, child_of(&request, "status", json!({"execution_state": "busy"}))).await;

                    if code == "die" {
                        publish(&mut iopub, &signer, child_of(&request, "stream", json!({"name": "stdout", "text": "partial\n"}))).await;
                        if let Some(pid) = pid {
                            kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
                        }
                        continue;
                    }

                    publish(&mut iopub, &signer, child_of(&request, "stream", json!({"name": "stdout", "text": "hello\n"}))).await;
                    publish(
                        &mut iopub,
                        &signer,
                        child_of(&request, "execute_result", json!({"data": {"text/plain": code}, "metadata": {}})),
                    )
                    .await;
                    publish(&mut iopub, &signer, child_of(&request, "status", json!({"execution_state": "idle"}))).await;
                    reply(&mut shell, identity, &signer, child_of(&request, "execute_reply", json!({"status": "ok"}))).await;
                    publish(&mut iopub, &signer, child_of(&request, "stream", json!({"name": "stdout", "text": "late\n"}))).await;
                }
                "interrupt_request" if !from_shell => {
                    reply(&mut control, identity, &signer, child_of(&request, "interrupt_reply", json!({"status": "ok"}))).await;
                }
                _ => {}
            }
        }
    }

    /// A ready session whose "kernel" is `serve` and whose process is `sleep`
    async fn in_process_session(config: KernelConfig) -> KernelSession {
        let mut shell = RouterSocket::new();
        let shell_port = port_of(&shell.bind("tcp://127.0.0.1:0").await.unwrap());
        let mut iopub = PubSocket::new();
        let iopub_port = port_of(&iopub.bind("tcp://127.0.0.1:0").await.unwrap());
        let mut control = RouterSocket::new();
        let control_port = port_of(&control.bind("tcp://127.0.0.1:0").await.unwrap());

        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let pid = child.id();
        tokio::spawn(serve(shell, iopub, control, pid));

        let info = ConnectionInfo {
            ip: "127.0.0.1".to_string(),
            transport: "tcp".to_string(),
            shell_port,
            iopub_port,
            stdin_port: 0,
            control_port,
            hb_port: 0,
            key: KEY.to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            kernel_name: "in_process".to_string(),
        };

        let mut session = KernelSession {
            kernel_id: Uuid::now_v7().to_string(),
            session_id: Uuid::new_v4().to_string(),
            child,
            pid,
            channels: None,
            signer: Signer::new(KEY).unwrap(),
            connection_file: std::env::temp_dir().join(format!("cellpilot-test-{}.json", Uuid::new_v4())),
            interrupt_mode: InterruptMode::Message,
            source: LaunchSource::Direct,
            config,
            alive: false,
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut channels = Channels::connect(&info, &mut session.child, deadline).await.unwrap();
        wait_for_ready(
            &mut channels,
            &session.signer,
            &session.session_id,
            &mut session.child,
            deadline,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        session.channels = Some(channels);
        session.alive = true;
        session
    }

    fn quick_config() -> KernelConfig {
        KernelConfig {
            poll_timeout: Duration::from_millis(100),
            dead_poll_budget: 2,
            reply_timeout: Duration::from_millis(500),
            ..KernelConfig::default()
        }
    }

    #[test]
    fn test_default_timeouts() {
        let config = KernelConfig::default();
        assert_eq!(config.ready_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_timeout, Duration::from_secs(10));
        assert_eq!(config.dead_poll_budget, 2);
    }

    #[tokio::test]
    async fn test_start_with_missing_interpreter_fails_cleanly() {
        let env = tempfile::tempdir().unwrap();
        let err = KernelSession::start(
            "cellpilot_missing_00000000",
            env.path(),
            &[env.path().join("share").join("jupyter")],
            KernelConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KernelError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_submit_keeps_only_own_request_output() {
        let mut session = in_process_session(quick_config()).await;

        let events = session.submit("2").await.unwrap();
        assert_eq!(
            events,
            vec![
                OutputEvent::Stream {
                    name: "stdout".into(),
                    text: "hello\n".into()
                },
                OutputEvent::Result {
                    data: serde_json::from_value(json!({"text/plain": "2"})).unwrap(),
                    metadata: Default::default(),
                },
            ]
        );

        // The late message and the replayed stale output belong to other requests
        let events = session.submit("3").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].plain_text(), Some("hello\n"));
        assert_eq!(events[1].plain_text(), Some("3"));
        assert!(session.is_alive());

        session.shutdown().await;
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_dead_kernel_reported_once() {
        let mut session = in_process_session(quick_config()).await;

        let events = session.submit("die").await.unwrap();
        assert_eq!(events.len(), 2, "got {events:?}");
        assert_eq!(events[0].plain_text(), Some("partial\n"));
        assert!(events[1].is_kernel_died());
        assert_eq!(events.iter().filter(|e| e.is_kernel_died()).count(), 1);

        assert!(!session.is_alive());
        assert!(matches!(session.submit("1").await, Err(KernelError::NotRunning)));
        assert!(matches!(session.interrupt().await, Err(KernelError::NotRunning)));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_interrupt_over_control_channel() {
        let mut session = in_process_session(quick_config()).await;
        session.interrupt().await.unwrap();
        // The kernel keeps serving after the interrupt
        assert_eq!(session.submit("4").await.unwrap()[1].plain_text(), Some("4"));
        session.shutdown().await;
    }
}

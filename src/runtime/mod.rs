//! Execution runtime - a provisioned environment plus one live kernel
//!
//! The runtime owns exactly one [`KernelSession`]. `execute` never restarts
//! a dead kernel by itself; callers decide when to `restart`. Dropping the
//! runtime releases the kernel through the session's own `Drop`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::env::{ProvisionError, Provisioner, ProvisionerConfig, RuntimeEnvironment};
use crate::kernel::{KernelConfig, KernelError, KernelSession, OutputEvent};
use crate::metrics::{CODE_EXECUTIONS, CODE_EXECUTION_DURATION};

/// Runtime shared between the tools that need the live kernel
pub type SharedRuntime = Arc<Mutex<ExecutionRuntime>>;

/// Configuration for the execution runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Where the Python environment lives (created on first use)
    pub env_path: PathBuf,
    #[serde(flatten)]
    pub provisioner: ProvisionerConfig,
    pub ready_timeout_secs: u64,
    pub poll_timeout_secs: u64,
    pub dead_poll_budget: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let kernel = KernelConfig::default();
        Self {
            env_path: PathBuf::from(".venv_cellpilot"),
            provisioner: ProvisionerConfig::default(),
            ready_timeout_secs: kernel.ready_timeout.as_secs(),
            poll_timeout_secs: kernel.poll_timeout.as_secs(),
            dead_poll_budget: kernel.dead_poll_budget,
        }
    }
}

impl RuntimeConfig {
    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            dead_poll_budget: self.dead_poll_budget.max(1),
            ..KernelConfig::default()
        }
    }
}

/// One executed code unit and everything it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedUnit {
    pub code: String,
    pub outputs: Vec<OutputEvent>,
}

/// Error type for the execution runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("environment provisioning failed: {0}")]
    ProvisioningFailed(#[from] ProvisionError),
    #[error("kernel unavailable: {0}")]
    KernelUnavailable(#[source] KernelError),
    #[error("no live kernel session (restart the runtime)")]
    RuntimeUnavailable,
    #[error("execution failed: {0}")]
    Execution(#[source] KernelError),
}

/// Provisioned environment + supervised kernel + execution history
pub struct ExecutionRuntime {
    config: RuntimeConfig,
    environment: RuntimeEnvironment,
    session: Option<KernelSession>,
    history: Vec<ExecutedUnit>,
}

impl ExecutionRuntime {
    /// Provision the environment and start a kernel in it
    ///
    /// Both steps are fatal: an error here means no runtime exists.
    pub async fn start(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let span = info_span!("runtime.start", otel.name = "runtime.start", env = %config.env_path.display());
        async move {
            let provisioner = Provisioner::new(config.provisioner.clone());
            let environment = provisioner.ensure(&config.env_path).await?;
            let session = start_session(&environment, config.kernel_config()).await?;

            Ok(Self {
                config,
                environment,
                session: Some(session),
                history: Vec::new(),
            })
        }
        .instrument(span)
        .await
    }

    pub fn environment(&self) -> &RuntimeEnvironment {
        &self.environment
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Executed units in submission order
    pub fn history(&self) -> &[ExecutedUnit] {
        &self.history
    }

    /// Whether a live kernel session exists
    pub fn is_alive(&mut self) -> bool {
        self.session.as_mut().is_some_and(KernelSession::is_alive)
    }

    /// Execute code in the live kernel and record it in the history
    ///
    /// Fails with `RuntimeUnavailable` when the kernel is gone. A kernel that
    /// dies during this call yields a `KernelDied` error event instead.
    pub async fn execute(&mut self, code: &str) -> Result<Vec<OutputEvent>, RuntimeError> {
        if !self.is_alive() {
            return Err(RuntimeError::RuntimeUnavailable);
        }
        let session = self.session.as_mut().ok_or(RuntimeError::RuntimeUnavailable)?;

        let span = info_span!(
            "runtime.execute",
            otel.name = "runtime.execute",
            kernel_id = %session.kernel_id(),
            code_len = code.len()
        );
        let started = Instant::now();
        let result = session.submit(code).instrument(span).await;
        CODE_EXECUTION_DURATION.observe(started.elapsed().as_secs_f64());

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(KernelError::NotRunning) => {
                CODE_EXECUTIONS.with_label_values(&["unavailable"]).inc();
                return Err(RuntimeError::RuntimeUnavailable);
            }
            Err(e) => {
                CODE_EXECUTIONS.with_label_values(&["failed"]).inc();
                return Err(RuntimeError::Execution(e));
            }
        };

        let outcome = if outputs.iter().any(OutputEvent::is_kernel_died) {
            "kernel_died"
        } else if outputs.iter().any(OutputEvent::is_error) {
            "error"
        } else {
            "ok"
        };
        CODE_EXECUTIONS.with_label_values(&[outcome]).inc();

        self.history.push(ExecutedUnit {
            code: code.to_string(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    /// Interrupt the running execution
    pub async fn interrupt(&mut self) -> Result<(), RuntimeError> {
        let session = self.session.as_mut().ok_or(RuntimeError::RuntimeUnavailable)?;
        session.interrupt().await.map_err(|e| match e {
            KernelError::NotRunning => RuntimeError::RuntimeUnavailable,
            other => RuntimeError::Execution(other),
        })
    }

    /// Replace the kernel session with a fresh one (history is kept)
    pub async fn restart(&mut self) -> Result<(), RuntimeError> {
        info!(env = %self.environment.path.display(), "Restarting kernel");
        self.shutdown().await;
        let session = start_session(&self.environment, self.config.kernel_config()).await?;
        self.session = Some(session);
        Ok(())
    }

    /// Shut the kernel down; repeated calls are no-ops
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
    }
}

impl std::fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("environment", &self.environment)
            .field("session", &self.session)
            .field("history_len", &self.history.len())
            .finish()
    }
}

async fn start_session(
    environment: &RuntimeEnvironment,
    config: KernelConfig,
) -> Result<KernelSession, RuntimeError> {
    KernelSession::start(
        &environment.kernel_spec_name,
        &environment.path,
        &environment.kernel_search_dirs(),
        config,
    )
    .await
    .map_err(|e| {
        warn!(error = %e, "Kernel failed to start");
        RuntimeError::KernelUnavailable(e)
    })
}

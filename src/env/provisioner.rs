//! Python environment provisioning
//!
//! `ensure` is idempotent: the `pyvenv.cfg` marker means the environment
//! is already there and nothing is installed again.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::kernel::spec::{data_dirs, find_kernel_spec};
use crate::metrics::PROVISION_DURATION;

/// File whose presence marks a finished environment
pub const MARKER_FILE: &str = "pyvenv.cfg";

/// Packages the kernel needs inside the environment
pub const KERNEL_PACKAGES: [&str; 2] = ["jupyter_client", "ipykernel"];

/// Error type for environment provisioning
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("`{command}` failed:\n{output}")]
    CommandFailed { command: String, output: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provisioner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Interpreter used to create the environment
    pub base_python: String,
    pub create_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub register_timeout_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            base_python: "python3".to_string(),
            create_timeout_secs: 120,
            install_timeout_secs: 300,
            register_timeout_secs: 60,
        }
    }
}

/// A provisioned, reusable Python environment
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEnvironment {
    pub path: PathBuf,
    pub kernel_spec_name: String,
    /// True when this call created the environment
    pub freshly_created: bool,
    /// True when a kernel spec with `kernel_spec_name` is discoverable
    pub kernel_spec_registered: bool,
}

impl RuntimeEnvironment {
    pub fn python(&self) -> PathBuf {
        self.path.join("bin").join("python")
    }

    pub fn pip(&self) -> PathBuf {
        self.path.join("bin").join("pip")
    }

    /// Jupyter data directories searched for this environment's kernel spec
    pub fn kernel_search_dirs(&self) -> Vec<PathBuf> {
        data_dirs(&self.path)
    }
}

/// Deterministic kernel spec name for an environment path
///
/// `cellpilot_<dir name slug>_<first 8 hex chars of sha256(path)>`
pub fn kernel_spec_name(path: &Path) -> String {
    let dir_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let slug: String = dir_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hash = hex::encode(&digest[..4]);
    format!("cellpilot_{}_{}", slug, hash)
}

/// Creates Python environments with the kernel packages installed
#[derive(Debug, Clone, Default)]
pub struct Provisioner {
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    /// Make sure an environment exists at `path`
    ///
    /// When the marker file exists this returns immediately. Otherwise the
    /// environment is created and the kernel packages installed; any
    /// failure removes the half-built directory so the next call starts
    /// from scratch. Kernel spec registration failure is only logged.
    pub async fn ensure(&self, path: &Path) -> Result<RuntimeEnvironment, ProvisionError> {
        let path = absolute(path)?;
        let spec_name = kernel_spec_name(&path);

        if path.join(MARKER_FILE).exists() {
            debug!(path = %path.display(), "Environment already provisioned");
            let registered = find_kernel_spec(&spec_name, &data_dirs(&path)).is_ok();
            return Ok(RuntimeEnvironment {
                path,
                kernel_spec_name: spec_name,
                freshly_created: false,
                kernel_spec_registered: registered,
            });
        }

        let started = Instant::now();
        let existed_before = path.exists();
        info!(path = %path.display(), "Creating Python environment");

        if let Err(e) = self.create_and_install(&path).await {
            if !existed_before && path.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %cleanup, "Failed to remove partial environment");
                }
            }
            return Err(e);
        }

        let mut env = RuntimeEnvironment {
            path,
            kernel_spec_name: spec_name,
            freshly_created: true,
            kernel_spec_registered: false,
        };
        env.kernel_spec_registered = self.register_kernel_spec(&env).await;

        PROVISION_DURATION.observe(started.elapsed().as_secs_f64());
        info!(
            path = %env.path.display(),
            spec = %env.kernel_spec_name,
            registered = env.kernel_spec_registered,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Environment ready"
        );
        Ok(env)
    }

    async fn create_and_install(&self, path: &Path) -> Result<(), ProvisionError> {
        let path_arg = path.to_string_lossy().into_owned();
        run_command(
            &self.config.base_python,
            &["-m", "venv", &path_arg],
            Duration::from_secs(self.config.create_timeout_secs),
        )
        .await?;

        let pip = path.join("bin").join("pip");
        let mut args = vec!["install", "--upgrade"];
        args.extend(KERNEL_PACKAGES);
        info!(packages = ?KERNEL_PACKAGES, "Installing kernel packages");
        run_command(
            &pip.to_string_lossy(),
            &args,
            Duration::from_secs(self.config.install_timeout_secs),
        )
        .await?;
        Ok(())
    }

    /// Register a kernel spec for the environment's interpreter
    ///
    /// Returns whether the spec is discoverable afterwards.
    async fn register_kernel_spec(&self, env: &RuntimeEnvironment) -> bool {
        let dirs = env.kernel_search_dirs();
        if find_kernel_spec(&env.kernel_spec_name, &dirs).is_ok() {
            debug!(spec = %env.kernel_spec_name, "Kernel spec already registered");
            return true;
        }

        let dir_name = env
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name_arg = format!("--name={}", env.kernel_spec_name);
        let display_arg = format!("--display-name=Cellpilot Runtime ({})", dir_name);
        let result = run_command(
            &env.python().to_string_lossy(),
            &["-m", "ipykernel", "install", "--user", &name_arg, &display_arg],
            Duration::from_secs(self.config.register_timeout_secs),
        )
        .await;

        match result {
            Ok(()) => find_kernel_spec(&env.kernel_spec_name, &dirs).is_ok(),
            Err(e) => {
                warn!(spec = %env.kernel_spec_name, error = %e, "Kernel spec registration failed, will launch directly");
                false
            }
        }
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Run a command to completion within `timeout`, capturing its output
async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<(), ProvisionError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!(command = %command, "Running");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProvisionError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => return Err(ProvisionError::Timeout { command, after: timeout }),
    };

    if output.status.success() {
        return Ok(());
    }
    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    captured.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(ProvisionError::CommandFailed {
        command,
        output: format!("{} ({})", captured.trim_end(), output.status),
    })
}

//! Kernel specification discovery and launch command resolution
//!
//! A kernel spec is a `kernels/<name>/kernel.json` file under one of the
//! Jupyter data directories. It tells us the argv to start the kernel with
//! (containing a `{connection_file}` placeholder) and how to interrupt it.
//!
//! When no spec with the requested name exists we fall back to launching
//! `ipykernel_launcher` directly with the environment's interpreter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

/// How the kernel wants to be interrupted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Send SIGINT to the kernel process
    #[default]
    Signal,
    /// Send an `interrupt_request` on the control channel
    Message,
}

/// Parsed `kernel.json`
#[derive(Debug, Clone, Deserialize)]
pub struct KernelSpec {
    pub argv: Vec<String>,
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Error type for kernel spec lookup
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("no such kernel: {0}")]
    NoSuchKernel(String),
    #[error("invalid kernel spec at {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Jupyter data directories in lookup order
///
/// # Arguments
/// * `env_prefix` - Root of the isolated environment (its `share/jupyter` is searched)
pub fn data_dirs(env_prefix: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(paths) = std::env::var_os("JUPYTER_PATH") {
        dirs.extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
    }
    if let Some(dir) = std::env::var_os("JUPYTER_DATA_DIR") {
        if !dir.is_empty() {
            dirs.push(PathBuf::from(dir));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        if cfg!(target_os = "macos") {
            dirs.push(home.join("Library").join("Jupyter"));
        } else {
            let data_home = std::env::var_os("XDG_DATA_HOME")
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".local").join("share"));
            dirs.push(data_home.join("jupyter"));
        }
    }
    dirs.push(env_prefix.join("share").join("jupyter"));
    dirs.push(PathBuf::from("/usr/local/share/jupyter"));
    dirs.push(PathBuf::from("/usr/share/jupyter"));

    dirs
}

/// Find a kernel spec by name in the given data directories
///
/// Returns the spec's resource directory together with the parsed spec.
pub fn find_kernel_spec(name: &str, dirs: &[PathBuf]) -> Result<(PathBuf, KernelSpec), SpecError> {
    for dir in dirs {
        let resource_dir = dir.join("kernels").join(name);
        let spec_file = resource_dir.join("kernel.json");
        if !spec_file.is_file() {
            continue;
        }
        debug!(path = %spec_file.display(), "Found kernel spec");

        let text = std::fs::read_to_string(&spec_file).map_err(|e| SpecError::Invalid {
            path: spec_file.clone(),
            reason: e.to_string(),
        })?;
        let spec: KernelSpec = serde_json::from_str(&text).map_err(|e| SpecError::Invalid {
            path: spec_file.clone(),
            reason: e.to_string(),
        })?;
        if spec.argv.is_empty() {
            return Err(SpecError::Invalid {
                path: spec_file,
                reason: "empty argv".to_string(),
            });
        }
        return Ok((resource_dir, spec));
    }
    Err(SpecError::NoSuchKernel(name.to_string()))
}

/// Where a launch command came from
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchSource {
    KernelSpec(PathBuf),
    Direct,
}

impl LaunchSource {
    pub fn label(&self) -> &'static str {
        match self {
            LaunchSource::KernelSpec(_) => "spec",
            LaunchSource::Direct => "direct",
        }
    }
}

/// A fully substituted command line for starting a kernel
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub interrupt_mode: InterruptMode,
    pub source: LaunchSource,
}

impl LaunchCommand {
    /// Build from a kernel spec, substituting `{connection_file}` and `{resource_dir}`
    pub fn from_spec(resource_dir: &Path, spec: &KernelSpec, connection_file: &Path) -> Self {
        let connection = connection_file.to_string_lossy();
        let resources = resource_dir.to_string_lossy();
        let mut argv = spec.argv.iter().map(|arg| {
            arg.replace("{connection_file}", &connection)
                .replace("{resource_dir}", &resources)
        });
        // find_kernel_spec rejects empty argv
        let program = argv.next().unwrap_or_default();

        Self {
            program,
            args: argv.collect(),
            env: spec.env.clone(),
            interrupt_mode: spec.interrupt_mode,
            source: LaunchSource::KernelSpec(resource_dir.to_path_buf()),
        }
    }

    /// `<python> -m ipykernel_launcher -f <connection_file>`
    pub fn direct(python: &Path, connection_file: &Path) -> Self {
        Self {
            program: python.to_string_lossy().into_owned(),
            args: vec![
                "-m".to_string(),
                "ipykernel_launcher".to_string(),
                "-f".to_string(),
                connection_file.to_string_lossy().into_owned(),
            ],
            env: HashMap::new(),
            interrupt_mode: InterruptMode::Signal,
            source: LaunchSource::Direct,
        }
    }

    /// Prefer the named kernel spec; fall back to a direct launch on any lookup failure
    pub fn resolve(spec_name: &str, python: &Path, dirs: &[PathBuf], connection_file: &Path) -> Self {
        match find_kernel_spec(spec_name, dirs) {
            Ok((resource_dir, spec)) => {
                info!(spec = %spec_name, display_name = %spec.display_name, "Launching kernel from spec");
                Self::from_spec(&resource_dir, &spec, connection_file)
            }
            Err(e) => {
                info!(spec = %spec_name, reason = %e, "Kernel spec unavailable, falling back to direct launch");
                Self::direct(python, connection_file)
            }
        }
    }
}

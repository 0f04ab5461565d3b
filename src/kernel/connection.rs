//! Kernel connection descriptor
//!
//! The kernel is told where to listen through a JSON connection file. We
//! pick the ports and the signing key, write the file, and pass its path on
//! the kernel's command line.

use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Loopback address every channel binds to
const KERNEL_IP: &str = "127.0.0.1";

/// Contents of a kernel connection file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub key: String,
    pub signature_scheme: String,
    pub kernel_name: String,
}

impl ConnectionInfo {
    /// Allocate five free loopback ports and a random signing key
    ///
    /// All listeners are held open until every port is known so the OS
    /// cannot hand out the same port twice.
    pub fn allocate(kernel_name: &str) -> io::Result<Self> {
        let listeners = (0..5)
            .map(|_| TcpListener::bind((KERNEL_IP, 0)))
            .collect::<io::Result<Vec<_>>>()?;
        let ports = listeners
            .iter()
            .map(|l| l.local_addr().map(|a| a.port()))
            .collect::<io::Result<Vec<_>>>()?;
        drop(listeners);

        Ok(Self {
            ip: KERNEL_IP.to_string(),
            transport: "tcp".to_string(),
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            key: Uuid::new_v4().to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            kernel_name: kernel_name.to_string(),
        })
    }

    /// ZeroMQ endpoint for a port, e.g. `tcp://127.0.0.1:52811`
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    /// Write the connection file, readable only by the current user
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&json)
    }
}

/// Directory holding connection files (`$JUPYTER_RUNTIME_DIR` if set)
pub fn runtime_dir() -> PathBuf {
    match std::env::var_os("JUPYTER_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("cellpilot"),
    }
}

/// Fresh connection file path for a kernel
pub fn connection_file_path(dir: &Path, kernel_id: &str) -> PathBuf {
    dir.join(format!("kernel-{}.json", kernel_id))
}

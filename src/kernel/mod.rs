//! Interactive execution kernel
//!
//! Launches a Jupyter-protocol kernel inside the provisioned environment and
//! speaks the messaging protocol to it directly over ZeroMQ.
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────┐
//! │        KernelSession         │          │      kernel process      │
//! │                              │  shell   │                          │
//! │  submit(code) ───────────────┼─────────►│  execute_request         │
//! │                              │  iopub   │                          │
//! │  pump: stream / display /  ◄─┼──────────┤  status busy … idle      │
//! │        result / error        │ control  │                          │
//! │  interrupt / shutdown ───────┼─────────►│  interrupt_request       │
//! └──────────────────────────────┘          └──────────────────────────┘
//! ```

pub mod channel;
pub mod connection;
pub mod lifecycle;
pub mod output;
pub mod session;
pub mod spec;
pub mod wire;

pub use output::{render_events, OutputEvent, KERNEL_DIED};
pub use session::{KernelConfig, KernelSession};
pub use spec::{InterruptMode, LaunchCommand, LaunchSource};

/// Error type for kernel operations
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to launch kernel `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel unavailable: {0}")]
    Unavailable(String),
    #[error("kernel channel error: {0}")]
    Channel(String),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
    #[error("kernel is not running")]
    NotRunning,
    #[error("interrupt failed: {0}")]
    Interrupt(String),
}

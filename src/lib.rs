//! Cellpilot - a planning agent that executes its plan in a live Python kernel
//!
//! The agent turns model function calls into tool invocations. The central
//! tool runs code in one long-lived Jupyter kernel, started inside a
//! provisioned virtual environment and driven over the native wire protocol.
//!
//! # Modules
//!
//! - `env` - Virtual environment provisioning and kernel spec registration
//! - `kernel` - Kernel launch, ZeroMQ channels, and the message pump
//! - `runtime` - Environment + kernel session + execution history
//! - `tools` - Tool contract, registry and built-in tools
//! - `integrations` - Persisted app wrappers that can be imported into the kernel
//! - `llm` - Model adapter (OpenAI Responses API)
//! - `agent` - Planner, tool-orchestration loop, sessions
//! - `config` - TOML + environment configuration
//! - `metrics` - Prometheus metrics
//! - `tracing` - Console logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use cellpilot::{Agent, AppConfig};
//!
//! let config = AppConfig::load(None)?;
//! let mut agent = Agent::start(&config).await?;
//! agent.generate_plan("Send 'hello' to the #general Discord channel").await?;
//! let result = agent.execute().await?;
//! agent.shutdown().await;
//! ```

pub mod agent;
pub mod config;
pub mod env;
pub mod integrations;
pub mod kernel;
pub mod llm;
pub mod metrics;
pub mod runtime;
pub mod tools;
pub mod tracing;

pub use agent::{Agent, AgentConfig, AgentController, AgentError, AgentState};
pub use config::AppConfig;
pub use runtime::{ExecutionRuntime, RuntimeConfig, SharedRuntime};

//! Agent: plan a task, then execute the plan with tools
//!
//! # Architecture
//!
//! ```text
//! Task → Planner ──(plan, user feedback loop)──► approved Plan
//!                                                    │
//!                                                    ▼
//!        AgentController ◄──► ModelClient (Responses API, with tools)
//!              │
//!              ▼ function call
//!        ToolRegistry ─┬─ execute_code ─┐
//!                      ├─ import_app ───┼─► ExecutionRuntime (one live kernel)
//!                      ├─ list_apps     │
//!                      └─ generate_app ─┘─► IntegrationStore
//!              │
//!              ▼ tool result appended, loop until "done"
//! ```

pub mod controller;
pub mod launch;
pub mod planner;
pub mod prompts;
pub mod sessions;

pub use controller::{AgentConfig, AgentController, AgentError, AgentResult, AgentState};
pub use launch::{build_registry, Agent};
pub use planner::Planner;
pub use sessions::{Session, SessionStore, SessionSummary};

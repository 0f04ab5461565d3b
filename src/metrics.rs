//! Prometheus metrics for agent runs, model calls, tools and the kernel
//!
//! All metrics live in the default registry; [`render`] produces the text
//! exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Agent runs by outcome.
    ///
    /// Labels:
    /// - outcome: "done", "model_retries_exhausted", "max_iterations"
    pub static ref AGENT_RUNS: IntCounterVec = register_int_counter_vec!(
        "cellpilot_agent_runs_total",
        "Agent runs by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_RUNS metric");

    /// Model turns taken across all runs.
    pub static ref AGENT_ITERATIONS: IntCounter = register_int_counter!(
        "cellpilot_agent_iterations_total",
        "Model turns taken by the agent loop"
    ).expect("failed to register AGENT_ITERATIONS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Model Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref MODEL_CALLS: IntCounter = register_int_counter!(
        "cellpilot_model_calls_total",
        "Requests sent to the model provider"
    ).expect("failed to register MODEL_CALLS metric");

    /// Failed model turns (transport, HTTP status, unparseable output).
    pub static ref MODEL_FAILURES: IntCounter = register_int_counter!(
        "cellpilot_model_failures_total",
        "Model turns that failed and were retried"
    ).expect("failed to register MODEL_FAILURES metric");

    pub static ref MODEL_LATENCY: Histogram = register_histogram!(
        "cellpilot_model_latency_seconds",
        "Model request latency",
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register MODEL_LATENCY metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Tool Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tool invocations.
    ///
    /// Labels:
    /// - tool: tool name (e.g., "execute_code", "import_app")
    /// - outcome: "ok", "error", "invalid", "unknown"
    pub static ref TOOL_CALLS: IntCounterVec = register_int_counter_vec!(
        "cellpilot_tool_calls_total",
        "Tool invocations by tool and outcome",
        &["tool", "outcome"]
    ).expect("failed to register TOOL_CALLS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Runtime Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code submissions.
    ///
    /// Labels:
    /// - outcome: "ok", "error", "kernel_died", "unavailable", "failed"
    pub static ref CODE_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "cellpilot_code_executions_total",
        "Code submissions by outcome",
        &["outcome"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    pub static ref CODE_EXECUTION_DURATION: Histogram = register_histogram!(
        "cellpilot_code_execution_duration_seconds",
        "Time from execute_request to idle",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    /// Kernel starts.
    ///
    /// Labels:
    /// - source: "spec" (registered kernel spec) or "direct" (fallback launch)
    pub static ref KERNEL_STARTS: IntCounterVec = register_int_counter_vec!(
        "cellpilot_kernel_starts_total",
        "Kernels started by launch source",
        &["source"]
    ).expect("failed to register KERNEL_STARTS metric");

    pub static ref KERNEL_DEATHS: IntCounter = register_int_counter!(
        "cellpilot_kernel_deaths_total",
        "Kernels found dead during an execution"
    ).expect("failed to register KERNEL_DEATHS metric");

    pub static ref PROVISION_DURATION: Histogram = register_histogram!(
        "cellpilot_provision_duration_seconds",
        "Time to create an environment and install kernel packages",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("failed to register PROVISION_DURATION metric");
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        TOOL_CALLS.with_label_values(&["execute_code", "ok"]).inc();
        KERNEL_STARTS.with_label_values(&["direct"]).inc();
        let text = render();
        assert!(text.contains("cellpilot_tool_calls_total"));
        assert!(text.contains("source=\"direct\""));
    }
}

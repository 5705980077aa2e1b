//! Execution record types: bindings, artifacts, verdicts, run traces.
//!
//! These are closed structs with defined field sets; unknown fields in
//! inbound JSON are ignored on deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{TaskGraph, TaskNode};

/// A concrete (task, model, provider, attempt) association used for one
/// execution. Immutable once created; new attempts create new bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub task_id: String,
    pub model_id: String,
    pub provider_id: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Produced,
    Verified,
    Rejected,
    Repaired,
}

/// Text produced by executing a binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub task_id: String,
    pub binding: Binding,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub produced_at: DateTime<Utc>,
    pub status: ArtifactStatus,
}

/// One-node subgraph emitted by the verifier to correct a rejected
/// artifact. The node inherits the original task's criteria and consumes
/// the rejected artifact as input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairDirective {
    pub node: TaskNode,
    pub rejected_artifact_id: String,
}

/// The verifier's structured judgement over an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub artifact_id: String,
    pub score: f64,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairDirective>,
}

/// Aggregate numbers for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub wall_time_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub tasks_executed: u32,
    pub tasks_repaired: u32,
    pub tasks_failed: u32,
}

/// Final assembled response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub content: String,
    /// Mean of constituent verdict scores.
    pub confidence: f64,
    pub strategy: String,
    pub source_artifacts: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The full, sealed record of one invocation, suitable for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: String,
    pub prompt: String,
    /// Final graph, including repair-generated nodes.
    pub graph: TaskGraph,
    pub bindings: Vec<Binding>,
    pub artifacts: Vec<Artifact>,
    pub verdicts: Vec<Verdict>,
    pub response: Option<RunResponse>,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
}

/// Generate a time-sortable run id: `YYYYMMDD_HHMMSS_<6-hex>`.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..6])
}

/// Generate an artifact id: `<task_id>_a<attempt>_<6-hex>`.
pub fn generate_artifact_id(task_id: &str, attempt: u32) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_a{}_{}", task_id, attempt, &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let now = "2025-03-01T12:34:56Z".parse().unwrap();
        let id = generate_run_id(now);
        assert!(id.starts_with("20250301_123456_"));
        assert_eq!(id.len(), "20250301_123456_".len() + 6);
    }

    #[test]
    fn test_trace_round_trips_structurally_equal() {
        let trace = RunTrace {
            run_id: "20250301_123456_abc123".into(),
            prompt: "What is 2+2?".into(),
            graph: TaskGraph::new(vec![TaskNode::new(
                "t1",
                crate::graph::TaskKind::General,
                "What is 2+2?",
            )]),
            bindings: vec![Binding {
                task_id: "t1".into(),
                model_id: "m".into(),
                provider_id: "p".into(),
                attempt: 0,
            }],
            artifacts: vec![],
            verdicts: vec![],
            response: Some(RunResponse {
                content: "4".into(),
                confidence: 1.0,
                strategy: "best_single".into(),
                source_artifacts: vec![],
                warnings: vec![],
            }),
            stats: RunStats::default(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&trace).unwrap();
        let back: RunTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(trace, back);
    }
}

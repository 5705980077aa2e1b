//! Streaming event vocabulary emitted during a run.
//!
//! Each variant maps to one named SSE event; the serialized form is the
//! `data:` payload.

use serde::Serialize;

use crate::types::RunStats;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Graph summary, emitted once planning succeeds.
    Plan {
        run_id: String,
        task_count: usize,
        task_ids: Vec<String>,
    },

    /// Routing decision for one attempt of a task.
    Decision {
        task_id: String,
        model_id: String,
        provider_id: String,
        rank: usize,
        attempt: u32,
    },

    TaskStart {
        task_id: String,
    },

    /// Text fragment; partial output is permitted.
    TaskArtifact {
        task_id: String,
        fragment: String,
    },

    TaskVerified {
        task_id: String,
        score: f64,
        passed: bool,
    },

    /// Repair directive accepted; new node ids inserted into the graph.
    TaskRepaired {
        task_id: String,
        new_node_ids: Vec<String>,
    },

    /// Terminal failure for one task.
    TaskFailed {
        task_id: String,
        reason: String,
    },

    AssembleStart {
        strategy: String,
    },

    Final {
        content: String,
        confidence: f64,
    },

    Stats {
        stats: RunStats,
    },
}

impl RunEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Plan { .. } => "plan",
            RunEvent::Decision { .. } => "decision",
            RunEvent::TaskStart { .. } => "task_start",
            RunEvent::TaskArtifact { .. } => "task_artifact",
            RunEvent::TaskVerified { .. } => "task_verified",
            RunEvent::TaskRepaired { .. } => "task_repaired",
            RunEvent::TaskFailed { .. } => "task_failed",
            RunEvent::AssembleStart { .. } => "assemble_start",
            RunEvent::Final { .. } => "final",
            RunEvent::Stats { .. } => "stats",
        }
    }
}

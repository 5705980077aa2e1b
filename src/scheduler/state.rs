//! Per-run scheduler state: task state machine, concurrency counters, and
//! the shared execution record.
//!
//! Everything here is mutated under the single run-scoped mutex; critical
//! sections are short and never perform I/O.

use std::collections::{HashMap, HashSet};

use crate::graph::TaskGraph;
use crate::router::RankedCandidate;
use crate::types::{Artifact, Binding, Verdict};

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Verifying,
    Repairing,
    Fallback,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// States that count against the global and per-provider caps.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            TaskState::Running | TaskState::Verifying | TaskState::Repairing
        )
    }
}

/// Terminal outcome for one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Done { artifact_id: String, score: f64 },
    Failed { reason: String },
}

/// Shared mutable state for one run.
pub(crate) struct RunState {
    pub graph: TaskGraph,
    pub states: HashMap<String, TaskState>,
    /// Nodes inserted by repair directives; recorded in the graph but
    /// executed inside their parent's admission slot.
    pub repair_nodes: HashSet<String>,

    pub candidates: HashMap<String, Vec<RankedCandidate>>,
    pub next_candidate: HashMap<String, usize>,
    /// Cumulative attempts per task (initial + fallbacks + repairs).
    pub attempts: HashMap<String, u32>,
    /// Cap: len(candidates) + initial repair budget.
    pub max_attempts: HashMap<String, u32>,
    pub repair_left: HashMap<String, u32>,

    pub running_global: usize,
    pub running_per_provider: HashMap<String, usize>,
    /// Provider charged for each in-flight task's slot.
    pub admitted_provider: HashMap<String, String>,

    pub bindings: Vec<Binding>,
    pub artifacts: Vec<Artifact>,
    pub verdicts: Vec<Verdict>,
    pub results: HashMap<String, TaskResult>,
    /// Index into `artifacts` of each task's most recent artifact.
    pub latest_artifact: HashMap<String, usize>,
    pub tasks_repaired: u32,
}

impl RunState {
    pub fn new(graph: TaskGraph, repair_limit: u32) -> Self {
        let mut states = HashMap::new();
        let mut repair_left = HashMap::new();
        for task in &graph.tasks {
            states.insert(task.id.clone(), TaskState::Pending);
            repair_left.insert(task.id.clone(), task.repair_budget.min(repair_limit));
        }
        Self {
            graph,
            states,
            repair_nodes: HashSet::new(),
            candidates: HashMap::new(),
            next_candidate: HashMap::new(),
            attempts: HashMap::new(),
            max_attempts: HashMap::new(),
            repair_left,
            running_global: 0,
            running_per_provider: HashMap::new(),
            admitted_provider: HashMap::new(),
            bindings: Vec::new(),
            artifacts: Vec::new(),
            verdicts: Vec::new(),
            results: HashMap::new(),
            latest_artifact: HashMap::new(),
            tasks_repaired: 0,
        }
    }

    pub fn state_of(&self, task_id: &str) -> TaskState {
        self.states
            .get(task_id)
            .copied()
            .unwrap_or(TaskState::Pending)
    }

    pub fn set_state(&mut self, task_id: &str, state: TaskState) {
        self.states.insert(task_id.to_string(), state);
    }

    /// All scheduled tasks (repair nodes excluded) reached done or failed.
    pub fn all_terminal(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }

    /// A pending task becomes ready once every input is done.
    pub fn inputs_done(&self, task_id: &str) -> bool {
        match self.graph.get(task_id) {
            Some(node) => node
                .inputs
                .iter()
                .all(|input| self.state_of(input) == TaskState::Done),
            None => false,
        }
    }

    /// Charge one slot against the caps if both admit it.
    pub fn try_admit(&mut self, task_id: &str, provider_id: &str, global_max: usize, per_provider_max: usize) -> bool {
        if self.running_global >= global_max {
            return false;
        }
        let provider_count = self
            .running_per_provider
            .get(provider_id)
            .copied()
            .unwrap_or(0);
        if provider_count >= per_provider_max {
            return false;
        }
        self.running_global += 1;
        *self
            .running_per_provider
            .entry(provider_id.to_string())
            .or_insert(0) += 1;
        self.admitted_provider
            .insert(task_id.to_string(), provider_id.to_string());
        true
    }

    /// Release the slot held by a task, if any.
    pub fn release_slot(&mut self, task_id: &str) {
        if let Some(provider_id) = self.admitted_provider.remove(task_id) {
            self.running_global = self.running_global.saturating_sub(1);
            if let Some(count) = self.running_per_provider.get_mut(&provider_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Most recent artifact content for a task.
    pub fn latest_content(&self, task_id: &str) -> Option<&str> {
        self.latest_artifact
            .get(task_id)
            .and_then(|&idx| self.artifacts.get(idx))
            .map(|a| a.content.as_str())
    }

    pub fn push_artifact(&mut self, artifact: Artifact) {
        self.latest_artifact
            .insert(artifact.task_id.clone(), self.artifacts.len());
        self.artifacts.push(artifact);
    }
}

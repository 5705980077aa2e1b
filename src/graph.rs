//! Task graph: the DAG of subtasks produced by the planner.
//!
//! Nodes carry everything the router and verifier need; edges are the
//! `inputs` lists. Validation rejects duplicate ids, dangling inputs, and
//! cycles before anything is scheduled.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Task categories used for routing, telemetry indexing, and length floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Coding,
    CreativeWriting,
    ProfessionalWriting,
    DocumentProcessing,
    Automation,
    Summarization,
    DataAnalysis,
    Multimodal,
    Integration,
    MathematicalReasoning,
    RealtimeSocial,
    CreativeInsight,
    General,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Coding => "coding",
            TaskKind::CreativeWriting => "creative_writing",
            TaskKind::ProfessionalWriting => "professional_writing",
            TaskKind::DocumentProcessing => "document_processing",
            TaskKind::Automation => "automation",
            TaskKind::Summarization => "summarization",
            TaskKind::DataAnalysis => "data_analysis",
            TaskKind::Multimodal => "multimodal",
            TaskKind::Integration => "integration",
            TaskKind::MathematicalReasoning => "mathematical_reasoning",
            TaskKind::RealtimeSocial => "realtime_social",
            TaskKind::CreativeInsight => "creative_insight",
            TaskKind::General => "general",
        }
    }

    /// Minimum plausible output length in characters. Shorter outputs are
    /// flagged as a defect by the verifier. Answer-style kinds accept a
    /// single token ("4" is a valid data_analysis result).
    pub fn min_output_chars(&self) -> usize {
        match self {
            TaskKind::Coding => 20,
            TaskKind::CreativeWriting | TaskKind::ProfessionalWriting => 40,
            TaskKind::DocumentProcessing | TaskKind::Integration => 10,
            TaskKind::Automation | TaskKind::Summarization => 5,
            TaskKind::DataAnalysis
            | TaskKind::MathematicalReasoning
            | TaskKind::RealtimeSocial
            | TaskKind::Multimodal
            | TaskKind::CreativeInsight
            | TaskKind::General => 1,
        }
    }
}

/// Model capabilities a task may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Streaming,
    LongContext,
    Vision,
    FunctionCalling,
}

fn default_repair_budget() -> u32 {
    1
}

/// One node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub kind: TaskKind,
    pub prompt: String,
    /// Upstream node ids whose artifacts are concatenated as context.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Free-form checkable statements for the verifier.
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub features: BTreeSet<Feature>,
    #[serde(default)]
    pub min_context: u32,
    #[serde(default = "default_repair_budget")]
    pub repair_budget: u32,
    #[serde(default)]
    pub terminal: bool,
}

impl TaskNode {
    /// Minimal node constructor used by the verifier's repair directives
    /// and by tests.
    pub fn new(id: impl Into<String>, kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            prompt: prompt.into(),
            inputs: Vec::new(),
            criteria: Vec::new(),
            features: BTreeSet::new(),
            min_context: 0,
            repair_budget: default_repair_budget(),
            terminal: false,
        }
    }
}

/// Finite DAG of tasks. Insertion order is preserved so topological
/// ordering is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub tasks: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<TaskNode>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Insert a node (used for repair directives). The caller holds the
    /// run mutex; duplicate ids are rejected.
    pub fn insert(&mut self, node: TaskNode) -> Result<(), GraphError> {
        if self.get(&node.id).is_some() {
            return Err(GraphError::DuplicateId(node.id));
        }
        self.tasks.push(node);
        Ok(())
    }

    /// Structural validation: non-empty, unique ids, resolvable inputs,
    /// acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Empty);
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(GraphError::DuplicateId(task.id.clone()));
            }
        }
        for task in &self.tasks {
            for input in &task.inputs {
                if !seen.contains(input.as_str()) {
                    return Err(GraphError::UnknownInput {
                        task_id: task.id.clone(),
                        input: input.clone(),
                    });
                }
            }
        }
        self.topo_order().map(|_| ())
    }

    /// Kahn's algorithm with a sorted queue for deterministic output.
    pub fn topo_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();

        for task in &self.tasks {
            in_degree.entry(task.id.as_str()).or_insert(0);
            for input in &task.inputs {
                *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
                downstream
                    .entry(input.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while !queue.is_empty() {
            let mut batch: Vec<&str> = queue.drain(..).collect();
            batch.sort_unstable();
            for id in batch {
                order.push(id.to_string());
                for next in downstream.get(id).map(|v| v.as_slice()).unwrap_or(&[]) {
                    let deg = in_degree.get_mut(next).expect("known node");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }

    /// Task ids whose artifacts feed the assembler: explicitly flagged
    /// terminals, or every sink when nothing is flagged.
    pub fn terminal_ids(&self) -> Vec<String> {
        let flagged: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.terminal)
            .map(|t| t.id.clone())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }

        let mut consumed: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            for input in &task.inputs {
                consumed.insert(input.as_str());
            }
        }
        self.tasks
            .iter()
            .filter(|t| !consumed.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }

}

//! Planner: one LLM call turning a prompt into a validated task graph.
//!
//! The designated planner model gets a fixed system prompt demanding JSON
//! in the canonical TaskGraph shape. Common JSON damage (fences, prose,
//! unbalanced brackets, trailing commas) is auto-repaired before
//! validation; structural violations get one corrective retry.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{GraphError, PlanError};
use crate::graph::TaskGraph;
use crate::providers::{CompletionRequest, Provider};

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a task planning agent. Given a user request, decompose it into a directed acyclic graph (DAG) of subtasks.

Output ONLY valid JSON matching this schema:
{
  "tasks": [
    {
      "id": "t1",
      "kind": "coding|creative_writing|professional_writing|document_processing|automation|summarization|data_analysis|multimodal|integration|mathematical_reasoning|realtime_social|creative_insight|general",
      "prompt": "instruction for this subtask",
      "inputs": ["ids of upstream tasks whose outputs this task needs"],
      "criteria": ["checkable success criteria"],
      "features": ["streaming"|"long_context"|"vision"|"function_calling"],
      "min_context": 0,
      "repair_budget": 1,
      "terminal": false
    }
  ]
}

Rules:
- Task ids must be unique and inputs may only reference earlier tasks.
- The graph must be acyclic.
- A simple request is a single task; do not decompose for its own sake.
- Mark the task(s) whose output answers the user with "terminal": true.

Return ONLY the JSON object, no markdown fences, no prose."#;

pub struct Planner {
    provider: Arc<dyn Provider>,
    model_id: String,
    max_tokens: u32,
    temperature: f64,
}

impl Planner {
    pub fn new(
        provider: Arc<dyn Provider>,
        model_id: impl Into<String>,
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            max_tokens,
            temperature,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Produce a validated task graph, with at most two model attempts.
    pub async fn plan(&self, prompt: &str) -> Result<TaskGraph, PlanError> {
        let mut violation: Option<String> = None;

        for attempt in 1..=2u32 {
            let user = match &violation {
                None => prompt.to_string(),
                Some(problems) => format!(
                    "{prompt}\n\nYour previous plan was rejected for these violations:\n{problems}\nReturn a corrected JSON plan only."
                ),
            };

            let request = CompletionRequest::new(&self.model_id, user)
                .with_system(PLANNER_SYSTEM_PROMPT)
                .with_temperature(self.temperature)
                .with_max_tokens(self.max_tokens);

            let completion = self
                .provider
                .complete(request)
                .await
                .map_err(|e| PlanError::UpstreamLlm(e.to_string()))?;

            match parse_and_validate(&completion.content) {
                Ok(graph) => {
                    info!(attempt, tasks = graph.len(), "plan accepted");
                    return Ok(graph);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "plan rejected");
                    if attempt == 2 {
                        return Err(err);
                    }
                    violation = Some(format!("- {err}"));
                }
            }
        }
        unreachable!("planner attempt loop always returns")
    }
}

fn parse_and_validate(raw: &str) -> Result<TaskGraph, PlanError> {
    let value = auto_repair_json(raw)
        .ok_or_else(|| PlanError::Schema("planner output was not valid JSON".into()))?;
    let graph: TaskGraph = serde_json::from_value(value)
        .map_err(|e| PlanError::Schema(format!("plan does not match the task schema: {e}")))?;
    match graph.validate() {
        Ok(()) => Ok(graph),
        Err(GraphError::Cycle) => Err(PlanError::Cycle),
        Err(other) => Err(PlanError::Schema(other.to_string())),
    }
}

/// Best-effort recovery of a JSON object from model output: strip fences
/// and prose, balance brackets, drop trailing commas.
fn auto_repair_json(raw: &str) -> Option<Value> {
    let fence = Regex::new(r"```(?:json)?").expect("static regex");
    let cleaned = fence.replace_all(raw, "");
    let cleaned = cleaned.trim();

    if let Ok(value) = serde_json::from_str(cleaned) {
        return Some(value);
    }

    // Extract the outermost brace-delimited block.
    let candidate = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => cleaned,
    };
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }

    // Balance brackets, then strip trailing commas.
    let open = candidate.matches('{').count();
    let close = candidate.matches('}').count();
    let mut balanced = candidate.to_string();
    if open > close {
        balanced.push_str(&"}".repeat(open - close));
    }
    let trailing_comma = Regex::new(r",\s*([\]}])").expect("static regex");
    let repaired = trailing_comma.replace_all(&balanced, "$1");

    match serde_json::from_str(&repaired) {
        Ok(value) => {
            debug!("planner JSON recovered after repair");
            Some(value)
        }
        Err(_) => None,
    }
}

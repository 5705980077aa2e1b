//! Router: scored model selection for one task.
//!
//! Combines static skills with the live telemetry window into a weighted
//! score. The full ranked list is returned; the scheduler consumes it in
//! order across fallback cycles.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::debug;

use crate::error::RouteError;
use crate::graph::{TaskKind, TaskNode};
use crate::registry::{CandidateModel, Registry};

// Scoring weights. Skill dominates; live performance, cost, context fit,
// and feature coverage refine the ordering.
const W_SKILL: f64 = 0.50;
const W_PERF: f64 = 0.20;
const W_COST: f64 = 0.15;
const W_CONTEXT: f64 = 0.10;
const W_FEATURES: f64 = 0.05;

/// One entry of the ranked candidate list.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub model_id: String,
    pub provider_id: String,
    pub score: f64,
}

/// Scoring weights as reported by the stats surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RoutingWeights {
    pub skill: f64,
    pub performance: f64,
    pub cost: f64,
    pub context_fit: f64,
    pub features: f64,
}

/// Aggregate view of the routing configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingStats {
    pub available_models: usize,
    /// task kind -> pinned model id.
    pub active_overrides: BTreeMap<String, String>,
    pub weights: RoutingWeights,
}

pub struct Router {
    registry: Arc<Registry>,
    /// task kind -> pinned model id. Pinning reorders, never removes.
    overrides: RwLock<HashMap<TaskKind, String>>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_override(&self, kind: TaskKind, model_id: impl Into<String>) {
        self.overrides
            .write()
            .expect("router lock poisoned")
            .insert(kind, model_id.into());
    }

    pub fn clear_override(&self, kind: TaskKind) {
        self.overrides
            .write()
            .expect("router lock poisoned")
            .remove(&kind);
    }

    /// Ranked candidate bindings for a task, best first.
    pub fn route(&self, task: &TaskNode) -> Result<Vec<RankedCandidate>, RouteError> {
        let all = self.registry.candidates();
        let eligible: Vec<&CandidateModel> = all
            .iter()
            .filter(|c| {
                c.descriptor.covers(&task.features)
                    && c.descriptor.context_window >= task.min_context
            })
            .collect();

        if eligible.is_empty() {
            return Err(RouteError::NoCandidate {
                task_id: task.id.clone(),
                reason: if all.is_empty() {
                    "no models registered".into()
                } else {
                    "no model covers the required features and context window".into()
                },
            });
        }

        let max_cost = eligible
            .iter()
            .map(|c| c.descriptor.blended_cost_per_1k())
            .fold(0.0_f64, f64::max);
        let max_latency = eligible
            .iter()
            .map(|c| c.stats.avg_latency_ms)
            .fold(0.0_f64, f64::max);

        let mut ranked: Vec<RankedCandidate> = eligible
            .iter()
            .map(|c| {
                let score = score_candidate(task, c, max_cost, max_latency);
                RankedCandidate {
                    model_id: c.descriptor.model_id.clone(),
                    provider_id: c.descriptor.provider_id.clone(),
                    score,
                }
            })
            .collect();

        let cost_of = |model_id: &str| {
            self.registry
                .get(model_id)
                .map(|m| m.blended_cost_per_1k())
                .unwrap_or(f64::MAX)
        };
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    cost_of(&a.model_id)
                        .partial_cmp(&cost_of(&b.model_id))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        // An override pins its model to the top without shrinking the list.
        if let Some(pinned) = self
            .overrides
            .read()
            .expect("router lock poisoned")
            .get(&task.kind)
        {
            if let Some(pos) = ranked.iter().position(|c| &c.model_id == pinned) {
                let chosen = ranked.remove(pos);
                ranked.insert(0, chosen);
            }
        }

        debug!(
            task_id = %task.id,
            kind = task.kind.as_str(),
            chosen = %ranked[0].model_id,
            candidates = ranked.len(),
            "routed task"
        );
        Ok(ranked)
    }

    /// Aggregate routing configuration for the stats surface.
    pub fn get_routing_stats(&self) -> RoutingStats {
        let overrides = self.overrides.read().expect("router lock poisoned");
        RoutingStats {
            available_models: self.registry.model_ids().len(),
            active_overrides: overrides
                .iter()
                .map(|(kind, model_id)| (kind.as_str().to_string(), model_id.clone()))
                .collect(),
            weights: RoutingWeights {
                skill: W_SKILL,
                performance: W_PERF,
                cost: W_COST,
                context_fit: W_CONTEXT,
                features: W_FEATURES,
            },
        }
    }

    /// Human-readable routing summary, printed by the CLI at debug level.
    pub fn explain(&self, task: &TaskNode, ranked: &[RankedCandidate]) -> String {
        let mut lines = vec![
            format!("task {} [{}]", task.id, task.kind.as_str()),
            format!("candidates ({}):", ranked.len()),
        ];
        for (rank, candidate) in ranked.iter().enumerate() {
            let pricing = self
                .registry
                .get(&candidate.model_id)
                .map(|m| format!("${:.4}/1k", m.blended_cost_per_1k()))
                .unwrap_or_default();
            lines.push(format!(
                "  {}. {} via {} score={:.3} {}",
                rank + 1,
                candidate.model_id,
                candidate.provider_id,
                candidate.score,
                pricing
            ));
        }
        lines.join("\n")
    }
}

fn score_candidate(
    task: &TaskNode,
    candidate: &CandidateModel,
    max_cost: f64,
    max_latency: f64,
) -> f64 {
    let descriptor = &candidate.descriptor;

    let skill = descriptor.skill(task.kind);

    let lat_norm = if max_latency > 0.0 {
        (candidate.stats.avg_latency_ms / max_latency).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let perf = 0.7 * candidate.stats.success_rate + 0.3 * (1.0 - lat_norm);

    let cost_eff = if max_cost > 0.0 {
        1.0 - (descriptor.blended_cost_per_1k() / max_cost).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let context_fit =
        (descriptor.context_window as f64 / task.min_context.max(1) as f64).min(1.0);

    let covered = task
        .features
        .iter()
        .filter(|f| descriptor.features.contains(f))
        .count();
    let feat = covered as f64 / task.features.len().max(1) as f64;

    let score = W_SKILL * skill
        + W_PERF * perf
        + W_COST * cost_eff
        + W_CONTEXT * context_fit
        + W_FEATURES * feat;

    score * descriptor.weight_override.unwrap_or(1.0)
}

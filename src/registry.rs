//! Capability registry: static model descriptors merged with live
//! telemetry on every query.
//!
//! Descriptors come from a built-in table or a declarative JSON file
//! (`AI3_MODELS_FILE`). The registry never blocks execution: models with
//! no telemetry samples get a neutral prior (success 1.0, latency = median
//! of sampled models).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::graph::{Feature, TaskKind};
use crate::telemetry::Telemetry;

/// Latency prior when no model has been sampled yet.
const DEFAULT_LATENCY_MS: f64 = 1_000.0;

/// Static description of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub provider_id: String,
    /// Task-kind proficiency in [0,1]; unknown kinds default to 0.5.
    #[serde(default)]
    pub skills: BTreeMap<TaskKind, f64>,
    pub context_window: u32,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    #[serde(default)]
    pub features: BTreeSet<Feature>,
    #[serde(default)]
    pub weight_override: Option<f64>,
}

impl ModelDescriptor {
    pub fn skill(&self, kind: TaskKind) -> f64 {
        self.skills.get(&kind).copied().unwrap_or(0.5)
    }

    /// Blended per-1k cost used for cost-efficiency scoring and tie-breaks.
    pub fn blended_cost_per_1k(&self) -> f64 {
        (self.cost_per_1k_input + self.cost_per_1k_output) / 2.0
    }

    pub fn covers(&self, required: &BTreeSet<Feature>) -> bool {
        required.iter().all(|f| self.features.contains(f))
    }
}

/// Live performance view merged into a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStats {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    /// False when the neutral prior was applied.
    pub sampled: bool,
}

/// A descriptor plus its current stats, as handed to the router.
#[derive(Debug, Clone)]
pub struct CandidateModel {
    pub descriptor: ModelDescriptor,
    pub stats: ModelStats,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<ModelDescriptor>,
}

pub struct Registry {
    models: Vec<ModelDescriptor>,
    telemetry: Arc<Telemetry>,
}

impl Registry {
    pub fn new(models: Vec<ModelDescriptor>, telemetry: Arc<Telemetry>) -> Self {
        Self { models, telemetry }
    }

    /// Built-in descriptor table restricted to providers with a key.
    pub fn builtin(providers: &[&str], telemetry: Arc<Telemetry>) -> Self {
        let models = builtin_models()
            .into_iter()
            .filter(|m| providers.contains(&m.provider_id.as_str()))
            .collect();
        Self::new(models, telemetry)
    }

    /// Load descriptors from a JSON file, keeping only configured providers.
    pub fn from_file(path: &Path, providers: &[&str], telemetry: Arc<Telemetry>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading models file {}", path.display()))?;
        let file: ModelsFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing models file {}", path.display()))?;
        let models: Vec<ModelDescriptor> = file
            .models
            .into_iter()
            .filter(|m| providers.contains(&m.provider_id.as_str()))
            .collect();
        info!(count = models.len(), "loaded model descriptors from file");
        Ok(Self::new(models, telemetry))
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|m| m.model_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// All descriptors merged with live stats. Filtering and scoring is
    /// the router's job; scores are never cached here.
    pub fn candidates(&self) -> Vec<CandidateModel> {
        let median = self
            .telemetry
            .median_latency_ms()
            .unwrap_or(DEFAULT_LATENCY_MS);

        self.models
            .iter()
            .map(|descriptor| {
                let stats = match self.telemetry.snapshot(&descriptor.model_id) {
                    Some(snap) if snap.window_samples > 0 => ModelStats {
                        success_rate: snap.success_rate,
                        avg_latency_ms: snap.avg_latency_ms.unwrap_or(median),
                        sampled: true,
                    },
                    // Zero samples: neutral prior so unseen models are not
                    // penalized during bring-up.
                    _ => ModelStats {
                        success_rate: 1.0,
                        avg_latency_ms: median,
                        sampled: false,
                    },
                };
                CandidateModel {
                    descriptor: descriptor.clone(),
                    stats,
                }
            })
            .collect()
    }

    /// Live telemetry snapshot per registered model; None for models that
    /// were never sampled.
    pub fn live_metrics(&self) -> BTreeMap<String, Option<crate::telemetry::TelemetrySnapshot>> {
        self.models
            .iter()
            .map(|m| (m.model_id.clone(), self.telemetry.snapshot(&m.model_id)))
            .collect()
    }

    /// Forward an execution outcome to telemetry.
    pub fn record_outcome(
        &self,
        model_id: &str,
        success: bool,
        latency_ms: u64,
        tokens_in: u64,
        tokens_out: u64,
    ) {
        let cost = self
            .get(model_id)
            .map(|m| {
                (tokens_in as f64 / 1_000.0) * m.cost_per_1k_input
                    + (tokens_out as f64 / 1_000.0) * m.cost_per_1k_output
            })
            .unwrap_or(0.0);
        self.telemetry
            .record(model_id, success, latency_ms, tokens_in, tokens_out, cost);
    }

    /// Cost of one call on a model, from its static pricing.
    pub fn cost_of(&self, model_id: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.get(model_id)
            .map(|m| {
                (tokens_in as f64 / 1_000.0) * m.cost_per_1k_input
                    + (tokens_out as f64 / 1_000.0) * m.cost_per_1k_output
            })
            .unwrap_or(0.0)
    }
}

fn model(
    model_id: &str,
    provider_id: &str,
    context_window: u32,
    cost_in: f64,
    cost_out: f64,
    features: &[Feature],
    skills: &[(TaskKind, f64)],
) -> ModelDescriptor {
    ModelDescriptor {
        model_id: model_id.into(),
        provider_id: provider_id.into(),
        skills: skills.iter().copied().collect(),
        context_window,
        cost_per_1k_input: cost_in,
        cost_per_1k_output: cost_out,
        features: features.iter().copied().collect(),
        weight_override: None,
    }
}

/// Default descriptor table. Skill figures are editorial priors; live
/// telemetry corrects for them over time.
fn builtin_models() -> Vec<ModelDescriptor> {
    use Feature::*;
    use TaskKind::*;

    vec![
        model(
            "claude-3-7-sonnet-20250219",
            "anthropic",
            200_000,
            0.003,
            0.015,
            &[Streaming, LongContext, Vision, FunctionCalling],
            &[
                (Coding, 0.95),
                (CreativeWriting, 0.92),
                (ProfessionalWriting, 0.93),
                (DocumentProcessing, 0.88),
                (Automation, 0.85),
                (Summarization, 0.90),
                (DataAnalysis, 0.86),
                (Integration, 0.86),
                (MathematicalReasoning, 0.88),
                (CreativeInsight, 0.90),
                (General, 0.92),
            ],
        ),
        model(
            "claude-3-5-haiku-20241022",
            "anthropic",
            200_000,
            0.0008,
            0.004,
            &[Streaming, LongContext, FunctionCalling],
            &[
                (Coding, 0.82),
                (Summarization, 0.85),
                (DocumentProcessing, 0.80),
                (Automation, 0.80),
                (DataAnalysis, 0.75),
                (General, 0.80),
            ],
        ),
        model(
            "gpt-4o",
            "openai",
            128_000,
            0.0025,
            0.01,
            &[Streaming, LongContext, Vision, FunctionCalling],
            &[
                (Coding, 0.90),
                (CreativeWriting, 0.88),
                (ProfessionalWriting, 0.89),
                (DocumentProcessing, 0.87),
                (Automation, 0.86),
                (Summarization, 0.88),
                (DataAnalysis, 0.90),
                (Multimodal, 0.92),
                (Integration, 0.88),
                (MathematicalReasoning, 0.85),
                (General, 0.89),
            ],
        ),
        model(
            "gpt-4o-mini",
            "openai",
            128_000,
            0.00015,
            0.0006,
            &[Streaming, LongContext, Vision, FunctionCalling],
            &[
                (Coding, 0.78),
                (Summarization, 0.82),
                (DocumentProcessing, 0.78),
                (Automation, 0.78),
                (DataAnalysis, 0.74),
                (General, 0.78),
            ],
        ),
        model(
            "grok-4",
            "xai",
            256_000,
            0.003,
            0.015,
            &[Streaming, LongContext, Vision, FunctionCalling],
            &[
                (Coding, 0.88),
                (CreativeWriting, 0.86),
                (RealtimeSocial, 0.95),
                (MathematicalReasoning, 0.92),
                (CreativeInsight, 0.90),
                (DataAnalysis, 0.84),
                (General, 0.87),
            ],
        ),
        model(
            "grok-4-fast",
            "xai",
            128_000,
            0.0002,
            0.0005,
            &[Streaming, LongContext, FunctionCalling],
            &[
                (RealtimeSocial, 0.90),
                (Summarization, 0.80),
                (Automation, 0.78),
                (General, 0.76),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Registry {
        Registry::builtin(&["anthropic", "openai", "xai"], Arc::new(Telemetry::new()))
    }

    #[test]
    fn test_builtin_filters_by_provider() {
        let registry = Registry::builtin(&["openai"], Arc::new(Telemetry::new()));
        assert!(registry.get("gpt-4o").is_some());
        assert!(registry.get("claude-3-7-sonnet-20250219").is_none());
    }

    #[test]
    fn test_unseen_model_gets_neutral_prior() {
        let registry = test_registry();
        let candidates = registry.candidates();
        assert!(!candidates.is_empty());
        for candidate in &candidates {
            assert!(!candidate.stats.sampled);
            assert_eq!(candidate.stats.success_rate, 1.0);
        }
    }

    #[test]
    fn test_sampled_model_uses_window() {
        let registry = test_registry();
        registry.record_outcome("gpt-4o", false, 800, 100, 0);
        let candidates = registry.candidates();
        let gpt = candidates
            .iter()
            .find(|c| c.descriptor.model_id == "gpt-4o")
            .unwrap();
        assert!(gpt.stats.sampled);
        // One failure: (0+1)/(1+2).
        assert!((gpt.stats.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(gpt.stats.avg_latency_ms, 800.0);
    }

    #[test]
    fn test_live_metrics_cover_every_model() {
        let registry = test_registry();
        registry.record_outcome("gpt-4o", true, 400, 100, 50);

        let metrics = registry.live_metrics();
        assert_eq!(metrics.len(), registry.model_ids().len());
        assert!(metrics.get("gpt-4o").unwrap().is_some());
        assert!(metrics.get("grok-4").unwrap().is_none());
    }

    #[test]
    fn test_cost_uses_split_pricing() {
        let registry = test_registry();
        let cost = registry.cost_of("gpt-4o", 1_000, 1_000);
        assert!((cost - (0.0025 + 0.01)).abs() < 1e-9);
    }

    #[test]
    fn test_descriptor_skill_defaults_to_half() {
        let registry = test_registry();
        let haiku = registry.get("claude-3-5-haiku-20241022").unwrap();
        assert_eq!(haiku.skill(TaskKind::RealtimeSocial), 0.5);
        assert_eq!(haiku.skill(TaskKind::Summarization), 0.85);
    }
}

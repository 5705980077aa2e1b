//! Shared test harness: stub-backed engine and registry builders.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ai3::config::{
    Ai3Config, LimitsConfig, PlannerConfig, ServerConfig, StorageConfig, VerifyConfig,
};
use ai3::engine::Engine;
use ai3::graph::TaskKind;
use ai3::providers::{ProviderSet, StubProvider};
use ai3::registry::{ModelDescriptor, Registry};
use ai3::telemetry::Telemetry;
use ai3::verifier::Verifier;

pub const ALL_KINDS: [TaskKind; 13] = [
    TaskKind::Coding,
    TaskKind::CreativeWriting,
    TaskKind::ProfessionalWriting,
    TaskKind::DocumentProcessing,
    TaskKind::Automation,
    TaskKind::Summarization,
    TaskKind::DataAnalysis,
    TaskKind::Multimodal,
    TaskKind::Integration,
    TaskKind::MathematicalReasoning,
    TaskKind::RealtimeSocial,
    TaskKind::CreativeInsight,
    TaskKind::General,
];

/// A descriptor with the same proficiency across every task kind.
pub fn flat_descriptor(model_id: &str, provider_id: &str, skill: f64) -> ModelDescriptor {
    let skills: BTreeMap<TaskKind, f64> = ALL_KINDS.iter().map(|k| (*k, skill)).collect();
    ModelDescriptor {
        model_id: model_id.into(),
        provider_id: provider_id.into(),
        skills,
        context_window: 128_000,
        cost_per_1k_input: 0.001,
        cost_per_1k_output: 0.002,
        features: Default::default(),
        weight_override: None,
    }
}

pub fn test_config(dir: &Path) -> Ai3Config {
    Ai3Config {
        anthropic_api_key: None,
        openai_api_key: None,
        xai_api_key: None,
        models_file: None,
        planner: PlannerConfig {
            model: "planner-model".into(),
            max_tokens: 4096,
            temperature: 0.0,
        },
        limits: LimitsConfig {
            max_concurrency: 5,
            max_concurrency_per_provider: 3,
            task_timeout_secs: 30,
        },
        verify: VerifyConfig {
            enabled: true,
            repair_limit: 1,
        },
        storage: StorageConfig {
            journal_dir: dir.join("journal"),
            artifacts_dir: dir.join("artifacts"),
        },
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
    }
}

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub stub: Arc<StubProvider>,
    pub registry: Arc<Registry>,
    _dir: tempfile::TempDir,
}

/// Engine wired to one stub provider ("stub") serving the given models.
/// The planner model must be among them.
pub fn harness(models: Vec<ModelDescriptor>) -> TestHarness {
    harness_with_stub(models, StubProvider::new("stub"))
}

pub fn harness_with_stub(models: Vec<ModelDescriptor>, stub: StubProvider) -> TestHarness {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(Registry::new(models, Arc::new(Telemetry::new())));
    let stub = Arc::new(stub);
    let mut providers = ProviderSet::new();
    providers.insert(stub.clone());

    let engine = Engine::with_parts(
        test_config(dir.path()),
        registry.clone(),
        providers,
        Arc::new(Verifier::heuristic()),
    )
    .expect("engine");

    TestHarness {
        engine: Arc::new(engine),
        stub,
        registry,
        _dir: dir,
    }
}

/// Models for the common single-executor setup: a weak planner model plus
/// one strong worker model, both on the stub provider.
pub fn planner_and_worker() -> Vec<ModelDescriptor> {
    vec![
        flat_descriptor("planner-model", "stub", 0.3),
        flat_descriptor("model-a", "stub", 0.9),
    ]
}

//! Engine: glue between the interface layer and the orchestration
//! pipeline (plan -> schedule -> assemble -> journal).
//!
//! Owns the RunTrace for the duration of a run and seals it on exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::assembler::{Assembler, TerminalArtifact};
use crate::config::Ai3Config;
use crate::error::{Ai3Error, RunError};
use crate::events::RunEvent;
use crate::journal::{Journal, JournalStats};
use crate::planner::Planner;
use crate::providers::{Provider, ProviderSet};
use crate::registry::Registry;
use crate::router::{Router, RoutingStats};
use crate::scheduler::{
    Scheduler, SchedulerConfig, TaskResult, EVENT_CHANNEL_CAPACITY,
};
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use crate::types::{generate_run_id, RunResponse, RunStats, RunTrace};
use crate::verifier::Verifier;

/// Per-run overrides layered over the environment configuration.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub max_concurrency: Option<usize>,
    pub max_concurrency_per_provider: Option<usize>,
    pub planner_model: Option<String>,
    pub verify: Option<bool>,
    pub repair_limit: Option<u32>,
    /// Run-level deadline in seconds; per-attempt deadlines still apply.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineResult {
    pub run_id: String,
    pub response: RunResponse,
    pub stats: RunStats,
}

/// Cross-run observability: live model telemetry, routing configuration,
/// and journal aggregates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub models: std::collections::BTreeMap<String, Option<TelemetrySnapshot>>,
    pub routing: RoutingStats,
    pub journal: JournalStats,
}

pub struct Engine {
    config: Ai3Config,
    registry: Arc<Registry>,
    providers: ProviderSet,
    router: Arc<Router>,
    verifier: Arc<Verifier>,
    journal: Journal,
}

impl Engine {
    /// Build an engine from environment configuration with live adapters.
    pub fn new(config: Ai3Config) -> Result<Self, RunError> {
        config.validate()?;

        let telemetry = Arc::new(Telemetry::new());
        let providers_configured = config.configured_providers();
        let registry = match &config.models_file {
            Some(path) => Registry::from_file(path, &providers_configured, telemetry)
                .map_err(|e| RunError::Configuration(e.to_string()))?,
            None => Registry::builtin(&providers_configured, telemetry),
        };
        if registry.is_empty() {
            return Err(RunError::Configuration(
                "no models available for the configured providers".into(),
            ));
        }
        let registry = Arc::new(registry);
        let providers = ProviderSet::from_config(&config);

        Self::assemble_parts(config, registry, providers, Arc::new(Verifier::heuristic()))
    }

    /// Build an engine from explicit parts (stub providers in tests).
    pub fn with_parts(
        config: Ai3Config,
        registry: Arc<Registry>,
        providers: ProviderSet,
        verifier: Arc<Verifier>,
    ) -> Result<Self, RunError> {
        Self::assemble_parts(config, registry, providers, verifier)
    }

    fn assemble_parts(
        config: Ai3Config,
        registry: Arc<Registry>,
        providers: ProviderSet,
        verifier: Arc<Verifier>,
    ) -> Result<Self, RunError> {
        if providers.is_empty() {
            return Err(RunError::Configuration(
                "no provider adapters configured".into(),
            ));
        }
        let journal =
            Journal::new(&config.storage).map_err(|e| RunError::Configuration(e.to_string()))?;
        let router = Arc::new(Router::new(registry.clone()));
        Ok(Self {
            config,
            registry,
            providers,
            router,
            verifier,
            journal,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Aggregate engine statistics for the stats surface.
    pub fn get_stats(&self) -> anyhow::Result<EngineStats> {
        Ok(EngineStats {
            models: self.registry.live_metrics(),
            routing: self.router.get_routing_stats(),
            journal: self.journal.get_stats()?,
        })
    }

    /// Aggregate entry point: run to completion, return the response.
    pub async fn run(&self, prompt: &str, options: RunOptions) -> Result<EngineResult, Ai3Error> {
        self.run_with_cancel(prompt, options, CancellationToken::new())
            .await
    }

    /// Aggregate entry point with a caller-owned cancellation token.
    /// Cancelling the token moves in-flight work through the scheduler's
    /// cooperative shutdown path instead of dropping it mid-request.
    pub async fn run_with_cancel(
        &self,
        prompt: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<EngineResult, Ai3Error> {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Nobody consumes events in aggregate mode; drain so emitters
        // never block on the bounded channel.
        let drain = tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

        let result = self.execute(prompt, options, events_tx, cancel).await;
        let _ = drain.await;
        result
    }

    /// Streaming entry point: events arrive on the returned receiver while
    /// the run proceeds in the background.
    pub fn run_stream(
        self: Arc<Self>,
        prompt: String,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<RunEvent>,
        JoinHandle<Result<EngineResult, Ai3Error>>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let result = self.execute(&prompt, options, events_tx, cancel).await;
            if let Err(err) = &result {
                error!(error = %err, "streamed run failed");
            }
            result
        });
        (events_rx, handle)
    }

    async fn execute(
        &self,
        prompt: &str,
        options: RunOptions,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<EngineResult, Ai3Error> {
        let started = Instant::now();
        let started_at = chrono::Utc::now();
        let run_id = generate_run_id(started_at);
        info!(run_id = %run_id, "run started");

        // Plan.
        let planner = self.planner_for(&options)?;
        let graph = planner.plan(prompt).await?;
        let terminal_ids = graph.terminal_ids();
        let topo = graph
            .topo_order()
            .expect("validated graph has a topological order");

        let _ = events
            .send(RunEvent::Plan {
                run_id: run_id.clone(),
                task_count: graph.len(),
                task_ids: graph.ids(),
            })
            .await;

        // Schedule.
        let scheduler_config = SchedulerConfig {
            global_max: options
                .max_concurrency
                .unwrap_or(self.config.limits.max_concurrency),
            per_provider_max: options
                .max_concurrency_per_provider
                .unwrap_or(self.config.limits.max_concurrency_per_provider),
            task_timeout: Duration::from_secs(self.config.limits.task_timeout_secs),
            verify_enabled: options.verify.unwrap_or(self.config.verify.enabled),
            repair_limit: options.repair_limit.unwrap_or(self.config.verify.repair_limit),
        };
        let scheduler = Scheduler::new(
            self.router.clone(),
            self.providers.clone(),
            self.verifier.clone(),
            self.registry.clone(),
            scheduler_config,
        );

        let run = scheduler.run(graph, events.clone(), cancel.clone());
        let outcome = match options.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    return Err(RunError::Timeout.into());
                }
            },
            None => run.await,
        };

        if let Some(fatal) = outcome.fatal {
            return Err(fatal.into());
        }

        // Partition terminals, in topological post-order.
        let mut items: Vec<TerminalArtifact> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for task_id in topo.iter().filter(|id| terminal_ids.contains(*id)) {
            match outcome.results.get(task_id) {
                Some(TaskResult::Done { artifact_id, score }) => {
                    let artifact = outcome
                        .artifacts
                        .iter()
                        .find(|a| &a.artifact_id == artifact_id)
                        .expect("completed task has its artifact")
                        .clone();
                    let kind = outcome
                        .graph
                        .get(task_id)
                        .expect("known task")
                        .kind;
                    items.push(TerminalArtifact {
                        artifact,
                        kind,
                        score: *score,
                    });
                }
                Some(TaskResult::Failed { reason }) => {
                    failures.push(format!("task {task_id} failed: {reason}"));
                }
                None => failures.push(format!("task {task_id} failed: never scheduled")),
            }
        }

        // A cancelled run only assembles when the terminal layer finished
        // before the token fired.
        if outcome.cancelled && !failures.is_empty() {
            return Err(RunError::Cancelled.into());
        }
        if items.is_empty() {
            return Err(RunError::AllCandidatesFailed { reasons: failures }.into());
        }

        // Assemble.
        let assembler = self.assembler_for(&options);
        let strategy = crate::assembler::select_strategy(&items);
        let _ = events
            .send(RunEvent::AssembleStart {
                strategy: strategy.as_str().to_string(),
            })
            .await;
        let completed = items.len();
        let mut response = assembler.assemble(items, failures).await;
        // Partial failure reduces confidence proportionally.
        if completed < terminal_ids.len() {
            response.confidence *= completed as f64 / terminal_ids.len() as f64;
        }

        // Stats.
        let tasks_failed = outcome
            .results
            .values()
            .filter(|r| matches!(r, TaskResult::Failed { .. }))
            .count() as u32;
        let stats = RunStats {
            wall_time_ms: started.elapsed().as_millis() as u64,
            tokens_in: outcome.artifacts.iter().map(|a| a.input_tokens).sum(),
            tokens_out: outcome.artifacts.iter().map(|a| a.output_tokens).sum(),
            cost: outcome
                .artifacts
                .iter()
                .map(|a| {
                    self.registry
                        .cost_of(&a.binding.model_id, a.input_tokens, a.output_tokens)
                })
                .sum(),
            tasks_executed: outcome.tasks_executed,
            tasks_repaired: outcome.tasks_repaired,
            tasks_failed,
        };

        let _ = events
            .send(RunEvent::Final {
                content: response.content.clone(),
                confidence: response.confidence,
            })
            .await;
        let _ = events.send(RunEvent::Stats { stats }).await;

        // Seal and journal the trace; persistence problems are logged but
        // do not fail a completed run.
        for artifact in &outcome.artifacts {
            let kind = outcome
                .graph
                .get(&artifact.task_id)
                .map(|n| n.kind)
                .unwrap_or(crate::graph::TaskKind::General);
            if let Err(err) = self.journal.store_artifact(kind, artifact) {
                warn!(error = %err, artifact_id = %artifact.artifact_id, "artifact not persisted");
            }
        }
        let trace = RunTrace {
            run_id: run_id.clone(),
            prompt: prompt.to_string(),
            graph: outcome.graph,
            bindings: outcome.bindings,
            artifacts: outcome.artifacts,
            verdicts: outcome.verdicts,
            response: Some(response.clone()),
            stats,
            started_at,
        };
        if let Err(err) = self.journal.record_trace(&trace) {
            warn!(error = %err, run_id = %run_id, "run trace not persisted");
        }

        info!(
            run_id = %run_id,
            wall_time_ms = stats.wall_time_ms,
            cost = stats.cost,
            confidence = response.confidence,
            "run finished"
        );

        Ok(EngineResult {
            run_id,
            response,
            stats,
        })
    }

    /// Resolve the planner model to a provider adapter.
    fn planner_for(&self, options: &RunOptions) -> Result<Planner, RunError> {
        let model_id = options
            .planner_model
            .clone()
            .unwrap_or_else(|| self.config.planner.model.clone());
        let (provider, model_id) = self.resolve_model(&model_id)?;
        Ok(Planner::new(
            provider,
            model_id,
            self.config.planner.max_tokens,
            self.config.planner.temperature,
        ))
    }

    /// The synthesize strategy reuses the planner model.
    fn assembler_for(&self, options: &RunOptions) -> Assembler {
        let model_id = options
            .planner_model
            .clone()
            .unwrap_or_else(|| self.config.planner.model.clone());
        match self.resolve_model(&model_id) {
            Ok((provider, model_id)) => Assembler::with_synthesizer(provider, model_id),
            Err(_) => Assembler::new(),
        }
    }

    fn resolve_model(&self, model_id: &str) -> Result<(Arc<dyn Provider>, String), RunError> {
        let descriptor = self.registry.get(model_id).ok_or_else(|| {
            RunError::Configuration(format!("model {model_id} is not in the registry"))
        })?;
        let provider = self.providers.get(&descriptor.provider_id).ok_or_else(|| {
            RunError::Configuration(format!(
                "no adapter configured for provider {}",
                descriptor.provider_id
            ))
        })?;
        Ok((provider, model_id.to_string()))
    }
}

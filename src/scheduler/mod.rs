//! Scheduler: executes the task graph with maximum permissible
//! parallelism under global and per-provider caps.
//!
//! A dispatch loop promotes tasks through the
//! pending -> ready -> running -> verifying -> {done, repairing, fallback,
//! failed} state machine. Workers run one admission's worth of attempts
//! (including repair cycles, which reuse the parent's slot) and report an
//! outcome back over a channel. All shared state lives behind one
//! run-scoped mutex with short, I/O-free critical sections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, RunError};
use crate::events::RunEvent;
use crate::graph::{TaskGraph, TaskNode};
use crate::providers::{Completion, CompletionRequest, Provider, ProviderSet};
use crate::registry::Registry;
use crate::router::{RankedCandidate, Router};
use crate::types::{generate_artifact_id, Artifact, ArtifactStatus, Binding, Verdict};
use crate::verifier::{repair_directive, Verifier};

mod state;

pub use state::{TaskResult, TaskState};

use state::RunState;

/// Bounded event channel size; a full channel blocks the emitting task.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub global_max: usize,
    pub per_provider_max: usize,
    pub task_timeout: Duration,
    pub verify_enabled: bool,
    pub repair_limit: u32,
}

/// Everything the engine needs after the graph has run to completion.
pub struct SchedulerOutcome {
    /// Final graph, including repair-generated nodes.
    pub graph: TaskGraph,
    pub bindings: Vec<Binding>,
    pub artifacts: Vec<Artifact>,
    pub verdicts: Vec<Verdict>,
    pub results: std::collections::HashMap<String, TaskResult>,
    pub tasks_executed: u32,
    pub tasks_repaired: u32,
    pub cancelled: bool,
    /// Set when a run-fatal error (bad credentials) aborted the run.
    pub fatal: Option<RunError>,
}

enum AttemptOutcome {
    Done {
        artifact_id: String,
        score: f64,
        did_repair: bool,
    },
    Fallback {
        reason: String,
    },
    Fatal(RunError),
    Cancelled,
}

enum ExecError {
    Provider(ProviderError),
    Cancelled,
}

/// One admission, computed under the run lock and spawned after.
struct SpawnSpec {
    task: TaskNode,
    candidate: RankedCandidate,
    rank: usize,
    attempt: u32,
    inputs: Vec<(String, String)>,
    provider: Arc<dyn Provider>,
}

pub struct Scheduler {
    router: Arc<Router>,
    providers: ProviderSet,
    verifier: Arc<Verifier>,
    registry: Arc<Registry>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        router: Arc<Router>,
        providers: ProviderSet,
        verifier: Arc<Verifier>,
        registry: Arc<Registry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            router,
            providers,
            verifier,
            registry,
            config,
        }
    }

    /// Execute a validated graph to completion (every task done or failed).
    pub async fn run(
        &self,
        graph: TaskGraph,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> SchedulerOutcome {
        let state = Arc::new(Mutex::new(RunState::new(graph, self.config.repair_limit)));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<(String, AttemptOutcome)>();
        let mut workers: JoinSet<()> = JoinSet::new();

        let mut fatal: Option<RunError> = None;
        let mut cancelled = false;

        loop {
            // Promote and admit under one short lock; emit and spawn after
            // it is released.
            let mut pending_events: Vec<RunEvent> = Vec::new();
            let mut spawns: Vec<SpawnSpec> = Vec::new();
            let all_terminal = {
                let mut st = state.lock().await;
                self.promote_pending(&mut st, &mut pending_events);
                self.admit_ready(&mut st, &mut spawns, &mut pending_events);
                st.all_terminal()
            };

            for event in pending_events {
                let _ = events.send(event).await;
            }
            for spec in spawns {
                let worker = AttemptWorker {
                    task: spec.task,
                    candidate: spec.candidate,
                    rank: spec.rank,
                    attempt: spec.attempt,
                    inputs: spec.inputs,
                    provider: spec.provider,
                    state: state.clone(),
                    events: events.clone(),
                    cancel: cancel.clone(),
                    registry: self.registry.clone(),
                    verifier: self.verifier.clone(),
                    verify_enabled: self.config.verify_enabled,
                    timeout: self.config.task_timeout,
                };
                let outcome_tx = outcome_tx.clone();
                workers.spawn(async move {
                    let task_id = worker.task.id.clone();
                    let outcome = worker.run().await;
                    let _ = outcome_tx.send((task_id, outcome));
                });
            }

            if all_terminal {
                break;
            }

            tokio::select! {
                maybe = outcome_rx.recv() => {
                    let Some((task_id, outcome)) = maybe else { break };
                    let mut pending_events = Vec::new();
                    {
                        let mut st = state.lock().await;
                        self.handle_outcome(
                            &mut st,
                            &task_id,
                            outcome,
                            &mut pending_events,
                            &mut fatal,
                            &cancel,
                        );
                    }
                    for event in pending_events {
                        let _ = events.send(event).await;
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    let mut pending_events = Vec::new();
                    {
                        let mut st = state.lock().await;
                        sweep_cancelled(&mut st, &mut pending_events);
                    }
                    for event in pending_events {
                        let _ = events.send(event).await;
                    }
                }
            }
        }

        // Outstanding workers observe the token promptly; abort stragglers.
        workers.shutdown().await;
        drop(outcome_tx);
        let cancelled = cancelled || cancel.is_cancelled();

        let st = Arc::try_unwrap(state)
            .unwrap_or_else(|_| panic!("scheduler state still shared after shutdown"))
            .into_inner();

        let tasks_executed = st.attempts.values().filter(|a| **a > 0).count() as u32;

        info!(
            tasks = st.states.len(),
            executed = tasks_executed,
            repaired = st.tasks_repaired,
            cancelled,
            "graph execution finished"
        );

        SchedulerOutcome {
            graph: st.graph,
            bindings: st.bindings,
            artifacts: st.artifacts,
            verdicts: st.verdicts,
            results: st.results,
            tasks_executed,
            tasks_repaired: st.tasks_repaired,
            cancelled,
            fatal,
        }
    }

    /// pending -> ready once all inputs are done; routing happens here.
    fn promote_pending(&self, st: &mut RunState, events: &mut Vec<RunEvent>) {
        for id in st.graph.ids() {
            if st.repair_nodes.contains(&id) {
                continue;
            }
            if st.state_of(&id) != TaskState::Pending {
                continue;
            }
            // Upstream failure cascades: a task whose input failed can
            // never become ready.
            let failed_input = st
                .graph
                .get(&id)
                .and_then(|node| {
                    node.inputs
                        .iter()
                        .find(|input| st.state_of(input) == TaskState::Failed)
                        .cloned()
                });
            if let Some(input) = failed_input {
                fail_task(st, &id, format!("upstream task {input} failed"), events);
                continue;
            }
            if !st.inputs_done(&id) {
                continue;
            }
            let node = st.graph.get(&id).expect("known node").clone();
            match self.router.route(&node) {
                Ok(ranked) => {
                    debug!("{}", self.router.explain(&node, &ranked));
                    let budget = st.repair_left.get(&id).copied().unwrap_or(0);
                    st.max_attempts
                        .insert(id.clone(), ranked.len() as u32 + budget);
                    st.candidates.insert(id.clone(), ranked);
                    st.next_candidate.insert(id.clone(), 0);
                    st.attempts.insert(id.clone(), 0);
                    st.set_state(&id, TaskState::Ready);
                }
                Err(err) => {
                    fail_task(st, &id, err.to_string(), events);
                }
            }
        }
    }

    /// ready -> running for every task both caps admit.
    fn admit_ready(
        &self,
        st: &mut RunState,
        spawns: &mut Vec<SpawnSpec>,
        events: &mut Vec<RunEvent>,
    ) {
        for id in st.graph.ids() {
            if st.state_of(&id) != TaskState::Ready {
                continue;
            }

            let attempts = st.attempts.get(&id).copied().unwrap_or(0);
            let max_attempts = st.max_attempts.get(&id).copied().unwrap_or(0);
            if attempts >= max_attempts {
                fail_task(st, &id, "attempt budget exhausted".into(), events);
                continue;
            }

            // Resolve the current candidate, skipping any without a live
            // adapter.
            let resolved = loop {
                let idx = st.next_candidate.get(&id).copied().unwrap_or(0);
                let Some(candidate) = st
                    .candidates
                    .get(&id)
                    .and_then(|ranked| ranked.get(idx))
                    .cloned()
                else {
                    break None;
                };
                match self.providers.get(&candidate.provider_id) {
                    Some(provider) => break Some((candidate, idx, provider)),
                    None => {
                        warn!(
                            task_id = %id,
                            provider = %candidate.provider_id,
                            "no adapter for routed provider, skipping candidate"
                        );
                        *st.next_candidate.get_mut(&id).expect("routed task") += 1;
                    }
                }
            };
            let Some((candidate, rank, provider)) = resolved else {
                fail_task(st, &id, "no candidate with a configured adapter".into(), events);
                continue;
            };

            // Admission is rechecked on every pass because fallback may
            // have moved the task to a different provider.
            if !st.try_admit(
                &id,
                &candidate.provider_id,
                self.config.global_max,
                self.config.per_provider_max,
            ) {
                continue;
            }

            *st.attempts.get_mut(&id).expect("routed task") += 1;
            st.set_state(&id, TaskState::Running);

            let node = st.graph.get(&id).expect("known node").clone();
            let inputs: Vec<(String, String)> = node
                .inputs
                .iter()
                .filter_map(|input| {
                    st.latest_content(input)
                        .map(|content| (input.clone(), content.to_string()))
                })
                .collect();

            spawns.push(SpawnSpec {
                task: node,
                candidate,
                rank,
                attempt: attempts,
                inputs,
                provider,
            });
        }
    }

    fn handle_outcome(
        &self,
        st: &mut RunState,
        task_id: &str,
        outcome: AttemptOutcome,
        events: &mut Vec<RunEvent>,
        fatal: &mut Option<RunError>,
        cancel: &CancellationToken,
    ) {
        st.release_slot(task_id);
        if st.state_of(task_id).is_terminal() {
            // Already failed by the cancellation sweep.
            return;
        }

        match outcome {
            AttemptOutcome::Done {
                artifact_id,
                score,
                did_repair,
            } => {
                st.set_state(task_id, TaskState::Done);
                st.results.insert(
                    task_id.to_string(),
                    TaskResult::Done { artifact_id, score },
                );
                if did_repair {
                    st.tasks_repaired += 1;
                }
            }
            AttemptOutcome::Fallback { reason } => {
                let next = st.next_candidate.get_mut(task_id).expect("routed task");
                *next += 1;
                let candidate_count = st.candidates.get(task_id).map(|c| c.len()).unwrap_or(0);
                let attempts = st.attempts.get(task_id).copied().unwrap_or(0);
                let max_attempts = st.max_attempts.get(task_id).copied().unwrap_or(0);

                if st.next_candidate[task_id] >= candidate_count || attempts >= max_attempts {
                    fail_task(st, task_id, reason, events);
                } else {
                    debug!(task_id, reason = %reason, "falling back to next candidate");
                    st.set_state(task_id, TaskState::Fallback);
                    st.set_state(task_id, TaskState::Ready);
                }
            }
            AttemptOutcome::Fatal(error) => {
                fail_task(st, task_id, error.to_string(), events);
                if fatal.is_none() {
                    *fatal = Some(error);
                }
                cancel.cancel();
            }
            AttemptOutcome::Cancelled => {
                fail_task(st, task_id, "Cancelled".into(), events);
            }
        }
    }
}

fn fail_task(st: &mut RunState, task_id: &str, reason: String, events: &mut Vec<RunEvent>) {
    st.set_state(task_id, TaskState::Failed);
    st.results.insert(
        task_id.to_string(),
        TaskResult::Failed {
            reason: reason.clone(),
        },
    );
    events.push(RunEvent::TaskFailed {
        task_id: task_id.to_string(),
        reason,
    });
}

fn sweep_cancelled(st: &mut RunState, events: &mut Vec<RunEvent>) {
    for id in st.states.keys().cloned().collect::<Vec<_>>() {
        if st.state_of(&id).is_terminal() {
            continue;
        }
        st.release_slot(&id);
        fail_task(st, &id, "Cancelled".into(), events);
    }
}

/// Runs one admission: the initial attempt plus any repair cycles, all
/// inside the slot charged at admission time.
struct AttemptWorker {
    task: TaskNode,
    candidate: RankedCandidate,
    rank: usize,
    attempt: u32,
    inputs: Vec<(String, String)>,
    provider: Arc<dyn Provider>,
    state: Arc<Mutex<RunState>>,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
    registry: Arc<Registry>,
    verifier: Arc<Verifier>,
    verify_enabled: bool,
    timeout: Duration,
}

impl AttemptWorker {
    async fn run(&self) -> AttemptOutcome {
        let task_id = self.task.id.clone();
        let mut attempt = self.attempt;
        let mut did_repair = false;

        self.record_binding(attempt).await;
        self.emit(RunEvent::Decision {
            task_id: task_id.clone(),
            model_id: self.candidate.model_id.clone(),
            provider_id: self.candidate.provider_id.clone(),
            rank: self.rank,
            attempt,
        })
        .await;
        self.emit(RunEvent::TaskStart {
            task_id: task_id.clone(),
        })
        .await;

        let mut prompt = build_prompt(&self.task.prompt, &self.inputs);

        loop {
            let started = Instant::now();
            let execution = self.execute(&prompt).await;

            let completion = match execution {
                Ok(completion) => completion,
                Err(ExecError::Cancelled) => return AttemptOutcome::Cancelled,
                Err(ExecError::Provider(err)) => {
                    self.registry.record_outcome(
                        &self.candidate.model_id,
                        false,
                        started.elapsed().as_millis() as u64,
                        0,
                        0,
                    );
                    if err.is_fatal() {
                        return AttemptOutcome::Fatal(RunError::Configuration(err.to_string()));
                    }
                    // Exhausted transients, timeouts, and permanent errors
                    // all fall back; a permanent error during a repair
                    // cycle has already consumed the repair attempt.
                    return AttemptOutcome::Fallback {
                        reason: err.to_string(),
                    };
                }
            };

            // Record the artifact and move to verifying.
            let artifact = Artifact {
                artifact_id: generate_artifact_id(&task_id, attempt),
                task_id: task_id.clone(),
                binding: Binding {
                    task_id: task_id.clone(),
                    model_id: self.candidate.model_id.clone(),
                    provider_id: self.candidate.provider_id.clone(),
                    attempt,
                },
                content: completion.content.clone(),
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
                latency_ms: completion.latency_ms,
                produced_at: chrono::Utc::now(),
                status: ArtifactStatus::Produced,
            };
            let repair_left = {
                let mut st = self.state.lock().await;
                st.push_artifact(artifact.clone());
                st.set_state(&task_id, TaskState::Verifying);
                st.repair_left.get(&task_id).copied().unwrap_or(0)
            };

            let verdict = self.compute_verdict(&artifact, repair_left).await;

            self.registry.record_outcome(
                &self.candidate.model_id,
                verdict.passed,
                completion.latency_ms,
                completion.input_tokens,
                completion.output_tokens,
            );

            let passed = verdict.passed;
            let score = verdict.score;
            let directive = verdict.repair.clone();
            let reasons = verdict.failure_reasons.join("; ");
            {
                let mut st = self.state.lock().await;
                let status = if passed {
                    if did_repair {
                        ArtifactStatus::Repaired
                    } else {
                        ArtifactStatus::Verified
                    }
                } else {
                    ArtifactStatus::Rejected
                };
                if let Some(stored) = st
                    .artifacts
                    .iter_mut()
                    .find(|a| a.artifact_id == artifact.artifact_id)
                {
                    stored.status = status;
                }
                st.verdicts.push(verdict);
            }
            self.emit(RunEvent::TaskVerified {
                task_id: task_id.clone(),
                score,
                passed,
            })
            .await;

            if passed {
                return AttemptOutcome::Done {
                    artifact_id: artifact.artifact_id,
                    score,
                    did_repair,
                };
            }

            // Rejected: spend a repair attempt if the directive and the
            // attempt budget allow it, otherwise fall back.
            let Some(directive) = directive else {
                return AttemptOutcome::Fallback { reason: reasons };
            };
            let admitted_repair = {
                let mut st = self.state.lock().await;
                let attempts = st.attempts.get(&task_id).copied().unwrap_or(0);
                let max_attempts = st.max_attempts.get(&task_id).copied().unwrap_or(0);
                if attempts >= max_attempts {
                    false
                } else {
                    *st.repair_left.get_mut(&task_id).expect("known task") -= 1;
                    *st.attempts.get_mut(&task_id).expect("routed task") += 1;
                    attempt = attempts;
                    if st.graph.insert(directive.node.clone()).is_ok() {
                        st.repair_nodes.insert(directive.node.id.clone());
                    }
                    st.set_state(&task_id, TaskState::Repairing);
                    true
                }
            };
            if !admitted_repair {
                return AttemptOutcome::Fallback { reason: reasons };
            }

            self.emit(RunEvent::TaskRepaired {
                task_id: task_id.clone(),
                new_node_ids: vec![directive.node.id.clone()],
            })
            .await;
            self.record_binding(attempt).await;
            self.emit(RunEvent::Decision {
                task_id: task_id.clone(),
                model_id: self.candidate.model_id.clone(),
                provider_id: self.candidate.provider_id.clone(),
                rank: self.rank,
                attempt,
            })
            .await;
            self.emit(RunEvent::TaskStart {
                task_id: task_id.clone(),
            })
            .await;

            did_repair = true;
            // The directive prompt already embeds the rejected artifact.
            prompt = directive.node.prompt.clone();
        }
    }

    async fn compute_verdict(&self, artifact: &Artifact, repair_left: u32) -> Verdict {
        if !self.verify_enabled {
            return Verdict {
                artifact_id: artifact.artifact_id.clone(),
                score: 1.0,
                passed: true,
                failure_reasons: Vec::new(),
                repair: None,
            };
        }
        match self.verifier.verify(&self.task, artifact, repair_left).await {
            Ok(verdict) => verdict,
            Err(err) => {
                // Verifier-internal failure counts as a failed verdict and
                // still consumes a repair attempt.
                warn!(task_id = %self.task.id, error = %err, "verifier internal error");
                let reasons = vec![format!("VerifierError: {err}")];
                let repair = if repair_left > 0 {
                    Some(repair_directive(&self.task, artifact, &reasons))
                } else {
                    None
                };
                Verdict {
                    artifact_id: artifact.artifact_id.clone(),
                    score: 0.0,
                    passed: false,
                    failure_reasons: reasons,
                    repair,
                }
            }
        }
    }

    /// One adapter call bounded by the per-attempt deadline and the run's
    /// cancellation token. Streamed fragments are forwarded as
    /// task_artifact events.
    async fn execute(&self, prompt: &str) -> Result<Completion, ExecError> {
        let request = CompletionRequest::new(&self.candidate.model_id, prompt);

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(16);
        let events = self.events.clone();
        let task_id = self.task.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(fragment) = delta_rx.recv().await {
                let _ = events
                    .send(RunEvent::TaskArtifact {
                        task_id: task_id.clone(),
                        fragment,
                    })
                    .await;
            }
        });

        let call = self.provider.complete_streaming(request, delta_tx);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => match outcome {
                Ok(Ok(completion)) => Ok(completion),
                Ok(Err(err)) => Err(ExecError::Provider(err)),
                Err(_) => Err(ExecError::Provider(ProviderError::Timeout(
                    self.timeout.as_millis() as u64,
                ))),
            },
        };
        let _ = forwarder.await;
        result
    }

    async fn record_binding(&self, attempt: u32) {
        let binding = Binding {
            task_id: self.task.id.clone(),
            model_id: self.candidate.model_id.clone(),
            provider_id: self.candidate.provider_id.clone(),
            attempt,
        };
        self.state.lock().await.bindings.push(binding);
    }

    async fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Upstream artifacts are concatenated as context ahead of the task's own
/// instruction.
fn build_prompt(task_prompt: &str, inputs: &[(String, String)]) -> String {
    if inputs.is_empty() {
        return task_prompt.to_string();
    }
    let mut prompt = String::new();
    for (task_id, content) in inputs {
        prompt.push_str(&format!("Context from {task_id}:\n{content}\n\n"));
    }
    prompt.push_str("Task:\n");
    prompt.push_str(task_prompt);
    prompt
}

//! Journal: append-only run traces and artifact files.
//!
//! Layout:
//! - `journal/<run_id>.json` - sealed RunTrace, one file per run
//! - `artifacts/<YYYY-MM-DD>/<task_kind>/<model_id>/<artifact_id>.txt`
//!
//! `get_trace` rehydrates a trace for replay without re-executing
//! anything. Writes happen off the scheduling hot path.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StorageConfig;
use crate::graph::TaskKind;
use crate::types::{Artifact, RunTrace};

/// Index row for the history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub tasks: usize,
    pub cost: f64,
    pub wall_time_ms: u64,
}

/// Cross-run aggregates over everything journaled so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalStats {
    pub total_runs: usize,
    pub total_tasks: usize,
    pub total_cost: f64,
    pub avg_cost_per_run: f64,
    pub avg_wall_time_ms: f64,
    pub total_artifacts: usize,
    pub journal_dir: PathBuf,
}

pub struct Journal {
    journal_dir: PathBuf,
    artifacts_dir: PathBuf,
}

impl Journal {
    pub fn new(storage: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(&storage.journal_dir)
            .with_context(|| format!("creating {}", storage.journal_dir.display()))?;
        fs::create_dir_all(&storage.artifacts_dir)
            .with_context(|| format!("creating {}", storage.artifacts_dir.display()))?;
        Ok(Self {
            journal_dir: storage.journal_dir.clone(),
            artifacts_dir: storage.artifacts_dir.clone(),
        })
    }

    /// Persist a sealed trace. One file per run; never rewritten.
    pub fn record_trace(&self, trace: &RunTrace) -> Result<()> {
        let path = self.journal_dir.join(format!("{}.json", trace.run_id));
        let json = serde_json::to_string_pretty(trace)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        debug!(run_id = %trace.run_id, path = %path.display(), "run trace recorded");
        Ok(())
    }

    /// Store one artifact's text, indexed by date, task kind, and model.
    pub fn store_artifact(&self, kind: TaskKind, artifact: &Artifact) -> Result<PathBuf> {
        let dir = self
            .artifacts_dir
            .join(artifact.produced_at.format("%Y-%m-%d").to_string())
            .join(kind.as_str())
            .join(&artifact.binding.model_id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{}.txt", artifact.artifact_id));
        fs::write(&path, &artifact.content)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Rehydrate a persisted trace. Does not re-execute anything.
    pub fn get_trace(&self, run_id: &str) -> Result<Option<RunTrace>> {
        if !run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("invalid run id: {run_id}");
        }
        let path = self.journal_dir.join(format!("{run_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let trace: RunTrace =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(trace))
    }

    /// Most recent runs, newest first. Run ids are time-sortable, so the
    /// filename order is the chronological order.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut run_ids: Vec<String> = fs::read_dir(&self.journal_dir)
            .with_context(|| format!("listing {}", self.journal_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(|stem| stem.to_string())
            })
            .collect();
        run_ids.sort();
        run_ids.reverse();

        let mut summaries = Vec::new();
        for run_id in run_ids.into_iter().take(limit) {
            if let Some(trace) = self.get_trace(&run_id)? {
                summaries.push(RunSummary {
                    run_id: trace.run_id,
                    prompt: trace.prompt,
                    started_at: trace.started_at,
                    tasks: trace.graph.len(),
                    cost: trace.stats.cost,
                    wall_time_ms: trace.stats.wall_time_ms,
                });
            }
        }
        Ok(summaries)
    }

    /// Aggregate statistics over every journaled run and stored artifact.
    pub fn get_stats(&self) -> Result<JournalStats> {
        let summaries = self.recent(usize::MAX)?;
        let total_runs = summaries.len();
        let total_tasks: usize = summaries.iter().map(|s| s.tasks).sum();
        let total_cost: f64 = summaries.iter().map(|s| s.cost).sum();
        let total_wall_time_ms: u64 = summaries.iter().map(|s| s.wall_time_ms).sum();

        Ok(JournalStats {
            total_runs,
            total_tasks,
            total_cost,
            avg_cost_per_run: if total_runs > 0 {
                total_cost / total_runs as f64
            } else {
                0.0
            },
            avg_wall_time_ms: if total_runs > 0 {
                total_wall_time_ms as f64 / total_runs as f64
            } else {
                0.0
            },
            total_artifacts: count_files(&self.artifacts_dir),
            journal_dir: self.journal_dir.clone(),
        })
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{TaskGraph, TaskNode};
    use crate::types::{ArtifactStatus, Binding, RunStats};

    fn storage(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            journal_dir: dir.join("journal"),
            artifacts_dir: dir.join("artifacts"),
        }
    }

    fn trace(run_id: &str) -> RunTrace {
        RunTrace {
            run_id: run_id.into(),
            prompt: "What is 2+2?".into(),
            graph: TaskGraph::new(vec![TaskNode::new("t1", TaskKind::General, "What is 2+2?")]),
            bindings: vec![],
            artifacts: vec![],
            verdicts: vec![],
            response: None,
            stats: RunStats::default(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_trace_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&storage(dir.path())).unwrap();

        let original = trace("20250301_120000_abc123");
        journal.record_trace(&original).unwrap();

        let loaded = journal.get_trace("20250301_120000_abc123").unwrap().unwrap();
        assert_eq!(original, loaded);
        assert!(journal.get_trace("20250301_999999_zzzzzz").unwrap().is_none());
    }

    #[test]
    fn test_get_trace_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&storage(dir.path())).unwrap();
        assert!(journal.get_trace("../evil").is_err());
    }

    #[test]
    fn test_artifact_layout() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&storage(dir.path())).unwrap();

        let produced_at: DateTime<Utc> = "2025-03-01T12:00:00Z".parse().unwrap();
        let artifact = Artifact {
            artifact_id: "t1_a0_abc123".into(),
            task_id: "t1".into(),
            binding: Binding {
                task_id: "t1".into(),
                model_id: "gpt-4o".into(),
                provider_id: "openai".into(),
                attempt: 0,
            },
            content: "4".into(),
            input_tokens: 5,
            output_tokens: 1,
            latency_ms: 10,
            produced_at,
            status: ArtifactStatus::Verified,
        };

        let path = journal
            .store_artifact(TaskKind::DataAnalysis, &artifact)
            .unwrap();
        let expected = dir
            .path()
            .join("artifacts/2025-03-01/data_analysis/gpt-4o/t1_a0_abc123.txt");
        assert_eq!(path, expected);
        assert_eq!(fs::read_to_string(path).unwrap(), "4");
    }

    #[test]
    fn test_get_stats_aggregates_runs_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&storage(dir.path())).unwrap();

        let mut first = trace("20250301_100000_aaaaaa");
        first.stats = RunStats {
            wall_time_ms: 100,
            cost: 0.02,
            tasks_executed: 1,
            ..RunStats::default()
        };
        let mut second = trace("20250301_110000_bbbbbb");
        second.stats = RunStats {
            wall_time_ms: 300,
            cost: 0.04,
            tasks_executed: 1,
            ..RunStats::default()
        };
        journal.record_trace(&first).unwrap();
        journal.record_trace(&second).unwrap();

        let artifact = Artifact {
            artifact_id: "t1_a0_abc123".into(),
            task_id: "t1".into(),
            binding: Binding {
                task_id: "t1".into(),
                model_id: "gpt-4o".into(),
                provider_id: "openai".into(),
                attempt: 0,
            },
            content: "4".into(),
            input_tokens: 5,
            output_tokens: 1,
            latency_ms: 10,
            produced_at: Utc::now(),
            status: ArtifactStatus::Verified,
        };
        journal
            .store_artifact(TaskKind::General, &artifact)
            .unwrap();

        let stats = journal.get_stats().unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.total_tasks, 2);
        assert!((stats.total_cost - 0.06).abs() < 1e-9);
        assert!((stats.avg_cost_per_run - 0.03).abs() < 1e-9);
        assert!((stats.avg_wall_time_ms - 200.0).abs() < 1e-9);
        assert_eq!(stats.total_artifacts, 1);
    }

    #[test]
    fn test_get_stats_on_empty_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&storage(dir.path())).unwrap();
        let stats = journal.get_stats().unwrap();
        assert_eq!(stats.total_runs, 0);
        assert_eq!(stats.avg_cost_per_run, 0.0);
        assert_eq!(stats.total_artifacts, 0);
    }

    #[test]
    fn test_recent_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&storage(dir.path())).unwrap();

        journal.record_trace(&trace("20250301_100000_aaaaaa")).unwrap();
        journal.record_trace(&trace("20250302_100000_bbbbbb")).unwrap();
        journal.record_trace(&trace("20250301_230000_cccccc")).unwrap();

        let recent = journal.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "20250302_100000_bbbbbb");
        assert_eq!(recent[1].run_id, "20250301_230000_cccccc");
    }
}

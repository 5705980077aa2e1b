//! Rolling telemetry window feeding the router.
//!
//! Process-wide; writes take a short exclusive lock, reads work on the
//! window as of "now" (samples past the horizon are excluded logically and
//! pruned physically on the next write). Lifetime counters are monotonic.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// One recorded execution outcome.
#[derive(Debug, Clone)]
pub struct OutcomeSample {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

#[derive(Debug, Default)]
struct ModelWindow {
    samples: VecDeque<OutcomeSample>,
    // Lifetime counters, never decremented.
    attempts: u64,
    successes: u64,
    errors: u64,
}

/// Windowed view of one model's recent behavior.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub errors: u64,
    /// Laplace-smoothed success rate over the window: (s+1)/(a+2).
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub window_samples: usize,
}

pub struct Telemetry {
    windows: RwLock<HashMap<String, ModelWindow>>,
    horizon: Duration,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Standard 24-hour rolling horizon.
    pub fn new() -> Self {
        Self::with_horizon(Duration::hours(24))
    }

    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            horizon,
        }
    }

    /// Record one execution outcome for a model.
    pub fn record(
        &self,
        model_id: &str,
        success: bool,
        latency_ms: u64,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    ) {
        let now = Utc::now();
        let cutoff = now - self.horizon;
        let mut windows = self.windows.write().expect("telemetry lock poisoned");
        let window = windows.entry(model_id.to_string()).or_default();

        window.samples.push_back(OutcomeSample {
            at: now,
            success,
            latency_ms,
            tokens_in,
            tokens_out,
            cost,
        });
        while window
            .samples
            .front()
            .map(|s| s.at < cutoff)
            .unwrap_or(false)
        {
            window.samples.pop_front();
        }

        window.attempts += 1;
        if success {
            window.successes += 1;
        } else {
            window.errors += 1;
        }
    }

    /// Windowed snapshot for one model, or None when it was never sampled.
    pub fn snapshot(&self, model_id: &str) -> Option<TelemetrySnapshot> {
        let cutoff = Utc::now() - self.horizon;
        let windows = self.windows.read().expect("telemetry lock poisoned");
        let window = windows.get(model_id)?;

        let live: Vec<&OutcomeSample> =
            window.samples.iter().filter(|s| s.at >= cutoff).collect();
        let win_attempts = live.len() as u64;
        let win_successes = live.iter().filter(|s| s.success).count() as u64;
        let avg_latency_ms = if live.is_empty() {
            None
        } else {
            Some(live.iter().map(|s| s.latency_ms as f64).sum::<f64>() / live.len() as f64)
        };

        Some(TelemetrySnapshot {
            attempts: window.attempts,
            successes: window.successes,
            errors: window.errors,
            success_rate: (win_successes + 1) as f64 / (win_attempts + 2) as f64,
            avg_latency_ms,
            tokens_in: live.iter().map(|s| s.tokens_in).sum(),
            tokens_out: live.iter().map(|s| s.tokens_out).sum(),
            cost: live.iter().map(|s| s.cost).sum(),
            window_samples: live.len(),
        })
    }

    /// Median of the per-model average latencies across sampled models.
    /// Used as the neutral latency prior for unseen models.
    pub fn median_latency_ms(&self) -> Option<f64> {
        let cutoff = Utc::now() - self.horizon;
        let windows = self.windows.read().expect("telemetry lock poisoned");

        let mut averages: Vec<f64> = windows
            .values()
            .filter_map(|w| {
                let live: Vec<&OutcomeSample> =
                    w.samples.iter().filter(|s| s.at >= cutoff).collect();
                if live.is_empty() {
                    None
                } else {
                    Some(live.iter().map(|s| s.latency_ms as f64).sum::<f64>() / live.len() as f64)
                }
            })
            .collect();
        if averages.is_empty() {
            return None;
        }
        averages.sort_by(|a, b| a.partial_cmp(b).expect("latency is finite"));
        Some(averages[averages.len() / 2])
    }
}

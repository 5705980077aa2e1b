//! ai3 CLI: orchestrate a prompt across multiple model backends.
//!
//! Exit codes: 0 success, 1 plan error, 2 all candidates failed,
//! 3 cancelled or timed out, 4 configuration error.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use ai3::config::Ai3Config;
use ai3::engine::{Engine, RunOptions};
use ai3::events::RunEvent;
use ai3::journal::Journal;

#[derive(Parser)]
#[command(name = "ai3")]
#[command(about = "Multi-model orchestration engine: plan, route, execute, verify, assemble")]
struct Args {
    /// Prompt to orchestrate.
    prompt: Option<String>,

    /// Stream run events instead of waiting for the aggregate result.
    #[arg(long)]
    stream: bool,

    /// Global concurrent-task cap.
    #[arg(long, value_name = "N")]
    max_concurrency: Option<usize>,

    /// Per-provider concurrent-task cap.
    #[arg(long, value_name = "N")]
    max_concurrency_per_provider: Option<usize>,

    /// Model used for planning (and synthesis).
    #[arg(long, value_name = "MODEL")]
    planner_model: Option<String>,

    /// Skip output verification.
    #[arg(long)]
    no_verify: bool,

    /// Repair attempts allowed per task.
    #[arg(long, value_name = "N")]
    repair_limit: Option<u32>,

    /// Start the HTTP server instead of running a prompt.
    #[arg(long)]
    serve: bool,

    /// Server port (with --serve).
    #[arg(long)]
    port: Option<u16>,

    /// Print aggregate engine statistics (telemetry, routing, journal).
    #[arg(long)]
    stats: bool,

    /// List the most recent journaled runs.
    #[arg(long, value_name = "N")]
    history: Option<usize>,

    /// Print a journaled run trace without re-executing it.
    #[arg(long, value_name = "RUN_ID")]
    replay: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Ai3Config::from_env();
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Journal-only commands need no API keys.
    if let Some(limit) = args.history {
        return cmd_history(&config, limit);
    }
    if let Some(run_id) = &args.replay {
        return cmd_replay(&config, run_id);
    }

    if args.stats {
        return cmd_stats(config);
    }

    if args.serve {
        let engine = match Engine::new(config.clone()) {
            Ok(engine) => Arc::new(engine),
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::from(4);
            }
        };
        if let Err(err) = ai3::server::run(engine, &config.server.bind_address()).await {
            eprintln!("error: {err}");
            return ExitCode::from(4);
        }
        return ExitCode::SUCCESS;
    }

    let Some(prompt) = args.prompt.clone() else {
        eprintln!("error: no prompt given (see --help)");
        return ExitCode::from(4);
    };

    let engine = match Engine::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(4);
        }
    };

    let options = RunOptions {
        max_concurrency: args.max_concurrency,
        max_concurrency_per_provider: args.max_concurrency_per_provider,
        planner_model: args.planner_model.clone(),
        verify: if args.no_verify { Some(false) } else { None },
        repair_limit: args.repair_limit,
        timeout_secs: None,
    };

    if args.stream {
        cmd_run_stream(engine, prompt, options).await
    } else {
        cmd_run(engine, prompt, options).await
    }
}

async fn cmd_run(engine: Arc<Engine>, prompt: String, options: RunOptions) -> ExitCode {
    // Ctrl-C cancels the token and keeps awaiting the run, so in-flight
    // tasks shut down through the scheduler's cooperative path and the
    // trace is still journaled when the terminal layer already finished.
    let cancel = CancellationToken::new();
    let run = engine.run_with_cancel(&prompt, options, cancel.clone());
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("cancelling...");
                cancel.cancel();
            }
        }
    };

    match result {
        Ok(result) => {
            println!("{}", result.response.content);
            eprintln!(
                "run {} | confidence {:.2} | {} tasks, {} repaired, {} failed | {} ms | ${:.4}",
                result.run_id,
                result.response.confidence,
                result.stats.tasks_executed,
                result.stats.tasks_repaired,
                result.stats.tasks_failed,
                result.stats.wall_time_ms,
                result.stats.cost,
            );
            for warning in &result.response.warnings {
                eprintln!("warning: {warning}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn cmd_run_stream(engine: Arc<Engine>, prompt: String, options: RunOptions) -> ExitCode {
    let cancel = CancellationToken::new();
    let (mut events, handle) = engine.run_stream(prompt, options, cancel.clone());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ncancelling...");
                cancel.cancel();
            }
        }
    }

    match handle.await {
        Ok(Ok(_)) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
        Err(_) => ExitCode::from(3),
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Plan { task_count, .. } => eprintln!("[plan] {task_count} task(s)"),
        RunEvent::Decision {
            task_id,
            model_id,
            rank,
            attempt,
            ..
        } => eprintln!("[decision] {task_id} -> {model_id} (rank {rank}, attempt {attempt})"),
        RunEvent::TaskStart { task_id } => eprintln!("[start] {task_id}"),
        RunEvent::TaskArtifact { fragment, .. } => {
            print!("{fragment}");
            let _ = std::io::stdout().flush();
        }
        RunEvent::TaskVerified {
            task_id,
            score,
            passed,
        } => eprintln!("\n[verified] {task_id} score {score:.2} passed {passed}"),
        RunEvent::TaskRepaired {
            task_id,
            new_node_ids,
        } => eprintln!("[repair] {task_id} -> {}", new_node_ids.join(", ")),
        RunEvent::TaskFailed { task_id, reason } => eprintln!("[failed] {task_id}: {reason}"),
        RunEvent::AssembleStart { strategy } => eprintln!("[assemble] {strategy}"),
        RunEvent::Final {
            content,
            confidence,
        } => println!("\n---\n{content}\n---\nconfidence {confidence:.2}"),
        RunEvent::Stats { stats } => eprintln!(
            "[stats] {} ms | in {} out {} tokens | ${:.4}",
            stats.wall_time_ms, stats.tokens_in, stats.tokens_out, stats.cost
        ),
    }
}

fn cmd_stats(config: Ai3Config) -> ExitCode {
    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(4);
        }
    };
    match engine.get_stats() {
        Ok(stats) => match serde_json::to_string_pretty(&stats) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::from(4)
            }
        },
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(4)
        }
    }
}

fn cmd_history(config: &Ai3Config, limit: usize) -> ExitCode {
    let journal = match Journal::new(&config.storage) {
        Ok(journal) => journal,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(4);
        }
    };
    match journal.recent(limit) {
        Ok(summaries) => {
            for summary in summaries {
                println!(
                    "{}  {}  {} task(s)  ${:.4}  {}",
                    summary.run_id,
                    summary.started_at.format("%Y-%m-%d %H:%M:%S"),
                    summary.tasks,
                    summary.cost,
                    truncate(&summary.prompt, 60),
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(4)
        }
    }
}

fn cmd_replay(config: &Ai3Config, run_id: &str) -> ExitCode {
    let journal = match Journal::new(&config.storage) {
        Ok(journal) => journal,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(4);
        }
    };
    match journal.get_trace(run_id) {
        Ok(Some(trace)) => {
            match serde_json::to_string_pretty(&trace) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("error: {err}");
                    return ExitCode::from(4);
                }
            }
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("error: no run trace for {run_id}");
            ExitCode::from(4)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(4)
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

//! Assembler: merges terminal artifacts into the final response.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::graph::TaskKind;
use crate::providers::{CompletionRequest, Provider};
use crate::types::{Artifact, RunResponse};

const SYNTHESIZE_SYSTEM_PROMPT: &str = "You merge partial results from specialist subtasks into one coherent response. Preserve all substantive content; remove redundancy; do not add commentary about the merging process.";

/// One terminal artifact with its verdict score, in topological post-order.
#[derive(Debug, Clone)]
pub struct TerminalArtifact {
    pub artifact: Artifact,
    pub kind: TaskKind,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Concatenate,
    BestSingle,
    Synthesize,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Concatenate => "concatenate",
            Strategy::BestSingle => "best_single",
            Strategy::Synthesize => "synthesize",
        }
    }
}

/// Pick a strategy from the shape of the terminal set: one artifact uses
/// it directly, several of the same kind concatenate, mixed kinds merge
/// through one LLM call.
pub fn select_strategy(items: &[TerminalArtifact]) -> Strategy {
    if items.len() <= 1 {
        return Strategy::BestSingle;
    }
    let first_kind = items[0].kind;
    if items.iter().all(|i| i.kind == first_kind) {
        Strategy::Concatenate
    } else {
        Strategy::Synthesize
    }
}

#[derive(Default)]
pub struct Assembler {
    synthesizer: Option<(Arc<dyn Provider>, String)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider used for the `synthesize` strategy.
    pub fn with_synthesizer(provider: Arc<dyn Provider>, model_id: impl Into<String>) -> Self {
        Self {
            synthesizer: Some((provider, model_id.into())),
        }
    }

    pub async fn assemble(
        &self,
        items: Vec<TerminalArtifact>,
        mut warnings: Vec<String>,
    ) -> RunResponse {
        let strategy = select_strategy(&items);
        let confidence = if items.is_empty() {
            0.0
        } else {
            items.iter().map(|i| i.score).sum::<f64>() / items.len() as f64
        };
        let sources: Vec<String> = items
            .iter()
            .map(|i| i.artifact.artifact_id.clone())
            .collect();

        debug!(
            strategy = strategy.as_str(),
            artifacts = items.len(),
            "assembling response"
        );

        let content = match strategy {
            Strategy::BestSingle => items
                .iter()
                .max_by(|a, b| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|i| i.artifact.content.clone())
                .unwrap_or_default(),
            Strategy::Concatenate => concatenate(&items),
            Strategy::Synthesize => match self.synthesize(&items).await {
                Ok(content) => content,
                Err(reason) => {
                    warn!(reason = %reason, "synthesis failed, falling back to concatenation");
                    warnings.push(format!("synthesis failed ({reason}); concatenated instead"));
                    concatenate(&items)
                }
            },
        };

        RunResponse {
            content,
            confidence,
            strategy: strategy.as_str().to_string(),
            source_artifacts: sources,
            warnings,
        }
    }

    async fn synthesize(&self, items: &[TerminalArtifact]) -> Result<String, String> {
        let (provider, model_id) = self
            .synthesizer
            .as_ref()
            .ok_or_else(|| "no synthesizer model configured".to_string())?;

        let mut prompt = String::from("Merge the following partial results into a single coherent response.\n");
        for item in items {
            prompt.push_str(&format!(
                "\n--- {} ({}) ---\n{}\n",
                item.artifact.task_id,
                item.kind.as_str(),
                item.artifact.content
            ));
        }

        let request = CompletionRequest::new(model_id, prompt)
            .with_system(SYNTHESIZE_SYSTEM_PROMPT)
            .with_temperature(0.3);
        provider
            .complete(request)
            .await
            .map(|c| c.content)
            .map_err(|e| e.to_string())
    }
}

fn concatenate(items: &[TerminalArtifact]) -> String {
    items
        .iter()
        .map(|i| i.artifact.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArtifactStatus, Binding};
    use chrono::Utc;

    fn item(task_id: &str, kind: TaskKind, content: &str, score: f64) -> TerminalArtifact {
        TerminalArtifact {
            artifact: Artifact {
                artifact_id: format!("{task_id}_a0_test"),
                task_id: task_id.into(),
                binding: Binding {
                    task_id: task_id.into(),
                    model_id: "m".into(),
                    provider_id: "p".into(),
                    attempt: 0,
                },
                content: content.into(),
                input_tokens: 1,
                output_tokens: 1,
                latency_ms: 1,
                produced_at: Utc::now(),
                status: ArtifactStatus::Verified,
            },
            kind,
            score,
        }
    }

    #[test]
    fn test_strategy_selection() {
        let one = vec![item("t1", TaskKind::General, "a", 1.0)];
        assert_eq!(select_strategy(&one), Strategy::BestSingle);

        let same = vec![
            item("t1", TaskKind::Coding, "a", 1.0),
            item("t2", TaskKind::Coding, "b", 1.0),
        ];
        assert_eq!(select_strategy(&same), Strategy::Concatenate);

        let mixed = vec![
            item("t1", TaskKind::Coding, "a", 1.0),
            item("t2", TaskKind::Summarization, "b", 1.0),
        ];
        assert_eq!(select_strategy(&mixed), Strategy::Synthesize);
    }

    #[tokio::test]
    async fn test_single_artifact_uses_best_single() {
        let assembler = Assembler::new();
        let response = assembler
            .assemble(vec![item("t1", TaskKind::General, "4", 0.9)], vec![])
            .await;
        assert_eq!(response.content, "4");
        assert_eq!(response.strategy, "best_single");
        assert!((response.confidence - 0.9).abs() < 1e-9);
        assert_eq!(response.source_artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_concatenate_preserves_order() {
        let assembler = Assembler::new();
        let response = assembler
            .assemble(
                vec![
                    item("t1", TaskKind::Coding, "first", 0.8),
                    item("t2", TaskKind::Coding, "second", 1.0),
                ],
                vec![],
            )
            .await;
        assert_eq!(response.content, "first\n\nsecond");
        assert_eq!(response.strategy, "concatenate");
        assert!((response.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_synthesize_without_model_falls_back() {
        let assembler = Assembler::new();
        let response = assembler
            .assemble(
                vec![
                    item("t1", TaskKind::Coding, "code", 1.0),
                    item("t2", TaskKind::Summarization, "summary", 1.0),
                ],
                vec![],
            )
            .await;
        assert_eq!(response.content, "code\n\nsummary");
        assert_eq!(response.strategy, "synthesize");
        assert_eq!(response.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_synthesize_merges_via_provider() {
        use crate::providers::StubProvider;
        let stub = StubProvider::new("stub");
        stub.push_reply("merger", "merged output");
        let assembler = Assembler::with_synthesizer(Arc::new(stub), "merger");

        let response = assembler
            .assemble(
                vec![
                    item("t1", TaskKind::Coding, "code", 1.0),
                    item("t2", TaskKind::Summarization, "summary", 0.8),
                ],
                vec![],
            )
            .await;
        assert_eq!(response.content, "merged output");
        assert!(response.warnings.is_empty());
    }
}

//! Verifier: judges artifacts against task criteria and emits repair
//! directives for rejected outputs.
//!
//! Criterion checks run in one of two rubric modes: a deterministic
//! heuristic (keyword containment) or an LLM rubric (one yes/no call per
//! criterion). Defect checks are always heuristic.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::error::{ProviderError, VerifyError};
use crate::graph::{TaskKind, TaskNode};
use crate::providers::{CompletionRequest, Provider};
use crate::types::{Artifact, RepairDirective, Verdict};

const PASS_THRESHOLD: f64 = 0.7;
const DEFECT_PENALTY: f64 = 0.25;

const RUBRIC_SYSTEM_PROMPT: &str =
    "You are a strict grader. Answer with exactly YES or NO and nothing else.";

/// How success criteria are judged.
pub enum RubricMode {
    Heuristic,
    Llm {
        provider: Arc<dyn Provider>,
        model_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Defect {
    Empty,
    Refusal,
    Truncated,
    TooShort,
}

impl Defect {
    /// Fatal defects fail the artifact regardless of score.
    fn is_fatal(self) -> bool {
        matches!(self, Defect::Empty | Defect::Refusal)
    }

    fn describe(self) -> &'static str {
        match self {
            Defect::Empty => "output is empty",
            Defect::Refusal => "output is a refusal",
            Defect::Truncated => "output appears truncated",
            Defect::TooShort => "output is shorter than expected for this task kind",
        }
    }
}

pub struct Verifier {
    mode: RubricMode,
}

impl Verifier {
    pub fn heuristic() -> Self {
        Self {
            mode: RubricMode::Heuristic,
        }
    }

    pub fn with_llm_rubric(provider: Arc<dyn Provider>, model_id: impl Into<String>) -> Self {
        Self {
            mode: RubricMode::Llm {
                provider,
                model_id: model_id.into(),
            },
        }
    }

    /// Judge an artifact. `repair_budget_left` gates directive emission;
    /// the directive node id derives from the artifact's attempt index.
    pub async fn verify(
        &self,
        task: &TaskNode,
        artifact: &Artifact,
        repair_budget_left: u32,
    ) -> Result<Verdict, VerifyError> {
        let content = artifact.content.trim();

        let defects = detect_defects(task.kind, content);
        let has_fatal_defect = defects.iter().any(|d| d.is_fatal());

        let mut failure_reasons: Vec<String> = Vec::new();
        let mut passed_criteria = 0usize;
        for criterion in &task.criteria {
            let ok = match &self.mode {
                RubricMode::Heuristic => check_criterion_heuristic(criterion, content),
                RubricMode::Llm { provider, model_id } => {
                    check_criterion_llm(provider.as_ref(), model_id, criterion, content).await?
                }
            };
            if ok {
                passed_criteria += 1;
            } else {
                failure_reasons.push(format!("criterion not met: {criterion}"));
            }
        }
        for defect in &defects {
            failure_reasons.push(defect.describe().to_string());
        }

        let criteria_fraction = if task.criteria.is_empty() {
            1.0
        } else {
            passed_criteria as f64 / task.criteria.len() as f64
        };
        let score =
            (criteria_fraction - DEFECT_PENALTY * defects.len() as f64).clamp(0.0, 1.0);
        let passed = score >= PASS_THRESHOLD && !has_fatal_defect;

        debug!(
            task_id = %task.id,
            artifact_id = %artifact.artifact_id,
            score,
            passed,
            defects = defects.len(),
            "verdict computed"
        );

        let repair = if !passed && repair_budget_left > 0 {
            Some(repair_directive(task, artifact, &failure_reasons))
        } else {
            None
        };

        Ok(Verdict {
            artifact_id: artifact.artifact_id.clone(),
            score,
            passed,
            failure_reasons,
            repair,
        })
    }
}

/// Build the one-node repair subgraph for a rejected artifact. The node
/// inherits the original task's criteria and consumes the rejected
/// artifact as input.
pub(crate) fn repair_directive(
    task: &TaskNode,
    artifact: &Artifact,
    reasons: &[String],
) -> RepairDirective {
    let issues = reasons
        .iter()
        .map(|r| format!("- {r}"))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Given the prior attempt:\n{}\n\nAddress the following issues:\n{}\n\nProduce a corrected version.",
        artifact.content, issues
    );

    let node = TaskNode {
        id: format!("{}.repair{}", task.id, artifact.binding.attempt + 1),
        kind: task.kind,
        prompt,
        inputs: vec![task.id.clone()],
        criteria: task.criteria.clone(),
        features: task.features.clone(),
        min_context: task.min_context,
        repair_budget: 0,
        terminal: false,
    };

    RepairDirective {
        node,
        rejected_artifact_id: artifact.artifact_id.clone(),
    }
}

fn detect_defects(kind: TaskKind, content: &str) -> Vec<Defect> {
    if content.is_empty() {
        return vec![Defect::Empty];
    }

    let mut defects = Vec::new();
    let lowered = content.to_lowercase();

    let refusal = Regex::new(
        r"(?i)\b(i cannot|i can't|i am unable|i'm unable|i will not|i won't assist|not able to help)\b",
    )
    .expect("static regex");
    if refusal.is_match(&lowered) {
        defects.push(Defect::Refusal);
    }

    let truncated = content.ends_with("...")
        || content.ends_with('…')
        || lowered.ends_with("[truncated]")
        || content.matches("```").count() % 2 == 1;
    if truncated {
        defects.push(Defect::Truncated);
    }

    if content.len() < kind.min_output_chars() {
        defects.push(Defect::TooShort);
    }

    defects
}

/// Deterministic criterion check. Containment-style criteria ("must
/// contain the word FOO") check their targets literally; anything else
/// passes when the criterion's significant words appear in the output or
/// the output is substantial.
fn check_criterion_heuristic(criterion: &str, content: &str) -> bool {
    let content_lower = content.to_lowercase();
    let criterion_lower = criterion.to_lowercase();

    // Quoted targets are checked verbatim.
    let quoted = Regex::new(r#"["'`]([^"'`]+)["'`]"#).expect("static regex");
    let quoted_targets: Vec<&str> = quoted
        .captures_iter(criterion)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    if !quoted_targets.is_empty() {
        return quoted_targets
            .iter()
            .all(|t| content_lower.contains(&t.to_lowercase()));
    }

    // "contain/include/mention the word X" style criteria.
    let containment =
        Regex::new(r"(?:contains?|includes?|mentions?)\s+(?:the\s+)?(?:words?|phrases?|text|string)?\s*(.+)$")
            .expect("static regex");
    if let Some(caps) = containment.captures(&criterion_lower) {
        let targets: Vec<&str> = caps
            .get(1)
            .map(|m| m.as_str().split_whitespace().collect())
            .unwrap_or_default();
        if !targets.is_empty() {
            return targets
                .iter()
                .all(|t| content_lower.contains(&t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()));
        }
    }

    // General criteria: significant-word overlap, or a substantial answer.
    let stopwords = [
        "must", "should", "will", "with", "that", "this", "have", "been", "from", "into",
        "output", "response", "answer", "result",
    ];
    let significant: Vec<&str> = criterion_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4 && !stopwords.contains(w))
        .collect();
    if significant.is_empty() {
        return !content.is_empty();
    }
    let matched = significant
        .iter()
        .filter(|w| content_lower.contains(**w))
        .count();
    matched * 2 >= significant.len() || content.len() > 100
}

async fn check_criterion_llm(
    provider: &dyn Provider,
    model_id: &str,
    criterion: &str,
    content: &str,
) -> Result<bool, VerifyError> {
    let prompt = format!(
        "Criterion: {criterion}\n\nOutput:\n{content}\n\nDoes the output satisfy the criterion? Answer YES or NO."
    );
    let request = CompletionRequest::new(model_id, prompt)
        .with_system(RUBRIC_SYSTEM_PROMPT)
        .with_temperature(0.0)
        .with_max_tokens(8);

    let completion = provider.complete(request).await.map_err(|e: ProviderError| {
        VerifyError::InternalRubric(e.to_string())
    })?;
    Ok(completion
        .content
        .trim()
        .to_uppercase()
        .starts_with("YES"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StubProvider;
    use crate::types::{ArtifactStatus, Binding};
    use chrono::Utc;

    fn artifact(task_id: &str, content: &str, attempt: u32) -> Artifact {
        Artifact {
            artifact_id: format!("{task_id}_a{attempt}_test"),
            task_id: task_id.into(),
            binding: Binding {
                task_id: task_id.into(),
                model_id: "m".into(),
                provider_id: "p".into(),
                attempt,
            },
            content: content.into(),
            input_tokens: 10,
            output_tokens: 10,
            latency_ms: 5,
            produced_at: Utc::now(),
            status: ArtifactStatus::Produced,
        }
    }

    fn task_with_criterion(criterion: &str) -> TaskNode {
        let mut task = TaskNode::new("t1", TaskKind::General, "do the thing");
        task.criteria = vec![criterion.into()];
        task
    }

    #[tokio::test]
    async fn test_containment_criterion() {
        let verifier = Verifier::heuristic();
        let task = task_with_criterion("must contain the word FOO");

        let verdict = verifier
            .verify(&task, &artifact("t1", "bar", 0), 1)
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert!(verdict.repair.is_some());

        let verdict = verifier
            .verify(&task, &artifact("t1", "bar FOO", 1), 0)
            .await
            .unwrap();
        assert!(verdict.passed);
        assert!(verdict.repair.is_none());
    }

    #[tokio::test]
    async fn test_refusal_is_fatal() {
        let verifier = Verifier::heuristic();
        let task = TaskNode::new("t1", TaskKind::General, "help");
        let verdict = verifier
            .verify(&task, &artifact("t1", "I cannot help with that", 0), 0)
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert!(verdict
            .failure_reasons
            .iter()
            .any(|r| r.contains("refusal")));
    }

    #[tokio::test]
    async fn test_empty_output_is_fatal() {
        let verifier = Verifier::heuristic();
        let task = TaskNode::new("t1", TaskKind::General, "help");
        let verdict = verifier
            .verify(&task, &artifact("t1", "   ", 0), 0)
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.75);
    }

    #[tokio::test]
    async fn test_short_answer_passes_for_answer_kinds() {
        let verifier = Verifier::heuristic();
        let task = TaskNode::new("t1", TaskKind::General, "What is 2+2?");
        let verdict = verifier
            .verify(&task, &artifact("t1", "4", 0), 1)
            .await
            .unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.score, 1.0);
    }

    #[tokio::test]
    async fn test_repair_directive_shape() {
        let verifier = Verifier::heuristic();
        let task = task_with_criterion("must contain the word FOO");
        let rejected = artifact("t1", "bar", 0);
        let verdict = verifier.verify(&task, &rejected, 1).await.unwrap();

        let directive = verdict.repair.unwrap();
        assert_eq!(directive.node.id, "t1.repair1");
        assert_eq!(directive.node.inputs, vec!["t1"]);
        assert_eq!(directive.node.criteria, task.criteria);
        assert_eq!(directive.node.repair_budget, 0);
        assert_eq!(directive.rejected_artifact_id, rejected.artifact_id);
        assert!(directive.node.prompt.contains("prior attempt"));
        assert!(directive.node.prompt.contains("bar"));
    }

    #[tokio::test]
    async fn test_no_directive_without_budget() {
        let verifier = Verifier::heuristic();
        let task = task_with_criterion("must contain the word FOO");
        let verdict = verifier
            .verify(&task, &artifact("t1", "bar", 0), 0)
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert!(verdict.repair.is_none());
    }

    #[tokio::test]
    async fn test_llm_rubric_consults_provider() {
        let stub = StubProvider::new("stub");
        stub.push_reply("judge", "NO");
        stub.push_reply("judge", "YES");
        let verifier = Verifier::with_llm_rubric(Arc::new(stub), "judge");
        let task = task_with_criterion("response is polite");

        let verdict = verifier
            .verify(&task, &artifact("t1", "whatever", 0), 0)
            .await
            .unwrap();
        assert!(!verdict.passed);

        let verdict = verifier
            .verify(&task, &artifact("t1", "thank you kindly", 1), 0)
            .await
            .unwrap();
        assert!(verdict.passed);
    }
}

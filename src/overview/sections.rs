//! Bounded section generation.
//!
//! Every section of an outline becomes one required content task, plus one
//! optional diagram task when diagrams are on. All tasks go through a single
//! pool of `K` workers: a task takes a permit before it is spawned, in
//! submission order, so queued tasks start first-in first-out as soon as a
//! worker frees up.
//!
//! A failed required task fails the whole phase and aborts the rest. A
//! failed optional task is logged and leaves its field empty.

use std::collections::HashMap;
use std::sync::Arc;

use condense_common::{
    Citation, ConversationInput, Diagram, GeneratedSection, Importance, Outline, OutlineSection,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{GenerationError, OverviewError};
use crate::generation::{Generation, GenerationFacade, GenerationRequest, ModelRole};
use crate::overview::OverviewSettings;
use crate::overview::relevance::{RelevanceIndex, render_excerpts};
use crate::parse::{extract_fenced_blocks, extract_optional_tag, parse_index_list};
use crate::tokens::TokenEstimator;

/// Whether a task's failure may fail the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Required,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Content,
    Diagram,
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub struct SectionTask {
    /// Position of the owning section in the outline.
    pub order: usize,
    pub section_id: String,
    pub kind: TaskKind,
    pub requirement: Requirement,
    pub request: GenerationRequest,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub order: usize,
    pub section_id: String,
    pub kind: TaskKind,
    pub requirement: Requirement,
    pub result: Result<Generation, GenerationError>,
}

/// Runs section tasks with at most `limit` generation calls in flight.
pub struct BoundedSectionGenerator {
    facade: Arc<GenerationFacade>,
    limit: usize,
}

impl BoundedSectionGenerator {
    pub fn new(facade: Arc<GenerationFacade>, limit: usize) -> Self {
        Self {
            facade,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run every task and return the successful outcomes in submission
    /// order, or the first required failure.
    ///
    /// `on_done` sees each finished task as it completes.
    pub async fn run<F>(
        &self,
        tasks: Vec<SectionTask>,
        cancel: &CancellationToken,
        mut on_done: F,
    ) -> Result<Vec<TaskOutcome>, OverviewError>
    where
        F: FnMut(&TaskOutcome),
    {
        let total = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, TaskOutcome)>(total.max(1));
        // Child token: aborting the phase must not cancel the caller's token.
        let abort = cancel.child_token();
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(total);

        for (slot, task) in tasks.into_iter().enumerate() {
            if abort.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                _ = abort.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| OverviewError::Worker(e.to_string()))?
                }
            };

            let facade = self.facade.clone();
            let result_tx = result_tx.clone();
            let abort = abort.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let request = task.request.with_cancellation(abort.clone());
                let result = facade.generate(&request).await;
                if result.is_err() && task.requirement == Requirement::Required {
                    abort.cancel();
                }
                let outcome = TaskOutcome {
                    order: task.order,
                    section_id: task.section_id,
                    kind: task.kind,
                    requirement: task.requirement,
                    result,
                };
                result_tx.send((slot, outcome)).await.ok();
            }));
        }
        drop(result_tx);

        let mut finished: Vec<(usize, TaskOutcome)> = Vec::with_capacity(total);
        let mut failure: Option<OverviewError> = None;

        while let Some((slot, outcome)) = result_rx.recv().await {
            on_done(&outcome);
            if outcome.result.is_ok() {
                finished.push((slot, outcome));
                continue;
            }
            let TaskOutcome {
                section_id,
                kind,
                requirement,
                result,
                ..
            } = outcome;
            let Err(err) = result else {
                continue;
            };
            match requirement {
                Requirement::Optional => {
                    warn!(
                        section = %section_id,
                        kind = ?kind,
                        error = %err,
                        "Optional section task failed, continuing without it"
                    );
                }
                // Tasks cut short by the abort are not the cause.
                Requirement::Required if err.is_cancelled() => {}
                Requirement::Required => {
                    if failure.is_none() {
                        warn!(section = %section_id, error = %err, "Section generation failed");
                        failure = Some(OverviewError::Section {
                            section_id,
                            source: Box::new(OverviewError::Generation(err)),
                        });
                    }
                }
            }
        }

        for handle in handles {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                abort.cancel();
                return Err(OverviewError::Worker(err.to_string()));
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled.into());
        }

        finished.sort_by_key(|(slot, _)| *slot);
        Ok(finished.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

pub const SECTION_SYSTEM_PROMPT: &str = "You write one section of a structured overview of an \
AI-assistant conversation. Be concrete: keep code identifiers, file paths, commands and decisions \
exactly as they appear. Never invent facts that are not in the excerpts.";

fn content_prompt(outline: &Outline, section: &OutlineSection, excerpts: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Overview: {}\n", outline.title));
    if !outline.summary.is_empty() {
        prompt.push_str(&format!("Summary: {}\n", outline.summary));
    }
    prompt.push_str(&format!(
        "\nWrite the section \"{}\" ({}). {}\n\n",
        section.title, section.section_type, section.description
    ));
    prompt.push_str(
        "Answer with the section body in markdown inside <content></content>, then the numbers \
         of the turns you relied on inside <citations></citations>, e.g. <citations>[2, 5]</citations>.\n\n",
    );
    prompt.push_str("<excerpts>\n");
    prompt.push_str(excerpts);
    prompt.push_str("</excerpts>");
    prompt
}

fn diagram_prompt(section: &OutlineSection, excerpts: &str) -> String {
    format!(
        "Draw one mermaid diagram (flowchart or sequence diagram) for the section \"{}\": {}\n\
         Answer with a single ```mermaid fenced block and nothing else.\n\n<excerpts>\n{}</excerpts>",
        section.title, section.description, excerpts
    )
}

/// Turn an outline into pool tasks. Low-importance sections get no diagram.
pub fn plan_tasks(
    input: &ConversationInput,
    outline: &Outline,
    settings: &OverviewSettings,
    diagrams: bool,
    estimator: &TokenEstimator,
) -> Vec<SectionTask> {
    let index = RelevanceIndex::new(outline);
    let mut tasks = Vec::new();

    for (order, section) in outline.sections.iter().enumerate() {
        let budget = settings.budgets.for_importance(section.importance);
        let excerpts = render_excerpts(&index.select(&input.turns, section, budget, estimator));

        let base = |prompt: String, role: ModelRole, feature: &str| {
            GenerationRequest::text(prompt)
                .with_system(SECTION_SYSTEM_PROMPT)
                .with_role(role)
                .with_temperature(settings.temperature)
                .with_max_output_tokens(settings.max_output_tokens)
                .with_policy(&settings.retry)
                .with_feature(feature, Some(input.conversation_id.clone()))
        };

        tasks.push(SectionTask {
            order,
            section_id: section.id.clone(),
            kind: TaskKind::Content,
            requirement: Requirement::Required,
            request: base(
                content_prompt(outline, section, &excerpts),
                ModelRole::Section,
                "overview_section",
            ),
        });

        if diagrams && section.importance != Importance::Low {
            tasks.push(SectionTask {
                order,
                section_id: section.id.clone(),
                kind: TaskKind::Diagram,
                requirement: Requirement::Optional,
                request: base(
                    diagram_prompt(section, &excerpts),
                    ModelRole::Diagram,
                    "overview_diagram",
                ),
            });
        }
    }

    debug!(sections = outline.sections.len(), tasks = tasks.len(), "Planned section tasks");
    tasks
}

/// Parse a content response. Missing tags fall back to the whole text.
fn parse_content(text: &str, turn_count: usize) -> (String, Vec<Citation>) {
    let content = extract_optional_tag(text, "content").unwrap_or_else(|| text.trim().to_string());
    let citations = extract_optional_tag(text, "citations")
        .map(|list| parse_index_list(&list))
        .unwrap_or_default()
        .into_iter()
        .filter(|&i| i < turn_count)
        .map(|turn_index| Citation {
            turn_index,
            excerpt: None,
        })
        .collect();
    (content, citations)
}

/// Join finished tasks back onto their outline sections, sorted by `order`.
pub fn assemble(
    outline: &Outline,
    outcomes: Vec<TaskOutcome>,
    turn_count: usize,
    estimator: &TokenEstimator,
) -> Result<Vec<GeneratedSection>, OverviewError> {
    let mut contents: HashMap<usize, String> = HashMap::new();
    let mut diagrams: HashMap<usize, Vec<Diagram>> = HashMap::new();

    for outcome in outcomes {
        let Ok(generation) = outcome.result else {
            continue;
        };
        match outcome.kind {
            TaskKind::Content => {
                contents.insert(outcome.order, generation.content);
            }
            TaskKind::Diagram => {
                let blocks = extract_fenced_blocks(&generation.content, "mermaid");
                diagrams.entry(outcome.order).or_default().extend(
                    blocks.into_iter().map(|source| Diagram {
                        kind: "mermaid".to_string(),
                        source,
                    }),
                );
            }
        }
    }

    let mut sections = Vec::with_capacity(outline.sections.len());
    for (order, section) in outline.sections.iter().enumerate() {
        let raw = contents
            .remove(&order)
            .ok_or_else(|| OverviewError::Section {
                section_id: section.id.clone(),
                source: Box::new(OverviewError::Worker("no content produced".to_string())),
            })?;
        let (content, citations) = parse_content(&raw, turn_count);
        let token_count = estimator.estimate(&content);
        sections.push(GeneratedSection {
            outline: section.clone(),
            content,
            diagrams: diagrams.remove(&order).unwrap_or_default(),
            citations,
            token_count,
            order,
        });
    }
    sections.sort_by_key(|s| s.order);

    info!(
        sections = sections.len(),
        diagrams = sections.iter().map(|s| s.diagrams.len()).sum::<usize>(),
        "Sections assembled"
    );
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use condense_common::Turn;

    use crate::generation::RetryPolicy;
    use crate::generation::testing::{Reply, ScriptedProvider, scripted_facade};

    fn settings() -> OverviewSettings {
        OverviewSettings {
            retry: RetryPolicy {
                budget: 1,
                delay_base: Duration::from_millis(1),
                attempt_timeout: Duration::from_secs(5),
            },
            ..OverviewSettings::default()
        }
    }

    fn outline(count: usize) -> Outline {
        Outline {
            title: "Overview".into(),
            summary: "A conversation.".into(),
            sections: (0..count)
                .map(|i| OutlineSection {
                    id: format!("s{}", i),
                    title: format!("Section {}", i),
                    section_type: "topic".into(),
                    description: format!("About part {}", i),
                    importance: if i % 3 == 2 { Importance::Low } else { Importance::High },
                    relevant_turn_indices: vec![i % 4],
                })
                .collect(),
        }
    }

    fn input() -> ConversationInput {
        ConversationInput::new(
            "ws",
            "conv",
            (0..4).map(|i| Turn::user(format!("turn {}", i))).collect(),
        )
    }

    /// Content replies echo the section title so assembly can be checked.
    fn echo_provider() -> ScriptedProvider {
        let provider = ScriptedProvider::new("alpha");
        provider.respond_with(|call| {
            let prompt = call.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let title = prompt
                .split('"')
                .nth(1)
                .unwrap_or("unknown")
                .to_string();
            if prompt.contains("mermaid") {
                Reply::text(format!("```mermaid\ngraph TD; A-->B\n```\n{}", title))
            } else {
                Reply::text(format!("<content>Body of {}</content><citations>[1, 3, 42]</citations>", title))
            }
        });
        provider
    }

    async fn generate(
        provider: &ScriptedProvider,
        outline: &Outline,
        limit: usize,
        diagrams: bool,
    ) -> Result<Vec<GeneratedSection>, OverviewError> {
        let (facade, _) = scripted_facade(&[provider.clone()]);
        let generator = BoundedSectionGenerator::new(Arc::new(facade), limit);
        let estimator = TokenEstimator::default();
        let input = input();
        let tasks = plan_tasks(&input, outline, &settings(), diagrams, &estimator);
        let outcomes = generator
            .run(tasks, &CancellationToken::new(), |_| {})
            .await?;
        assemble(outline, outcomes, input.turns.len(), &estimator)
    }

    #[tokio::test]
    async fn test_nine_sections_never_exceed_three_in_flight() {
        let provider = echo_provider();
        provider.with_delay(Duration::from_millis(20));
        let outline = outline(9);

        let sections = generate(&provider, &outline, 3, false).await.unwrap();
        assert_eq!(provider.calls(), 9);
        assert!(provider.max_in_flight() <= 3, "in flight: {}", provider.max_in_flight());
        assert_eq!(provider.max_in_flight(), 3);
        assert_eq!(sections.len(), 9);
        for (i, section) in sections.iter().enumerate() {
            assert_eq!(section.order, i);
            assert_eq!(section.outline.id, format!("s{}", i));
            assert_eq!(section.content, format!("Body of Section {}", i));
        }
    }

    #[tokio::test]
    async fn test_citations_are_parsed_and_bounded() {
        let provider = echo_provider();
        let sections = generate(&provider, &outline(1), 2, false).await.unwrap();
        let turns: Vec<usize> = sections[0].citations.iter().map(|c| c.turn_index).collect();
        assert_eq!(turns, vec![1, 3]);
        assert!(sections[0].token_count > 0);
    }

    #[tokio::test]
    async fn test_diagrams_skip_low_importance_sections() {
        let provider = echo_provider();
        let sections = generate(&provider, &outline(3), 3, true).await.unwrap();
        // Sections 0 and 1 are high importance, 2 is low.
        assert_eq!(provider.calls(), 5);
        assert_eq!(sections[0].diagrams.len(), 1);
        assert_eq!(sections[0].diagrams[0].kind, "mermaid");
        assert_eq!(sections[0].diagrams[0].source, "graph TD; A-->B");
        assert_eq!(sections[1].diagrams.len(), 1);
        assert!(sections[2].diagrams.is_empty());
    }

    #[tokio::test]
    async fn test_optional_failure_is_swallowed() {
        let provider = ScriptedProvider::new("alpha");
        provider.respond_with(|call| {
            let prompt = call.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if prompt.contains("mermaid") {
                Reply::server_error()
            } else {
                Reply::text("<content>fine</content>")
            }
        });
        let sections = generate(&provider, &outline(2), 2, true).await.unwrap();
        assert_eq!(sections.len(), 2);
        assert!(sections.iter().all(|s| s.diagrams.is_empty()));
        assert!(sections.iter().all(|s| s.content == "fine"));
        assert!(sections.iter().all(|s| s.citations.is_empty()));
    }

    #[tokio::test]
    async fn test_required_failure_fails_the_phase() {
        let provider = ScriptedProvider::new("alpha");
        provider.respond_with(|call| {
            let prompt = call.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if prompt.contains("\"Section 4\"") && !prompt.contains("mermaid") {
                Reply::server_error()
            } else {
                Reply::text("<content>fine</content>")
            }
        });
        let err = generate(&provider, &outline(6), 2, false).await.unwrap_err();
        match err {
            OverviewError::Section { section_id, .. } => assert_eq!(section_id, "s4"),
            other => panic!("expected Section error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queued_tasks_start_in_submission_order() {
        let provider = echo_provider();
        provider.with_delay(Duration::from_millis(5));
        let outline = outline(6);
        generate(&provider, &outline, 1, false).await.unwrap();

        let order: Vec<String> = provider
            .prompts()
            .iter()
            .map(|p| p.split('"').nth(1).unwrap_or_default().to_string())
            .collect();
        let expected: Vec<String> = (0..6).map(|i| format!("Section {}", i)).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_parse_content_without_tags_uses_whole_text() {
        let (content, citations) = parse_content("  just prose  ", 10);
        assert_eq!(content, "just prose");
        assert!(citations.is_empty());
    }

    #[test]
    fn test_plan_tasks_marks_requirements() {
        let estimator = TokenEstimator::default();
        let tasks = plan_tasks(&input(), &outline(3), &settings(), true, &estimator);
        let kinds: Vec<(usize, TaskKind, Requirement)> =
            tasks.iter().map(|t| (t.order, t.kind, t.requirement)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, TaskKind::Content, Requirement::Required),
                (0, TaskKind::Diagram, Requirement::Optional),
                (1, TaskKind::Content, Requirement::Required),
                (1, TaskKind::Diagram, Requirement::Optional),
                (2, TaskKind::Content, Requirement::Required),
            ]
        );
    }
}

//! Turns a natural-language request into a [`WorkflowPlan`].
//!
//! The heuristic decomposer splits the request into clauses, maps each clause
//! to a specialty through keyword tables and wires dependencies by stage:
//! gathering, then analysis and design, then building, then writing, then
//! review. Sequencing connectors ("then", "after that", "finally") force a
//! dependency on the preceding sub-task.

use crate::graph::TaskGraph;
use crate::types::{ComplexityTier, SubTask, WorkflowPlan, WorkflowStatus};
use async_trait::async_trait;
use chrono::Utc;
use maestro_core::{DecompositionReason, MaestroError, MaestroResult, Priority, Specialty};
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// Anything that can turn a request into a plan.
#[async_trait]
pub trait Decompose: Send + Sync {
    /// Turn a request into a validated plan.
    async fn decompose(&self, request: &str) -> MaestroResult<WorkflowPlan>;
}

/// Keyword tables. A leading `=` means the word must match exactly,
/// otherwise the keyword is a prefix.
const KEYWORDS: &[(Stage, &[&str])] = &[
    (
        Stage::Research,
        &[
            "research", "investigat", "search", "explor", "gather", "survey", "discover",
            "scout", "=find", "=finds", "=look", "=study", "=learn", "=sources", "=cite",
        ],
    ),
    (
        Stage::Data,
        &[
            "data", "scrap", "extract", "ingest", "spreadsheet", "aggregat", "=etl", "=csv",
            "=sql", "=query", "=queries", "=collect", "=clean", "=import", "=export",
        ],
    ),
    (
        Stage::Analysis,
        &[
            "analy", "compar", "evaluat", "assess", "interpret", "benchmark", "measur",
            "examin", "statistic", "forecast", "insight", "quantif", "=trend", "=trends",
        ],
    ),
    (
        Stage::Design,
        &[
            "design", "architect", "wirefram", "prototyp", "diagram", "blueprint", "mockup",
            "schema", "=plan", "=plans", "=planning",
        ],
    ),
    (
        Stage::Coding,
        &[
            "implement", "refactor", "debug", "deploy", "compil", "programm", "endpoint",
            "=code", "=coding", "=program", "=script", "=scripts", "=function", "=functions",
            "=api", "=apis", "=build", "=develop", "=fix", "=test", "=tests", "=library",
            "=module", "=app", "=application", "=cli", "=frontend", "=backend",
        ],
    ),
    (
        Stage::Writing,
        &[
            "draft", "summar", "document", "compos", "article", "paragraph", "describ",
            "proposal", "narrat", "=write", "=writes", "=writing", "=written", "=report",
            "=reports", "=essay", "=blog", "=explain", "=email", "=memo", "=translate",
        ],
    ),
    (
        Stage::Review,
        &[
            "review", "proofread", "audit", "validat", "critiqu", "fact-check", "=verify",
            "=check", "=approve", "=qa", "=edit", "=polish",
        ],
    ),
];

/// Words that signal organisation-scale work.
const SCALE_KEYWORDS: &[&str] = &[
    "enterprise",
    "organization-wide",
    "company-wide",
    "large-scale",
    "platform",
    "migration",
    "end-to-end",
    "comprehensive",
    "multi-team",
    "global",
    "production",
    "scalable",
    "distributed",
    "compliance",
];

const GENERIC_WRITE_VERBS: &[&str] = &["write", "writes", "writing", "written"];

/// Pipeline position of a specialty, used to infer dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Research,
    Data,
    Analysis,
    Design,
    Coding,
    Writing,
    Review,
}

impl Stage {
    fn rank(self) -> u8 {
        match self {
            Stage::Research | Stage::Data => 0,
            Stage::Analysis | Stage::Design => 1,
            Stage::Coding => 2,
            Stage::Writing => 3,
            Stage::Review => 4,
        }
    }

    fn specialty(self) -> Specialty {
        match self {
            Stage::Research => Specialty::Research,
            Stage::Data => Specialty::Data,
            Stage::Analysis => Specialty::Analysis,
            Stage::Design => Specialty::Design,
            Stage::Coding => Specialty::Coding,
            Stage::Writing => Specialty::Writing,
            Stage::Review => Specialty::Review,
        }
    }

    /// Base effort in hours for a simple request.
    fn base_hours(self) -> f64 {
        match self {
            Stage::Research | Stage::Data => 2.0,
            Stage::Analysis | Stage::Design => 3.0,
            Stage::Coding => 6.0,
            Stage::Writing => 1.5,
            Stage::Review => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Clause {
    text: String,
    /// Preceded by "then", "after that", "afterwards" or "finally".
    sequenced: bool,
    stage: Option<Stage>,
    scale_hits: usize,
    words: usize,
}

#[derive(Debug, Clone)]
struct Draft {
    text: String,
    stage: Stage,
    sequenced: bool,
}

/// Keyword-driven decomposer.
pub struct HeuristicDecomposer {
    hourly_rate: f64,
    sentence_re: Regex,
    separator_re: Regex,
    word_re: Regex,
}

impl HeuristicDecomposer {
    /// Build a decomposer that prices estimates at `hourly_rate`.
    pub fn new(hourly_rate: f64) -> MaestroResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| MaestroError::Config(format!("invalid decomposer pattern: {e}")))
        };
        Ok(Self {
            hourly_rate,
            sentence_re: compile(r"[.!?\n]+\s*")?,
            separator_re: compile(
                r"(?i)\s*(?:[,;:]|\band then\b|\bafter that\b|\bafterwards\b|\bthen\b|\bfinally\b|\band\b)\s*",
            )?,
            word_re: compile(r"[A-Za-z][A-Za-z0-9'-]*")?,
        })
    }

    /// Heuristic tier and a confidence in `[0.5, 0.95]`.
    pub fn classify_complexity(&self, request: &str) -> (ComplexityTier, f64) {
        let clauses = self.split_clauses(request);
        self.classify_clauses(&clauses)
    }

    /// Specialties needed for the request, including oversight review for
    /// complex and enterprise tiers.
    pub fn identify_specialists(
        &self,
        request: &str,
        tier: ComplexityTier,
    ) -> MaestroResult<BTreeSet<Specialty>> {
        let clauses = self.split_clauses(request);
        let mut specialties: BTreeSet<Specialty> = clauses
            .iter()
            .filter_map(|c| c.stage.map(Stage::specialty))
            .collect();
        if specialties.is_empty() {
            return Err(MaestroError::Decomposition(DecompositionReason::NoSpecialists));
        }
        if tier.needs_oversight() {
            specialties.insert(Specialty::Review);
        }
        Ok(specialties)
    }

    /// Validate the dependency relation of a set of sub-tasks.
    pub fn build_dependency_graph(&self, subtasks: &[SubTask]) -> MaestroResult<TaskGraph> {
        TaskGraph::build(subtasks)
    }

    /// Hours along the critical path and their cost at the hourly rate.
    pub fn estimate_resources(&self, subtasks: &[SubTask]) -> MaestroResult<(f64, f64)> {
        let graph = TaskGraph::build(subtasks)?;
        let (_, hours) = graph.critical_path();
        Ok((hours, hours * self.hourly_rate))
    }

    fn plan_request(&self, request: &str) -> MaestroResult<WorkflowPlan> {
        let trimmed = request.trim();
        if trimmed.is_empty() {
            return Err(MaestroError::Decomposition(DecompositionReason::EmptyRequest));
        }
        if !self.is_intelligible(trimmed) {
            return Err(MaestroError::Decomposition(DecompositionReason::Unintelligible));
        }

        let clauses = self.split_clauses(trimmed);
        let (tier, confidence) = self.classify_clauses(&clauses);
        let mut drafts = merge_clauses(&clauses);
        if drafts.is_empty() {
            return Err(MaestroError::Decomposition(DecompositionReason::NoSpecialists));
        }

        let oversight = tier.needs_oversight() && !drafts.iter().any(|d| d.stage == Stage::Review);
        if oversight {
            drafts.push(Draft {
                text: format!("Review the combined output for: {trimmed}"),
                stage: Stage::Review,
                sequenced: false,
            });
        }

        let uncertainty = 1.0 + (1.0 - confidence) * 0.5;
        let mut subtasks: Vec<SubTask> = drafts
            .iter()
            .map(|d| {
                let hours = d.stage.base_hours() * tier.effort_multiplier() * uncertainty;
                SubTask::new(capitalize(&d.text), d.stage.specialty(), round2(hours))
            })
            .collect();

        let ids: Vec<Uuid> = subtasks.iter().map(|t| t.id).collect();
        for i in 0..drafts.len() {
            let deps = if oversight && i == drafts.len() - 1 {
                sink_indices(&drafts[..i], &subtasks[..i])
            } else {
                stage_dependencies(&drafts, i)
            };
            subtasks[i].dependencies = deps.into_iter().map(|j| ids[j]).collect();
        }

        let graph = self.build_dependency_graph(&subtasks)?;
        let (critical_path, hours) = graph.critical_path();
        for task in &mut subtasks {
            if critical_path.contains(&task.id) {
                task.critical = true;
                task.priority = Priority::High;
            }
        }

        let order = graph.topological_order().to_vec();
        subtasks.sort_by_key(|t| order.iter().position(|id| *id == t.id));

        let required_specialties = subtasks.iter().map(|t| t.specialty.clone()).collect();
        let plan = WorkflowPlan {
            id: Uuid::new_v4(),
            request: request.to_string(),
            tier,
            confidence,
            subtasks,
            required_specialties,
            critical_path,
            estimated_hours: round2(hours),
            estimated_cost: round2(hours * self.hourly_rate),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
        };
        debug!(
            plan_id = %plan.id,
            tier = %plan.tier,
            subtasks = plan.subtasks.len(),
            hours = plan.estimated_hours,
            "Request decomposed"
        );
        Ok(plan)
    }

    /// At least one word of two or more letters with a vowel.
    fn is_intelligible(&self, request: &str) -> bool {
        self.word_re.find_iter(request).any(|m| {
            let word = m.as_str().to_lowercase();
            word.chars().filter(char::is_ascii_alphabetic).count() >= 2
                && word.chars().any(|c| "aeiouy".contains(c))
        })
    }

    fn split_clauses(&self, request: &str) -> Vec<Clause> {
        let mut clauses = Vec::new();
        for sentence in self.sentence_re.split(request) {
            let mut cursor = 0;
            let mut sequenced = false;
            for sep in self.separator_re.find_iter(sentence) {
                self.push_clause(&mut clauses, &sentence[cursor..sep.start()], &mut sequenced);
                sequenced |= is_sequencing(sep.as_str());
                cursor = sep.end();
            }
            self.push_clause(&mut clauses, &sentence[cursor..], &mut sequenced);
        }
        clauses
    }

    fn push_clause(&self, clauses: &mut Vec<Clause>, text: &str, sequenced: &mut bool) {
        let text = text.trim();
        if text.is_empty() {
            // keep the connector for the next non-empty clause
            return;
        }
        let words: Vec<String> = self
            .word_re
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        clauses.push(Clause {
            text: text.to_string(),
            sequenced: *sequenced,
            stage: detect_stage(&words),
            scale_hits: words
                .iter()
                .filter(|w| SCALE_KEYWORDS.contains(&w.as_str()))
                .count(),
            words: words.len(),
        });
        *sequenced = false;
    }

    fn classify_clauses(&self, clauses: &[Clause]) -> (ComplexityTier, f64) {
        let words: usize = clauses.iter().map(|c| c.words).sum();
        let matched = clauses.iter().filter(|c| c.stage.is_some()).count();
        let distinct: BTreeSet<Stage> = clauses.iter().filter_map(|c| c.stage).collect();
        let scale: usize = clauses.iter().map(|c| c.scale_hits).sum();

        let mut score = 0usize;
        score += [15, 40, 100].iter().filter(|limit| words > **limit).count();
        score += [3, 5].iter().filter(|limit| matched >= **limit).count();
        score += [3, 5].iter().filter(|limit| distinct.len() >= **limit).count();
        score += scale.min(2);

        let tier = match score {
            0..=1 => ComplexityTier::Simple,
            2..=3 => ComplexityTier::Moderate,
            4..=5 => ComplexityTier::Complex,
            _ => ComplexityTier::Enterprise,
        };
        let confidence = if clauses.is_empty() {
            0.5
        } else {
            0.5 + 0.45 * matched as f64 / clauses.len() as f64
        };
        (tier, round2(confidence))
    }
}

#[async_trait]
impl Decompose for HeuristicDecomposer {
    async fn decompose(&self, request: &str) -> MaestroResult<WorkflowPlan> {
        self.plan_request(request)
    }
}

fn is_sequencing(separator: &str) -> bool {
    let sep = separator.to_lowercase();
    ["then", "after that", "afterwards", "finally"]
        .iter()
        .any(|kw| sep.contains(kw))
}

fn keyword_matches(keyword: &str, word: &str) -> bool {
    match keyword.strip_prefix('=') {
        Some(exact) => word == exact,
        None => word.starts_with(keyword),
    }
}

/// The earliest keyword in the clause decides its stage. A generic "write"
/// yields to coding vocabulary in the same clause ("write a test suite").
fn detect_stage(words: &[String]) -> Option<Stage> {
    let mut earliest: Option<(usize, Stage, &str)> = None;
    let mut has_coding = false;
    for (pos, word) in words.iter().enumerate() {
        for (stage, keywords) in KEYWORDS {
            if keywords.iter().any(|kw| keyword_matches(kw, word)) {
                if *stage == Stage::Coding {
                    has_coding = true;
                }
                if earliest.is_none() {
                    earliest = Some((pos, *stage, word.as_str()));
                }
            }
        }
    }
    let (_, stage, word) = earliest?;
    if stage == Stage::Writing && has_coding && GENERIC_WRITE_VERBS.contains(&word) {
        return Some(Stage::Coding);
    }
    Some(stage)
}

/// Clauses without a keyword extend the previous sub-task, or the next one
/// when they lead the request.
fn merge_clauses(clauses: &[Clause]) -> Vec<Draft> {
    let mut drafts: Vec<Draft> = Vec::new();
    let mut prefix: Vec<&str> = Vec::new();
    for clause in clauses {
        match clause.stage {
            Some(stage) => {
                let mut text = prefix.join(", ");
                if !text.is_empty() {
                    text.push_str(", ");
                }
                text.push_str(&clause.text);
                prefix.clear();
                drafts.push(Draft {
                    text,
                    stage,
                    sequenced: clause.sequenced,
                });
            }
            None => match drafts.last_mut() {
                Some(last) => {
                    last.text.push_str(" and ");
                    last.text.push_str(&clause.text);
                }
                None => prefix.push(&clause.text),
            },
        }
    }
    drafts
}

/// Depend on every earlier draft of the closest earlier stage, plus the
/// immediately preceding draft when sequenced. Edges only point backwards,
/// so the result is acyclic.
fn stage_dependencies(drafts: &[Draft], i: usize) -> Vec<usize> {
    let rank = drafts[i].stage.rank();
    let closest = drafts[..i]
        .iter()
        .map(|d| d.stage.rank())
        .filter(|r| *r < rank)
        .max();
    let mut deps: Vec<usize> = match closest {
        Some(c) => (0..i).filter(|j| drafts[*j].stage.rank() == c).collect(),
        None => Vec::new(),
    };
    if drafts[i].sequenced && i > 0 && !deps.contains(&(i - 1)) {
        deps.push(i - 1);
    }
    deps
}

/// Drafts nothing else depends on.
fn sink_indices(drafts: &[Draft], subtasks: &[SubTask]) -> Vec<usize> {
    (0..drafts.len())
        .filter(|j| {
            let id = subtasks[*j].id;
            !subtasks.iter().any(|t| t.dependencies.contains(&id))
        })
        .collect()
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn decomposer() -> HeuristicDecomposer {
        HeuristicDecomposer::new(50.0).unwrap()
    }

    #[tokio::test]
    async fn test_research_then_write_summary() {
        let plan = decomposer()
            .decompose("Research X and write a two-paragraph summary")
            .await
            .unwrap();

        assert_eq!(plan.subtasks.len(), 2);
        let research = &plan.subtasks[0];
        let writing = &plan.subtasks[1];
        assert_eq!(research.specialty, Specialty::Research);
        assert_eq!(writing.specialty, Specialty::Writing);
        assert_eq!(writing.dependencies, vec![research.id]);
        assert!(research.dependencies.is_empty());
        assert_eq!(plan.tier, ComplexityTier::Simple);
        assert_eq!(plan.critical_path, vec![research.id, writing.id]);
    }

    #[tokio::test]
    async fn test_empty_and_whitespace_rejected() {
        for request in ["", "   \n\t"] {
            let err = decomposer().decompose(request).await.unwrap_err();
            assert!(matches!(
                err,
                MaestroError::Decomposition(DecompositionReason::EmptyRequest)
            ));
        }
    }

    #[tokio::test]
    async fn test_unintelligible_rejected() {
        for request in ["%%% $$$ ???", "12 34 56", "xkcd brrr"] {
            let err = decomposer().decompose(request).await.unwrap_err();
            assert_eq!(err.to_string(), "Decomposition error: unintelligible", "{request}");
        }
    }

    #[tokio::test]
    async fn test_no_specialists_rejected() {
        let err = decomposer().decompose("hello there my friend").await.unwrap_err();
        assert!(matches!(
            err,
            MaestroError::Decomposition(DecompositionReason::NoSpecialists)
        ));
    }

    #[tokio::test]
    async fn test_independent_research_clauses_run_in_parallel() {
        let plan = decomposer()
            .decompose("Research cats; research dogs; research birds")
            .await
            .unwrap();
        assert_eq!(plan.subtasks.len(), 3);
        assert!(plan.subtasks.iter().all(|t| t.dependencies.is_empty()));
        // critical path of independent tasks is a single task
        assert!((plan.estimated_hours - plan.subtasks[0].estimated_hours).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_then_forces_sequence() {
        let plan = decomposer()
            .decompose("Write a blog post, then research reader reactions")
            .await
            .unwrap();
        assert_eq!(plan.subtasks.len(), 2);
        let write = plan.subtasks.iter().find(|t| t.specialty == Specialty::Writing).unwrap();
        let research = plan.subtasks.iter().find(|t| t.specialty == Specialty::Research).unwrap();
        assert_eq!(research.dependencies, vec![write.id]);
        // topological order puts the writer first
        assert_eq!(plan.subtasks[0].id, write.id);
    }

    #[tokio::test]
    async fn test_keywordless_clause_merges_into_previous() {
        let plan = decomposer()
            .decompose("Research cats and dogs and write a summary")
            .await
            .unwrap();
        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.subtasks[0].description, "Research cats and dogs");
    }

    #[tokio::test]
    async fn test_write_code_is_coding() {
        let plan = decomposer()
            .decompose("Design the schema, then write the API endpoint")
            .await
            .unwrap();
        let specialties: Vec<&Specialty> = plan.subtasks.iter().map(|t| &t.specialty).collect();
        assert_eq!(specialties, vec![&Specialty::Design, &Specialty::Coding]);
    }

    #[tokio::test]
    async fn test_complex_request_gets_oversight_review() {
        let request = "Research the enterprise platform migration options, collect the usage data, \
                       analyze costs, design the target architecture, implement the migration scripts, \
                       and finally document the rollout plan for production";
        let d = decomposer();
        let (tier, _) = d.classify_complexity(request);
        assert!(tier >= ComplexityTier::Complex);

        let plan = d.decompose(request).await.unwrap();
        assert!(plan.required_specialties.contains(&Specialty::Review));
        let review = plan.subtasks.last().unwrap();
        assert_eq!(review.specialty, Specialty::Review);
        assert!(!review.dependencies.is_empty());
        assert!(TaskGraph::build(&plan.subtasks).is_ok());
    }

    #[test]
    fn test_identify_specialists() {
        let d = decomposer();
        let set = d
            .identify_specialists("Compare the vendors and write a memo", ComplexityTier::Simple)
            .unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![Specialty::Analysis, Specialty::Writing]
        );
        let set = d
            .identify_specialists("Compare the vendors", ComplexityTier::Enterprise)
            .unwrap();
        assert!(set.contains(&Specialty::Review));
        assert!(d.identify_specialists("nothing relevant", ComplexityTier::Simple).is_err());
    }

    #[test]
    fn test_confidence_bounds() {
        let d = decomposer();
        let (_, full) = d.classify_complexity("Research X and write a summary");
        assert!((full - 0.95).abs() < 1e-9);
        let (_, partial) = d.classify_complexity("Research X, the thing we talked about");
        assert!(partial >= 0.5 && partial < 0.95);
    }

    #[test]
    fn test_estimate_uses_critical_path() {
        let d = decomposer();
        let a = SubTask::new("a", Specialty::Research, 2.0);
        let b = SubTask::new("b", Specialty::Research, 3.0);
        let c = SubTask::new("c", Specialty::Writing, 1.0).with_dependencies(vec![a.id, b.id]);
        let (hours, cost) = d.estimate_resources(&[a, b, c]).unwrap();
        assert!((hours - 4.0).abs() < 1e-9);
        assert!((cost - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_plan_graph_always_sorts() {
        let d = decomposer();
        for request in [
            "Gather the data, analyze trends, then write a report and review it",
            "First, for the Q3 launch, research competitors",
            "Build a CLI, write tests, document it, finally audit the code",
        ] {
            let plan = d.decompose(request).await.unwrap();
            let graph = TaskGraph::build(&plan.subtasks).unwrap();
            assert_eq!(graph.len(), plan.subtasks.len());
        }
    }
}

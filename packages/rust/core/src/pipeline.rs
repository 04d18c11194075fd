//! Research pipeline: `planner → crawler → analyzer → report_generator`.
//!
//! A [`PipelineRun`] threads one [`PipelineState`] through the four stages in
//! a fixed order. Each stage returns a [`StateUpdate`] that is merged before
//! the next stage starts, and the caller pulls one [`StageSnapshot`] per
//! completed stage via [`PipelineRun::advance`]. Language model and knowledge
//! store failures end the run and surface to the caller; crawl failures never
//! do, they are recorded inside the crawl results.

use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use darkscout_crawler::{CrawlEngine, PageFetcher};
use darkscout_shared::{
    AppConfig, ChatMessage, CrawlResult, KnowledgeItem, ResearchRun, Result, RetrievedDocument,
    RunId,
};
use darkscout_storage::KnowledgeStore;

use crate::llm::LanguageModelService;

/// System instruction sent with the query to the planner.
const PLANNER_INSTRUCTION: &str = "\
You are a research agent specializing in hidden-service and dark web analysis.
Break the research query below into concrete sub-tasks that can be answered by
crawling and reading onion sites. Write one sub-task per line, in the order they
should be carried out, with no numbering, commentary, or blank lines between them.
Where a sub-task targets a specific onion site, include its address.
Favor patterns, trends, and insight over sensitive or explicit detail, and never
promote illegal activity.";

const ANALYZER_INSTRUCTION: &str = "\
Focus your analysis on identifying patterns, key insights, and relevant findings.
Organize the analysis into sections covering different aspects of the research question.
Include specific examples from the data where relevant.";

const TRUNCATION_MARKER: &str = "\n[... truncated]";

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planner,
    Crawler,
    Analyzer,
    ReportGenerator,
}

impl Stage {
    /// The sole entry stage.
    pub const ENTRY: Stage = Stage::Planner;

    /// Stage that follows this one, or `None` after the terminal stage.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Planner => Some(Stage::Crawler),
            Stage::Crawler => Some(Stage::Analyzer),
            Stage::Analyzer => Some(Stage::ReportGenerator),
            Stage::ReportGenerator => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Crawler => "crawler",
            Stage::Analyzer => "analyzer",
            Stage::ReportGenerator => "report_generator",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Record threaded through every stage of one research request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub query: String,
    /// Plan steps in planner order; never contains empty strings.
    pub plan: Vec<String>,
    /// One crawl result per plan step, in plan order.
    pub crawled_data: Vec<CrawlResult>,
    pub report: String,
    /// Conversation supplied by the caller; stages never modify it.
    pub chat_history: Vec<ChatMessage>,
}

impl PipelineState {
    pub fn new(query: impl Into<String>, chat_history: Vec<ChatMessage>) -> Self {
        Self {
            query: query.into(),
            chat_history,
            ..Default::default()
        }
    }

    /// Merge a stage's partial update; absent fields are left untouched.
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(plan) = update.plan {
            self.plan = plan;
        }
        if let Some(crawled_data) = update.crawled_data {
            self.crawled_data = crawled_data;
        }
        if let Some(report) = update.report {
            self.report = report;
        }
    }
}

/// Partial state returned by one stage.
#[derive(Debug, Default, PartialEq)]
pub struct StateUpdate {
    pub plan: Option<Vec<String>>,
    pub crawled_data: Option<Vec<CrawlResult>>,
    pub report: Option<String>,
}

/// State as it stood after `stage` completed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    pub stage: Stage,
    pub state: PipelineState,
}

/// Language model and retrieval tunables for a run.
#[derive(Debug, Clone)]
pub struct ResearchOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub retrieve_k: u32,
    /// Per-source cap on crawled text inside the analyzer prompt.
    pub max_source_chars: usize,
}

impl From<&AppConfig> for ResearchOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            retrieve_k: config.knowledge.retrieve_k,
            max_source_chars: config.knowledge.max_source_chars,
        }
    }
}

impl Default for ResearchOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a stage starts.
    fn stage_started(&self, stage: Stage);
    /// Called with the merged state after a stage completes.
    fn stage_finished(&self, snapshot: &StageSnapshot);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: Stage) {}
    fn stage_finished(&self, _snapshot: &StageSnapshot) {}
}

/// Final state and history record of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    pub run: ResearchRun,
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// One research request moving through the stages.
pub struct PipelineRun<'a, F: PageFetcher> {
    id: RunId,
    started_at: DateTime<Utc>,
    next: Option<Stage>,
    state: PipelineState,
    engine: &'a mut CrawlEngine<F>,
    llm: &'a dyn LanguageModelService,
    store: &'a dyn KnowledgeStore,
    options: ResearchOptions,
}

impl<'a, F: PageFetcher> PipelineRun<'a, F> {
    pub fn new(
        state: PipelineState,
        engine: &'a mut CrawlEngine<F>,
        llm: &'a dyn LanguageModelService,
        store: &'a dyn KnowledgeStore,
        options: ResearchOptions,
    ) -> Self {
        Self {
            id: RunId::new(),
            started_at: Utc::now(),
            next: Some(Stage::ENTRY),
            state,
            engine,
            llm,
            store,
            options,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// The stage the next [`advance`](Self::advance) call will execute.
    pub fn next_stage(&self) -> Option<Stage> {
        self.next
    }

    /// Execute the next stage and return the merged state.
    ///
    /// Returns `None` once the terminal stage has run, or after a stage failed.
    pub async fn advance(&mut self) -> Option<Result<StageSnapshot>> {
        let stage = self.next?;
        info!(stage = %stage, run_id = %self.id, "entering stage");

        let update = match stage {
            Stage::Planner => plan(self.llm, &self.options, &self.state.query).await,
            Stage::Crawler => crawl_plan(&mut *self.engine, self.store, &self.state.plan).await,
            Stage::Analyzer => analyze(self.llm, self.store, &self.options, &self.state).await,
            Stage::ReportGenerator => {
                generate_report(self.llm, &self.options, &self.state.report).await
            }
        };

        match update {
            Ok(update) => {
                self.state.apply(update);
                self.next = stage.next();
                Some(Ok(StageSnapshot {
                    stage,
                    state: self.state.clone(),
                }))
            }
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }

    /// Drive every remaining stage, reporting each to `progress`.
    #[instrument(skip_all, fields(run_id = %self.id, query = %self.state.query))]
    pub async fn run(mut self, progress: &dyn ProgressReporter) -> Result<PipelineOutcome> {
        while let Some(stage) = self.next {
            progress.stage_started(stage);
            if let Some(step) = self.advance().await {
                progress.stage_finished(&step?);
            }
        }

        info!(
            plan_steps = self.state.plan.len(),
            sources = self.state.crawled_data.len(),
            report_len = self.state.report.len(),
            "research run completed"
        );
        Ok(self.into_outcome())
    }

    /// Snapshot the run as a history record, finished now.
    pub fn into_outcome(self) -> PipelineOutcome {
        let run = ResearchRun {
            id: self.id,
            query: self.state.query.clone(),
            plan: self.state.plan.clone(),
            report: self.state.report.clone(),
            source_count: self.state.crawled_data.len(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        PipelineOutcome {
            state: self.state,
            run,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage implementations
// ---------------------------------------------------------------------------

async fn plan(
    llm: &dyn LanguageModelService,
    options: &ResearchOptions,
    query: &str,
) -> Result<StateUpdate> {
    info!("generating research plan");
    let prompt = format!("{PLANNER_INSTRUCTION}\n\nResearch query: {query}");
    let response = llm
        .invoke(&prompt, options.temperature, options.max_tokens)
        .await?;

    let plan = parse_plan(&response);
    debug!(steps = plan.len(), "plan generated");
    Ok(StateUpdate {
        plan: Some(plan),
        ..Default::default()
    })
}

async fn crawl_plan<F: PageFetcher>(
    engine: &mut CrawlEngine<F>,
    store: &dyn KnowledgeStore,
    plan: &[String],
) -> Result<StateUpdate> {
    info!(steps = plan.len(), "executing crawler over plan");
    let depth = engine.settings().depth;
    let mut crawled = Vec::with_capacity(plan.len());

    for step in plan {
        let target = resolve_target(
            step,
            &engine.settings().seed_url,
            &engine.settings().onion_marker,
        );
        debug!(%step, %target, "resolved crawl target");
        crawled.push(engine.crawl(&target, depth).await);
    }

    let items: Vec<KnowledgeItem> = crawled.iter().map(KnowledgeItem::from).collect();
    store.store(&items).await?;

    Ok(StateUpdate {
        crawled_data: Some(crawled),
        ..Default::default()
    })
}

async fn analyze(
    llm: &dyn LanguageModelService,
    store: &dyn KnowledgeStore,
    options: &ResearchOptions,
    state: &PipelineState,
) -> Result<StateUpdate> {
    info!("analyzing crawled data");
    let context = store.retrieve(&state.query, options.retrieve_k).await?;
    let prompt = analyzer_prompt(
        &state.query,
        &state.crawled_data,
        &context,
        options.max_source_chars,
    );
    let analysis = llm
        .invoke(&prompt, options.temperature, options.max_tokens)
        .await?;

    Ok(StateUpdate {
        report: Some(analysis),
        ..Default::default()
    })
}

async fn generate_report(
    llm: &dyn LanguageModelService,
    options: &ResearchOptions,
    analysis: &str,
) -> Result<StateUpdate> {
    info!("generating final report");
    let prompt = format!("Generate a detailed markdown report from:\n{analysis}");
    let report = llm
        .invoke(&prompt, options.temperature, options.max_tokens)
        .await?;

    Ok(StateUpdate {
        report: Some(report),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split a planner response into trimmed, non-empty lines.
pub fn parse_plan(response: &str) -> Vec<String> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Choose the address to crawl for a plan step.
///
/// A step naming an in-scope address (one containing `marker`) is crawled at
/// that address, with `http://` added when it has no scheme. Every other step
/// is crawled at `seed`.
pub fn resolve_target(step: &str, seed: &str, marker: &str) -> String {
    if marker.is_empty() {
        return seed.to_string();
    }

    let token = r#"[^\s<>"'`()\[\]{}]*"#;
    let Ok(pattern) = Regex::new(&format!("{token}{}{token}", regex::escape(marker))) else {
        return seed.to_string();
    };

    for found in pattern.find_iter(step) {
        let candidate = found
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        let host_start = candidate.find("://").map_or(0, |i| i + 3);
        let Some(marker_at) = candidate[host_start..].find(marker) else {
            continue;
        };
        let host = &candidate[host_start..host_start + marker_at];
        if !host.chars().any(char::is_alphanumeric) {
            continue;
        }

        return if candidate.contains("://") {
            candidate.to_string()
        } else {
            format!("http://{candidate}")
        };
    }

    seed.to_string()
}

/// Build the single analyzer prompt from crawled data and retrieved context.
fn analyzer_prompt(
    query: &str,
    crawled: &[CrawlResult],
    context: &[RetrievedDocument],
    max_source_chars: usize,
) -> String {
    let mut prompt = format!("Analyze the following dark web research data for the query: {query}\n\n");

    prompt.push_str("Crawled data:\n");
    if crawled.is_empty() {
        prompt.push_str("(none)\n");
    }
    for (i, result) in crawled.iter().enumerate() {
        prompt.push_str(&format!("\n[Source {}] {}\n", i + 1, result.url));
        if !result.errors.is_empty() {
            prompt.push_str(&format!("Errors: {}\n", result.errors.join("; ")));
        }
        prompt.push_str(&truncate_source(&result.content, max_source_chars));
        prompt.push('\n');
    }

    prompt.push_str("\nContext from knowledge base:\n");
    if context.is_empty() {
        prompt.push_str("(none)\n");
    }
    for (i, doc) in context.iter().enumerate() {
        prompt.push_str(&format!("\n[Document {}] {}\n", i + 1, doc.url));
        prompt.push_str(&truncate_source(&doc.content, max_source_chars));
        prompt.push('\n');
    }

    prompt.push('\n');
    prompt.push_str(ANALYZER_INSTRUCTION);
    prompt
}

/// Truncate content to `max_chars` characters.
fn truncate_source(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{TRUNCATION_MARKER}", &content[..idx]),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use darkscout_crawler::NoDelay;
    use darkscout_shared::{CrawlSettings, DarkscoutError};

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    /// Answers each invoke with the next scripted response and records prompts.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn ok(responses: &[&str]) -> Self {
            Self::new(responses.iter().map(|r| Ok(r.to_string())).collect())
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LanguageModelService for ScriptedLlm {
        async fn invoke(&self, prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DarkscoutError::llm("script exhausted")))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        stored: Mutex<Vec<Vec<KnowledgeItem>>>,
        retrievals: Mutex<Vec<(String, u32)>>,
        documents: Vec<RetrievedDocument>,
        fail_store: bool,
    }

    #[async_trait]
    impl KnowledgeStore for RecordingStore {
        async fn store(&self, items: &[KnowledgeItem]) -> Result<()> {
            if self.fail_store {
                return Err(DarkscoutError::Storage("disk full".into()));
            }
            self.stored.lock().unwrap().push(items.to_vec());
            Ok(())
        }

        async fn retrieve(&self, query: &str, k: u32) -> Result<Vec<RetrievedDocument>> {
            self.retrievals.lock().unwrap().push((query.to_string(), k));
            Ok(self.documents.iter().take(k as usize).cloned().collect())
        }
    }

    #[derive(Default)]
    struct Pages {
        pages: HashMap<String, String>,
        fetched: Mutex<Vec<String>>,
        connected: bool,
    }

    impl Pages {
        fn with(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.to_string()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PageFetcher for Pages {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn check_connectivity(&self) -> bool {
            true
        }

        async fn fetch(&self, url: &str) -> Result<String> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| DarkscoutError::Network(format!("{url}: unreachable")))
        }

        fn close(&mut self) {
            self.connected = false;
        }
    }

    fn engine(pages: Pages) -> CrawlEngine<Pages> {
        let settings = CrawlSettings {
            depth: 0,
            link_limit_per_page: 2,
            delay_min: Duration::ZERO,
            delay_max: Duration::ZERO,
            onion_marker: ".onion".into(),
            seed_url: "http://example.onion".into(),
        };
        CrawlEngine::new(pages, settings).with_delay_policy(NoDelay)
    }

    fn options() -> ResearchOptions {
        ResearchOptions {
            temperature: 0.7,
            max_tokens: 1024,
            retrieve_k: 3,
            max_source_chars: 40,
        }
    }

    // -----------------------------------------------------------------------
    // Stage table
    // -----------------------------------------------------------------------

    #[test]
    fn stages_form_a_linear_chain() {
        let mut order = vec![Stage::ENTRY];
        while let Some(next) = order.last().and_then(|s| s.next()) {
            order.push(next);
        }
        assert_eq!(
            order,
            vec![
                Stage::Planner,
                Stage::Crawler,
                Stage::Analyzer,
                Stage::ReportGenerator
            ]
        );
        assert_eq!(Stage::ReportGenerator.to_string(), "report_generator");
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let mut state = PipelineState::new("q", vec![ChatMessage::user("hi")]);
        state.plan = vec!["keep".into()];
        state.apply(StateUpdate {
            report: Some("draft".into()),
            ..Default::default()
        });
        assert_eq!(state.plan, vec!["keep"]);
        assert_eq!(state.report, "draft");
        assert_eq!(state.chat_history.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn plan_keeps_line_order_and_drops_blanks() {
        let plan = parse_plan("  first step \n\n\t\nsecond step\n   \nthird\n");
        assert_eq!(plan, vec!["first step", "second step", "third"]);
        assert!(parse_plan("\n \n").is_empty());
    }

    #[test]
    fn target_uses_onion_address_in_step() {
        let seed = "http://example.onion";
        assert_eq!(
            resolve_target("Crawl abcdefghij234567.onion/forum for listings.", seed, ".onion"),
            "http://abcdefghij234567.onion/forum"
        );
        assert_eq!(
            resolve_target("Check (https://xyz.onion/a?b=1), then summarize", seed, ".onion"),
            "https://xyz.onion/a?b=1"
        );
    }

    #[test]
    fn target_falls_back_to_seed() {
        let seed = "http://example.onion";
        assert_eq!(resolve_target("Survey marketplaces", seed, ".onion"), seed);
        assert_eq!(resolve_target("List popular .onion directories", seed, ".onion"), seed);
        assert_eq!(resolve_target("anything", seed, ""), seed);
    }

    #[test]
    fn source_truncation_is_char_safe() {
        assert_eq!(truncate_source("short", 10), "short");
        let cut = truncate_source("ééééé", 2);
        assert_eq!(cut, format!("éé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn analyzer_prompt_includes_sources_and_context() {
        let mut crawled = CrawlResult::new("http://a.onion");
        crawled.content = "x".repeat(100);
        let failed = CrawlResult::failed("http://b.onion", "timed out");
        let context = vec![RetrievedDocument {
            url: "http://c.onion".into(),
            content: "archived context".into(),
            score: -1.0,
        }];

        let prompt = analyzer_prompt("markets", &[crawled, failed], &context, 40);
        assert!(prompt.contains("for the query: markets"));
        assert!(prompt.contains("[Source 1] http://a.onion"));
        assert!(prompt.contains(&format!("{}{TRUNCATION_MARKER}", "x".repeat(40))));
        assert!(!prompt.contains(&"x".repeat(41)));
        assert!(prompt.contains("Error crawling http://b.onion: timed out"));
        assert!(prompt.contains("[Document 1] http://c.onion\narchived context"));
    }

    // -----------------------------------------------------------------------
    // Full runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stages_run_in_order_with_snapshots() {
        let mut engine = engine(Pages::with(&[
            ("http://example.onion", "<p>seed page</p>"),
            ("http://forum.onion", "<p>forum page</p>"),
        ]));
        let llm = ScriptedLlm::ok(&[
            "Survey the seed\n\n  Read forum.onion threads  \n",
            "analysis text",
            "# Final report",
        ]);
        let store = RecordingStore::default();
        let history = vec![ChatMessage::user("earlier"), ChatMessage::assistant("reply")];

        let mut run = PipelineRun::new(
            PipelineState::new("forum activity", history.clone()),
            &mut engine,
            &llm,
            &store,
            options(),
        );

        let mut stages = Vec::new();
        let mut snapshots = Vec::new();
        while let Some(step) = run.advance().await {
            let snapshot = step.expect("stage succeeds");
            stages.push(snapshot.stage);
            snapshots.push(snapshot);
        }
        assert!(run.advance().await.is_none());

        assert_eq!(
            stages,
            vec![
                Stage::Planner,
                Stage::Crawler,
                Stage::Analyzer,
                Stage::ReportGenerator
            ]
        );

        // Planner
        assert_eq!(
            snapshots[0].state.plan,
            vec!["Survey the seed", "Read forum.onion threads"]
        );
        assert!(snapshots[0].state.crawled_data.is_empty());

        // Crawler: plan order, one store call holding every result
        let urls: Vec<_> = snapshots[1]
            .state
            .crawled_data
            .iter()
            .map(|r| r.url.as_str())
            .collect();
        assert_eq!(urls, vec!["http://example.onion", "http://forum.onion"]);
        let stored = store.stored.lock().unwrap().clone();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0][1].content, "forum page");

        // Analyzer then report generator
        assert_eq!(snapshots[2].state.report, "analysis text");
        assert_eq!(snapshots[3].state.report, "# Final report");
        assert_eq!(
            store.retrievals.lock().unwrap().clone(),
            vec![("forum activity".to_string(), 3)]
        );

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].starts_with(PLANNER_INSTRUCTION));
        assert!(prompts[0].ends_with("forum activity"));
        assert!(prompts[1].contains("seed page"));
        assert_eq!(
            prompts[2],
            "Generate a detailed markdown report from:\nanalysis text"
        );

        assert_eq!(run.state().chat_history, history);
    }

    #[tokio::test]
    async fn run_reports_progress_and_builds_history_record() {
        struct Recorder(Mutex<Vec<String>>);
        impl ProgressReporter for Recorder {
            fn stage_started(&self, stage: Stage) {
                self.0.lock().unwrap().push(format!("start {stage}"));
            }
            fn stage_finished(&self, snapshot: &StageSnapshot) {
                self.0.lock().unwrap().push(format!("done {}", snapshot.stage));
            }
        }

        let mut engine = engine(Pages::with(&[("http://example.onion", "<p>seed</p>")]));
        let llm = ScriptedLlm::ok(&["only step", "analysis", "report"]);
        let store = RecordingStore::default();
        let recorder = Recorder(Mutex::new(Vec::new()));

        let outcome = PipelineRun::new(
            PipelineState::new("q", Vec::new()),
            &mut engine,
            &llm,
            &store,
            options(),
        )
        .run(&recorder)
        .await
        .expect("run succeeds");

        assert_eq!(
            recorder.0.lock().unwrap().clone(),
            vec![
                "start planner",
                "done planner",
                "start crawler",
                "done crawler",
                "start analyzer",
                "done analyzer",
                "start report_generator",
                "done report_generator",
            ]
        );
        assert_eq!(outcome.run.query, "q");
        assert_eq!(outcome.run.plan, vec!["only step"]);
        assert_eq!(outcome.run.report, "report");
        assert_eq!(outcome.run.source_count, 1);
        assert!(outcome.run.finished_at >= outcome.run.started_at);
    }

    #[tokio::test]
    async fn crawl_failures_do_not_stop_the_run() {
        let mut engine = engine(Pages::default());
        let llm = ScriptedLlm::ok(&["step a\nstep b", "analysis", "report"]);
        let store = RecordingStore::default();

        let outcome = PipelineRun::new(
            PipelineState::new("q", Vec::new()),
            &mut engine,
            &llm,
            &store,
            options(),
        )
        .run(&SilentProgress)
        .await
        .expect("run succeeds");

        assert_eq!(outcome.state.crawled_data.len(), 2);
        assert!(outcome.state.crawled_data.iter().all(|r| r.content.is_empty()));
        assert!(outcome.state.crawled_data.iter().all(|r| r.errors.len() == 1));
        assert!(llm.prompts()[1].contains("Error crawling http://example.onion"));
    }

    #[tokio::test]
    async fn llm_failure_propagates_and_ends_run() {
        let mut engine = engine(Pages::default());
        let llm = ScriptedLlm::new(vec![Err(DarkscoutError::llm("quota exceeded"))]);
        let store = RecordingStore::default();

        let mut run = PipelineRun::new(
            PipelineState::new("q", Vec::new()),
            &mut engine,
            &llm,
            &store,
            options(),
        );

        let err = run.advance().await.expect("one step").unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(run.advance().await.is_none());
        assert!(engine.fetcher().fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let mut engine = engine(Pages::default());
        let llm = ScriptedLlm::ok(&["step", "never used"]);
        let store = RecordingStore {
            fail_store: true,
            ..Default::default()
        };

        let result = PipelineRun::new(
            PipelineState::new("q", Vec::new()),
            &mut engine,
            &llm,
            &store,
            options(),
        )
        .run(&SilentProgress)
        .await;

        assert!(matches!(result, Err(DarkscoutError::Storage(_))));
        assert_eq!(llm.prompts().len(), 1);
    }
}

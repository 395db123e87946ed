//! # Pipeline Executor
//!
//! Runs the stage sequence for one audit on its own task and streams a
//! `PipelineResult` per stage and per agent.
//!
//! ## Stages
//!
//! 1. **Crawl** - fetch through the `Crawler`, bounded by a hard ceiling.
//!    Network errors are retried through `ErrorRecovery`.
//! 2. **Analyze** - every registered agent runs concurrently against the
//!    crawl output (JoinSet scatter/gather). One result per agent, then a
//!    stage summary with completed and failed counts.
//! 3. **Report** - the `Reporter` aggregates agent output; failure falls
//!    back to a minimal report.
//!
//! Cancellation and the caller deadline are checked at stage boundaries.
//! The result stream is bounded and never blocks the run: a full stream
//! drops the newest event.

use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;

use super::events::{PipelineResult, PipelineStep, ResultStatus};
use super::progress::ExecutionProgress;
use super::report::{Reporter, ScoreReporter};
use super::stage::StageMachine;
use super::{panic_message, RunContext};
use crate::agents::{AgentCategory, AgentInput, AgentRegistry, AgentStatus};
use crate::config::OrchestratorConfig;
use crate::crawl::{CrawlResult, Crawler};
use crate::error::{AuditError, PipelineError};
use crate::models::{AuditRequest, AuditStatus};
use crate::recovery::{minimal_report, ErrorRecovery, RecoveryDecision};

/// How long the terminal result may wait for stream capacity
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a run stopped before completing
#[derive(Debug)]
enum StageExit {
    Cancelled,
    TimedOut(String),
    Failed(AuditError),
}

struct RunningAudit {
    run: u64,
    ctx: RunContext,
    progress: Arc<Mutex<ExecutionProgress>>,
}

type RunningTable = Arc<Mutex<HashMap<String, RunningAudit>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the audit's bookkeeping when its run ends, including by panic
struct RunGuard {
    running: RunningTable,
    audit_id: String,
    run: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = lock(&self.running);
        if running.get(&self.audit_id).is_some_and(|r| r.run == self.run) {
            running.remove(&self.audit_id);
        }
    }
}

/// Collaborators shared by every run
#[derive(Clone)]
struct Stages {
    crawler: Arc<dyn Crawler>,
    reporter: Arc<dyn Reporter>,
    recovery: ErrorRecovery,
    crawl_timeout: Duration,
    output_dir: Option<PathBuf>,
}

/// Multi-stage audit runner
pub struct PipelineExecutor {
    stages: Stages,
    result_capacity: usize,
    running: RunningTable,
    next_run: AtomicU64,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("running", &self.running_audits())
            .field("crawl_timeout", &self.stages.crawl_timeout)
            .finish()
    }
}

impl PipelineExecutor {
    pub fn new(crawler: Arc<dyn Crawler>, config: &OrchestratorConfig) -> Self {
        Self {
            stages: Stages {
                crawler,
                reporter: Arc::new(ScoreReporter),
                recovery: ErrorRecovery::from_config(config),
                crawl_timeout: config.crawl_timeout(),
                output_dir: config.output_dir.clone(),
            },
            result_capacity: config.result_capacity.max(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.stages.reporter = reporter;
        self
    }

    pub fn with_recovery(mut self, recovery: ErrorRecovery) -> Self {
        self.stages.recovery = recovery;
        self
    }

    /// Start a run and return its result stream.
    ///
    /// The stream ends after a terminal result (`Completed`, `Failed`,
    /// `Cancelled` or `TimedOut`).
    pub fn execute(
        &self,
        ctx: &RunContext,
        request: AuditRequest,
        registry: Arc<AgentRegistry>,
    ) -> Result<mpsc::Receiver<PipelineResult>, PipelineError> {
        request.validate().map_err(PipelineError::InvalidRequest)?;

        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let run_ctx = ctx.child();
        let progress = Arc::new(Mutex::new(ExecutionProgress::new(&request.audit_id)));
        {
            let mut running = lock(&self.running);
            if running.contains_key(&request.audit_id) {
                return Err(PipelineError::AlreadyRunning(request.audit_id));
            }
            running.insert(
                request.audit_id.clone(),
                RunningAudit {
                    run,
                    ctx: run_ctx.clone(),
                    progress: Arc::clone(&progress),
                },
            );
        }

        let (tx, rx) = mpsc::channel(self.result_capacity);
        let guard = RunGuard {
            running: Arc::clone(&self.running),
            audit_id: request.audit_id.clone(),
            run,
        };
        let runner = Run {
            _guard: guard,
            stages: self.stages.clone(),
            ctx: run_ctx,
            request,
            registry,
            tx,
            progress,
            machine: StageMachine::new(),
        };

        tokio::spawn(runner.run());

        Ok(rx)
    }

    /// Snapshot of a dispatched run's progress
    pub fn get_progress(&self, audit_id: &str) -> Option<ExecutionProgress> {
        lock(&self.running)
            .get(audit_id)
            .map(|r| lock(&r.progress).clone())
    }

    /// Signal a dispatched run to stop at its next stage boundary
    pub fn cancel(&self, audit_id: &str) -> Result<(), PipelineError> {
        let running = lock(&self.running);
        let audit = running
            .get(audit_id)
            .ok_or_else(|| PipelineError::NotRunning(audit_id.to_string()))?;
        audit.ctx.cancel();
        tracing::info!("Cancellation requested for audit {}", audit_id);
        Ok(())
    }

    pub fn is_running(&self, audit_id: &str) -> bool {
        lock(&self.running).contains_key(audit_id)
    }

    /// Sorted ids of dispatched runs
    pub fn running_audits(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.running).keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// State of one in-flight run
struct Run {
    // Dropped before `tx`, so the run is released before consumers see the stream end
    _guard: RunGuard,
    stages: Stages,
    ctx: RunContext,
    request: AuditRequest,
    registry: Arc<AgentRegistry>,
    tx: mpsc::Sender<PipelineResult>,
    progress: Arc<Mutex<ExecutionProgress>>,
    machine: StageMachine,
}

impl Run {
    #[tracing::instrument(skip(self), fields(audit_id = %self.request.audit_id))]
    async fn run(mut self) {
        let started = Instant::now();
        match self.stages_in_order().await {
            Ok(()) => {
                self.enter(PipelineStep::Completed);
                tracing::info!("Audit completed in {:?}", started.elapsed());
                let result = PipelineResult::stage(PipelineStep::Completed, ResultStatus::Completed)
                    .with_duration(started.elapsed());
                self.emit_terminal(result).await;
            }
            Err(exit) => {
                let result = self.exit_result(exit).with_duration(started.elapsed());
                self.emit_terminal(result).await;
            }
        }
    }

    async fn stages_in_order(&mut self) -> Result<(), StageExit> {
        self.boundary()?;
        self.enter(PipelineStep::Crawling);
        let crawl = Arc::new(self.crawl_stage().await?);

        self.boundary()?;
        self.enter(PipelineStep::Analyzing);
        let agent_results = self.analysis_stage(&crawl).await?;

        self.boundary()?;
        self.enter(PipelineStep::Reporting);
        self.report_stage(&crawl, &agent_results).await;

        self.boundary()
    }

    fn enter(&mut self, step: PipelineStep) {
        if step.canonical_progress().is_some() {
            self.machine.advance();
        } else {
            self.machine.end(step);
        }
        lock(&self.progress).set_step(self.machine.step);
        tracing::debug!("Entering step {}", self.machine.step.as_str());
    }

    /// Cancellation and deadline check between stages
    fn boundary(&self) -> Result<(), StageExit> {
        if self.ctx.is_cancelled() {
            return Err(StageExit::Cancelled);
        }
        if self.ctx.deadline_passed() {
            return Err(StageExit::TimedOut(format!(
                "deadline exceeded during {}",
                self.machine.step.as_str()
            )));
        }
        Ok(())
    }

    fn exit_result(&mut self, exit: StageExit) -> PipelineResult {
        match exit {
            StageExit::Cancelled => {
                self.enter(PipelineStep::Cancelled);
                tracing::info!("Audit cancelled");
                PipelineResult::stage(PipelineStep::Cancelled, ResultStatus::Failed)
                    .with_error("audit cancelled")
            }
            StageExit::TimedOut(message) => {
                let error = AuditError::Timeout(message);
                let action = self.stages.recovery.handle(&error, 0);
                tracing::warn!("Audit timed out: {}", error);
                self.enter(PipelineStep::TimedOut);
                PipelineResult::stage(PipelineStep::TimedOut, ResultStatus::Partial)
                    .with_error(error.to_string())
                    .with_data(serde_json::json!({ "recovery": action.action.as_str() }))
            }
            StageExit::Failed(error) => {
                let pages_processed = error.pages_processed();
                let status = if pages_processed > 0 {
                    ResultStatus::Partial
                } else {
                    ResultStatus::Failed
                };
                tracing::warn!("Audit failed: {}", error);
                self.enter(PipelineStep::Failed);
                PipelineResult::stage(PipelineStep::Failed, status)
                    .with_error(error.to_string())
                    .with_data(serde_json::json!({ "pages_processed": pages_processed }))
            }
        }
    }

    // Stage 1

    async fn crawl_stage(&mut self) -> Result<CrawlResult, StageExit> {
        let started = Instant::now();
        let outcome = self.crawl_with_retries().await;

        match outcome {
            Ok(crawl) => {
                self.emit(
                    PipelineResult::stage(PipelineStep::Crawling, ResultStatus::Completed)
                        .with_data(crawl.summary())
                        .with_duration(started.elapsed()),
                );
                Ok(crawl)
            }
            Err(StageExit::Failed(error)) => {
                self.emit(
                    PipelineResult::stage(PipelineStep::Crawling, ResultStatus::Failed)
                        .with_error(error.to_string())
                        .with_data(serde_json::json!({
                            "pages_processed": error.pages_processed(),
                            "retries": self.machine.crawl_retries,
                        }))
                        .with_duration(started.elapsed()),
                );
                Err(StageExit::Failed(error))
            }
            Err(other) => Err(other),
        }
    }

    async fn crawl_with_retries(&mut self) -> Result<CrawlResult, StageExit> {
        loop {
            let error = match self.crawl_once().await {
                Ok(crawl) => return Ok(crawl),
                Err(StageExit::Failed(error)) => error,
                Err(other) => return Err(other),
            };

            let recovery = &self.stages.recovery;
            let mut action = recovery.handle(&error, self.machine.crawl_retries);
            let RecoveryDecision::Retry { after } = recovery.decide(&action, &self.request.audit_id)
            else {
                return Err(StageExit::Failed(error));
            };
            recovery.record_retry(&mut action);
            self.machine.crawl_retries = action.retry_count;
            tracing::warn!(
                "Crawl attempt failed ({}), retry {}/{} in {:?}",
                error,
                action.retry_count,
                action.max_retries,
                after
            );

            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return Err(StageExit::Cancelled),
                _ = self.ctx.deadline_elapsed() => {
                    return Err(StageExit::TimedOut("deadline exceeded while waiting to retry crawl".into()))
                }
                _ = tokio::time::sleep(after) => {}
            }
        }
    }

    async fn crawl_once(&self) -> Result<CrawlResult, StageExit> {
        let ceiling = self.stages.crawl_timeout;
        let output_dir = self
            .stages
            .output_dir
            .as_ref()
            .map(|dir| dir.join(&self.request.audit_id));
        let crawl = self.stages.crawler.crawl(
            &self.ctx,
            &self.request.seed_url,
            self.request.max_pages,
            output_dir.as_deref(),
        );

        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(StageExit::Cancelled),
            _ = self.ctx.deadline_elapsed() => {
                Err(StageExit::TimedOut("deadline exceeded during crawl".into()))
            }
            outcome = tokio::time::timeout(ceiling, crawl) => match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error)) => Err(StageExit::Failed(error)),
                // The crawler's partial output is lost with its future, so a
                // ceiling hit always counts as a crawl with no pages
                Err(_) => Err(StageExit::Failed(AuditError::crawl(format!(
                    "crawl exceeded the {}s ceiling",
                    ceiling.as_secs()
                )))),
            },
        }
    }

    // Stage 2

    async fn analysis_stage(
        &self,
        crawl: &Arc<CrawlResult>,
    ) -> Result<HashMap<String, serde_json::Value>, StageExit> {
        let agents = self.registry.list();
        let names: Vec<String> = agents.iter().map(|(name, _)| name.clone()).collect();
        {
            let mut progress = lock(&self.progress);
            progress.plan(&names);
            progress.dispatch_all();
        }
        tracing::info!("Dispatching {} agents", agents.len());

        let input = Arc::new(AgentInput {
            audit_id: self.request.audit_id.clone(),
            seed_url: self.request.seed_url.clone(),
            options: self.request.options.clone(),
            crawl: Arc::clone(crawl),
        });

        // SCATTER: one task per agent
        let mut join_set = JoinSet::new();
        for (name, agent) in agents {
            let ctx = self.ctx.clone();
            let input = Arc::clone(&input);
            join_set.spawn(async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(agent.process(&ctx, &input))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(anyhow::anyhow!("agent panicked: {}", panic_message(payload)))
                    });
                (name, agent.category(), outcome, started.elapsed())
            });
        }

        // GATHER: every agent reports before the stage advances
        let mut agent_results = HashMap::new();
        let mut unreported: HashSet<String> = names.iter().cloned().collect();
        let (mut completed, mut failed) = (0usize, 0usize);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.deadline_elapsed() => None,
                joined = join_set.join_next() => Some(joined),
            };
            let Some(joined) = next else {
                join_set.abort_all();
                return Err(StageExit::TimedOut(
                    "deadline exceeded while waiting on agents".into(),
                ));
            };
            let Some(joined) = joined else { break };

            let (name, category, outcome, elapsed) = match joined {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!("Agent task ended abnormally: {}", e);
                    continue;
                }
            };

            let result = self.agent_result(&name, category, outcome).with_duration(elapsed);
            let succeeded = matches!(result.status, ResultStatus::Completed);
            if succeeded {
                completed += 1;
            } else {
                failed += 1;
            }
            unreported.remove(&name);
            lock(&self.progress).finish_agent(&name, succeeded);
            agent_results.insert(name, result.data.clone());
            self.emit(result);
        }

        // Tasks that ended without handing back their outcome
        let mut lost: Vec<String> = unreported.into_iter().collect();
        lost.sort();
        for name in lost {
            failed += 1;
            lock(&self.progress).finish_agent(&name, false);
            self.emit(
                PipelineResult::agent(&name, ResultStatus::Failed)
                    .with_error("agent task ended abnormally"),
            );
        }

        self.emit(
            PipelineResult::stage(PipelineStep::Analyzing, ResultStatus::Completed).with_data(
                serde_json::json!({
                    "agents": names.len(),
                    "completed": completed,
                    "failed": failed,
                }),
            ),
        );

        Ok(agent_results)
    }

    /// Turn an agent outcome into a result, substituting fallbacks by category
    fn agent_result(
        &self,
        name: &str,
        category: AgentCategory,
        outcome: anyhow::Result<crate::agents::AgentResult>,
    ) -> PipelineResult {
        match outcome {
            Ok(result) => {
                let status = match result.status {
                    AgentStatus::Completed => ResultStatus::Completed,
                    AgentStatus::Partial => ResultStatus::Partial,
                    AgentStatus::Failed => ResultStatus::Failed,
                };
                let data = serde_json::to_value(&result.data).unwrap_or_default();
                let mut pipeline_result = PipelineResult::agent(name, status).with_data(data);
                if !result.errors.is_empty() {
                    pipeline_result = pipeline_result.with_error(result.errors.join("; "));
                }
                pipeline_result
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Agent '{}' failed: {}", name, message);

                let Some(error) = category.classify(&message) else {
                    return PipelineResult::agent(name, ResultStatus::Failed).with_error(message);
                };
                let action = self.stages.recovery.handle(&error, 0);
                match self.stages.recovery.decide(&action, &self.request.audit_id) {
                    RecoveryDecision::Fallback(fallback) => {
                        let status = match category {
                            AgentCategory::Semantic => ResultStatus::Skipped,
                            _ => ResultStatus::Partial,
                        };
                        PipelineResult::agent(name, status)
                            .with_data(fallback)
                            .with_error(error.to_string())
                    }
                    _ => PipelineResult::agent(name, ResultStatus::Failed).with_error(error.to_string()),
                }
            }
        }
    }

    // Stage 3

    async fn report_stage(
        &self,
        crawl: &CrawlResult,
        agent_results: &HashMap<String, serde_json::Value>,
    ) {
        let started = Instant::now();
        let audit_id = &self.request.audit_id;

        let outcome = AssertUnwindSafe(self.stages.reporter.generate(audit_id, crawl, agent_results))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(AuditError::Report(panic_message(payload))));

        let result = match outcome {
            Ok(report) => PipelineResult::stage(PipelineStep::Reporting, ResultStatus::Completed)
                .with_data(serde_json::to_value(&report).unwrap_or_default()),
            Err(error) => {
                let error = match error {
                    AuditError::Report(_) => error,
                    other => AuditError::Report(other.to_string()),
                };
                tracing::warn!("Report generation failed: {}", error);
                let action = self.stages.recovery.handle(&error, 0);
                let fallback = match self.stages.recovery.decide(&action, audit_id) {
                    RecoveryDecision::Fallback(value) => value,
                    _ => serde_json::to_value(minimal_report(audit_id, AuditStatus::Partial))
                        .unwrap_or_default(),
                };
                PipelineResult::stage(PipelineStep::Reporting, ResultStatus::Partial)
                    .with_data(fallback)
                    .with_error(error.to_string())
            }
        };
        self.emit(result.with_duration(started.elapsed()));
    }

    // Delivery

    fn emit(&self, result: PipelineResult) {
        match self.tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    "Result stream full, dropping {} result{}",
                    dropped.step.as_str(),
                    dropped
                        .agent_name
                        .map(|n| format!(" for agent '{}'", n))
                        .unwrap_or_default()
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Result stream closed, consumer gone");
            }
        }
    }

    /// The terminal result gets a short grace period for capacity
    async fn emit_terminal(&self, result: PipelineResult) {
        if let Err(e) = self.tx.send_timeout(result, TERMINAL_SEND_TIMEOUT).await {
            tracing::warn!("Terminal result not delivered: {}", e);
        }
    }
}

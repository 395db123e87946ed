//! # Orchestrator
//!
//! Public entry point. Owns the agent registry, the pipeline executor,
//! progress tracking and the table of audit executions.
//!
//! ## Audit lifecycle
//!
//! ```text
//! start_audit ──► active (running) ──► driver applies PipelineResults ──► history
//!                      │                                                  ▲
//!                      └── cancel_audit / shutdown / panic ───────────────┘
//! ```
//!
//! Each audit runs as its own task. A driver task converts pipeline results
//! into execution updates and `ProgressUpdate`s; a supervisor task around
//! the driver turns a panic into a failed audit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::agents::{builtin_agents, Agent, AgentRegistry, RegistryStats};
use crate::config::OrchestratorConfig;
use crate::crawl::{Crawler, HttpCrawler};
use crate::error::OrchestratorError;
use crate::models::{AuditExecution, AuditRequest, AuditResults, AuditStatus, ProgressUpdate};
use crate::progress::ProgressManager;
use crate::state::{AuditRecord, AuditStore};
use crate::swarm::{
    panic_message, PipelineExecutor, PipelineResult, PipelineStep, Reporter, ResultStatus,
    RunContext,
};

/// Overall progress for a step name: the fixed table for canonical steps,
/// 0 for anything else
pub fn progress_for_step(step: &str) -> u8 {
    PipelineStep::from_str(step)
        .and_then(|s| s.canonical_progress())
        .unwrap_or(0)
}

struct ActiveAudit {
    run: u64,
    execution: AuditExecution,
}

/// Active executions plus a bounded history of finished ones
#[derive(Default)]
struct AuditTable {
    active: HashMap<String, ActiveAudit>,
    history: HashMap<String, AuditExecution>,
    order: VecDeque<String>,
}

impl AuditTable {
    fn lookup(&self, audit_id: &str) -> Option<&AuditExecution> {
        self.active
            .get(audit_id)
            .map(|a| &a.execution)
            .or_else(|| self.history.get(audit_id))
    }

    /// The active entry, if it belongs to `run`
    fn active_run(&mut self, audit_id: &str, run: u64) -> Option<&mut ActiveAudit> {
        self.active.get_mut(audit_id).filter(|a| a.run == run)
    }

    fn archive(&mut self, execution: AuditExecution, limit: usize) {
        let id = execution.audit_id.clone();
        if self.history.insert(id.clone(), execution).is_some() {
            self.order.retain(|existing| existing != &id);
        }
        self.order.push_back(id);

        while self.order.len() > limit.max(1) {
            if let Some(evicted) = self.order.pop_front() {
                self.history.remove(&evicted);
            }
        }
    }
}

/// NotActive for finished audits, NotFound for unknown ids
fn inactive_error(table: &AuditTable, audit_id: &str) -> OrchestratorError {
    if table.history.contains_key(audit_id) {
        OrchestratorError::NotActive(audit_id.to_string())
    } else {
        OrchestratorError::NotFound(audit_id.to_string())
    }
}

/// State shared with driver tasks
#[derive(Clone)]
struct Shared {
    audits: Arc<RwLock<AuditTable>>,
    progress: Arc<ProgressManager>,
    store: Option<Arc<AuditStore>>,
    history_limit: usize,
}

impl Shared {
    /// Apply one pipeline result. Returns false once the run is no longer
    /// the active one for its audit id.
    async fn apply(&self, audit_id: &str, run: u64, result: &PipelineResult) -> bool {
        let finished = {
            let mut table = self.audits.write().await;
            let Some(active) = table.active_run(audit_id, run) else {
                return false;
            };
            let execution = &mut active.execution;

            execution.current_step = result.step.as_str().to_string();
            if let Some(progress) = result.step.canonical_progress() {
                execution.progress = execution.progress.max(progress);
            }

            match (&result.agent_name, result.step) {
                (Some(agent), _) => {
                    execution
                        .agent_statuses
                        .insert(agent.clone(), result.status.as_str().to_string());
                    execution.results.insert(agent.clone(), result.data.clone());
                }
                (None, PipelineStep::Crawling) => {
                    execution.results.insert("crawl".into(), result.data.clone());
                }
                (None, PipelineStep::Reporting) => {
                    execution.results.insert("report".into(), result.data.clone());
                }
                _ => {}
            }
            if let Some(error) = &result.error {
                execution.error = Some(error.clone());
            }

            let mut update = ProgressUpdate::new(audit_id, result.step.as_str(), execution.progress);
            if let Some(agent) = &result.agent_name {
                update = update.with_agent(agent, result.status.as_str());
            }
            if !result.data.is_null() {
                update = update.with_data(result.data.clone());
            }
            if let Some(error) = &result.error {
                update = update.with_error(error.clone());
            }
            let _ = self.progress.update_progress(update);

            if !result.is_terminal() {
                return true;
            }

            let status = match (result.step, result.status) {
                (PipelineStep::Completed, _) => AuditStatus::Completed,
                (PipelineStep::TimedOut, _) => AuditStatus::Partial,
                (PipelineStep::Failed, ResultStatus::Partial) => AuditStatus::Partial,
                _ => AuditStatus::Failed,
            };
            execution.finish(status, result.error.clone());
            tracing::info!("Audit {} finished: {}", audit_id, status);

            self.progress.stop_tracking(audit_id);
            let finished = table.active.remove(audit_id).map(|a| a.execution);
            if let Some(execution) = &finished {
                table.archive(execution.clone(), self.history_limit);
            }
            finished
        };

        if let Some(execution) = finished {
            self.persist(&execution).await;
        }
        true
    }

    /// Force the run into a terminal status if it is still active
    async fn fail(&self, audit_id: &str, run: u64, message: &str) {
        let finished = {
            let mut table = self.audits.write().await;
            let Some(active) = table.active_run(audit_id, run) else {
                return;
            };
            let execution = &mut active.execution;
            execution.current_step = PipelineStep::Failed.as_str().to_string();
            execution.finish(AuditStatus::Failed, Some(message.to_string()));

            let update = ProgressUpdate::new(audit_id, PipelineStep::Failed.as_str(), execution.progress)
                .with_error(message);
            let _ = self.progress.update_progress(update);
            self.progress.stop_tracking(audit_id);

            let finished = table.active.remove(audit_id).map(|a| a.execution);
            if let Some(execution) = &finished {
                table.archive(execution.clone(), self.history_limit);
            }
            finished
        };

        tracing::warn!("Audit {} failed: {}", audit_id, message);
        if let Some(execution) = finished {
            self.persist(&execution).await;
        }
    }

    async fn persist(&self, execution: &AuditExecution) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let record = AuditRecord::from_execution(execution);
        let id = record.id.clone();
        match tokio::task::spawn_blocking(move || store.save(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to persist audit {}: {:#}", id, e),
            Err(e) => tracing::warn!("Persistence task for audit {} failed: {}", id, e),
        }
    }

    /// Forward pipeline results until the run ends
    async fn drive(self, audit_id: String, run: u64, mut results: mpsc::Receiver<PipelineResult>) {
        while let Some(result) = results.recv().await {
            let terminal = result.is_terminal();
            if !self.apply(&audit_id, run, &result).await {
                tracing::debug!("Audit {} run {} superseded, driver exiting", audit_id, run);
                return;
            }
            if terminal {
                return;
            }
        }
        self.fail(&audit_id, run, "pipeline ended without a terminal result")
            .await;
    }
}

/// Audit orchestration facade
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    executor: PipelineExecutor,
    shared: Shared,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_run: AtomicU64,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator over the given crawler, with no agents registered
    pub fn new(config: OrchestratorConfig, crawler: Arc<dyn Crawler>) -> Self {
        let executor = PipelineExecutor::new(crawler, &config);
        let shared = Shared {
            audits: Arc::new(RwLock::new(AuditTable::default())),
            progress: Arc::new(ProgressManager::new(config.stream_capacity)),
            store: None,
            history_limit: config.history_limit,
        };
        Self {
            config,
            registry: Arc::new(AgentRegistry::new()),
            executor,
            shared,
            tasks: Mutex::new(Vec::new()),
            next_run: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// HTTP crawler, built-in agents and, when configured, SQLite persistence
    pub fn from_config(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let crawler = Arc::new(HttpCrawler::new(&config.user_agent)?);
        let database_path = config.database_path.clone();
        let mut orchestrator = Self::new(config, crawler);

        for agent in builtin_agents() {
            let name = agent.name().to_string();
            orchestrator.registry.register(&name, Some(agent))?;
        }

        if let Some(path) = database_path {
            orchestrator = orchestrator.with_store(Arc::new(AuditStore::open_at(&path)?));
        }
        Ok(orchestrator)
    }

    pub fn with_store(mut self, store: Arc<AuditStore>) -> Self {
        self.shared.store = Some(store);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.executor = self.executor.with_reporter(reporter);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn register_agent(
        &self,
        name: &str,
        agent: Option<Arc<dyn Agent>>,
    ) -> Result<(), OrchestratorError> {
        self.registry.register(name, agent)?;
        Ok(())
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Submit an audit and return its primary progress stream
    #[tracing::instrument(skip(self, ctx, request), fields(audit_id = %request.audit_id))]
    pub async fn start_audit(
        &self,
        ctx: &RunContext,
        request: AuditRequest,
    ) -> Result<mpsc::Receiver<ProgressUpdate>, OrchestratorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        request.validate().map_err(OrchestratorError::InvalidRequest)?;

        let audit_id = request.audit_id.clone();
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let step = PipelineStep::Initializing.as_str();
        let execution = AuditExecution::start(&request, step, progress_for_step(step));

        let (progress_rx, results) = {
            let mut table = self.shared.audits.write().await;
            if table.active.contains_key(&audit_id) {
                return Err(OrchestratorError::AlreadyActive(audit_id));
            }

            let progress_rx = self.shared.progress.start_tracking(&audit_id)?;
            let results = match self
                .executor
                .execute(ctx, request, Arc::clone(&self.registry))
            {
                Ok(results) => results,
                Err(e) => {
                    self.shared.progress.stop_tracking(&audit_id);
                    return Err(e.into());
                }
            };

            let _ = self.shared.progress.update_progress(ProgressUpdate::new(
                &audit_id,
                step,
                execution.progress,
            ));
            table.active.insert(
                audit_id.clone(),
                ActiveAudit {
                    run,
                    execution: execution.clone(),
                },
            );
            (progress_rx, results)
        };

        self.shared.persist(&execution).await;
        self.spawn_driver(audit_id, run, results);
        Ok(progress_rx)
    }

    fn spawn_driver(&self, audit_id: String, run: u64, results: mpsc::Receiver<PipelineResult>) {
        let shared = self.shared.clone();
        let supervisor = tokio::spawn(async move {
            let driver = tokio::spawn(shared.clone().drive(audit_id.clone(), run, results));
            match driver.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let message = format!("audit task panicked: {}", panic_message(e.into_panic()));
                    shared.fail(&audit_id, run, &message).await;
                }
                Err(_) => {
                    shared.fail(&audit_id, run, "audit task aborted").await;
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(supervisor);
    }

    /// Snapshot of an active or finished audit
    pub async fn get_audit_status(&self, audit_id: &str) -> Result<AuditExecution, OrchestratorError> {
        self.shared
            .audits
            .read()
            .await
            .lookup(audit_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(audit_id.to_string()))
    }

    /// Additional progress stream for an active audit
    pub async fn stream_progress(
        &self,
        audit_id: &str,
    ) -> Result<mpsc::Receiver<ProgressUpdate>, OrchestratorError> {
        let table = self.shared.audits.read().await;
        if !table.active.contains_key(audit_id) {
            return Err(inactive_error(&table, audit_id));
        }
        let (_, rx) = self.shared.progress.subscribe(audit_id)?;
        Ok(rx)
    }

    /// Active executions, oldest first
    pub async fn list_active_audits(&self) -> Vec<AuditExecution> {
        let table = self.shared.audits.read().await;
        let mut active: Vec<AuditExecution> =
            table.active.values().map(|a| a.execution.clone()).collect();
        active.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        active
    }

    /// Finished executions, most recent first
    pub async fn history(&self) -> Vec<AuditExecution> {
        let table = self.shared.audits.read().await;
        table
            .order
            .iter()
            .rev()
            .filter_map(|id| table.history.get(id).cloned())
            .collect()
    }

    /// Stop an active audit; it is marked failed and moved to history
    pub async fn cancel_audit(&self, audit_id: &str) -> Result<(), OrchestratorError> {
        let cancelled = {
            let mut table = self.shared.audits.write().await;
            let Some(active) = table.active.remove(audit_id) else {
                return Err(inactive_error(&table, audit_id));
            };

            let mut execution = active.execution;
            execution.current_step = PipelineStep::Cancelled.as_str().to_string();
            execution.finish(AuditStatus::Failed, Some("audit cancelled".into()));

            if self.executor.is_running(audit_id) {
                let _ = self.executor.cancel(audit_id);
            }

            let update = ProgressUpdate::new(audit_id, PipelineStep::Cancelled.as_str(), execution.progress)
                .with_error("audit cancelled");
            let _ = self.shared.progress.update_progress(update);
            self.shared.progress.stop_tracking(audit_id);

            table.archive(execution.clone(), self.shared.history_limit);
            execution
        };

        tracing::info!("Audit {} cancelled", audit_id);
        self.shared.persist(&cancelled).await;
        Ok(())
    }

    /// Results of a completed audit
    pub async fn get_results(&self, audit_id: &str) -> Result<AuditResults, OrchestratorError> {
        let execution = self.get_audit_status(audit_id).await?;
        if execution.status != AuditStatus::Completed {
            return Err(OrchestratorError::NotCompleted {
                id: audit_id.to_string(),
                status: execution.status,
            });
        }
        Ok(AuditResults::from_execution(&execution))
    }

    /// Load persisted audits into history. Active ids are left alone.
    pub async fn restore_from_store(&self) -> Result<usize, OrchestratorError> {
        let Some(store) = self.shared.store.clone() else {
            return Ok(0);
        };
        let records = tokio::task::spawn_blocking(move || store.list_all())
            .await
            .map_err(|e| anyhow::anyhow!("Restore task failed: {}", e))??;

        let mut table = self.shared.audits.write().await;
        let mut restored = 0;
        // Oldest first so the most recent survive the history bound
        for record in records.into_iter().rev() {
            if table.active.contains_key(&record.id) {
                continue;
            }
            table.archive(record.into_execution(), self.shared.history_limit);
            restored += 1;
        }
        tracing::info!("Restored {} audits from store", restored);
        Ok(restored)
    }

    /// Cancel every active audit, close every stream and wait briefly for
    /// audit tasks to wind down. Further submissions are rejected.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let cancelled: Vec<AuditExecution> = {
            let mut table = self.shared.audits.write().await;
            let active: Vec<(String, ActiveAudit)> = table.active.drain().collect();
            let mut cancelled = Vec::with_capacity(active.len());
            for (audit_id, active) in active {
                let mut execution = active.execution;
                execution.current_step = PipelineStep::Cancelled.as_str().to_string();
                execution.finish(AuditStatus::Failed, Some("orchestrator shutting down".into()));
                let _ = self.executor.cancel(&audit_id);
                table.archive(execution.clone(), self.shared.history_limit);
                cancelled.push(execution);
            }
            let closed = self.shared.progress.stop_all();
            tracing::info!(
                "Shutdown: cancelled {} audits, closed {} progress streams",
                cancelled.len(),
                closed
            );
            cancelled
        };

        for execution in &cancelled {
            self.shared.persist(execution).await;
        }

        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let grace = self.config.shutdown_grace();
        let wind_down = futures::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(grace, wind_down).await.is_err() {
            let stragglers = tasks.iter().filter(|t| !t.is_finished()).count();
            tracing::warn!("Aborting {} audit tasks after {:?}", stragglers, grace);
            for task in &tasks {
                task.abort();
            }
        }
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

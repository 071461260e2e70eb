//! Sync orchestrator
//!
//! Drives one run at a time through the requested entities in priority
//! order, persisting progress after each entity and honoring cooperative
//! cancellation between entities.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::database::Database;
use crate::error::{AppError, SyncError};
use crate::models::{EntitySlot, RunStatus, SyncRun};
use crate::otel::Metrics;
use crate::sync::entities::{self, EntityDef, EntityKind};
use crate::sync::pagination::PageResult;

/// Reason stored on runs cancelled through the orchestrator
pub const CANCEL_REASON: &str = "Cancelled by user request";

/// Reason stored on runs a previous process left in progress
pub const INTERRUPTED_REASON: &str = "Interrupted: the process stopped while the run was in progress";

/// Records fetched for one entity and the endpoint that served them
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFetch {
    pub endpoint: String,
    pub result: PageResult,
}

/// Upstream side of a run
///
/// `prepare` must succeed before a run record is created.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    /// Load and validate credentials
    async fn prepare(&self) -> Result<(), AppError>;

    /// Fetch every record of one entity
    async fn fetch_entity(&self, entity: &'static EntityDef) -> Result<EntityFetch, SyncError>;

    /// Upstream calls dispatched so far
    fn calls_made(&self) -> u64;
}

/// Publishes cancellation of a run to the executing orchestrator
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<i64>>>,
}

impl CancelSignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Announce that `run_id` was cancelled
    pub fn publish(&self, run_id: i64) {
        self.tx.send_replace(Some(run_id));
    }

    fn subscribe(&self) -> watch::Receiver<Option<i64>> {
        self.tx.subscribe()
    }
}

/// Sync orchestrator
pub struct Orchestrator<D: Database, F: EntityFetcher> {
    database: Arc<D>,
    fetcher: Arc<F>,
    cancel: CancelSignal,
    metrics: Option<Arc<Metrics>>,
}

impl<D: Database, F: EntityFetcher> Orchestrator<D, F> {
    pub fn new(database: Arc<D>, fetcher: Arc<F>) -> Self {
        Self {
            database,
            fetcher,
            cancel: CancelSignal::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Validate credentials and admit a new run
    ///
    /// Fails before any run record is written when credentials are missing
    /// or rejected, and with `RunInProgress` when another run is active.
    pub async fn begin_run<S: AsRef<str>>(&self, requested: &[S]) -> Result<SyncRun, AppError> {
        self.fetcher.prepare().await?;

        let planned = entities::plan(requested);
        let mut run = SyncRun::new(planned.iter().map(|entity| entity.name().to_string()))
            .in_progress();

        match self.database.create_run(&run).await? {
            Some(id) => run.id = Some(id),
            None => {
                let active = self
                    .database
                    .get_active_run()
                    .await?
                    .and_then(|active| active.id)
                    .unwrap_or_default();
                warn!(active_run = active, "Sync run rejected, another run is in progress");
                return Err(AppError::RunInProgress(active));
            }
        }

        info!(
            run_id = ?run.id,
            entities = ?run.entity_names(),
            "Sync run admitted"
        );
        Ok(run)
    }

    /// Execute an admitted run to a terminal status
    ///
    /// When a store error aborts the run, it is closed as cancelled on a best
    /// effort basis so it does not block later runs.
    pub async fn execute_run(&self, run: SyncRun) -> Result<SyncRun, AppError> {
        let run_id = run
            .id
            .ok_or_else(|| AppError::Internal("run was never admitted".to_string()))?;

        match self.drive_run(run_id, run).await {
            Ok(run) => Ok(run),
            Err(e) => {
                error!(run_id, error = %e, "Sync run aborted");
                let reason = format!("Run aborted: {}", e);
                match self.database.abandon_run(run_id, &reason).await {
                    Ok(true) => info!(run_id, "Aborted run closed as cancelled"),
                    Ok(false) => {}
                    Err(close_err) => {
                        warn!(run_id, error = %close_err, "Failed to close aborted run")
                    }
                }
                Err(e)
            }
        }
    }

    /// Close runs left in progress by a previous process
    ///
    /// Call once at startup, before any run is admitted.
    pub async fn recover_interrupted_runs(&self) -> Result<u64, AppError> {
        let closed = self
            .database
            .abandon_in_progress_runs(INTERRUPTED_REASON)
            .await?;
        if closed > 0 {
            warn!(runs = closed, "Closed sync runs interrupted by a previous shutdown");
        }
        Ok(closed)
    }

    async fn drive_run(&self, run_id: i64, mut run: SyncRun) -> Result<SyncRun, AppError> {
        let started = Instant::now();
        let calls_before = self.fetcher.calls_made();
        let cancel_rx = self.cancel.subscribe();

        for index in 0..run.entities.len() {
            if self.cancellation_observed(run_id, &cancel_rx).await? {
                return self.close_cancelled(run, started).await;
            }

            self.sync_entity(&mut run, index).await;
            run.api_calls_made = self.fetcher.calls_made().saturating_sub(calls_before);

            if !self.database.update_run_progress(&run).await? {
                info!(run_id, "Run was ended by another actor, stopping");
                return self.close_cancelled(run, started).await;
            }
        }

        let run = run.finish();
        if !self.database.update_run_progress(&run).await? {
            info!(run_id, "Run was ended by another actor before completion");
            return self.close_cancelled(run, started).await;
        }

        info!(
            run_id,
            status = %run.status,
            records = run.records_processed,
            errors = run.records_errors,
            api_calls = run.api_calls_made,
            duration_secs = started.elapsed().as_secs_f64(),
            "Sync run finished"
        );
        self.record_run(&run, started);
        Ok(run)
    }

    /// Admit and execute a run
    pub async fn run_sync<S: AsRef<str>>(&self, requested: &[S]) -> Result<SyncRun, AppError> {
        let run = self.begin_run(requested).await?;
        self.execute_run(run).await
    }

    /// Cancel the active run; true when one was running
    pub async fn cancel_run(&self) -> Result<bool, AppError> {
        Ok(self.cancel_active_run().await?.is_some())
    }

    /// Cancel the active run and return its ID
    pub async fn cancel_active_run(&self) -> Result<Option<i64>, AppError> {
        let cancelled = self.database.cancel_active_run(CANCEL_REASON).await?;
        match cancelled {
            Some(run_id) => {
                info!(run_id, "Sync run cancelled");
                self.cancel.publish(run_id);
            }
            None => info!("Cancel requested but no run is in progress"),
        }
        Ok(cancelled)
    }

    /// Most recently started run
    pub async fn latest_run(&self) -> Result<Option<SyncRun>, AppError> {
        Ok(self.database.get_latest_run().await?)
    }

    pub async fn run(&self, id: i64) -> Result<Option<SyncRun>, AppError> {
        Ok(self.database.get_run(id).await?)
    }

    async fn sync_entity(&self, run: &mut SyncRun, index: usize) {
        let name = run.entities[index].entity.clone();
        let slot = EntitySlot::new(name.as_str()).in_progress();

        let Some(kind) = EntityKind::parse(&name) else {
            warn!(entity = %name, "Unknown entity requested");
            run.records_errors += 1;
            run.entities[index] = slot.failed(format!("Unknown entity: {}", name));
            self.record_entity(&name, "unknown", 0);
            return;
        };
        let def = kind.def();

        let fetch = match self.fetcher.fetch_entity(def).await {
            Ok(fetch) => fetch,
            Err(e) => {
                error!(entity = %kind, error = %e, "Entity sync failed");
                run.records_errors += 1;
                run.entities[index] = slot.failed(e.to_string());
                self.record_entity(kind.id(), "failed", 0);
                return;
            }
        };

        let count = fetch.result.records.len() as u64;
        let summary = match self.database.save_records(kind.id(), &fetch.result.records).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(entity = %kind, error = %e, "Failed to store entity records");
                run.records_errors += 1;
                run.entities[index] = slot.failed(format!("Failed to store records: {}", e));
                self.record_entity(kind.id(), "failed", count);
                return;
            }
        };

        run.records_processed += count;
        run.records_inserted += summary.inserted;
        run.records_updated += summary.updated;
        run.records_errors += summary.errors;

        if fetch.result.truncated {
            warn!(entity = %kind, records = count, "Entity fetch truncated by pagination ceiling");
        }
        info!(
            entity = %kind,
            endpoint = %fetch.endpoint,
            records = count,
            inserted = summary.inserted,
            updated = summary.updated,
            "Entity synchronized"
        );

        let mut slot = slot.succeeded(count, fetch.endpoint);
        slot.truncated = fetch.result.truncated;
        slot.warnings = fetch.result.warnings;
        run.entities[index] = slot;
        self.record_entity(kind.id(), "succeeded", count);
    }

    /// Checkpoint between entities
    async fn cancellation_observed(
        &self,
        run_id: i64,
        cancel_rx: &watch::Receiver<Option<i64>>,
    ) -> Result<bool, AppError> {
        if *cancel_rx.borrow() == Some(run_id) {
            return Ok(true);
        }
        let stored = self.database.get_run(run_id).await?;
        Ok(stored.is_some_and(|stored| stored.status != RunStatus::InProgress))
    }

    /// Settle a run that stopped early, keeping the stored terminal state
    async fn close_cancelled(&self, run: SyncRun, started: Instant) -> Result<SyncRun, AppError> {
        let run_id = run.id.unwrap_or_default();

        let closed = match self.database.get_run(run_id).await? {
            Some(stored) if stored.status.is_terminal() => stored,
            _ => {
                let cancelled = run.cancelled(CANCEL_REASON);
                self.database.update_run_progress(&cancelled).await?;
                cancelled
            }
        };

        info!(
            run_id,
            status = %closed.status,
            progress = closed.progress_percent(),
            "Sync run stopped before completion"
        );
        self.record_run(&closed, started);
        Ok(closed)
    }

    fn record_entity(&self, entity: &str, outcome: &str, records: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_entity(entity, outcome, records);
        }
    }

    fn record_run(&self, run: &SyncRun, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_run(&run.status.to_string(), started.elapsed().as_secs_f64());
        }
    }
}

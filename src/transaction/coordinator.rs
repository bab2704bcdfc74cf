//! Transaction Coordinator
//!
//! Owns the transaction lifecycle:
//! `pending -> queued -> executing -> {committed | failed}`, with
//! `rolled_back` reachable from every non-terminal state through `rollback`.
//!
//! A commit plans its operations into remote calls, runs each call under an
//! admission permit with retries, stops at the first call that cannot
//! complete, and restores the pre-commit snapshot when the transaction asked
//! for auto-rollback.

use super::collaborators::{ClientRouter, SnapshotError, SnapshotGateway, SnapshotHandle};
use super::coordinator_config::CoordinatorConfig;
use super::operation::{Operation, QueuedOperation};
use super::resource_lock::ResourceLocks;
use super::transaction_errors::{TransactionError, TransactionResult};
use super::transaction_types::{
    CommitEffect, CommitResult, CoordinatorStats, ListFilter, OperationOutcome, OperationResult,
    RollbackReport, StatusBreakdown, Transaction, TransactionList, TransactionView,
};
use crate::admission::AdmissionController;
use crate::batcher::{BatchingHint, OperationBatcher};
use crate::config::Config;
use crate::metrics::{metrics, Timer};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::structured_logging::CommitLogger;
use crate::types::{BeginOptions, IsolationLevel, TransactionId, TransactionStatus};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type TransactionHandle = Arc<Mutex<Transaction>>;

/// Lifetime totals, lock-free
#[derive(Debug, Default)]
struct CoordinatorCounters {
    transactions_begun: AtomicU64,
    commits_succeeded: AtomicU64,
    commits_failed: AtomicU64,
    rollbacks: AtomicU64,
    operations_committed: AtomicU64,
    api_calls_issued: AtomicU64,
    api_calls_saved: AtomicU64,
    remote_attempts: AtomicU64,
    retries: AtomicU64,
}

impl CoordinatorCounters {
    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Working state of one commit
#[derive(Debug)]
struct CommitRun {
    results: Vec<OperationResult>,
    snapshot: Option<SnapshotHandle>,
    hints: Vec<BatchingHint>,
    failed: bool,
    issued: usize,
    /// Operations carried by dispatched calls
    covered: usize,
    attempts: u32,
    retries: u32,
    rollback_attempted: bool,
    rolled_back: bool,
    rollback_error: Option<String>,
}

impl CommitRun {
    fn new(operations: &[QueuedOperation]) -> Self {
        Self {
            results: operations.iter().map(OperationResult::not_executed).collect(),
            snapshot: None,
            hints: Vec::new(),
            failed: false,
            issued: 0,
            covered: 0,
            attempts: 0,
            retries: 0,
            rollback_attempted: false,
            rolled_back: false,
            rollback_error: None,
        }
    }

    fn result_mut(&mut self, sequence_number: u64) -> Option<&mut OperationResult> {
        let index = self
            .results
            .binary_search_by_key(&sequence_number, |r| r.sequence_number)
            .ok()?;
        self.results.get_mut(index)
    }

    fn saved(&self) -> usize {
        self.covered.saturating_sub(self.issued)
    }

    fn any_applied(&self) -> bool {
        self.results.iter().any(OperationResult::succeeded)
    }

    fn effect(&self) -> CommitEffect {
        if !self.failed {
            if self.rollback_attempted {
                return if self.rolled_back {
                    CommitEffect::RolledBack
                } else {
                    CommitEffect::RollbackFailed
                };
            }
            return CommitEffect::AllApplied;
        }

        match (self.rollback_attempted, self.rolled_back) {
            (true, true) => CommitEffect::RolledBack,
            (true, false) => CommitEffect::RollbackFailed,
            _ if self.any_applied() => CommitEffect::PartiallyApplied,
            _ => CommitEffect::NoneApplied,
        }
    }
}

/// Coordinates transactions over a shared admission controller
pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    retry: RetryPolicy,
    batcher: OperationBatcher,
    admission: AdmissionController,
    snapshots: Arc<dyn SnapshotGateway>,
    router: Arc<ClientRouter>,
    transactions: DashMap<TransactionId, TransactionHandle>,
    locks: ResourceLocks,
    active: AtomicUsize,
    counters: CoordinatorCounters,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("config", &self.config)
            .field("transactions", &self.transactions.len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        admission: AdmissionController,
        retry: RetryPolicy,
        batcher: OperationBatcher,
        snapshots: Arc<dyn SnapshotGateway>,
        router: ClientRouter,
    ) -> Self {
        Self {
            config,
            retry,
            batcher,
            admission,
            snapshots,
            router: Arc::new(router),
            transactions: DashMap::new(),
            locks: ResourceLocks::new(),
            active: AtomicUsize::new(0),
            counters: CoordinatorCounters::default(),
        }
    }

    /// Build every component from a loaded configuration
    pub fn from_config(
        config: &Config,
        snapshots: Arc<dyn SnapshotGateway>,
        router: ClientRouter,
    ) -> Self {
        Self::new(
            config.coordinator.clone(),
            AdmissionController::new(config.admission.clone()),
            config.retry.clone(),
            OperationBatcher::new(config.batching.clone()),
            snapshots,
            router,
        )
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    fn handle(&self, id: TransactionId) -> TransactionResult<TransactionHandle> {
        self.transactions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TransactionError::NotFound(id))
    }

    fn reserve_slot(&self) -> TransactionResult<()> {
        let limit = self.config.max_active_transactions;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < limit).then_some(active + 1)
            })
            .map_err(|active| TransactionError::ResourceExhausted { active, limit })?;
        metrics().active_transactions.inc();
        Ok(())
    }

    fn release_slot(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics().active_transactions.dec();
    }

    /// Move to `status`, giving back the active slot when leaving the active set
    fn settle(&self, tx: &mut Transaction, status: TransactionStatus) {
        let was_active = tx.status.is_active();
        tx.finish(status);
        if was_active && !status.is_active() {
            self.release_slot();
        }
        if status == TransactionStatus::RolledBack {
            CoordinatorCounters::add(&self.counters.rollbacks, 1);
            metrics().rollbacks_total.inc();
        }
    }

    /// Start a transaction against `resource_id`
    ///
    /// Waits while a serializable commit holds the resource.
    pub async fn begin(
        &self,
        resource_id: &str,
        options: BeginOptions,
    ) -> TransactionResult<TransactionId> {
        if self.admission.is_closed() {
            return Err(TransactionError::Shutdown);
        }

        self.reserve_slot()?;
        let slot = scopeguard::guard((), |_| self.release_slot());

        tokio::select! {
            _ = self.locks.wait_until_free(resource_id) => {}
            _ = self.admission.closed() => return Err(TransactionError::Shutdown),
        }

        let tx = Transaction::new(resource_id, options);
        let id = tx.id;
        self.transactions.insert(id, Arc::new(Mutex::new(tx)));
        scopeguard::ScopeGuard::into_inner(slot);

        CoordinatorCounters::add(&self.counters.transactions_begun, 1);
        metrics().transactions_begun.inc();
        info!(
            transaction_id = %id,
            resource_id = %resource_id,
            isolation = options.isolation_level.as_str(),
            auto_rollback = options.auto_rollback,
            "Transaction started"
        );

        Ok(id)
    }

    /// Append an operation; returns its 1-based queue position
    pub fn queue(&self, id: TransactionId, operation: Operation) -> TransactionResult<u64> {
        let handle = self.handle(id)?;
        let mut tx = handle.lock();

        if !tx.status.accepts_operations() {
            return Err(TransactionError::FailedPrecondition {
                id,
                status: tx.status,
                action: "queue",
            });
        }
        if operation.scope.resource_id != tx.resource_id {
            return Err(TransactionError::ResourceMismatch {
                id,
                expected: tx.resource_id.clone(),
                found: operation.scope.resource_id.clone(),
            });
        }

        debug!(
            transaction_id = %id,
            operation = %operation.kind,
            range = ?operation.scope.range,
            "Operation queued"
        );
        let position = tx.push(operation);
        metrics().operations_queued.inc();

        let threshold = self.config.queue_warning_threshold;
        if tx.operations.len() == threshold + 1 {
            let message = format!(
                "{} operations queued, above the recommended {}; consider smaller transactions",
                tx.operations.len(),
                threshold
            );
            warn!(transaction_id = %id, queued = tx.operations.len(), threshold, "Large transaction queue");
            tx.warnings.push(message);
        }

        Ok(position)
    }

    /// Execute every queued operation as one unit of work
    ///
    /// Remote-call failures never surface as `Err`; they are reported in the
    /// returned result together with what happened to the resource.
    pub async fn commit(&self, id: TransactionId) -> TransactionResult<CommitResult> {
        let handle = self.handle(id)?;
        let (resource_id, isolation, auto_rollback, operations) = {
            let mut tx = handle.lock();
            if !tx.status.accepts_operations() {
                return Err(TransactionError::FailedPrecondition {
                    id,
                    status: tx.status,
                    action: "commit",
                });
            }
            if self.admission.is_closed() {
                return Err(TransactionError::Shutdown);
            }

            tx.status = TransactionStatus::Executing;
            tx.results = tx.operations.iter().map(OperationResult::not_executed).collect();
            (
                tx.resource_id.clone(),
                tx.isolation_level,
                tx.auto_rollback,
                tx.operations.clone(),
            )
        };

        // Settles the transaction if this future is dropped mid-commit
        let abandon = scopeguard::guard(Arc::clone(&handle), |handle| {
            self.abandon_commit(&handle);
        });

        let timer = Timer::new();
        let logger = CommitLogger::new(id, &resource_id);
        logger.log_commit_started(operations.len(), isolation);

        let busy = match isolation {
            IsolationLevel::Serializable => Some(self.locks.mark_busy(&resource_id).await),
            _ => None,
        };

        let mut run = self
            .run_commit(&handle, &logger, &resource_id, auto_rollback, &operations)
            .await;

        let deferred = handle.lock().rollback_requested;
        if deferred {
            self.apply_deferred_rollback(&handle, &logger, &mut run).await;
        }
        drop(busy);

        scopeguard::ScopeGuard::into_inner(abandon);

        let succeeded = !run.failed;
        let status = match (deferred, &run.rollback_error) {
            (true, None) => TransactionStatus::RolledBack,
            _ if succeeded => TransactionStatus::Committed,
            _ => TransactionStatus::Failed,
        };

        let result = CommitResult {
            transaction_id: id,
            succeeded,
            status,
            effect: run.effect(),
            api_calls_issued: run.issued,
            api_calls_saved: run.saved(),
            remote_attempts: run.attempts,
            reversible: run.snapshot.is_some(),
            rollback_attempted: run.rollback_attempted,
            rolled_back: run.rolled_back,
            rollback_error: run.rollback_error.clone(),
            snapshot: run.snapshot.clone(),
            hints: run.hints.clone(),
            duration_ms: timer.elapsed_ms(),
            operation_results: run.results,
        };

        {
            let mut tx = handle.lock();
            tx.results = result.operation_results.clone();
            tx.snapshot = result.snapshot.clone();
            tx.restored |= result.rolled_back;
            tx.rollback_requested = false;
            if deferred {
                if let Some(error) = &result.rollback_error {
                    tx.warnings.push(format!("deferred rollback failed: {}", error));
                }
            }
            self.settle(&mut tx, status);
            tx.commit_result = Some(result.clone());
        }

        self.record_commit(&result, operations.len(), run.retries);
        timer.observe_duration(&metrics().commit_duration_seconds);
        logger.log_commit_finished(
            succeeded,
            result.api_calls_issued,
            result.api_calls_saved,
            result.duration_ms,
        );

        Ok(result)
    }

    async fn run_commit(
        &self,
        handle: &TransactionHandle,
        logger: &CommitLogger,
        resource_id: &str,
        auto_rollback: bool,
        operations: &[QueuedOperation],
    ) -> CommitRun {
        let mut run = CommitRun::new(operations);
        if operations.is_empty() {
            return run;
        }

        if auto_rollback || self.config.snapshot_every_commit {
            match self.capture_snapshot(resource_id).await {
                Ok(snapshot) => {
                    logger.log_snapshot_captured(&snapshot.snapshot_id);
                    handle.lock().snapshot = Some(snapshot.clone());
                    run.snapshot = Some(snapshot);
                }
                Err(err) => {
                    metrics().snapshot_failures.inc();
                    logger.log_snapshot_failed(&err);
                    handle
                        .lock()
                        .warnings
                        .push(format!("snapshot capture failed: {}", err));
                }
            }
        }

        let plan = self.batcher.plan(operations);
        logger.log_plan(&plan);
        run.hints = plan.hints.clone();

        for call in &plan.calls {
            logger.log_call_dispatched(call);

            let shared = Arc::new(call.clone());
            let router = Arc::clone(&self.router);
            let outcome = execute_with_retry(
                &self.retry,
                &self.admission,
                self.config.call_timeout(),
                &call.label(),
                move |_attempt| {
                    let router = Arc::clone(&router);
                    let call = Arc::clone(&shared);
                    async move { router.invoke(&call).await }
                },
            )
            .await;

            let batched_with: Vec<u64> = if call.is_merged() {
                call.sequence_numbers.iter().copied().collect()
            } else {
                Vec::new()
            };

            let (outcome, retry_count) = match outcome {
                Ok(success) => {
                    run.issued += 1;
                    run.covered += call.operation_count();
                    run.attempts += success.attempts;
                    run.retries += success.retry_count;
                    (
                        OperationOutcome::Succeeded {
                            response: success.value,
                        },
                        success.retry_count,
                    )
                }
                Err(failure) => {
                    logger.log_call_failed(call, &failure);
                    if failure.attempts > 0 {
                        run.issued += 1;
                        run.covered += call.operation_count();
                    }
                    run.attempts += failure.attempts;
                    run.retries += failure.retry_count;
                    run.failed = true;
                    (
                        OperationOutcome::Failed {
                            error: failure.error,
                            class: failure.class,
                        },
                        failure.retry_count,
                    )
                }
            };

            for sequence_number in call.sequence_numbers.iter() {
                if let Some(result) = run.result_mut(*sequence_number) {
                    result.outcome = outcome.clone();
                    result.retry_count = retry_count;
                    result.batched_with = batched_with.clone();
                }
            }

            // Progress is stored for every level; `view` hides it unless read_uncommitted
            handle.lock().results = run.results.clone();

            if run.failed {
                break;
            }
        }

        if run.failed && auto_rollback {
            if let Some(snapshot) = run.snapshot.clone() {
                run.rollback_attempted = true;
                match self.restore_snapshot(&snapshot).await {
                    Ok(_) => {
                        run.rolled_back = true;
                        logger.log_rollback(true, None);
                    }
                    Err(err) => {
                        let message = err.to_string();
                        logger.log_rollback(false, Some(&message));
                        run.rollback_error = Some(message);
                    }
                }
            }
        }

        run
    }

    /// Settle a commit whose future was dropped while executing
    ///
    /// The transaction becomes `failed` and gives back its slot. Results keep
    /// the calls that completed; the call in flight at the drop stays
    /// `not_executed`. A later `rollback` restores the snapshot if one was
    /// captured.
    fn abandon_commit(&self, handle: &TransactionHandle) {
        let mut tx = handle.lock();
        if tx.status != TransactionStatus::Executing {
            return;
        }

        let pending_rollback = std::mem::take(&mut tx.rollback_requested);
        let not_run = not_executed(&tx);
        warn!(
            transaction_id = %tx.id,
            not_executed = not_run,
            pending_rollback,
            "Commit abandoned before completion"
        );

        tx.abandoned = true;
        tx.warnings.push(format!(
            "commit abandoned before completion; {} operations not executed",
            not_run
        ));
        if pending_rollback {
            tx.warnings
                .push("requested rollback was not applied; call rollback again".to_string());
        }
        self.settle(&mut tx, TransactionStatus::Failed);

        CoordinatorCounters::add(&self.counters.commits_failed, 1);
        metrics().commits_failed.inc();
    }

    /// Honour a `rollback` that arrived while the commit was executing
    async fn apply_deferred_rollback(
        &self,
        handle: &TransactionHandle,
        logger: &CommitLogger,
        run: &mut CommitRun,
    ) {
        info!(transaction_id = %logger.transaction_id(), "Applying deferred rollback");

        let needs_restore = run.issued > 0 && !run.rolled_back;
        let snapshot = match (&run.snapshot, needs_restore) {
            (Some(snapshot), true) => snapshot.clone(),
            (None, true) => {
                let message = "no snapshot was captured; applied operations remain".to_string();
                logger.log_rollback(false, Some(&message));
                run.rollback_error = Some(message);
                return;
            }
            (_, false) => {
                logger.log_rollback(run.rolled_back, None);
                return;
            }
        };

        run.rollback_attempted = true;
        match self.restore_snapshot(&snapshot).await {
            Ok(_) => {
                run.rolled_back = true;
                run.rollback_error = None;
                logger.log_rollback(true, None);
            }
            Err(err) => {
                let message = err.to_string();
                logger.log_rollback(false, Some(&message));
                run.rollback_error = Some(message);
            }
        }

        handle.lock().restored |= run.rolled_back;
    }

    async fn capture_snapshot(&self, resource_id: &str) -> Result<SnapshotHandle, SnapshotError> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|err| SnapshotError::Unavailable(err.to_string()))?;

        match tokio::time::timeout(self.config.call_timeout(), self.snapshots.capture(resource_id))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::CaptureFailed {
                resource_id: resource_id.to_string(),
                message: format!("timed out after {}ms", self.config.call_timeout_ms),
            }),
        }
    }

    /// Restores still run after shutdown; the permit is taken only if available
    async fn restore_snapshot(&self, snapshot: &SnapshotHandle) -> Result<String, SnapshotError> {
        let _permit = self.admission.acquire().await.ok();

        let result = match tokio::time::timeout(
            self.config.call_timeout(),
            self.snapshots.restore(snapshot),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::RestoreFailed {
                snapshot_id: snapshot.snapshot_id.clone(),
                message: format!("timed out after {}ms", self.config.call_timeout_ms),
            }),
        };

        if result.is_err() {
            metrics().restore_failures.inc();
        }
        result
    }

    fn record_commit(&self, result: &CommitResult, operations: usize, retries: u32) {
        let counters = &self.counters;
        let m = metrics();

        if result.succeeded {
            CoordinatorCounters::add(&counters.commits_succeeded, 1);
            CoordinatorCounters::add(&counters.operations_committed, operations as u64);
            m.commits_succeeded.inc();
        } else {
            CoordinatorCounters::add(&counters.commits_failed, 1);
            m.commits_failed.inc();
        }

        CoordinatorCounters::add(&counters.api_calls_issued, result.api_calls_issued as u64);
        CoordinatorCounters::add(&counters.api_calls_saved, result.api_calls_saved as u64);
        CoordinatorCounters::add(&counters.remote_attempts, result.remote_attempts as u64);
        CoordinatorCounters::add(&counters.retries, retries as u64);
        m.api_calls_issued.inc_by(result.api_calls_issued as u64);
        m.api_calls_saved.inc_by(result.api_calls_saved as u64);
    }

    /// Roll a transaction back
    ///
    /// - already rolled back: no-op
    /// - pending / queued: queued operations are discarded
    /// - executing: recorded and applied when the running commit finishes
    /// - failed: the snapshot is restored if one exists and was not already
    ///   restored by auto-rollback
    /// - committed: `FAILED_PRECONDITION`
    pub async fn rollback(&self, id: TransactionId) -> TransactionResult<RollbackReport> {
        let handle = self.handle(id)?;

        let snapshot = {
            let mut tx = handle.lock();
            let previous = tx.status;
            let report = |tx: &Transaction, discarded: usize, deferred: bool| RollbackReport {
                transaction_id: id,
                previous_status: previous,
                status: tx.status,
                discarded_operations: discarded,
                restore_attempted: false,
                restored: false,
                restore_error: None,
                deferred,
            };

            match previous {
                TransactionStatus::RolledBack => {
                    debug!(transaction_id = %id, "Rollback of rolled back transaction is a no-op");
                    return Ok(report(&tx, 0, false));
                }
                TransactionStatus::Committed => {
                    return Err(TransactionError::FailedPrecondition {
                        id,
                        status: previous,
                        action: "roll back",
                    });
                }
                TransactionStatus::Pending | TransactionStatus::Queued => {
                    let discarded = tx.operations.len();
                    tx.results = tx.operations.iter().map(OperationResult::not_executed).collect();
                    self.settle(&mut tx, TransactionStatus::RolledBack);
                    info!(transaction_id = %id, discarded, "Transaction rolled back before commit");
                    return Ok(report(&tx, discarded, false));
                }
                TransactionStatus::Executing => {
                    tx.rollback_requested = true;
                    info!(transaction_id = %id, "Rollback deferred until the running commit finishes");
                    return Ok(report(&tx, 0, true));
                }
                TransactionStatus::Failed => {
                    // An abandoned commit may have applied the call it was waiting on
                    let executed = tx.abandoned
                        || tx
                            .results
                            .iter()
                            .any(|r| !matches!(r.outcome, OperationOutcome::NotExecuted));
                    let restorable = tx.snapshot.clone().filter(|_| executed && !tx.restored);
                    match restorable {
                        Some(snapshot) => snapshot,
                        None => {
                            let discarded = not_executed(&tx);
                            self.settle(&mut tx, TransactionStatus::RolledBack);
                            info!(transaction_id = %id, "Failed transaction rolled back");
                            return Ok(report(&tx, discarded, false));
                        }
                    }
                }
            }
        };

        let logger = CommitLogger::new(id, &snapshot.resource_id);
        let restore = self.restore_snapshot(&snapshot).await;

        let mut tx = handle.lock();
        let previous = TransactionStatus::Failed;
        let discarded = not_executed(&tx);

        if tx.status == TransactionStatus::RolledBack {
            // A concurrent rollback finished first
            return Ok(RollbackReport {
                transaction_id: id,
                previous_status: previous,
                status: tx.status,
                discarded_operations: discarded,
                restore_attempted: true,
                restored: restore.is_ok(),
                restore_error: restore.err().map(|e| e.to_string()),
                deferred: false,
            });
        }

        let report = match restore {
            Ok(_) => {
                tx.restored = true;
                self.settle(&mut tx, TransactionStatus::RolledBack);
                logger.log_rollback(true, None);
                RollbackReport {
                    transaction_id: id,
                    previous_status: previous,
                    status: tx.status,
                    discarded_operations: discarded,
                    restore_attempted: true,
                    restored: true,
                    restore_error: None,
                    deferred: false,
                }
            }
            Err(err) => {
                let message = err.to_string();
                logger.log_rollback(false, Some(&message));
                tx.warnings.push(format!("rollback restore failed: {}", message));
                RollbackReport {
                    transaction_id: id,
                    previous_status: previous,
                    status: tx.status,
                    discarded_operations: discarded,
                    restore_attempted: true,
                    restored: false,
                    restore_error: Some(message),
                    deferred: false,
                }
            }
        };

        Ok(report)
    }

    /// Read-only view of one transaction
    pub fn status(&self, id: TransactionId) -> TransactionResult<TransactionView> {
        let handle = self.handle(id)?;
        let view = handle.lock().view();
        Ok(view)
    }

    /// Transactions matching `filter`, newest first
    pub fn list(&self, filter: &ListFilter) -> TransactionList {
        let mut breakdown = StatusBreakdown::default();
        let mut views: Vec<TransactionView> = self
            .transactions
            .iter()
            .filter_map(|entry| {
                let tx = entry.value().lock();
                if !filter.matches(&tx) {
                    return None;
                }
                breakdown.record(tx.status);
                Some(tx.view())
            })
            .collect();

        views.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        let total = views.len();
        if let Some(limit) = filter.limit {
            views.truncate(limit);
        }

        TransactionList {
            transactions: views,
            breakdown,
            total,
        }
    }

    pub fn status_breakdown(&self) -> StatusBreakdown {
        let mut breakdown = StatusBreakdown::default();
        for entry in self.transactions.iter() {
            breakdown.record(entry.value().lock().status);
        }
        breakdown
    }

    pub fn active_transactions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let counters = &self.counters;
        CoordinatorStats {
            admission: self.admission.snapshot(),
            transactions: self.status_breakdown(),
            transactions_begun: CoordinatorCounters::get(&counters.transactions_begun),
            commits_succeeded: CoordinatorCounters::get(&counters.commits_succeeded),
            commits_failed: CoordinatorCounters::get(&counters.commits_failed),
            rollbacks: CoordinatorCounters::get(&counters.rollbacks),
            operations_committed: CoordinatorCounters::get(&counters.operations_committed),
            api_calls_issued: CoordinatorCounters::get(&counters.api_calls_issued),
            api_calls_saved: CoordinatorCounters::get(&counters.api_calls_saved),
            remote_attempts: CoordinatorCounters::get(&counters.remote_attempts),
            retries: CoordinatorCounters::get(&counters.retries),
        }
    }

    /// Drop committed / rolled back transactions past the retention window
    /// and idle busy markers; returns how many transactions were removed
    pub fn prune_finished(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.finished_retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));

        let before = self.transactions.len();
        if let Some(cutoff) = cutoff {
            self.transactions.retain(|_, handle| {
                let tx = handle.lock();
                !(tx.status.is_terminal() && tx.ended_at.is_some_and(|ended| ended <= cutoff))
            });
        }
        let removed = before - self.transactions.len();
        let markers = self.locks.prune();

        if removed > 0 || markers > 0 {
            debug!(removed, markers, "Pruned finished transactions");
        }
        removed
    }

    /// Stop admitting remote calls; running commits fail their current call
    pub fn shutdown(&self) {
        info!(active = self.active_transactions(), "Coordinator shutting down");
        self.admission.close();
    }
}

fn not_executed(tx: &Transaction) -> usize {
    tx.results
        .iter()
        .filter(|r| matches!(r.outcome, OperationOutcome::NotExecuted))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::retry::RemoteError;
    use crate::simulation::InMemorySheets;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator_with(
        sheets: &Arc<InMemorySheets>,
        config: CoordinatorConfig,
    ) -> TransactionCoordinator {
        TransactionCoordinator::new(
            config,
            AdmissionController::new(AdmissionConfig::default()),
            RetryPolicy::fast(3),
            OperationBatcher::default(),
            sheets.clone(),
            ClientRouter::single(sheets.clone()),
        )
    }

    fn coordinator(sheets: &Arc<InMemorySheets>) -> TransactionCoordinator {
        coordinator_with(sheets, CoordinatorConfig::default())
    }

    fn write(range: &str, value: i64) -> Operation {
        Operation::new("values", "write", "sheet-1")
            .with_range(range)
            .with_params(json!({ "values": [[value]] }))
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);
        let id = TransactionId::new();

        assert_eq!(
            coordinator.queue(id, write("A1", 1)).unwrap_err().code(),
            "NOT_FOUND"
        );
        assert_eq!(coordinator.commit(id).await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(coordinator.rollback(id).await.unwrap_err().code(), "NOT_FOUND");
        assert!(coordinator.status(id).is_err());
    }

    #[tokio::test]
    async fn test_queue_positions_and_status() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);
        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();

        assert_eq!(coordinator.status(id).unwrap().status, TransactionStatus::Pending);
        assert_eq!(coordinator.queue(id, write("A1", 1)).unwrap(), 1);
        assert_eq!(coordinator.queue(id, write("A2", 2)).unwrap(), 2);
        assert_eq!(coordinator.status(id).unwrap().status, TransactionStatus::Queued);
    }

    #[tokio::test]
    async fn test_empty_commit_is_trivial() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);
        let id = coordinator
            .begin("sheet-1", BeginOptions::default().with_auto_rollback(true))
            .await
            .unwrap();

        let result = coordinator.commit(id).await.unwrap();
        assert!(result.succeeded);
        assert_eq!(result.status, TransactionStatus::Committed);
        assert_eq!(result.effect, CommitEffect::AllApplied);
        assert_eq!(result.api_calls_issued, 0);
        assert!(result.snapshot.is_none());
        assert_eq!(sheets.call_count(), 0);
        assert_eq!(sheets.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_active_transaction_ceiling() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator_with(
            &sheets,
            CoordinatorConfig {
                max_active_transactions: 2,
                ..CoordinatorConfig::default()
            },
        );

        let first = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        coordinator.begin("sheet-2", BeginOptions::default()).await.unwrap();

        let err = coordinator
            .begin("sheet-3", BeginOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::ResourceExhausted { active: 2, limit: 2 });

        // Finishing one frees a slot
        coordinator.commit(first).await.unwrap();
        assert_eq!(coordinator.active_transactions(), 1);
        assert!(coordinator.begin("sheet-3", BeginOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_size_warning_logged_once() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator_with(
            &sheets,
            CoordinatorConfig {
                queue_warning_threshold: 2,
                ..CoordinatorConfig::default()
            },
        );
        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();

        for row in 1..=5 {
            coordinator.queue(id, write(&format!("A{}", row), row)).unwrap();
        }

        let view = coordinator.status(id).unwrap();
        assert_eq!(view.warnings.len(), 1);
        assert_eq!(view.operation_count, 5);
    }

    #[tokio::test]
    async fn test_rollback_of_committed_is_rejected() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);
        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        coordinator.queue(id, write("A1", 1)).unwrap();
        coordinator.commit(id).await.unwrap();

        let err = coordinator.rollback(id).await.unwrap_err();
        assert_eq!(err.code(), "FAILED_PRECONDITION");
        assert_eq!(coordinator.status(id).unwrap().status, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn test_failed_without_snapshot_reports_partial_effect() {
        let sheets = Arc::new(InMemorySheets::new());
        sheets.inject_range_failure(
            "A2",
            RemoteError::PermissionDenied {
                message: "protected range".to_string(),
            },
            u32::MAX,
        );
        let coordinator = coordinator(&sheets);
        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        coordinator.queue(id, write("A1", 1)).unwrap();
        coordinator.queue(id, write("A2", 2)).unwrap();
        coordinator.queue(id, write("A3", 3)).unwrap();

        let result = coordinator.commit(id).await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.status, TransactionStatus::Failed);
        assert_eq!(result.effect, CommitEffect::PartiallyApplied);
        assert!(!result.reversible);
        assert!(!result.rollback_attempted);
        assert!(result.operation_results[0].succeeded());
        assert!(result.operation_results[1].failed());
        assert_eq!(
            result.operation_results[2].outcome,
            OperationOutcome::NotExecuted
        );

        // Manual cleanup without a snapshot still reaches rolled_back
        let report = coordinator.rollback(id).await.unwrap();
        assert_eq!(report.status, TransactionStatus::RolledBack);
        assert!(!report.restore_attempted);
        assert_eq!(report.discarded_operations, 1);
    }

    #[tokio::test]
    async fn test_explicit_rollback_restores_snapshot_of_failed_commit() {
        let sheets = Arc::new(InMemorySheets::new());
        sheets.seed_value("sheet-1", "A1", json!(0));
        sheets.inject_range_failure(
            "A2",
            RemoteError::NotFound {
                message: "sheet missing".to_string(),
            },
            u32::MAX,
        );
        let coordinator = coordinator_with(
            &sheets,
            CoordinatorConfig {
                snapshot_every_commit: true,
                ..CoordinatorConfig::default()
            },
        );
        let before = sheets.resource_state("sheet-1");

        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        coordinator.queue(id, write("A1", 1)).unwrap();
        coordinator.queue(id, write("A2", 2)).unwrap();

        let result = coordinator.commit(id).await.unwrap();
        assert!(result.reversible);
        assert!(!result.rollback_attempted);
        assert_ne!(sheets.resource_state("sheet-1"), before);

        let report = coordinator.rollback(id).await.unwrap();
        assert!(report.restore_attempted);
        assert!(report.restored);
        assert_eq!(report.status, TransactionStatus::RolledBack);
        assert_eq!(sheets.resource_state("sheet-1"), before);
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_failed_status() {
        let sheets = Arc::new(InMemorySheets::new());
        sheets.inject_range_failure(
            "A2",
            RemoteError::BadRequest {
                message: "bad".to_string(),
            },
            u32::MAX,
        );
        sheets.fail_restores(true);
        let coordinator = coordinator(&sheets);

        let id = coordinator
            .begin("sheet-1", BeginOptions::default().with_auto_rollback(true))
            .await
            .unwrap();
        coordinator.queue(id, write("A1", 1)).unwrap();
        coordinator.queue(id, write("A2", 2)).unwrap();

        let result = coordinator.commit(id).await.unwrap();
        assert_eq!(result.status, TransactionStatus::Failed);
        assert_eq!(result.effect, CommitEffect::RollbackFailed);
        assert!(result.rollback_attempted);
        assert!(!result.rolled_back);
        assert!(result.rollback_error.is_some());

        // Explicit retry of the restore, still failing
        let report = coordinator.rollback(id).await.unwrap();
        assert!(report.restore_attempted);
        assert!(!report.restored);
        assert_eq!(report.status, TransactionStatus::Failed);

        sheets.fail_restores(false);
        let report = coordinator.rollback(id).await.unwrap();
        assert!(report.restored);
        assert_eq!(report.status, TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_deferred_rollback_applies_after_commit() {
        let sheets = Arc::new(InMemorySheets::new());
        sheets.set_latency(Some((Duration::from_millis(20), Duration::from_millis(20))));
        let before = sheets.resource_state("sheet-1");
        let coordinator = Arc::new(coordinator(&sheets));

        let id = coordinator
            .begin("sheet-1", BeginOptions::default().with_auto_rollback(true))
            .await
            .unwrap();
        for row in 1..=3 {
            coordinator.queue(id, write(&format!("A{}", row), row)).unwrap();
        }

        let committing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.commit(id).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(coordinator.status(id).unwrap().status, TransactionStatus::Executing);

        let report = coordinator.rollback(id).await.unwrap();
        assert!(report.deferred);
        assert!(coordinator.status(id).unwrap().rollback_pending);

        let result = committing.await.unwrap().unwrap();
        assert_eq!(result.status, TransactionStatus::RolledBack);
        assert!(result.rolled_back);
        assert_eq!(result.effect, CommitEffect::RolledBack);
        assert_eq!(coordinator.status(id).unwrap().status, TransactionStatus::RolledBack);
        assert_eq!(sheets.resource_state("sheet-1"), before);
    }

    #[tokio::test]
    async fn test_queue_rejects_operation_for_another_resource() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);
        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();

        let operation = Operation::new("sheet", "delete", "sheet-2");
        let err = coordinator.queue(id, operation).unwrap_err();
        assert_eq!(
            err,
            TransactionError::ResourceMismatch {
                id,
                expected: "sheet-1".to_string(),
                found: "sheet-2".to_string(),
            }
        );

        let view = coordinator.status(id).unwrap();
        assert_eq!(view.status, TransactionStatus::Pending);
        assert_eq!(view.operation_count, 0);
    }

    #[tokio::test]
    async fn test_dropped_commit_releases_slot() {
        let sheets = Arc::new(InMemorySheets::new());
        sheets.set_latency(Some((Duration::from_millis(40), Duration::from_millis(40))));
        let coordinator = coordinator(&sheets);

        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        for row in 1..=3 {
            coordinator.queue(id, write(&format!("A{}", row), row)).unwrap();
        }

        {
            let commit = coordinator.commit(id);
            tokio::pin!(commit);
            tokio::select! {
                _ = &mut commit => panic!("commit should still be running"),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
            coordinator.rollback(id).await.unwrap();
            assert!(coordinator.status(id).unwrap().rollback_pending);
        }

        let view = coordinator.status(id).unwrap();
        assert_eq!(view.status, TransactionStatus::Failed);
        assert!(!view.rollback_pending);
        assert!(view.warnings.iter().any(|w| w.contains("call rollback again")));
        assert_eq!(coordinator.active_transactions(), 0);
        assert_eq!(coordinator.stats().commits_failed, 1);

        // Without a snapshot there is nothing to restore
        let report = coordinator.rollback(id).await.unwrap();
        assert!(!report.restore_attempted);
        assert_eq!(report.status, TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);
        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        coordinator.queue(id, write("A1", 1)).unwrap();

        coordinator.shutdown();
        assert_eq!(
            coordinator.begin("sheet-1", BeginOptions::default()).await,
            Err(TransactionError::Shutdown)
        );
        assert_eq!(coordinator.commit(id).await.unwrap_err().code(), "UNAVAILABLE");

        // Pending work can still be discarded
        assert!(coordinator.rollback(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator_with(
            &sheets,
            CoordinatorConfig {
                finished_retention_secs: 0,
                ..CoordinatorConfig::default()
            },
        );

        let done = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        coordinator.commit(done).await.unwrap();
        let open = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();

        assert_eq!(coordinator.prune_finished(), 1);
        assert!(coordinator.status(done).is_err());
        assert!(coordinator.status(open).is_ok());
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let sheets = Arc::new(InMemorySheets::new());
        let coordinator = coordinator(&sheets);

        let id = coordinator.begin("sheet-1", BeginOptions::default()).await.unwrap();
        for color in ["red", "green"] {
            coordinator
                .queue(
                    id,
                    Operation::new("format", "set_background", "sheet-1")
                        .with_range("A1")
                        .with_params(json!({ "backgroundColor": color }))
                        .field_patch(),
                )
                .unwrap();
        }
        coordinator.commit(id).await.unwrap();

        let stats = coordinator.stats();
        assert_eq!(stats.transactions_begun, 1);
        assert_eq!(stats.commits_succeeded, 1);
        assert_eq!(stats.operations_committed, 2);
        assert_eq!(stats.api_calls_issued, 1);
        assert_eq!(stats.api_calls_saved, 1);
        assert_eq!(stats.transactions.committed, 1);
        assert_eq!(stats.admission.in_flight, 0);
    }
}

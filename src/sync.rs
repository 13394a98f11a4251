//! Background sync engine for the driver terminal.
//!
//! Drains the offline action queue against the dispatch server: strict FIFO
//! order, exponential backoff between retries of the same action, and
//! at-least-once delivery (an action is removed only after a confirmed
//! remote apply; a crash between apply and removal replays it, which the
//! idempotency key lets the server absorb). A boolean re-entrancy guard
//! refuses overlapping drains — the network observer and the periodic loop
//! can both trigger a pass without coordination.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::db::{self, DbState};
use crate::error::TerminalError;
use crate::queue::{OfflineQueue, QueueStatus, QueueUpdate, MAX_RETRIES};

/// Base delay for the first retry (doubles per subsequent attempt).
pub const DEFAULT_RETRY_BASE_MS: u64 = 1000;

/// Retry delays are capped here no matter how high the retry count climbs.
pub const MAX_BACKOFF_MS: u64 = 16_000;

/// Delay before retrying an action that has already failed `retry_count`
/// times: `min(2^retry_count × base, 16s)`. The first attempt of any action
/// is never delayed (the drain loop only consults this when
/// `retry_count > 0`).
pub fn backoff_delay(retry_count: u32, base_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << retry_count.min(20));
    Duration::from_millis(exp.min(MAX_BACKOFF_MS))
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Actions confirmed applied and removed from the queue.
    pub processed: usize,
    /// Actions that failed this pass and stay queued for a later one.
    pub failed: usize,
    /// Actions skipped because their retries are exhausted.
    pub skipped: usize,
    /// Queue size at the start of the pass.
    pub total: usize,
}

/// Clears the `syncing` flag when the drain scope exits, on every path.
struct DrainGuard(Arc<AtomicBool>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the drain loop and its lifecycle. Constructed once at session start
/// with the injected database state and API client; shared via `Arc`.
pub struct SyncEngine {
    db: Arc<DbState>,
    queue: OfflineQueue,
    api: ApiClient,
    syncing: Arc<AtomicBool>,
    is_running: Arc<AtomicBool>,
    retry_base_delay_ms: u64,
}

impl SyncEngine {
    pub fn new(db: Arc<DbState>, api: ApiClient) -> Self {
        let queue = OfflineQueue::new(Arc::clone(&db));
        Self {
            db,
            queue,
            api,
            syncing: Arc::new(AtomicBool::new(false)),
            is_running: Arc::new(AtomicBool::new(false)),
            retry_base_delay_ms: DEFAULT_RETRY_BASE_MS,
        }
    }

    /// Override the retry backoff base. Tests use ~0 to avoid real sleeps.
    pub fn with_retry_base_delay(mut self, base_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self
    }

    /// True while a drain pass is in progress.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// True while the periodic background loop is active.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Aggregate queue status for the driver-facing sync indicator.
    pub fn status(&self) -> Result<QueueStatus, TerminalError> {
        self.queue.status(self.is_syncing())
    }

    /// Drain the queue once, front-to-back.
    ///
    /// Exhausted actions (`retry_count >= 5`) are skipped in place. A failed
    /// replay bumps the action's retry count and records the error; the
    /// action stays queued for a later pass. `last_sync_time` is updated on
    /// completion regardless of how many actions succeeded.
    ///
    /// If a drain is already in progress the call returns an empty report
    /// immediately rather than queueing a second pass.
    pub async fn process_queue(
        &self,
        mut on_progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<DrainReport, TerminalError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress; skipping re-entrant call");
            return Ok(DrainReport::default());
        }
        let _guard = DrainGuard(Arc::clone(&self.syncing));

        let snapshot = self.queue.list()?;
        let total = snapshot.len();
        let mut report = DrainReport {
            total,
            ..DrainReport::default()
        };

        for action in snapshot {
            if action.retry_count >= MAX_RETRIES {
                report.skipped += 1;
                continue;
            }

            if action.retry_count > 0 {
                let delay = backoff_delay(action.retry_count as u32, self.retry_base_delay_ms);
                debug!(
                    action_id = %action.id,
                    retry_count = action.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            match self
                .api
                .replay(&action.method, &action.endpoint, &action.data, &action.id)
                .await
            {
                Ok(_) => {
                    self.queue.remove(&action.id)?;
                    report.processed += 1;
                    if let Some(cb) = &mut on_progress {
                        cb(report.processed, total);
                    }
                }
                Err(e) => {
                    let message = e.replay_message();
                    warn!(
                        action_id = %action.id,
                        action_type = action.action_type.as_str(),
                        retry_count = action.retry_count + 1,
                        error = %message,
                        "action replay failed"
                    );
                    self.queue.update(
                        &action.id,
                        QueueUpdate {
                            retry_count: Some(action.retry_count + 1),
                            last_error: Some(message),
                        },
                    )?;
                    report.failed += 1;
                }
            }
        }

        let completed_at = Utc::now().to_rfc3339();
        {
            let conn = self
                .db
                .conn
                .lock()
                .map_err(|e| TerminalError::Internal(e.to_string()))?;
            db::set_setting(&conn, "sync", "last_sync_time", &completed_at)?;
        }

        if report.processed > 0 || report.failed > 0 {
            info!(
                processed = report.processed,
                failed = report.failed,
                skipped = report.skipped,
                total = report.total,
                "queue drain complete"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------------

    /// Start the periodic drain loop. Spawns a tokio task that wakes every
    /// `interval_secs`, probes connectivity, and drains the queue while
    /// online. Connectivity transitions are logged once per flip.
    pub fn start(self: &Arc<Self>, interval_secs: u64) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("sync loop already running");
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("Sync loop started (interval: {interval_secs}s)");
            let mut previous_online: Option<bool> = None;

            loop {
                if !engine.is_running.load(Ordering::SeqCst) {
                    info!("Sync loop stopped");
                    break;
                }

                tokio::time::sleep(Duration::from_secs(interval_secs)).await;

                if !engine.is_running.load(Ordering::SeqCst) {
                    info!("Sync loop stopped");
                    break;
                }

                let online = engine.api.probe_health().await;
                if !online {
                    if previous_online != Some(false) {
                        info!("Network offline; deferring drain and keeping queue pending");
                    }
                    previous_online = Some(false);
                    continue;
                }
                if previous_online == Some(false) {
                    info!("Network restored; resuming queued sync");
                }
                previous_online = Some(true);

                match engine.process_queue(None).await {
                    Ok(report) if report.processed > 0 => {
                        info!(processed = report.processed, "sync cycle complete");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Sync cycle failed: {e}"),
                }
            }
        });
    }

    /// Signal the background loop to exit after its current cycle. Does not
    /// abort a drain already in progress.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! DeliveryWorker - 配送ループ
//!
//! # フロー
//! 1. 起動時に RecoverySweep
//! 2. `claim_pending` で eligible なレコードを processing へ
//! 3. Dispatcher で backend に送る（request_timeout で打ち切り）
//! 4. 失敗なら Decider で retry / exhausted を決める
//! 5. `resolve` で pending / failed / 削除 に遷移
//! 6. pending も processing も空のまま idle_window が過ぎたら終了
//!
//! pending に未来のレコードしかない間は終了せず、次の eligible 時刻
//! （poll_interval と次の sweep で上限）まで眠る。
//!
//! worker.lock の heartbeat はラウンドごと・レコードごとに更新する。
//! 他のワーカーに lock を奪われたら（token 不一致）その場で止まる。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Dispatcher, RecoverySweep, on_store};
use crate::config::Config;
use crate::domain::{Decider, Resolution};
use crate::error::StoreError;
use crate::ports::EventStore;
use crate::queue::{EventRecord, LockGuard};

const MAX_BATCH_SIZE: usize = 50;

/// Backend calls one record may need: append, create on 404, append again.
const CALLS_PER_RECORD: u32 = 3;

const RESOLVE_ATTEMPTS: u32 = 3;
const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Records claimed per round. `None` claims every eligible record.
    ///
    /// Claims are stamped when the round starts, so a round must finish well
    /// inside `processing_timeout` or the sweep hands its tail to others.
    pub batch_size: Option<usize>,

    /// Exit after the queue has been empty this long.
    pub idle_window: Duration,

    pub sweep_interval: Duration,

    /// Longest sleep between store checks.
    pub poll_interval: Duration,

    pub processing_timeout: Duration,
    pub max_retry_count: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: Some(bounded_batch_size(config)),
            idle_window: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            processing_timeout: config.processing_timeout,
            max_retry_count: config.max_retry_count,
        }
    }
}

/// Half of the records that fit in a processing timeout when every backend
/// call runs to its request timeout.
fn bounded_batch_size(config: &Config) -> usize {
    let per_record = config
        .request_timeout
        .saturating_mul(CALLS_PER_RECORD)
        .as_millis()
        .max(1);
    let fits = config.processing_timeout.as_millis() / per_record;
    (fits / 2).clamp(1, MAX_BATCH_SIZE as u128) as usize
}

/// What one worker run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,

    /// Orphans returned to pending by sweeps.
    pub recovered: usize,
}

impl WorkerReport {
    pub fn merge(&mut self, other: WorkerReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.failed += other.failed;
        self.recovered += other.recovered;
    }

    fn record(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Delivered => self.delivered += 1,
            Resolution::Retry { .. } => self.retried += 1,
            Resolution::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct DeliveryWorker {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    decider: Arc<dyn Decider>,
    sweep: RecoverySweep,
    settings: WorkerSettings,
    lock: Option<LockGuard>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Dispatcher,
        decider: Arc<dyn Decider>,
        settings: WorkerSettings,
    ) -> Self {
        let sweep = RecoverySweep::new(
            Arc::clone(&store),
            settings.processing_timeout,
            settings.max_retry_count,
        );
        Self {
            store,
            dispatcher,
            decider,
            sweep,
            settings,
            lock: None,
        }
    }

    /// Keep `lock` alive for the run and refresh its heartbeat before every
    /// round and every record.
    pub fn with_lock(mut self, lock: LockGuard) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Run until the queue stays empty for `idle_window` or `shutdown` flips
    /// to true. Shutdown is honoured between records, never mid-delivery.
    ///
    /// Returns [`StoreError::LockLost`] when another worker took the lock
    /// over. Claims still held are left to that worker's sweep.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerReport, StoreError> {
        let mut report = WorkerReport::default();

        report.recovered += self.sweep.run_once().await?.recovered.len();
        let mut last_sweep = Instant::now();
        let mut idle_since: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                let released = self.sweep.release_all().await?;
                info!(released = released.len(), "shutdown requested, released claims");
                break;
            }
            self.heartbeat()?;

            if last_sweep.elapsed() >= self.settings.sweep_interval {
                report.recovered += self.sweep.run_once().await?.recovered.len();
                last_sweep = Instant::now();
            }

            let limit = self.settings.batch_size;
            let claimed = on_store(&self.store, move |s| s.claim_pending(limit)).await?;

            if !claimed.is_empty() {
                idle_since = None;
                debug!(count = claimed.len(), "claimed records");
                for record in claimed {
                    // unprocessed claims are released at the top of the loop
                    if *shutdown.borrow() {
                        break;
                    }
                    self.heartbeat()?;
                    self.deliver(record, &mut report).await?;
                }
                continue;
            }

            let counts = on_store(&self.store, |s| s.counts()).await?;
            let until_sweep = self
                .settings
                .sweep_interval
                .saturating_sub(last_sweep.elapsed());

            let wait = if counts.is_drained() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                let idle_for = since.elapsed();
                if idle_for >= self.settings.idle_window {
                    info!("queue drained, worker exiting");
                    break;
                }
                self.settings.idle_window - idle_for
            } else {
                // future retries, or claims from a dead worker awaiting the sweep
                idle_since = None;
                match on_store(&self.store, |s| s.next_eligible_at()).await? {
                    Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                    None => until_sweep,
                }
            };

            let wait = wait
                .min(self.settings.poll_interval)
                .min(until_sweep)
                .max(Duration::from_millis(1));
            wait_or_shutdown(&mut shutdown, wait).await;
        }

        info!(
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            recovered = report.recovered,
            "worker finished"
        );
        Ok(report)
    }

    async fn deliver(&self, record: EventRecord, report: &mut WorkerReport) -> Result<(), StoreError> {
        let resolution = match self.dispatcher.dispatch(&record).await {
            Ok(()) => Resolution::Delivered,
            Err(error) => {
                let decision = self.decider.decide(record.attempt_count, &error);
                decision.into_resolution()
            }
        };

        match &resolution {
            Resolution::Delivered => info!(
                event_id = %record.id,
                kind = %record.kind,
                attempt = record.attempt_count + 1,
                "delivered"
            ),
            Resolution::Retry { delay, error } => warn!(
                event_id = %record.id,
                kind = %record.kind,
                attempt = record.attempt_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "delivery failed, will retry"
            ),
            Resolution::Failed { error } => warn!(
                event_id = %record.id,
                kind = %record.kind,
                attempt = record.attempt_count + 1,
                error = %error,
                "delivery failed, giving up"
            ),
        }

        let id = record.id;
        let mut attempt = 1;
        loop {
            let applied = resolution.clone();
            match on_store(&self.store, move |s| s.resolve(id, &applied)).await {
                Ok(()) => {
                    report.record(&resolution);
                    return Ok(());
                }
                Err(StoreError::NotClaimed(id)) => {
                    // swept back to pending while we were delivering
                    warn!(
                        event_id = %id,
                        outcome = resolution.label(),
                        "record no longer claimed, outcome dropped"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < RESOLVE_ATTEMPTS => {
                    warn!(event_id = %id, attempt, error = %e, "failed to record outcome, retrying");
                    tokio::time::sleep(RESOLVE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    // still claimed: the sweep returns it to pending
                    error!(
                        event_id = %id,
                        outcome = resolution.label(),
                        error = %e,
                        "failed to record outcome, leaving record to the sweep"
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh the worker lock. Only losing it is fatal.
    fn heartbeat(&self) -> Result<(), StoreError> {
        let Some(lock) = &self.lock else {
            return Ok(());
        };
        match lock.heartbeat() {
            Ok(()) => Ok(()),
            Err(e @ StoreError::LockLost { .. }) => {
                error!(error = %e, "worker lock taken over, stopping");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh worker lock");
                Ok(())
            }
        }
    }
}

async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        changed = shutdown.changed() => {
            // sender gone: nobody can ask us to stop any more, just sleep
            if changed.is_err() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;

    use crate::app::dispatch::tests::{Call, FakeBackend};
    use crate::domain::{DefaultDecider, DeliveryError, EventId, EventKind};
    use crate::observability::QueueCounts;
    use crate::paths::DataPaths;
    use crate::ports::SystemClock;
    use crate::queue::{FileEventStore, LockFile, LockHolder, RetryPolicy};

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<dyn EventStore>,
        backend: Arc<FakeBackend>,
    }

    fn harness(backend: FakeBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn EventStore> =
            Arc::new(FileEventStore::open(DataPaths::new(dir.path()), Arc::new(SystemClock)).unwrap());
        Harness {
            dir,
            store,
            backend: Arc::new(backend),
        }
    }

    fn settings(max_retry_count: u32) -> WorkerSettings {
        WorkerSettings {
            batch_size: None,
            idle_window: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            processing_timeout: Duration::from_secs(300),
            max_retry_count,
        }
    }

    fn worker(h: &Harness, max_retry_count: u32) -> DeliveryWorker {
        worker_on(h, Arc::clone(&h.store), settings(max_retry_count))
    }

    fn worker_on(h: &Harness, store: Arc<dyn EventStore>, settings: WorkerSettings) -> DeliveryWorker {
        let policy = RetryPolicy {
            max_retry_count: settings.max_retry_count,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
        };
        DeliveryWorker::new(
            store,
            Dispatcher::new(h.backend.clone(), Duration::from_secs(1)),
            Arc::new(DefaultDecider::new(policy)),
            settings,
        )
    }

    fn worker_lock(h: &Harness, stale_after: Duration) -> LockFile {
        LockFile::new(h.dir.path().join("worker.lock"), stale_after)
    }

    fn slow_backend(delay_ms: u64) -> FakeBackend {
        FakeBackend {
            delay: Some(Duration::from_millis(delay_ms)),
            ..Default::default()
        }
    }

    /// Fails the first `failures` resolves as if the store lock were busy.
    struct BusyOnResolve {
        inner: Arc<dyn EventStore>,
        failures: AtomicUsize,
    }

    impl EventStore for BusyOnResolve {
        fn append(&self, record: &EventRecord) -> Result<(), StoreError> {
            self.inner.append(record)
        }

        fn claim_pending(&self, limit: Option<usize>) -> Result<Vec<EventRecord>, StoreError> {
            self.inner.claim_pending(limit)
        }

        fn resolve(&self, id: EventId, resolution: &Resolution) -> Result<(), StoreError> {
            let busy = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return Err(StoreError::LockTimeout {
                    path: PathBuf::from("store.lock"),
                    waited: Duration::from_secs(5),
                });
            }
            self.inner.resolve(id, resolution)
        }

        fn sweep_orphans(&self, processing_timeout: Duration) -> Result<Vec<EventId>, StoreError> {
            self.inner.sweep_orphans(processing_timeout)
        }

        fn fail_exhausted(&self, max_retry_count: u32) -> Result<Vec<EventId>, StoreError> {
            self.inner.fail_exhausted(max_retry_count)
        }

        fn list_failed(&self) -> Result<Vec<EventRecord>, StoreError> {
            self.inner.list_failed()
        }

        fn reset_failed(&self, ids: Option<&[EventId]>) -> Result<Vec<EventId>, StoreError> {
            self.inner.reset_failed(ids)
        }

        fn counts(&self) -> Result<QueueCounts, StoreError> {
            self.inner.counts()
        }

        fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.next_eligible_at()
        }
    }

    fn busy_on_resolve(h: &Harness, failures: usize) -> Arc<dyn EventStore> {
        Arc::new(BusyOnResolve {
            inner: Arc::clone(&h.store),
            failures: AtomicUsize::new(failures),
        })
    }

    fn enqueue(h: &Harness, content: &str) -> EventId {
        let record = EventRecord::new(
            EventId::from_ulid(ulid::Ulid::new()),
            EventKind::UserMessage,
            "sess",
            serde_json::json!({"content": content}),
            Utc::now(),
        );
        h.store.append(&record).unwrap();
        record.id
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn delivers_and_exits_when_idle() {
        let h = harness(FakeBackend::default());
        enqueue(&h, "one");
        enqueue(&h, "two");

        let (_tx, rx) = no_shutdown();
        let report = worker(&h, 10).run(rx).await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(h.backend.calls().len(), 2);
        let counts = h.store.counts().unwrap();
        assert_eq!((counts.pending, counts.processing, counts.failed), (0, 0, 0));
    }

    #[tokio::test]
    async fn waits_out_backoff_instead_of_exiting() {
        let h = harness(FakeBackend::scripted([
            Err(DeliveryError::server(503, "busy")),
            Err(DeliveryError::network("reset")),
            Ok(()),
        ]));
        enqueue(&h, "retry me");

        let (_tx, rx) = no_shutdown();
        let report = worker(&h, 10).run(rx).await.unwrap();

        assert_eq!(report.retried, 2);
        assert_eq!(report.delivered, 1);
        assert!(h.store.counts().unwrap().is_drained());
    }

    #[tokio::test]
    async fn permanent_failure_goes_straight_to_failed() {
        let h = harness(FakeBackend::scripted([Err(DeliveryError::client(400, "bad"))]));
        let id = enqueue(&h, "rejected");

        let (_tx, rx) = no_shutdown();
        let report = worker(&h, 10).run(rx).await.unwrap();

        assert_eq!(report.failed, 1);
        let failed = h.store.list_failed().unwrap();
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].attempt_count, 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("400"));
    }

    #[tokio::test]
    async fn shutdown_releases_unprocessed_claims() {
        let backend = FakeBackend {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let h = harness(backend);
        for n in 0..5 {
            enqueue(&h, &format!("m{n}"));
        }

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(worker(&h, 10).run(rx));
        tokio::time::sleep(Duration::from_millis(45)).await;
        tx.send(true).unwrap();
        let report = run.await.unwrap().unwrap();

        let counts = h.store.counts().unwrap();
        assert_eq!(counts.processing, 0);
        assert_eq!(report.delivered + counts.pending, 5);
        assert!(report.delivered < 5);
    }

    #[tokio::test]
    async fn delivery_order_follows_enqueue_order() {
        let h = harness(FakeBackend::default());
        let contents = ["a", "b", "c", "d"];
        for c in contents {
            enqueue(&h, c);
            std::thread::sleep(Duration::from_millis(2));
        }

        let (_tx, rx) = no_shutdown();
        worker(&h, 10).run(rx).await.unwrap();

        let sent: Vec<String> = h
            .backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AppendMessage(_, body) => Some(body.content),
                Call::CreateSession(_) => None,
            })
            .collect();
        assert_eq!(sent, contents);
    }

    #[test]
    fn default_batch_fits_in_processing_timeout() {
        let config = Config::default();
        let batch = WorkerSettings::from_config(&config).batch_size.unwrap();
        assert_eq!(batch, 5);

        let worst = config.request_timeout * CALLS_PER_RECORD * batch as u32;
        assert!(worst < config.processing_timeout);

        let tight = Config {
            processing_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        assert_eq!(WorkerSettings::from_config(&tight).batch_size, Some(1));
    }

    #[tokio::test]
    async fn slow_batch_keeps_worker_lock_fresh() {
        let h = harness(slow_backend(60));
        for n in 0..8 {
            enqueue(&h, &format!("m{n}"));
        }
        let lock = worker_lock(&h, Duration::from_millis(200));
        let guard = lock.try_acquire().unwrap().unwrap();

        let (_tx, rx) = no_shutdown();
        let run = tokio::spawn(worker(&h, 10).with_lock(guard).run(rx));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!run.is_finished());
        assert!(lock.is_held_fresh());
        assert!(lock.try_acquire().unwrap().is_none());

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.delivered, 8);
        assert_eq!(h.backend.calls().len(), 8);
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn worker_stops_when_its_lock_is_taken_over() {
        let h = harness(slow_backend(30));
        for n in 0..6 {
            enqueue(&h, &format!("m{n}"));
        }
        let lock = worker_lock(&h, Duration::from_secs(30));
        let guard = lock.try_acquire().unwrap().unwrap();

        let (_tx, rx) = no_shutdown();
        let run = tokio::spawn(worker(&h, 10).with_lock(guard).run(rx));

        tokio::time::sleep(Duration::from_millis(45)).await;
        let other = LockHolder {
            pid: 1,
            token: "other-worker".into(),
            heartbeat: Utc::now(),
        };
        std::fs::write(lock.path(), serde_json::to_vec(&other).unwrap()).unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::LockLost { .. }));

        let attempted = h.backend.calls().len();
        assert!(attempted < 6, "kept delivering after losing the lock");
        let counts = h.store.counts().unwrap();
        assert_eq!(counts.processing, 6 - attempted);
        assert_eq!(lock.holder().unwrap().token, "other-worker");
    }

    #[tokio::test]
    async fn busy_store_on_resolve_is_retried() {
        let h = harness(FakeBackend::default());
        enqueue(&h, "once");

        let (_tx, rx) = no_shutdown();
        let report = worker_on(&h, busy_on_resolve(&h, 2), settings(10))
            .run(rx)
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(h.backend.calls().len(), 1);
        assert!(h.store.counts().unwrap().is_drained());
    }

    #[tokio::test]
    async fn unrecorded_outcome_is_left_to_the_sweep() {
        let h = harness(FakeBackend::default());
        enqueue(&h, "first");
        std::thread::sleep(Duration::from_millis(2));
        enqueue(&h, "second");

        let settings = WorkerSettings {
            sweep_interval: Duration::from_millis(100),
            processing_timeout: Duration::from_millis(50),
            ..settings(10)
        };
        let (_tx, rx) = no_shutdown();
        let report = worker_on(&h, busy_on_resolve(&h, RESOLVE_ATTEMPTS as usize), settings)
            .run(rx)
            .await
            .unwrap();

        // "first" lost its outcome, came back through the sweep and went again
        assert_eq!(report.delivered, 2);
        assert!(report.recovered >= 1);
        assert_eq!(h.backend.calls().len(), 3);
        assert!(h.store.counts().unwrap().is_drained());
    }
}

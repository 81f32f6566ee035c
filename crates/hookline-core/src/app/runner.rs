//! Wiring for the `worker` entry point.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use super::{DeliveryWorker, Dispatcher, WorkerReport, WorkerSettings, on_store};
use crate::config::Config;
use crate::domain::{Decider, DefaultDecider};
use crate::error::{RunError, StoreError};
use crate::impls::HttpBackend;
use crate::paths::DataPaths;
use crate::ports::{Backend, EventStore, SystemClock};
use crate::queue::{FileEventStore, LockFile, LockGuard};

/// `worker.lock` for a data directory. A holder that misses heartbeats for a
/// whole processing timeout is considered gone.
pub fn worker_lock(paths: &DataPaths, config: &Config) -> LockFile {
    LockFile::new(paths.worker_lock.clone(), config.processing_timeout)
}

/// Take the worker lock and run a worker until the queue is drained.
///
/// Returns `Ok(None)` when another live worker holds the lock.
pub async fn run_worker(
    paths: &DataPaths,
    config: &Config,
    settings: WorkerSettings,
) -> Result<Option<WorkerReport>, RunError> {
    let lock = worker_lock(paths, config);
    let Some(guard) = lock.try_acquire()? else {
        info!("another worker is running, nothing to do");
        return Ok(None);
    };

    let store: Arc<dyn EventStore> =
        Arc::new(FileEventStore::open(paths.clone(), Arc::new(SystemClock))?);
    let backend: Arc<dyn Backend> =
        Arc::new(HttpBackend::new(config.api_base_url.clone(), config.request_timeout)?);
    let decider = DefaultDecider::new(config.retry_policy());

    info!(
        api = %config.api_base_url,
        max_retry_count = decider.policy().max_retry_count,
        max_delay_secs = decider.policy().max_delay.as_secs(),
        batch_size = ?settings.batch_size,
        "worker starting"
    );
    let decider: Arc<dyn Decider> = Arc::new(decider);

    // kept alive for the whole run so the worker never sees a closed channel
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = drain_while_held(&lock, guard, &store, &shutdown_rx, |guard| {
        DeliveryWorker::new(
            Arc::clone(&store),
            Dispatcher::new(Arc::clone(&backend), config.request_timeout),
            Arc::clone(&decider),
            settings.clone(),
        )
        .with_lock(guard)
        .run(shutdown_rx.clone())
    })
    .await?;
    Ok(Some(report))
}

/// Run workers until the queue is drained and `lock` is released.
///
/// A capture that lands after a worker's last drained check, but before its
/// guard drops, finds a live lock and launches nobody. Pending is checked
/// again once the lock is free, and a new round starts if the lock can be
/// taken back.
async fn drain_while_held<F, Fut>(
    lock: &LockFile,
    guard: LockGuard,
    store: &Arc<dyn EventStore>,
    shutdown: &watch::Receiver<bool>,
    mut start: F,
) -> Result<WorkerReport, StoreError>
where
    F: FnMut(LockGuard) -> Fut,
    Fut: Future<Output = Result<WorkerReport, StoreError>>,
{
    let mut total = WorkerReport::default();
    let mut guard = guard;
    loop {
        total.merge(start(guard).await?);
        if *shutdown.borrow() {
            break;
        }

        let counts = on_store(store, |s| s.counts()).await?;
        if counts.pending == 0 {
            break;
        }
        match lock.try_acquire()? {
            Some(next) => {
                info!(pending = counts.pending, "records arrived while exiting, resuming");
                guard = next;
            }
            None => {
                debug!(pending = counts.pending, "another worker took over");
                break;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_worker_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let config = Config::default();
        let _held = worker_lock(&paths, &config).try_acquire().unwrap().unwrap();

        let outcome = run_worker(&paths, &config, WorkerSettings::default())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn empty_queue_exits_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let config = Config::default();
        let settings = WorkerSettings {
            idle_window: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..WorkerSettings::from_config(&config)
        };

        let report = run_worker(&paths, &config, settings).await.unwrap();
        assert_eq!(report, Some(WorkerReport::default()));
        assert!(!paths.worker_lock.exists());
    }

    mod resume {
        use super::*;
        use crate::app::dispatch::tests::FakeBackend;
        use crate::domain::{EventId, EventKind};
        use crate::queue::EventRecord;

        struct Fixture {
            _dir: tempfile::TempDir,
            paths: DataPaths,
            lock: LockFile,
            store: Arc<dyn EventStore>,
            backend: Arc<FakeBackend>,
        }

        fn fixture() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let paths = DataPaths::new(dir.path());
            let lock = worker_lock(&paths, &Config::default());
            let store: Arc<dyn EventStore> =
                Arc::new(FileEventStore::open(paths.clone(), Arc::new(SystemClock)).unwrap());
            Fixture {
                _dir: dir,
                paths,
                lock,
                store,
                backend: Arc::new(FakeBackend::default()),
            }
        }

        fn worker(f: &Fixture) -> DeliveryWorker {
            let settings = WorkerSettings {
                idle_window: Duration::from_millis(20),
                poll_interval: Duration::from_millis(5),
                ..WorkerSettings::default()
            };
            DeliveryWorker::new(
                Arc::clone(&f.store),
                Dispatcher::new(f.backend.clone(), Duration::from_secs(1)),
                Arc::new(DefaultDecider::new(Config::default().retry_policy())),
                settings,
            )
        }

        fn append(store: &dyn EventStore, content: &str) {
            let record = EventRecord::new(
                EventId::from_ulid(ulid::Ulid::new()),
                EventKind::UserMessage,
                "sess",
                serde_json::json!({"content": content}),
                chrono::Utc::now(),
            );
            store.append(&record).unwrap();
        }

        #[tokio::test]
        async fn capture_while_exiting_is_delivered() {
            let f = fixture();
            let guard = f.lock.try_acquire().unwrap().unwrap();
            let (_tx, rx) = watch::channel(false);
            let mut rounds = 0;

            let report = drain_while_held(&f.lock, guard, &f.store, &rx, |guard| {
                rounds += 1;
                let first = rounds == 1;
                let worker = worker(&f);
                let (store, lock, rx) = (Arc::clone(&f.store), f.lock.clone(), rx.clone());
                async move {
                    if !first {
                        return worker.with_lock(guard).run(rx).await;
                    }
                    // drained and exiting, lock not yet released
                    let report = worker.run(rx).await?;
                    append(store.as_ref(), "last words");
                    assert!(lock.is_held_fresh());
                    drop(guard);
                    Ok(report)
                }
            })
            .await
            .unwrap();

            assert_eq!(rounds, 2);
            assert_eq!(report.delivered, 1);
            assert_eq!(f.backend.calls().len(), 1);
            assert!(f.store.counts().unwrap().is_drained());
            assert!(!f.paths.worker_lock.exists());
        }

        #[tokio::test]
        async fn no_resume_when_another_worker_took_the_lock() {
            let f = fixture();
            let guard = f.lock.try_acquire().unwrap().unwrap();
            let (_tx, rx) = watch::channel(false);
            let mut successor = None;
            let mut rounds = 0;

            drain_while_held(&f.lock, guard, &f.store, &rx, |guard| {
                rounds += 1;
                append(f.store.as_ref(), "for the next worker");
                drop(guard);
                successor = f.lock.try_acquire().unwrap();
                async { Ok::<_, StoreError>(WorkerReport::default()) }
            })
            .await
            .unwrap();

            assert_eq!(rounds, 1);
            assert!(successor.is_some());
            assert_eq!(f.store.counts().unwrap().pending, 1);
            assert!(f.backend.calls().is_empty());
        }
    }
}

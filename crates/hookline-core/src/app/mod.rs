//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Enqueuer**: ホスト向けの capture（append → ワーカー起動保証 → 即 return）
//! - **Dispatcher**: kind → backend 呼び出し
//! - **DeliveryWorker**: claim→dispatch→decide→resolve ループ
//! - **RecoverySweep**: 孤児 claim の回収
//! - **ManualRetry**: failed → pending の手動リセット
//! - **run_worker**: worker.lock を取ってワーカーを走らせる

pub mod dispatch;
pub mod enqueuer;
pub mod manual_retry;
pub mod reaper_loop;
pub mod runner;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::dispatch::Dispatcher;
pub use self::enqueuer::{CaptureInput, Enqueuer};
pub use self::manual_retry::{ManualRetry, RetrySelection};
pub use self::reaper_loop::{RecoverySweep, SweepReport};
pub use self::runner::{run_worker, worker_lock};
pub use self::worker_loop::{DeliveryWorker, WorkerReport, WorkerSettings};

use std::sync::Arc;

use crate::error::StoreError;
use crate::ports::EventStore;

/// Run a blocking store call off the async executor.
pub(crate) async fn on_store<T, F>(store: &Arc<dyn EventStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn EventStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
}

//! WorkerLauncher port - ワーカーの起動保証
//!
//! capture はワーカーが動いていることだけを保証して即座に戻る。
//! 実際の配送はワーカー側で行う。

use crate::error::LaunchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A worker holds a fresh lock; nothing was started.
    AlreadyRunning,

    /// A new detached worker was started.
    Spawned { pid: u32 },
}

pub trait WorkerLauncher: Send + Sync {
    /// Start a worker unless one is already active. Must not wait for it.
    fn ensure_running(&self) -> Result<LaunchOutcome, LaunchError>;
}

//! Impls - ports の本番用実装
//!
//! # 含まれる実装
//! - **HttpBackend**: reqwest による Backend
//! - **ProcessLauncher**: detached プロセスとしてワーカーを起動
//!
//! EventStore の実装（FileEventStore）は queue モジュール側にある。

pub mod http_backend;
pub mod process_launcher;

pub use self::http_backend::HttpBackend;
pub use self::process_launcher::ProcessLauncher;

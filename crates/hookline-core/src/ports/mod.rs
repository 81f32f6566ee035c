//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部（ファイルシステム、リモート API、プロセス起動、時刻）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ローカルのファイルストアが source of truth（正本）
//! - backend への配送は at-least-once（サーバー側で冪等に扱う）
//! - 時刻と ID はテストで差し替えられる

pub mod backend;
pub mod clock;
pub mod event_store;
pub mod id_generator;
pub mod launcher;

// 主要な trait を再エクスポート
pub use self::backend::{Backend, MessageBody, MessageMetadata, SessionBody};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_store::EventStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::launcher::{LaunchOutcome, WorkerLauncher};

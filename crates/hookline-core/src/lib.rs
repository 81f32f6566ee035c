//! hookline-core
//!
//! Durable delivery of captured host lifecycle events.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, kind, errors, outcome, decision）
//! - **ports**: 抽象化レイヤー（EventStore, Backend, WorkerLauncher, Clock, IdGenerator）
//! - **queue**: ファイルベースのイベントストア（spool, partitions, journal, lock）
//! - **app**: アプリケーションロジック（enqueuer, dispatch, worker_loop, reaper_loop, manual_retry）
//! - **impls**: 本番用実装（HttpBackend, ProcessLauncher）
//! - **config**: 設定の解決（env → user file → bundled file → defaults）
//! - **paths**: データディレクトリのレイアウト
//! - **observability**: tracing の初期化とキューの件数

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod paths;
pub mod ports;
pub mod queue;

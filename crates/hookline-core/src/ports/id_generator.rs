//! IdGenerator port - ID 生成の抽象化
//!
//! capture は複数のホストプロセスから同時に呼ばれるので、調整なしで一意な
//! ID が必要。テスト容易性のために trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::EventId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はイベント ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_event_id(&self) -> EventId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// FixedClock を使えば timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_event_id(&self) -> EventId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        EventId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

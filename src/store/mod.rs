// Persistence boundary for positions, trades and daily ledgers

pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::EngineError;
use crate::models::{DailyLedger, Position, Trade};

pub use postgres::PostgresStore;

/// What the decision engine needs from storage
///
/// The live implementation is `PostgresStore`; engine tests use an in-memory
/// fake. Kline storage stays on the concrete store since only bootstrap and
/// backfill touch it.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The open position for a symbol, if one is persisted
    async fn position(&self, symbol: &str) -> Result<Option<Position>, EngineError>;

    /// Insert or update the open position for its symbol
    async fn persist_position(&self, position: &Position) -> Result<(), EngineError>;

    /// Remove the persisted position for a symbol, a no-op if absent
    async fn clear_position(&self, symbol: &str) -> Result<(), EngineError>;

    /// Record a trade; returns false if a trade with this id already exists
    async fn append_trade(&self, trade: &Trade) -> Result<bool, EngineError>;

    /// Sum of fees across all trades recorded on the given UTC date
    async fn fees_for_date(&self, date: NaiveDate) -> Result<f64, EngineError>;

    /// The ledger row for a date, if any trades closed that day
    async fn daily_ledger(&self, date: NaiveDate) -> Result<Option<DailyLedger>, EngineError>;

    /// Insert or replace the ledger row for its date
    async fn upsert_daily_ledger(&self, ledger: &DailyLedger) -> Result<(), EngineError>;
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Bar, DailyLedger, Position, Side, Trade};
use crate::store::PositionStore;

/// Postgres persistence
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(EngineError::remote)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(EngineError::remote)?;

        tracing::info!("connected to Postgres");
        Ok(Self { pool })
    }

    /// Insert bars, skipping any already stored
    pub async fn insert_bars(&self, bars: &[Bar]) -> Result<u64, EngineError> {
        let mut inserted = 0;
        for bar in bars {
            let result = sqlx::query(
                r#"
                INSERT INTO klines (symbol, interval, open_time, open, high, low, close, volume, close_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (symbol, interval, open_time) DO NOTHING
                "#,
            )
            .bind(&bar.symbol)
            .bind(&bar.interval)
            .bind(bar.open_time)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(bar.close_time)
            .execute(&self.pool)
            .await
            .map_err(EngineError::remote)?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// Replace the stored row for an open time, used when a bar closes
    pub async fn upsert_bar(&self, bar: &Bar) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO klines (symbol, interval, open_time, open, high, low, close, volume, close_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (symbol, interval, open_time) DO UPDATE SET
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume
            "#,
        )
        .bind(&bar.symbol)
        .bind(&bar.interval)
        .bind(bar.open_time)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.close_time)
        .execute(&self.pool)
        .await
        .map_err(EngineError::remote)?;
        Ok(())
    }

    /// Open time of the most recent stored bar
    pub async fn latest_bar_time(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<i64>, EngineError> {
        let row = sqlx::query(
            "SELECT MAX(open_time) AS latest FROM klines WHERE symbol = $1 AND interval = $2",
        )
        .bind(symbol)
        .bind(interval)
        .fetch_one(&self.pool)
        .await
        .map_err(EngineError::remote)?;
        Ok(row.get("latest"))
    }

    /// The most recent `limit` bars, oldest first
    pub async fn recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: i64,
    ) -> Result<Vec<Bar>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, interval, open_time, open, high, low, close, volume, close_time
            FROM klines
            WHERE symbol = $1 AND interval = $2
            ORDER BY open_time DESC
            LIMIT $3
            "#,
        )
        .bind(symbol)
        .bind(interval)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::remote)?;

        let mut bars: Vec<Bar> = rows
            .into_iter()
            .map(|row| Bar {
                symbol: row.get("symbol"),
                interval: row.get("interval"),
                open_time: row.get("open_time"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
                close_time: row.get("close_time"),
            })
            .collect();
        bars.reverse();
        Ok(bars)
    }
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn position(&self, symbol: &str) -> Result<Option<Position>, EngineError> {
        let row = sqlx::query(
            "SELECT symbol, side, quantity, entry_price, opened_at FROM positions WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::remote)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let side_str: String = row.get("side");
        let side = Side::parse(&side_str)
            .ok_or_else(|| EngineError::DataInconsistency(format!("bad side: {side_str}")))?;
        let opened_at: DateTime<Utc> = row.get("opened_at");

        Ok(Some(Position {
            symbol: row.get("symbol"),
            side,
            quantity: row.get("quantity"),
            entry_price: row.get("entry_price"),
            opened_at,
        }))
    }

    async fn persist_position(&self, position: &Position) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO positions (symbol, side, quantity, entry_price, opened_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (symbol) DO UPDATE SET
                side = EXCLUDED.side,
                quantity = EXCLUDED.quantity,
                entry_price = EXCLUDED.entry_price,
                opened_at = EXCLUDED.opened_at,
                updated_at = NOW()
            "#,
        )
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.quantity)
        .bind(position.entry_price)
        .bind(position.opened_at)
        .execute(&self.pool)
        .await
        .map_err(EngineError::remote)?;

        tracing::debug!("persisted {} position for {}", position.side, position.symbol);
        Ok(())
    }

    async fn clear_position(&self, symbol: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM positions WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(EngineError::remote)?;
        Ok(())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (id, timestamp, symbol, kind, quantity, price, realized_pnl, fee, is_simulated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(trade.timestamp)
        .bind(&trade.symbol)
        .bind(trade.kind.as_str())
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.realized_pnl)
        .bind(trade.fee)
        .bind(trade.is_simulated)
        .execute(&self.pool)
        .await
        .map_err(EngineError::remote)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fees_for_date(&self, date: NaiveDate) -> Result<f64, EngineError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(fee), 0) AS total FROM trades WHERE timestamp::date = $1",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(EngineError::remote)?;
        Ok(row.get("total"))
    }

    async fn daily_ledger(&self, date: NaiveDate) -> Result<Option<DailyLedger>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT date, trade_count, profit_count, loss_count, gross_profit,
                   total_fees, net_profit, profit_rate, opening_balance
            FROM daily_ledgers
            WHERE date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::remote)?;

        Ok(row.map(|row| DailyLedger {
            date: row.get("date"),
            trade_count: row.get("trade_count"),
            profit_count: row.get("profit_count"),
            loss_count: row.get("loss_count"),
            gross_profit: row.get("gross_profit"),
            total_fees: row.get("total_fees"),
            net_profit: row.get("net_profit"),
            profit_rate: row.get("profit_rate"),
            opening_balance: row.get("opening_balance"),
        }))
    }

    async fn upsert_daily_ledger(&self, ledger: &DailyLedger) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO daily_ledgers (
                date, trade_count, profit_count, loss_count, gross_profit,
                total_fees, net_profit, profit_rate, opening_balance
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (date) DO UPDATE SET
                trade_count = EXCLUDED.trade_count,
                profit_count = EXCLUDED.profit_count,
                loss_count = EXCLUDED.loss_count,
                gross_profit = EXCLUDED.gross_profit,
                total_fees = EXCLUDED.total_fees,
                net_profit = EXCLUDED.net_profit,
                profit_rate = EXCLUDED.profit_rate,
                opening_balance = EXCLUDED.opening_balance,
                updated_at = NOW()
            "#,
        )
        .bind(ledger.date)
        .bind(ledger.trade_count)
        .bind(ledger.profit_count)
        .bind(ledger.loss_count)
        .bind(ledger.gross_profit)
        .bind(ledger.total_fees)
        .bind(ledger.net_profit)
        .bind(ledger.profit_rate)
        .bind(ledger.opening_balance)
        .execute(&self.pool)
        .await
        .map_err(EngineError::remote)?;
        Ok(())
    }
}

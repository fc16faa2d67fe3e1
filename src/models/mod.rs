use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One OHLCV sample for a fixed interval
///
/// Immutable once closed; the most recent bar of a stream may still be
/// accumulating until its close event arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub interval: String,
    /// Interval start, epoch milliseconds (exchange convention)
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// A bar update from the market feed, partial or final
#[derive(Debug, Clone)]
pub struct BarEvent {
    pub bar: Bar,
    pub is_closed: bool,
}

/// Which consistency policy produced a band value
///
/// Recorded for observability only; decisions never branch on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BandMethod {
    /// Dynamic policy, tick substituted as the open bar's close
    DynamicRealtime,
    /// Dynamic policy, open bar dropped because the tick gap was large
    DynamicClosedOnly,
    /// Closed-bars-only policy
    ClosedOnly,
    /// All bars as given, open bar included unmodified
    Legacy,
}

/// Volatility envelope derived from a rolling mean and standard deviation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Band {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
    /// Price the band was evaluated against when computed
    pub computed_at_price: f64,
    pub method: BandMethod,
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position for a symbol
///
/// At most one non-flat position per symbol; flat is the absence of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Realized PnL for exiting the full quantity at `exit_price`, signed by side
    pub fn realized_pnl(&self, exit_price: f64) -> f64 {
        match self.side {
            Side::Long => (exit_price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - exit_price) * self.quantity,
        }
    }
}

/// What a single fill did
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::OpenLong => "open_long",
            TradeKind::OpenShort => "open_short",
            TradeKind::CloseLong => "close_long",
            TradeKind::CloseShort => "close_short",
        }
    }

    pub fn parse(s: &str) -> Option<TradeKind> {
        match s {
            "open_long" => Some(TradeKind::OpenLong),
            "open_short" => Some(TradeKind::OpenShort),
            "close_long" => Some(TradeKind::CloseLong),
            "close_short" => Some(TradeKind::CloseShort),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, TradeKind::CloseLong | TradeKind::CloseShort)
    }
}

/// Append-only record of a single fill; never mutated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub kind: TradeKind,
    pub quantity: f64,
    pub price: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub is_simulated: bool,
}

/// Per-calendar-date PnL ledger, upserted as trades close
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyLedger {
    pub date: NaiveDate,
    pub trade_count: i64,
    pub profit_count: i64,
    pub loss_count: i64,
    pub gross_profit: f64,
    pub total_fees: f64,
    pub net_profit: f64,
    pub profit_rate: f64,
    pub opening_balance: f64,
}

impl DailyLedger {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            trade_count: 0,
            profit_count: 0,
            loss_count: 0,
            gross_profit: 0.0,
            total_fees: 0.0,
            net_profit: 0.0,
            profit_rate: 0.0,
            opening_balance: 0.0,
        }
    }
}

/// Live position as reported by the execution gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_roundtrip() {
        assert_eq!(Side::parse("long"), Some(Side::Long));
        assert_eq!(Side::parse("short"), Some(Side::Short));
        assert_eq!(Side::parse("flat"), None);
        assert_eq!(Side::Long.as_str(), "long");
    }

    #[test]
    fn test_realized_pnl_signed_by_side() {
        let mut pos = Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 2.0,
            entry_price: 100.0,
            opened_at: Utc::now(),
        };

        assert_eq!(pos.realized_pnl(110.0), 20.0);
        assert_eq!(pos.realized_pnl(95.0), -10.0);

        pos.side = Side::Short;
        assert_eq!(pos.realized_pnl(110.0), -20.0);
        assert_eq!(pos.realized_pnl(95.0), 10.0);
    }

    #[test]
    fn test_trade_kind_roundtrip() {
        for kind in [
            TradeKind::OpenLong,
            TradeKind::OpenShort,
            TradeKind::CloseLong,
            TradeKind::CloseShort,
        ] {
            assert_eq!(TradeKind::parse(kind.as_str()), Some(kind));
        }
        assert!(TradeKind::CloseShort.is_close());
        assert!(!TradeKind::OpenLong.is_close());
    }
}

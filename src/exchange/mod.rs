// Exchange boundary: execution gateway (REST) and market feed (WebSocket)

pub mod binance;
pub mod feed;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::models::{GatewayPosition, Side};

/// Result of a filled market order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub avg_price: f64,
    pub filled_quantity: f64,
}

/// Capability the decision engine needs from the exchange
///
/// The live implementation is `binance::BinanceFutures`; tests substitute
/// in-memory fakes. The gateway is the ultimate source of truth for open
/// positions and can override locally persisted state at startup.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Available balance in the quote asset
    async fn balance(&self) -> Result<f64, EngineError>;

    /// Currently open (non-zero) positions
    async fn open_positions(&self) -> Result<Vec<GatewayPosition>, EngineError>;

    /// Place a market order opening a position of `side`
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderFill, EngineError>;

    /// Close an open position with a reduce-only market order, returning
    /// the exit price
    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<f64, EngineError>;
}

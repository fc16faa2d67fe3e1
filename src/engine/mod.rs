// Band-crossing decision engine

pub mod reconcile;
pub mod state;
pub mod transitions;

pub use state::EngineState;
pub use transitions::{plan, Action, Ctx, Transition};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::EngineError;
use crate::exchange::ExecutionGateway;
use crate::ledger::record_close;
use crate::models::{Band, DailyLedger, Position, Side, Trade, TradeKind};
use crate::store::PositionStore;

/// The decision engine for one symbol
///
/// Owns the machine state and the order gates. A transition that carries an
/// order commits only after the order and its persistence succeed; on any
/// failure the machine stays where it was and the next evaluation retries.
pub struct Engine<G, S> {
    pub(crate) settings: Settings,
    pub(crate) gateway: Arc<G>,
    pub(crate) store: Arc<S>,
    state: EngineState,
    last_order_at: Option<DateTime<Utc>>,
}

impl<G: ExecutionGateway, S: PositionStore> Engine<G, S> {
    pub fn new(settings: Settings, gateway: Arc<G>, store: Arc<S>) -> Self {
        Self {
            settings,
            gateway,
            store,
            state: EngineState::Waiting,
            last_order_at: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: EngineState) {
        if state != self.state {
            tracing::info!("state {} -> {}", self.state, state);
        }
        self.state = state;
    }

    /// Run one evaluation against the latest band
    ///
    /// `close` is the last closed bar's close, `tick` the freshest price.
    pub async fn evaluate(
        &mut self,
        close: f64,
        tick: f64,
        band: &Band,
    ) -> Result<(), EngineError> {
        self.evaluate_at(close, tick, band, Utc::now()).await
    }

    pub async fn evaluate_at(
        &mut self,
        close: f64,
        tick: f64,
        band: &Band,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let ctx = Ctx::new(close, tick, band);
        let Some(transition) = plan(self.state, &ctx) else {
            return Ok(());
        };

        match transition.action {
            None => {
                tracing::info!(
                    "state {} -> {} ({})",
                    self.state,
                    transition.next,
                    transition.reason
                );
                self.state = transition.next;
            }
            Some(action) => {
                if self.in_cooldown(now) {
                    tracing::debug!(
                        "cooldown active, deferring {} -> {} ({})",
                        self.state,
                        transition.next,
                        transition.reason
                    );
                    return Ok(());
                }
                let result = match action {
                    Action::Open(side) => self.try_open(side, tick, now).await,
                    Action::Close => self.try_close(tick, now).await,
                };
                match result {
                    Ok(()) => {
                        tracing::info!(
                            "state {} -> {} ({})",
                            self.state,
                            transition.next,
                            transition.reason
                        );
                        self.state = transition.next;
                    }
                    Err(e) => {
                        // Stay put; the next tick retries the same rule
                        tracing::warn!(
                            "order for {} -> {} failed, holding state: {e}",
                            self.state,
                            transition.next
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_order_at.is_some_and(|last| {
            let elapsed = (now - last).to_std().unwrap_or_default();
            elapsed < self.settings.cooldown
        })
    }

    /// Round a raw quantity down to the instrument's precision
    fn round_quantity(&self, raw: f64) -> f64 {
        let scale = 10f64.powi(self.settings.qty_precision as i32);
        (raw * scale).floor() / scale
    }

    async fn try_open(
        &mut self,
        side: Side,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if price <= 0.0 {
            return Err(EngineError::DataInconsistency(format!(
                "cannot open {side}: price is {price}"
            )));
        }
        let balance = self.gateway.balance().await?;
        if balance <= 0.0 {
            return Err(EngineError::DataInconsistency(format!(
                "cannot open {side}: balance is {balance}"
            )));
        }

        let margin = balance * self.settings.trade_fraction;
        let notional = margin * self.settings.leverage as f64;
        let quantity = self.round_quantity(notional / price);
        if quantity < self.settings.min_qty {
            return Err(EngineError::DataInconsistency(format!(
                "cannot open {side}: quantity {quantity} below minimum {}",
                self.settings.min_qty
            )));
        }

        let symbol = self.settings.symbol.clone();
        let fill = self
            .gateway
            .place_market_order(&symbol, side, quantity)
            .await?;

        // Exchanges report avgPrice as 0 until the fill settles
        let entry_price = if fill.avg_price > 0.0 {
            fill.avg_price
        } else {
            price
        };
        let filled = if fill.filled_quantity > 0.0 {
            fill.filled_quantity
        } else {
            quantity
        };

        let position = Position {
            symbol: symbol.clone(),
            side,
            quantity: filled,
            entry_price,
            opened_at: now,
        };
        self.store.persist_position(&position).await?;

        let trade = Trade {
            id: Uuid::new_v4(),
            timestamp: now,
            symbol,
            kind: match side {
                Side::Long => TradeKind::OpenLong,
                Side::Short => TradeKind::OpenShort,
            },
            quantity: filled,
            price: entry_price,
            realized_pnl: 0.0,
            fee: entry_price * filled * self.settings.fee_rate,
            is_simulated: self.settings.simulate,
        };
        self.store.append_trade(&trade).await?;

        self.last_order_at = Some(now);
        tracing::info!(
            "opened {side} {filled} {} @ {entry_price}",
            self.settings.symbol
        );
        Ok(())
    }

    async fn try_close(&mut self, price: f64, now: DateTime<Utc>) -> Result<(), EngineError> {
        let symbol = self.settings.symbol.clone();
        let Some(position) = self.store.position(&symbol).await? else {
            // Nothing to close: let the machine move on rather than wedge
            tracing::warn!("close requested for {symbol} but no position is persisted");
            return Ok(());
        };

        let reported = self
            .gateway
            .close_position(&symbol, position.side, position.quantity)
            .await?;
        let exit_price = if reported > 0.0 { reported } else { price };

        let realized_pnl = position.realized_pnl(exit_price);
        let fee = exit_price * position.quantity * self.settings.fee_rate;

        let trade = Trade {
            id: Uuid::new_v4(),
            timestamp: now,
            symbol: symbol.clone(),
            kind: match position.side {
                Side::Long => TradeKind::CloseLong,
                Side::Short => TradeKind::CloseShort,
            },
            quantity: position.quantity,
            price: exit_price,
            realized_pnl,
            fee,
            is_simulated: self.settings.simulate,
        };
        let inserted = self.store.append_trade(&trade).await?;
        self.store.clear_position(&symbol).await?;

        // The ledger folds once per recorded trade
        if inserted {
            let date = now.date_naive();
            let day_fees = self.store.fees_for_date(date).await?;
            let balance_after = self.gateway.balance().await?;
            let mut ledger = self
                .store
                .daily_ledger(date)
                .await?
                .unwrap_or_else(|| DailyLedger::empty(date));
            record_close(&mut ledger, realized_pnl, day_fees, balance_after);
            self.store.upsert_daily_ledger(&ledger).await?;
        }

        self.last_order_at = Some(now);
        tracing::info!(
            "closed {} {} {symbol} @ {exit_price}, pnl {realized_pnl:.4}",
            position.side,
            position.quantity
        );
        Ok(())
    }
}

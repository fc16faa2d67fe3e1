use crate::engine::{Engine, EngineState};
use crate::error::EngineError;
use crate::exchange::ExecutionGateway;
use crate::store::PositionStore;

/// Relative quantity difference tolerated before the gateway's number wins
const QTY_TOLERANCE: f64 = 1e-6;

impl<G: ExecutionGateway, S: PositionStore> Engine<G, S> {
    /// Align local state with the gateway at startup
    ///
    /// The gateway is the source of truth for whether a position exists and
    /// how big it is; the local record keeps the entry price and open time
    /// the gateway cannot provide.
    pub async fn reconcile(&mut self) -> Result<(), EngineError> {
        let symbol = self.settings.symbol.clone();
        let local = self.store.position(&symbol).await?;
        let remote = self
            .gateway
            .open_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol);

        match (local, remote) {
            (None, None) => {
                self.set_state(EngineState::Waiting);
                tracing::info!("reconciled {symbol}: flat");
            }
            (Some(local), None) => {
                tracing::warn!(
                    "reconciled {symbol}: local {} position has no gateway counterpart, discarding",
                    local.side
                );
                self.store.clear_position(&symbol).await?;
                self.set_state(EngineState::Waiting);
            }
            (None, Some(remote)) => {
                // Likely opened manually; leave it alone and stay flat locally
                tracing::warn!(
                    "reconciled {symbol}: gateway reports {} {} with no local record, not managing it",
                    remote.side,
                    remote.quantity
                );
                self.set_state(EngineState::Waiting);
            }
            (Some(local), Some(remote)) => {
                if local.side != remote.side {
                    // The local record describes a position that no longer
                    // exists; whatever the gateway holds was not opened by
                    // this machine.
                    tracing::warn!(
                        "reconciled {symbol}: side mismatch (local {}, gateway {}), discarding local record",
                        local.side,
                        remote.side
                    );
                    self.store.clear_position(&symbol).await?;
                    self.set_state(EngineState::Waiting);
                    return Ok(());
                }
                let mut adopted = local.clone();
                if quantity_differs(local.quantity, remote.quantity) {
                    tracing::warn!(
                        "reconciled {symbol}: quantity mismatch (local {}, gateway {}), adopting gateway",
                        local.quantity,
                        remote.quantity
                    );
                    adopted.quantity = remote.quantity;
                } else {
                    tracing::info!(
                        "reconciled {symbol}: holding {} {}",
                        local.side,
                        local.quantity
                    );
                }
                if adopted != local {
                    self.store.persist_position(&adopted).await?;
                }
                self.set_state(EngineState::holding(adopted.side));
            }
        }
        Ok(())
    }
}

fn quantity_differs(local: f64, remote: f64) -> bool {
    let scale = local.abs().max(remote.abs()).max(1e-12);
    ((local - remote).abs() / scale) > QTY_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::testutil::{MockGateway, MockStore};
    use crate::models::{GatewayPosition, Position, Side};
    use chrono::Utc;
    use std::sync::Arc;

    fn engine() -> (Engine<MockGateway, MockStore>, Arc<MockGateway>, Arc<MockStore>) {
        let gateway = Arc::new(MockGateway::new(1000.0));
        let store = Arc::new(MockStore::new());
        let settings = Settings {
            symbol: "BTCUSDT".to_string(),
            ..Default::default()
        };
        (
            Engine::new(settings, Arc::clone(&gateway), Arc::clone(&store)),
            gateway,
            store,
        )
    }

    fn local_position(side: Side, quantity: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side,
            quantity,
            entry_price: 64000.0,
            opened_at: Utc::now(),
        }
    }

    fn remote_position(side: Side, quantity: f64) -> GatewayPosition {
        GatewayPosition {
            symbol: "BTCUSDT".to_string(),
            side,
            quantity,
        }
    }

    #[tokio::test]
    async fn test_both_flat_waits() {
        let (mut engine, _, _) = engine();
        engine.reconcile().await.unwrap();
        assert_eq!(engine.state(), EngineState::Waiting);
    }

    #[tokio::test]
    async fn test_stale_local_position_discarded() {
        let (mut engine, _, store) = engine();
        *store.position.lock().unwrap() = Some(local_position(Side::Long, 0.5));

        engine.reconcile().await.unwrap();

        assert_eq!(engine.state(), EngineState::Waiting);
        assert!(store.position.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unmanaged_gateway_position_left_alone() {
        let (mut engine, gateway, store) = engine();
        gateway
            .positions
            .lock()
            .unwrap()
            .push(remote_position(Side::Short, 0.2));

        engine.reconcile().await.unwrap();

        assert_eq!(engine.state(), EngineState::Waiting);
        assert!(store.position.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_matching_position_resumes_holding() {
        let (mut engine, gateway, store) = engine();
        *store.position.lock().unwrap() = Some(local_position(Side::Short, 0.012));
        gateway
            .positions
            .lock()
            .unwrap()
            .push(remote_position(Side::Short, 0.012));

        engine.reconcile().await.unwrap();

        assert_eq!(engine.state(), EngineState::HoldingShort);
        let position = store.position.lock().unwrap().clone().unwrap();
        assert_eq!(position.quantity, 0.012);
        assert_eq!(position.entry_price, 64000.0);
    }

    #[tokio::test]
    async fn test_quantity_mismatch_adopts_gateway_quantity() {
        let (mut engine, gateway, store) = engine();
        *store.position.lock().unwrap() = Some(local_position(Side::Long, 0.5));
        gateway
            .positions
            .lock()
            .unwrap()
            .push(remote_position(Side::Long, 0.3));

        engine.reconcile().await.unwrap();

        assert_eq!(engine.state(), EngineState::HoldingLong);
        let position = store.position.lock().unwrap().clone().unwrap();
        assert_eq!(position.quantity, 0.3);
        // Entry details survive, only the size is corrected
        assert_eq!(position.entry_price, 64000.0);
    }

    #[tokio::test]
    async fn test_side_mismatch_discards_local_record() {
        let (mut engine, gateway, store) = engine();
        *store.position.lock().unwrap() = Some(local_position(Side::Long, 0.5));
        gateway
            .positions
            .lock()
            .unwrap()
            .push(remote_position(Side::Short, 0.4));

        engine.reconcile().await.unwrap();

        // The gateway's position was not opened by this machine, so the
        // stale local record goes and the machine starts flat
        assert_eq!(engine.state(), EngineState::Waiting);
        assert!(store.position.lock().unwrap().is_none());
    }

    #[test]
    fn test_quantity_tolerance() {
        assert!(!quantity_differs(0.012, 0.012));
        assert!(!quantity_differs(0.012, 0.012000000001));
        assert!(quantity_differs(0.012, 0.013));
        assert!(quantity_differs(0.5, 0.3));
    }
}

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::models::{Bar, BarEvent};

const MAINNET_WS_BASE: &str = "wss://fstream.binance.com/ws";
const TESTNET_WS_BASE: &str = "wss://stream.binancefuture.com/ws";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Streams kline events for one symbol/interval into a channel
///
/// Every update of the in-progress bar is forwarded; `is_closed` marks the
/// final update of each bar. The feed reconnects forever on any error, so
/// the receiving side only ever sees a closed channel at shutdown.
pub struct KlineFeed {
    ws_base: String,
    symbol: String,
    interval: String,
}

impl KlineFeed {
    pub fn new(symbol: &str, interval: &str, use_testnet: bool) -> Self {
        let ws_base = if use_testnet {
            TESTNET_WS_BASE
        } else {
            MAINNET_WS_BASE
        };
        Self {
            ws_base: ws_base.to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/{}@kline_{}",
            self.ws_base,
            self.symbol.to_lowercase(),
            self.interval
        )
    }

    /// Run until the receiver is dropped
    pub async fn run(self, tx: mpsc::Sender<BarEvent>) {
        loop {
            if let Err(e) = self.stream_once(&tx).await {
                error!("kline stream error: {e}");
            }
            if tx.is_closed() {
                info!("kline feed receiver dropped, stopping");
                return;
            }
            warn!(
                "kline stream for {} disconnected, reconnecting in {:?}",
                self.symbol, RECONNECT_DELAY
            );
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn stream_once(&self, tx: &mpsc::Sender<BarEvent>) -> crate::Result<()> {
        let url = self.stream_url();
        let (ws_stream, _) = connect_async(&url).await?;
        info!("connected to kline stream {url}");

        // Split so pongs can be sent while reading
        let (mut sink, mut reader) = ws_stream.split();

        while let Some(msg) = reader.next().await {
            match msg? {
                Message::Text(text) => {
                    if let Some(event) = parse_kline_event(&text) {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Ping(data) => {
                    sink.send(Message::Pong(data)).await?;
                }
                Message::Close(frame) => {
                    info!("kline stream closed by server: {frame:?}");
                    return Ok(());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Parse a kline event payload into a bar update
///
/// Returns None for anything that is not a well-formed kline event, so
/// subscription acks and unknown events are skipped silently.
pub fn parse_kline_event(text: &str) -> Option<BarEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("e")?.as_str()? != "kline" {
        return None;
    }
    let k = value.get("k")?;

    let parse_price = |key: &str| k.get(key)?.as_str()?.parse::<f64>().ok();

    Some(BarEvent {
        bar: Bar {
            symbol: k.get("s")?.as_str()?.to_string(),
            interval: k.get("i")?.as_str()?.to_string(),
            open_time: k.get("t")?.as_i64()?,
            open: parse_price("o")?,
            high: parse_price("h")?,
            low: parse_price("l")?,
            close: parse_price("c")?,
            volume: parse_price("v")?,
            close_time: k.get("T")?.as_i64()?,
        },
        is_closed: k.get("x")?.as_bool()?,
    })
}

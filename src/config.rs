use std::time::Duration;

use crate::error::EngineError;
use crate::indicators::StdDev;

/// Runtime settings, read from the environment at startup
///
/// Everything here is validated once in `from_env`; an invalid value is a
/// fatal `Configuration` error rather than a silent fallback.
#[derive(Debug, Clone)]
pub struct Settings {
    pub symbol: String,
    pub interval: String,

    /// Rolling window for the band mean/stddev
    pub band_period: usize,
    /// Stddev multiplier for the envelope width
    pub band_multiplier: f64,
    /// Population (exchange display convention) or sample divisor
    pub band_stddev: StdDev,
    /// Tick-vs-last-close gap (percent) above which the dynamic policy
    /// drops the open bar instead of substituting the tick
    pub large_gap_pct: f64,

    /// Bars fetched on first bootstrap when the store is empty
    pub initial_bars: usize,

    /// Fraction of available balance committed per open
    pub trade_fraction: f64,
    pub leverage: u32,
    pub fee_rate: f64,
    /// Minimum interval between two order-placing actions
    pub cooldown: Duration,
    /// Decimal places the instrument accepts for quantity
    pub qty_precision: u32,
    pub min_qty: f64,

    pub simulate: bool,
    pub api_key: String,
    pub api_secret: String,
    pub use_testnet: bool,
    pub database_url: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, EngineError> {
        let settings = Self {
            symbol: env_or("SYMBOL", "BTCUSDT"),
            interval: env_or("INTERVAL", "15m"),
            band_period: parse_env("BAND_PERIOD", 20)?,
            band_multiplier: parse_env("BAND_MULT", 2.0)?,
            band_stddev: match env_or("BAND_STDDEV", "population").as_str() {
                "population" => StdDev::Population,
                "sample" => StdDev::Sample,
                other => {
                    return Err(EngineError::Configuration(format!(
                        "BAND_STDDEV must be 'population' or 'sample', got '{other}'"
                    )))
                }
            },
            large_gap_pct: parse_env("LARGE_GAP_PCT", 0.5)?,
            initial_bars: parse_env("INITIAL_BARS", 100)?,
            trade_fraction: parse_env("TRADE_FRACTION", 0.7)?,
            leverage: parse_env("LEVERAGE", 10)?,
            fee_rate: parse_env("FEE_RATE", 0.0005)?,
            cooldown: Duration::from_secs(parse_env("COOLDOWN_SECS", 60)?),
            qty_precision: parse_env("QTY_PRECISION", 3)?,
            min_qty: parse_env("MIN_QTY", 0.001)?,
            simulate: env_or("SIMULATE", "false").to_lowercase() == "true",
            api_key: env_or("BINANCE_API_KEY", ""),
            api_secret: env_or("BINANCE_API_SECRET", ""),
            use_testnet: env_or("USE_TESTNET", "false").to_lowercase() == "true",
            database_url: env_or("DATABASE_URL", "postgres://localhost/bandbot"),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.band_period < 2 {
            return Err(EngineError::Configuration(format!(
                "BAND_PERIOD must be >= 2, got {}",
                self.band_period
            )));
        }
        if self.band_multiplier <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "BAND_MULT must be positive, got {}",
                self.band_multiplier
            )));
        }
        if self.leverage == 0 {
            return Err(EngineError::Configuration(
                "LEVERAGE must be positive".to_string(),
            ));
        }
        if !(self.trade_fraction > 0.0 && self.trade_fraction <= 1.0) {
            return Err(EngineError::Configuration(format!(
                "TRADE_FRACTION must be in (0, 1], got {}",
                self.trade_fraction
            )));
        }
        // Fails fast on interval typos before any network traffic
        interval_ms(&self.interval)?;
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            band_period: 20,
            band_multiplier: 2.0,
            band_stddev: StdDev::Population,
            large_gap_pct: 0.5,
            initial_bars: 100,
            trade_fraction: 0.7,
            leverage: 10,
            fee_rate: 0.0005,
            cooldown: Duration::from_secs(60),
            qty_precision: 3,
            min_qty: 0.001,
            simulate: false,
            api_key: String::new(),
            api_secret: String::new(),
            use_testnet: false,
            database_url: "postgres://localhost/bandbot".to_string(),
        }
    }
}

/// Interval string ("1m", "4h", "1d") to milliseconds
pub fn interval_ms(interval: &str) -> Result<i64, EngineError> {
    let unsupported =
        || EngineError::Configuration(format!("unsupported interval: '{interval}'"));

    if interval.len() < 2 {
        return Err(unsupported());
    }
    let (num, unit) = interval.split_at(interval.len() - 1);
    let n: i64 = num.parse().map_err(|_| unsupported())?;
    if n <= 0 {
        return Err(unsupported());
    }
    match unit {
        "m" => Ok(n * 60_000),
        "h" => Ok(n * 3_600_000),
        "d" => Ok(n * 86_400_000),
        _ => Err(unsupported()),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            EngineError::Configuration(format!("cannot parse {key}='{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_ms() {
        assert_eq!(interval_ms("1m").unwrap(), 60_000);
        assert_eq!(interval_ms("15m").unwrap(), 900_000);
        assert_eq!(interval_ms("4h").unwrap(), 14_400_000);
        assert_eq!(interval_ms("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn test_interval_ms_rejects_garbage() {
        assert!(interval_ms("15s").is_err());
        assert!(interval_ms("m").is_err());
        assert!(interval_ms("").is_err());
        assert!(interval_ms("-5m").is_err());
        assert!(interval_ms("abc").is_err());
    }

    #[test]
    fn test_default_settings_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_zero_leverage_is_fatal() {
        let settings = Settings {
            leverage: 0,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("LEVERAGE"));
    }

    #[test]
    fn test_bad_interval_is_fatal() {
        let settings = Settings {
            interval: "90x".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}

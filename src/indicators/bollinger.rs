use crate::error::EngineError;
use crate::models::{Band, BandMethod, Bar};

/// Which divisor the rolling standard deviation uses
///
/// Population (N) matches what exchanges display on their charts; Sample
/// (N-1) is available as an explicit option, never as a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdDev {
    Population,
    Sample,
}

/// How the most recent, possibly-unclosed bar is treated
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BandPolicy {
    /// Classify the tick-vs-last-closed-close gap: above `large_gap_pct`
    /// (percent) drop the open bar entirely, otherwise substitute the tick
    /// as the open bar's close.
    Dynamic { tick_price: f64, large_gap_pct: f64 },
    /// Always exclude the most recent bar; matches exchange-displayed band
    /// values that only move on bar close.
    ClosedOnly,
    /// Compute over the bars as given, open bar included unmodified.
    Legacy,
}

/// Simple moving average over the trailing `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Rolling standard deviation over the trailing `period` values
pub fn stddev(values: &[f64], period: usize, kind: StdDev) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }
    let mean = sma(values, period)?;
    let sum_sq: f64 = values
        .iter()
        .rev()
        .take(period)
        .map(|v| (v - mean) * (v - mean))
        .sum();
    let divisor = match kind {
        StdDev::Population => period as f64,
        StdDev::Sample => (period - 1) as f64,
    };
    // Guards against -0.0 noise from the subtraction
    Some((sum_sq / divisor).max(0.0).sqrt())
}

/// Compute a volatility band over `bars` under the given consistency policy
///
/// `bars` must be ordered by open_time ascending with the possibly-open bar
/// last. Fails with `InsufficientData` when fewer than `period` usable bars
/// remain after policy-specific trimming.
pub fn compute_band(
    bars: &[Bar],
    period: usize,
    multiplier: f64,
    policy: BandPolicy,
    kind: StdDev,
) -> Result<Band, EngineError> {
    let (closes, method, evaluated_at) = match policy {
        BandPolicy::Legacy => {
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let at = closes.last().copied().unwrap_or(0.0);
            (closes, BandMethod::Legacy, at)
        }
        BandPolicy::ClosedOnly => {
            let closed = &bars[..bars.len().saturating_sub(1)];
            let closes: Vec<f64> = closed.iter().map(|b| b.close).collect();
            let at = closes.last().copied().unwrap_or(0.0);
            (closes, BandMethod::ClosedOnly, at)
        }
        BandPolicy::Dynamic {
            tick_price,
            large_gap_pct,
        } => {
            if bars.len() < 2 || tick_price <= 0.0 {
                return Err(EngineError::InsufficientData {
                    needed: period,
                    available: bars.len().saturating_sub(1),
                });
            }
            let last_closed_close = bars[bars.len() - 2].close;
            let gap_pct = ((tick_price - last_closed_close) / last_closed_close).abs() * 100.0;

            if gap_pct > large_gap_pct {
                // A recognizably stale open bar: compute on closed bars only
                let closes: Vec<f64> =
                    bars[..bars.len() - 1].iter().map(|b| b.close).collect();
                (closes, BandMethod::DynamicClosedOnly, tick_price)
            } else {
                // Small move: full real-time replacement of the open bar's close
                let mut closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
                *closes.last_mut().unwrap() = tick_price;
                (closes, BandMethod::DynamicRealtime, tick_price)
            }
        }
    };

    if closes.len() < period {
        return Err(EngineError::InsufficientData {
            needed: period,
            available: closes.len(),
        });
    }

    let middle = sma(&closes, period).ok_or(EngineError::InsufficientData {
        needed: period,
        available: closes.len(),
    })?;
    let sd = stddev(&closes, period, kind).ok_or(EngineError::InsufficientData {
        needed: period,
        available: closes.len(),
    })?;

    Ok(Band {
        lower: middle - multiplier * sd,
        middle,
        upper: middle + multiplier * sd,
        computed_at_price: evaluated_at,
        method,
    })
}

/// Policy fallback chain: Dynamic, then closed-bars-only, then legacy
///
/// A failure in one policy is logged and falls through to the next; legacy
/// cannot fail given at least `period` bars.
pub fn compute_band_with_fallback(
    bars: &[Bar],
    period: usize,
    multiplier: f64,
    tick_price: f64,
    large_gap_pct: f64,
    kind: StdDev,
) -> Result<Band, EngineError> {
    let dynamic = BandPolicy::Dynamic {
        tick_price,
        large_gap_pct,
    };
    match compute_band(bars, period, multiplier, dynamic, kind) {
        Ok(band) => return Ok(band),
        Err(e) => {
            tracing::warn!("dynamic band policy failed ({e}), falling back to closed-only");
        }
    }
    match compute_band(bars, period, multiplier, BandPolicy::ClosedOnly, kind) {
        Ok(band) => return Ok(band),
        Err(e) => {
            tracing::warn!("closed-only band policy failed ({e}), falling back to legacy");
        }
    }
    compute_band(bars, period, multiplier, BandPolicy::Legacy, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: "BTCUSDT".to_string(),
                interval: "15m".to_string(),
                open_time: i as i64 * 900_000,
                open: close,
                high: close * 1.001,
                low: close * 0.999,
                close,
                volume: 10.0,
                close_time: (i as i64 + 1) * 900_000 - 1,
            })
            .collect()
    }

    #[test]
    fn test_sma() {
        let values = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(sma(&values, 5), Some(104.0));
        // Trailing window only
        assert_eq!(sma(&values, 2), Some(107.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert_eq!(sma(&[100.0, 102.0], 5), None);
        assert_eq!(sma(&[], 1), None);
    }

    #[test]
    fn test_stddev_population_vs_sample() {
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let pop = stddev(&values, 8, StdDev::Population).unwrap();
        let sample = stddev(&values, 8, StdDev::Sample).unwrap();
        assert!((pop - 2.0).abs() < 1e-9);
        assert!(sample > pop);
    }

    #[test]
    fn test_stddev_constant_series_is_zero() {
        let values = vec![100.0; 20];
        assert_eq!(stddev(&values, 20, StdDev::Population), Some(0.0));
    }

    #[test]
    fn test_band_ordering_invariant() {
        // lower <= middle <= upper for every policy
        let bars = bars_from_closes(&[
            100.0, 101.5, 99.2, 102.3, 103.1, 98.7, 100.4, 101.9, 102.8, 99.5, 100.1, 103.4,
            104.2, 101.1, 99.9, 100.7, 102.2, 103.8, 101.3, 100.6, 102.0,
        ]);
        for policy in [
            BandPolicy::Legacy,
            BandPolicy::ClosedOnly,
            BandPolicy::Dynamic {
                tick_price: 102.1,
                large_gap_pct: 0.5,
            },
        ] {
            let band = compute_band(&bars, 20, 2.0, policy, StdDev::Population).unwrap();
            assert!(band.lower <= band.middle, "{policy:?}");
            assert!(band.middle <= band.upper, "{policy:?}");
        }
    }

    #[test]
    fn test_band_is_pure() {
        let bars = bars_from_closes(&[100.0; 25]);
        let policy = BandPolicy::Dynamic {
            tick_price: 100.2,
            large_gap_pct: 0.5,
        };
        let a = compute_band(&bars, 20, 2.0, policy, StdDev::Population).unwrap();
        let b = compute_band(&bars, 20, 2.0, policy, StdDev::Population).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_closed_only_excludes_open_bar() {
        // 21 bars; the last one is an outlier that the policy must ignore
        let mut closes = vec![100.0; 20];
        closes.push(500.0);
        let bars = bars_from_closes(&closes);

        let band = compute_band(&bars, 20, 2.0, BandPolicy::ClosedOnly, StdDev::Population)
            .unwrap();
        assert_eq!(band.middle, 100.0);
        assert_eq!(band.lower, 100.0);
        assert_eq!(band.upper, 100.0);
        assert_eq!(band.method, BandMethod::ClosedOnly);

        // Legacy includes the outlier and widens the envelope
        let legacy =
            compute_band(&bars, 20, 2.0, BandPolicy::Legacy, StdDev::Population).unwrap();
        assert!(legacy.upper > band.upper);
        assert_eq!(legacy.method, BandMethod::Legacy);
    }

    #[test]
    fn test_dynamic_substitutes_tick_on_small_gap() {
        let mut closes = vec![100.0; 20];
        closes.push(250.0); // open bar value that must be replaced
        let bars = bars_from_closes(&closes);

        // Tick is 0.2% away from the last closed close of 100.0
        let band = compute_band(
            &bars,
            21,
            2.0,
            BandPolicy::Dynamic {
                tick_price: 100.2,
                large_gap_pct: 0.5,
            },
            StdDev::Population,
        )
        .unwrap();
        assert_eq!(band.method, BandMethod::DynamicRealtime);
        assert_eq!(band.computed_at_price, 100.2);
        // Open bar's 250.0 never entered the window
        assert!(band.middle < 101.0);
    }

    #[test]
    fn test_dynamic_drops_open_bar_on_large_gap() {
        let mut closes = vec![100.0; 20];
        closes.push(103.0);
        let bars = bars_from_closes(&closes);

        // Tick 3% away from last closed close: open bar dropped entirely
        let band = compute_band(
            &bars,
            20,
            2.0,
            BandPolicy::Dynamic {
                tick_price: 103.0,
                large_gap_pct: 0.5,
            },
            StdDev::Population,
        )
        .unwrap();
        assert_eq!(band.method, BandMethod::DynamicClosedOnly);
        assert_eq!(band.middle, 100.0);
    }

    #[test]
    fn test_insufficient_data_after_trimming() {
        // Exactly `period` bars: closed-only trims to period-1 and must fail
        let bars = bars_from_closes(&[100.0; 20]);
        let err = compute_band(&bars, 20, 2.0, BandPolicy::ClosedOnly, StdDev::Population)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn test_fallback_chain_lands_on_legacy() {
        // 20 bars, period 20: dynamic(large gap) and closed-only both trim to
        // 19 usable bars and fail; legacy succeeds.
        let bars = bars_from_closes(&[100.0; 20]);
        let band = compute_band_with_fallback(
            &bars,
            20,
            2.0,
            110.0, // 10% gap forces the drop-open-bar branch
            0.5,
            StdDev::Population,
        )
        .unwrap();
        assert_eq!(band.method, BandMethod::Legacy);
        assert_eq!(band.middle, 100.0);
    }

    #[test]
    fn test_fallback_prefers_dynamic_when_it_works() {
        let bars = bars_from_closes(&[100.0; 25]);
        let band = compute_band_with_fallback(&bars, 20, 2.0, 100.1, 0.5, StdDev::Population)
            .unwrap();
        assert_eq!(band.method, BandMethod::DynamicRealtime);
    }
}

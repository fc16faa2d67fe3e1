// Volatility band computation over rolling bar windows

pub mod bollinger;

pub use bollinger::{
    compute_band, compute_band_with_fallback, sma, stddev, BandPolicy, StdDev,
};

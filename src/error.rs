use thiserror::Error;

/// Failure taxonomy for the decision engine
///
/// Only `Configuration` is fatal; everything else is recovered by skipping the
/// evaluation cycle or leaving state unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Band cannot be computed; the caller skips this evaluation cycle.
    #[error("insufficient data: need {needed} bars, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// An order, close, balance, or position query failed remotely.
    /// No state change; the engine awaits the next trigger.
    #[error("remote call failed: {0}")]
    RemoteCallFailure(String),

    /// Locally persisted and gateway-reported position state disagree.
    /// Logged; the gateway is trusted by default.
    #[error("position state inconsistency: {0}")]
    DataInconsistency(String),

    /// Invalid configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn remote(e: impl std::fmt::Display) -> Self {
        EngineError::RemoteCallFailure(e.to_string())
    }
}

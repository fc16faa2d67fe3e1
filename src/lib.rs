// Core modules
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod store;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{Engine, EngineState};
pub use error::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

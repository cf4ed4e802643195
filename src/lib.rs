// Library crate - exports the engine, persistence and trade sources

pub mod types;
pub mod error;
pub mod config;
pub mod trading_core;
pub mod execution;
pub mod persistence;
pub mod streams;

// Re-export commonly used types
pub use types::*;
pub use config::EngineConfig;
pub use trading_core::SymbolTrader;

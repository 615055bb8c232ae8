pub mod config;
pub mod replay;

pub use config::{ConfigError, ReplayConfig};
pub use replay::{NodeStats, ReplayError, ReplaySummary, Replayer};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Largest accepted metric name or block field, in bytes.
pub const MAX_FIELD_SIZE: u32 = 1024 * 1024;

/// Stream parser configuration.
///
/// Missing fields take their defaults when deserialized, so a YAML section
/// only has to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Threads decoding blocks and running callbacks (default: available parallelism)
    pub workers: usize,

    /// Records queued for the workers before the reader blocks (default: 4x workers)
    pub queue_capacity: usize,

    /// Streams allowed to read at the same time (default: 2x available parallelism)
    pub max_concurrent_inserts: usize,

    /// How long a stream waits for a read slot before failing (default: 60s)
    pub max_queue_duration_ms: u64,

    /// Buffered reader capacity in bytes (default: 64 KiB)
    pub read_buffer_size: usize,
}

fn available_parallelism() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

impl Default for ParserConfig {
    fn default() -> Self {
        let cpus = available_parallelism();
        Self {
            workers: cpus,
            queue_capacity: 4 * cpus,
            max_concurrent_inserts: 2 * cpus,
            max_queue_duration_ms: 60_000,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl ParserConfig {
    pub fn max_queue_duration(&self) -> Duration {
        Duration::from_millis(self.max_queue_duration_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidField("workers must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidField(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_inserts == 0 {
            return Err(ConfigError::InvalidField(
                "max_concurrent_inserts must be > 0".to_string(),
            ));
        }
        if self.max_queue_duration_ms == 0 {
            return Err(ConfigError::InvalidField(
                "max_queue_duration_ms must be > 0".to_string(),
            ));
        }
        if self.read_buffer_size < 16 {
            return Err(ConfigError::InvalidField(format!(
                "read_buffer_size ({}) must be at least 16 bytes",
                self.read_buffer_size
            )));
        }
        Ok(())
    }
}

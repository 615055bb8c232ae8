//! Replay configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use vmingest_native::ParserConfig;

/// Replay configuration.
///
/// Example YAML:
/// ```yaml
/// input: "/var/lib/vmingest/export.bin"
/// gzip: false
/// nodes: ["vmstorage-0:8400", "vmstorage-1:8400", "vmstorage-2:8400"]
/// unavailable_nodes: ["vmstorage-2:8400"]
/// hash_seed: 0
/// parser:
///   workers: 4
///   max_concurrent_inserts: 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Native export file to replay
    pub input: PathBuf,

    /// Input is gzip-compressed
    #[serde(default)]
    pub gzip: bool,

    /// Storage nodes series are routed to
    pub nodes: Vec<String>,

    /// Nodes to route around, as if they were down
    #[serde(default)]
    pub unavailable_nodes: Vec<String>,

    /// Seed mixed into every routing key
    #[serde(default)]
    pub hash_seed: u64,

    /// Stream parser settings
    #[serde(default)]
    pub parser: ParserConfig,
}

impl ReplayConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: ReplayConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - VMINGEST_INPUT
    /// - VMINGEST_NODES (comma-separated)
    /// - VMINGEST_UNAVAILABLE_NODES (comma-separated)
    /// - VMINGEST_HASH_SEED
    /// - VMINGEST_GZIP (true/false)
    /// - VMINGEST_WORKERS
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let input = std::env::var("VMINGEST_INPUT")
            .map_err(|_| ConfigError::MissingField("VMINGEST_INPUT".to_string()))?;

        let nodes = std::env::var("VMINGEST_NODES")
            .map(|s| split_list(&s))
            .map_err(|_| ConfigError::MissingField("VMINGEST_NODES".to_string()))?;

        let unavailable_nodes = std::env::var("VMINGEST_UNAVAILABLE_NODES")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        let hash_seed = match std::env::var("VMINGEST_HASH_SEED") {
            Ok(s) => s.parse().map_err(|e| {
                ConfigError::InvalidField(format!("Invalid VMINGEST_HASH_SEED: {}", e))
            })?,
            Err(_) => 0,
        };

        let gzip = match std::env::var("VMINGEST_GZIP") {
            Ok(s) => s
                .parse()
                .map_err(|e| ConfigError::InvalidField(format!("Invalid VMINGEST_GZIP: {}", e)))?,
            Err(_) => false,
        };

        let mut parser = ParserConfig::default();
        if let Ok(s) = std::env::var("VMINGEST_WORKERS") {
            parser.workers = s
                .parse()
                .map_err(|e| ConfigError::InvalidField(format!("Invalid VMINGEST_WORKERS: {}", e)))?;
            parser.queue_capacity = 4 * parser.workers;
        }

        let config = ReplayConfig {
            input: PathBuf::from(input),
            gzip,
            nodes,
            unavailable_nodes,
            hash_seed,
            parser,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.as_os_str().is_empty() {
            return Err(ConfigError::InvalidField("input cannot be empty".to_string()));
        }

        if self.nodes.is_empty() {
            return Err(ConfigError::InvalidField(
                "at least one node is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.is_empty() {
                return Err(ConfigError::InvalidField("node cannot be empty".to_string()));
            }
            if !seen.insert(node.as_str()) {
                return Err(ConfigError::InvalidField(format!("duplicate node {}", node)));
            }
        }

        for node in &self.unavailable_nodes {
            if !seen.contains(node.as_str()) {
                return Err(ConfigError::InvalidField(format!(
                    "unavailable node {} is not in nodes",
                    node
                )));
            }
        }

        self.parser
            .validate()
            .map_err(|e| ConfigError::InvalidField(format!("parser: {}", e)))?;

        Ok(())
    }

    /// Indices of `unavailable_nodes` within `nodes`.
    pub fn excluded_idxs(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| self.unavailable_nodes.contains(*node))
            .map(|(idx, _)| idx)
            .collect()
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

//! Routes every series of a native stream to a storage node.

use crate::config::{ConfigError, ReplayConfig};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vmingest_native::{Block, ParseError, StreamParser};
use vmingest_observe::Meter;
use vmingest_pacer::StoragePacers;
use vmingest_placement::{xxhash64, ConsistentHash};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot start parser: {0}")]
    Parser(#[from] vmingest_native::ConfigError),
    #[error("cannot open input: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Default)]
struct NodeCounters {
    blocks: AtomicU64,
    rows: AtomicU64,
}

/// Blocks and rows routed to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub node: String,
    pub blocks: u64,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub nodes: Vec<NodeStats>,
}

impl ReplaySummary {
    pub fn total_blocks(&self) -> u64 {
        self.nodes.iter().map(|n| n.blocks).sum()
    }

    pub fn total_rows(&self) -> u64 {
        self.nodes.iter().map(|n| n.rows).sum()
    }
}

/// Parses native streams and routes each block with a rendezvous hash.
///
/// Routing a block registers an assisted merge on the `search` pacer. Once
/// its own stream is parsed, a replay acts as a search over the per-node
/// totals: it yields to assisted merges still running in other replays on
/// the same pacers before the summary is built.
pub struct Replayer {
    parser: StreamParser,
    hash: Arc<ConsistentHash>,
    nodes: Vec<String>,
    excluded: Arc<Vec<usize>>,
    pacers: StoragePacers,
    meter: Arc<dyn Meter>,
}

impl Replayer {
    pub fn new(config: &ReplayConfig, meter: Arc<dyn Meter>) -> Result<Self, ReplayError> {
        config.validate()?;
        let parser = StreamParser::with_meter(config.parser.clone(), meter.clone())?;
        let hash = ConsistentHash::new(&config.nodes, config.hash_seed);
        tracing::info!(
            "routing to {} nodes ({} unavailable)",
            hash.len(),
            config.unavailable_nodes.len()
        );

        Ok(Self {
            parser,
            hash: Arc::new(hash),
            nodes: config.nodes.clone(),
            excluded: Arc::new(config.excluded_idxs()),
            pacers: StoragePacers::new(),
            meter,
        })
    }

    /// Pacers shared by every replay on this instance.
    pub fn pacers(&self) -> &StoragePacers {
        &self.pacers
    }

    pub fn replay_file(&self, path: impl AsRef<Path>, is_gzip: bool) -> Result<ReplaySummary, ReplayError> {
        let file = File::open(path.as_ref())?;
        self.replay(file, is_gzip)
    }

    pub fn replay<R: Read>(&self, reader: R, is_gzip: bool) -> Result<ReplaySummary, ReplayError> {
        let counters: Arc<Vec<NodeCounters>> =
            Arc::new((0..self.nodes.len()).map(|_| NodeCounters::default()).collect());

        let callback = {
            let counters = counters.clone();
            let hash = self.hash.clone();
            let excluded = self.excluded.clone();
            let pacers = self.pacers.clone();
            move |block: &Block| -> Result<(), io::Error> {
                let _merge = pacers.assisted_merge();
                let mut key = Vec::new();
                block.metric_name.marshal(&mut key);
                let idx = hash.get_node_idx(xxhash64(&key), &excluded);
                let node = &counters[idx];
                node.blocks.fetch_add(1, Ordering::Relaxed);
                node.rows.fetch_add(block.rows() as u64, Ordering::Relaxed);
                Ok(())
            }
        };
        self.parser.parse(reader, is_gzip, callback)?;

        self.pacers.search_wait();
        let nodes = self
            .nodes
            .iter()
            .zip(counters.iter())
            .map(|(node, c)| NodeStats {
                node: node.clone(),
                blocks: c.blocks.load(Ordering::Relaxed),
                rows: c.rows.load(Ordering::Relaxed),
            })
            .collect();
        self.pacers.report(self.meter.as_ref());
        Ok(ReplaySummary { nodes })
    }
}

use std::sync::Arc;
use vmingest_observe::RecordingMeter;
use vmingest_replay::{ReplayConfig, Replayer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Parse CLI args for config file path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "vmingest.yaml".to_string());

    tracing::info!("Loading configuration from: {}", config_path);

    // Load configuration (try file first, fall back to env)
    let config = if std::path::Path::new(&config_path).exists() {
        ReplayConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        ReplayConfig::load_from_env()?
    };

    tracing::info!("Input: {} (gzip: {})", config.input.display(), config.gzip);

    let meter = RecordingMeter::new();
    let replayer = Replayer::new(&config, Arc::new(meter.clone()))?;
    let summary = replayer.replay_file(&config.input, config.gzip)?;

    for node in &summary.nodes {
        tracing::info!("{}: {} blocks, {} rows", node.node, node.blocks, node.rows);
    }
    tracing::info!(
        "Replayed {} blocks, {} rows",
        summary.total_blocks(),
        summary.total_rows()
    );
    for (series, value) in meter.snapshot() {
        tracing::info!("{} {}", series, value);
    }

    Ok(())
}

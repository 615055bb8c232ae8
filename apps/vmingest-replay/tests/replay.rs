use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vmingest_native::{MetricName, NativeWriter, PortableBlock, TimeRange};
use vmingest_observe::{NoopMeter, RecordingMeter};
use vmingest_replay::{ReplayConfig, ReplayError, Replayer};

const SERIES: usize = 64;
const ROWS: usize = 10;

fn write_export(path: &std::path::Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = NativeWriter::new(file, TimeRange::unbounded()).unwrap();
    for i in 0..SERIES {
        let name = MetricName::new("http_requests_total")
            .with_tag("instance", format!("host-{}", i))
            .with_tag("job", "api");
        let timestamps = (0..ROWS as i64).map(|j| 1_000 + j * 1_000).collect();
        let values = (0..ROWS as i64).map(|j| j * 10 + i as i64).collect();
        writer
            .write_block(&name, &PortableBlock::new(timestamps, values, 0))
            .unwrap();
    }
    writer.into_inner().flush().unwrap();
}

fn write_config(dir: &tempfile::TempDir, input: &std::path::Path, unavailable: &[&str]) -> ReplayConfig {
    let path = dir.path().join("vmingest.yaml");
    let unavailable = unavailable
        .iter()
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(", ");
    std::fs::write(
        &path,
        format!(
            "input: {}\nnodes: [\"n0\", \"n1\", \"n2\"]\nunavailable_nodes: [{}]\nhash_seed: 7\nparser:\n  workers: 2\n  queue_capacity: 8\n  max_concurrent_inserts: 2\n",
            input.display(),
            unavailable
        ),
    )
    .unwrap();
    ReplayConfig::load_from_file(&path).unwrap()
}

#[test]
fn test_replay_routes_every_block() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("export.bin");
    write_export(&input);
    let config = write_config(&dir, &input, &[]);

    let meter = RecordingMeter::new();
    let replayer = Replayer::new(&config, Arc::new(meter.clone())).unwrap();
    let summary = replayer.replay_file(&config.input, config.gzip).unwrap();

    assert_eq!(summary.nodes.len(), 3);
    assert_eq!(summary.total_blocks(), SERIES as u64);
    assert_eq!(summary.total_rows(), (SERIES * ROWS) as u64);
    for node in &summary.nodes {
        assert_eq!(node.rows, node.blocks * ROWS as u64);
    }

    assert_eq!(
        meter.value("vm_protoparser_blocks_read_total", &[("type", "native")]),
        SERIES as i64
    );
    assert_eq!(meter.value("vm_search_delays_total", &[]), 0);
}

#[test]
fn test_replay_skips_unavailable_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("export.bin");
    write_export(&input);
    let config = write_config(&dir, &input, &["n1"]);

    let replayer = Replayer::new(&config, Arc::new(NoopMeter)).unwrap();
    let summary = replayer.replay_file(&config.input, false).unwrap();

    assert_eq!(summary.nodes[1].node, "n1");
    assert_eq!(summary.nodes[1].blocks, 0);
    assert_eq!(summary.total_blocks(), SERIES as u64);
}

#[test]
fn test_replay_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("export.bin");
    write_export(&input);
    let config = write_config(&dir, &input, &[]);

    let replayer = Replayer::new(&config, Arc::new(NoopMeter)).unwrap();
    let first = replayer.replay_file(&config.input, false).unwrap();
    let second = replayer.replay_file(&config.input, false).unwrap();
    assert_eq!(first, second);

    let other = Replayer::new(&config, Arc::new(NoopMeter)).unwrap();
    assert_eq!(other.replay_file(&config.input, false).unwrap(), first);
}

#[test]
fn test_replay_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("export.bin");
    std::fs::write(&input, [0u8; 5]).unwrap();
    let config = write_config(&dir, &input, &[]);

    let replayer = Replayer::new(&config, Arc::new(NoopMeter)).unwrap();
    let err = replayer.replay_file(&config.input, false).unwrap_err();
    assert!(matches!(err, ReplayError::Parse(_)));

    let err = replayer
        .replay_file(dir.path().join("missing.bin"), false)
        .unwrap_err();
    assert!(matches!(err, ReplayError::Io(_)));
}

#[test]
fn test_replay_yields_to_running_assisted_merges() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("export.bin");
    write_export(&input);
    let config = write_config(&dir, &input, &[]);

    let meter = RecordingMeter::new();
    let replayer = Arc::new(Replayer::new(&config, Arc::new(meter.clone())).unwrap());
    let merge = replayer.pacers().assisted_merge();

    let (tx, rx) = mpsc::channel();
    {
        let replayer = replayer.clone();
        let input = config.input.clone();
        thread::spawn(move || {
            tx.send(replayer.replay_file(&input, false)).unwrap();
        });
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    drop(merge);
    let summary = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("replay did not finish after the merge ended")
        .unwrap();
    assert_eq!(summary.total_blocks(), SERIES as u64);
    assert!(meter.value("vm_search_delays_total", &[]) > 0);
}

//! Replay command implementation.

use fleetsync_engine::{EventDecoder, Snapshot, StateStore, StoreStats};
use fleetsync_protocol::{EntityKind, RawMessage, ServerFrame};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::warn;

/// A line that could not be replayed.
#[derive(Debug, Serialize)]
pub struct MalformedLine {
    /// 1-based line number.
    pub line: usize,
    /// Decode error.
    pub error: String,
}

/// Replay result.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Non-empty lines read.
    pub lines: usize,
    /// Frames decoded and applied.
    pub frames: usize,
    /// Lines skipped as undecodable.
    pub malformed: Vec<MalformedLine>,
    /// Store counters after the replay.
    pub stats: StoreStats,
    /// Resulting snapshots, one per kind.
    pub snapshots: Vec<Snapshot>,
}

/// Applies a JSON-lines capture of server frames to a fresh store.
pub fn replay(reader: impl BufRead, kind: Option<EntityKind>) -> std::io::Result<ReplayReport> {
    let store = StateStore::new(Duration::from_secs(10), Duration::from_secs(10));
    let decoder = EventDecoder::new();
    let mut lines = 0;
    let mut frames = 0;
    let mut malformed = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        let frame = match decoder.decode(&RawMessage::Text(line)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping malformed line");
                malformed.push(MalformedLine {
                    line: index + 1,
                    error: e.to_string(),
                });
                continue;
            }
        };
        frames += 1;
        let now = Instant::now();
        match frame {
            ServerFrame::Event(envelope) => {
                store.apply_event(&envelope, now);
            }
            ServerFrame::ResyncBatch(batch) => {
                store.apply_resync(&batch, now);
            }
            ServerFrame::MutationRejected(rejected) => {
                store.reject(rejected.correlation_id, rejected.reason);
            }
            ServerFrame::Pong { .. } | ServerFrame::Error { .. } => {}
        }
    }

    let kinds: Vec<EntityKind> = match kind {
        Some(kind) => vec![kind],
        None => EntityKind::ALL.to_vec(),
    };
    let snapshots = kinds
        .into_iter()
        .map(|kind| store.snapshot(kind))
        .filter(|snapshot| kind.is_some() || !snapshot.is_empty())
        .collect();

    Ok(ReplayReport {
        lines,
        frames,
        malformed,
        stats: store.stats(),
        snapshots,
    })
}

/// Runs the replay command.
pub fn run(
    path: &Path,
    kind: Option<EntityKind>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(path).map_err(|e| format!("opening {}: {e}", path.display()))?;
    let report = replay(BufReader::new(file), kind)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(path, &report),
    }
    Ok(())
}

fn print_text_output(path: &Path, report: &ReplayReport) {
    println!("fleetsync Replay");
    println!("================");
    println!();
    println!("Capture: {}", path.display());
    println!(
        "Lines:   {} ({} applied, {} malformed)",
        report.lines,
        report.frames,
        report.malformed.len()
    );
    for bad in &report.malformed {
        println!("  line {}: {}", bad.line, bad.error);
    }
    println!();
    println!("Store:");
    println!("  Events applied: {}", report.stats.events_applied);
    println!("  Stale events:   {}", report.stats.stale_events);
    println!("  Deletes:        {}", report.stats.deletes);
    println!("  Resyncs:        {}", report.stats.resyncs);

    for snapshot in &report.snapshots {
        println!();
        println!("{} ({}):", snapshot.kind, snapshot.len());
        for (id, view) in &snapshot.entities {
            println!(
                "  {:<32} rev {:>6}  {}",
                id, view.entity.revision, view.entity.status
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CAPTURE: &str = r#"
{"type":"event","kind":"deployment","entity_id":"deployment-42","revision":3,"operation":"upsert","status":"healthy","payload":{"replicas":3}}
{"type":"event","kind":"deployment","entity_id":"deployment-42","revision":2,"operation":"upsert","status":"error","payload":{}}
not json at all
{"type":"resync_batch","kind":"cluster","since_revision":0,"envelopes":[{"kind":"cluster","entity_id":"eu-west","revision":1,"operation":"upsert","status":"healthy"}]}
{"type":"pong","nonce":1}
"#;

    #[test]
    fn replay_applies_frames_and_skips_garbage() {
        let report = replay(Cursor::new(CAPTURE), None).unwrap();
        assert_eq!(report.lines, 5);
        assert_eq!(report.frames, 4);
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.malformed[0].line, 4);
        assert_eq!(report.stats.stale_events, 1);
        assert_eq!(report.snapshots.len(), 2);

        let deployments = &report.snapshots[0];
        let view = deployments.get("deployment-42").unwrap();
        assert_eq!(view.entity.revision, 3);
        assert_eq!(view.entity.status.as_str(), "healthy");
    }

    #[test]
    fn replay_filters_by_kind() {
        let report = replay(Cursor::new(CAPTURE), Some(EntityKind::Organization)).unwrap();
        assert_eq!(report.snapshots.len(), 1);
        assert!(report.snapshots[0].is_empty());
    }

    #[test]
    fn run_reads_capture_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        std::fs::write(&path, CAPTURE).unwrap();
        run(&path, None, "json").unwrap();
        assert!(run(&dir.path().join("missing.jsonl"), None, "text").is_err());
    }
}

//! GC command implementation.

use serde::Serialize;
use tidal_sync_engine::{LruParams, LruResults, MemoryPersistence, Persistence};
use tidal_sync_protocol::{
    DocumentKey, MaybeDocument, Query, RemoteEvent, ResumeToken, SnapshotVersion, TargetChange,
};

/// Cache shape to build before collecting.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Number of targets to allocate.
    pub targets: usize,
    /// Documents cached per target.
    pub documents_per_target: usize,
    /// How many of the oldest targets to release.
    pub released: usize,
    /// Percentile of sequence numbers to collect.
    pub percentile: u32,
    /// Cache size threshold in bytes.
    pub threshold: i64,
}

/// Outcome of one collection pass.
#[derive(Debug, Serialize)]
pub struct GcReport {
    /// What the collector did.
    pub results: LruResults,
    /// Cache size before the pass.
    pub bytes_before: i64,
    /// Cache size after the pass.
    pub bytes_after: i64,
    /// Cached targets before the pass.
    pub targets_before: usize,
    /// Cached targets after the pass.
    pub targets_after: usize,
    /// Cached documents before the pass.
    pub documents_before: usize,
    /// Cached documents after the pass.
    pub documents_after: usize,
}

/// Runs the gc command.
pub fn run(options: &GcOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let params = LruParams::with_cache_size(options.threshold).with_percentile(options.percentile);
    let persistence = MemoryPersistence::new(params);
    fill(&persistence, options)?;

    let bytes_before = persistence.cache_size_bytes()?;
    let targets_before = persistence.target_count();
    let documents_before = persistence.document_count();

    let results = persistence.collect_garbage(&persistence.garbage_collector())?;

    let report = GcReport {
        results,
        bytes_before,
        bytes_after: persistence.cache_size_bytes()?,
        targets_before,
        targets_after: persistence.target_count(),
        documents_before,
        documents_after: persistence.document_count(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

/// Allocates the targets, caches their documents and releases the oldest.
fn fill(persistence: &MemoryPersistence, options: &GcOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut released = Vec::new();
    for t in 0..options.targets {
        let collection = format!("collection{t}");
        let target = persistence.allocate_target(Query::at_path(&collection)?);
        let version = SnapshotVersion::from_micros(t as i64 + 1);

        let mut change = TargetChange {
            resume_token: ResumeToken::from(format!("v{}", t + 1).into_bytes()),
            current: true,
            ..TargetChange::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: version,
            ..RemoteEvent::default()
        };
        for d in 0..options.documents_per_target {
            let key = DocumentKey::parse(&format!("{collection}/doc{d}"))?;
            change.added_documents.insert(key.clone());
            event.document_updates.insert(
                key.clone(),
                MaybeDocument::document(key, version, serde_json::json!({ "index": d })),
            );
        }
        event.target_changes.insert(target.target_id(), change);
        persistence.apply_remote_event(&event)?;

        if t < options.released {
            released.push(target.target_id());
        }
    }
    for target_id in released {
        persistence.release_target(target_id);
    }
    Ok(())
}

fn print_text_output(report: &GcReport) {
    println!("LRU Garbage Collection");
    println!("======================");
    println!();
    if !report.results.did_run {
        println!("Collection skipped (cache below threshold or disabled)");
        println!("  Cache size: {} bytes", report.bytes_before);
        return;
    }
    println!("Collected:");
    println!(
        "  Sequence numbers: {}",
        report.results.sequence_numbers_collected
    );
    println!("  Targets removed:   {}", report.results.targets_removed);
    println!("  Documents removed: {}", report.results.documents_removed);
    println!();
    println!(
        "  Targets:   {} -> {}",
        report.targets_before, report.targets_after
    );
    println!(
        "  Documents: {} -> {}",
        report.documents_before, report.documents_after
    );
    println!(
        "  Size:      {} -> {} bytes",
        report.bytes_before, report.bytes_after
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_targets_are_collected() {
        let options = GcOptions {
            targets: 4,
            documents_per_target: 3,
            released: 2,
            percentile: 100,
            threshold: 1,
        };
        let persistence =
            MemoryPersistence::new(LruParams::with_cache_size(1).with_percentile(100));
        fill(&persistence, &options).unwrap();
        assert_eq!(persistence.target_count(), 4);
        assert_eq!(persistence.document_count(), 12);

        let results = persistence
            .collect_garbage(&persistence.garbage_collector())
            .unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 2);
        assert_eq!(results.documents_removed, 6);
        assert_eq!(persistence.target_count(), 2);
    }
}

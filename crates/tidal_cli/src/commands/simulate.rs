//! Simulate command implementation.
//!
//! Runs a client against an in-process backend and prints every call the
//! sync layer receives.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tidal_sync_engine::{
    LoopbackBackend, LoopbackWatchStream, MemoryPersistence, OnlineState, RemoteSyncer,
    RetryConfig, StaticIdentity, SyncClient, SyncConfig, SyncError, SyncResult, User,
};
use tidal_sync_protocol::{DocumentKey, Query, RemoteEvent, TargetId};
use tracing::info;

/// How long to let queued work drain between steps.
const SETTLE: Duration = Duration::from_millis(50);

/// Scenario to run.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Collection to listen to.
    pub collection: String,
    /// Documents present before the listen.
    pub documents: usize,
    /// Documents written while listening.
    pub writes: usize,
    /// Path whose listens the backend rejects.
    pub deny: Option<String>,
    /// How long the backend stays unreachable, if at all.
    pub outage: Option<Duration>,
}

/// Per-target summary of a snapshot.
#[derive(Debug, Serialize)]
pub struct TargetSummary {
    /// Target id.
    pub target_id: i32,
    /// Whether the target is caught up.
    pub current: bool,
    /// Documents that entered the result set.
    pub added: usize,
    /// Documents that changed.
    pub modified: usize,
    /// Documents that left the result set.
    pub removed: usize,
}

/// One call received by the sync layer.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionLine {
    /// A consistent snapshot.
    Snapshot {
        /// Snapshot version in microseconds.
        version: i64,
        /// Changed targets.
        targets: Vec<TargetSummary>,
        /// Documents updated.
        documents: usize,
        /// Targets that must be resynced.
        mismatches: Vec<i32>,
    },
    /// A rejected listen.
    Rejected {
        /// Target id.
        target_id: i32,
        /// Why the backend rejected it.
        error: String,
    },
    /// A connectivity change.
    OnlineState {
        /// New state.
        state: OnlineState,
    },
    /// A user change.
    User {
        /// New user.
        user: String,
    },
}

impl SessionLine {
    fn snapshot(event: &RemoteEvent) -> Self {
        SessionLine::Snapshot {
            version: event.snapshot_version.as_micros(),
            targets: event
                .target_changes
                .iter()
                .map(|(target_id, change)| TargetSummary {
                    target_id: target_id.get(),
                    current: change.current,
                    added: change.added_documents.len(),
                    modified: change.modified_documents.len(),
                    removed: change.removed_documents.len(),
                })
                .collect(),
            documents: event.document_updates.len(),
            mismatches: event.target_mismatches.iter().map(TargetId::get).collect(),
        }
    }
}

impl fmt::Display for SessionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionLine::Snapshot {
                version,
                targets,
                documents,
                mismatches,
            } => {
                write!(f, "snapshot  v{version} documents={documents}")?;
                for t in targets {
                    write!(
                        f,
                        " [{}: +{} ~{} -{}{}]",
                        t.target_id,
                        t.added,
                        t.modified,
                        t.removed,
                        if t.current { " current" } else { "" }
                    )?;
                }
                if !mismatches.is_empty() {
                    write!(f, " mismatches={mismatches:?}")?;
                }
                Ok(())
            }
            SessionLine::Rejected { target_id, error } => {
                write!(f, "rejected  target {target_id}: {error}")
            }
            SessionLine::OnlineState { state } => write!(f, "online    {state}"),
            SessionLine::User { user } => write!(f, "user      {user}"),
        }
    }
}

/// A sync layer that applies events to memory and prints each call.
struct PrintingSyncer {
    persistence: Arc<MemoryPersistence>,
    json: bool,
}

impl PrintingSyncer {
    fn print(&self, line: SessionLine) {
        if self.json {
            match serde_json::to_string(&line) {
                Ok(json) => println!("{json}"),
                Err(err) => tracing::warn!(error = %err, "Failed to encode session line"),
            }
        } else {
            println!("{line}");
        }
    }
}

impl RemoteSyncer for PrintingSyncer {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> SyncResult<()> {
        self.persistence.apply_remote_event(&event)?;
        self.print(SessionLine::snapshot(&event));
        Ok(())
    }

    fn reject_listen(&mut self, target_id: TargetId, error: SyncError) {
        self.persistence.release_target(target_id);
        self.print(SessionLine::Rejected {
            target_id: target_id.get(),
            error: error.to_string(),
        });
    }

    fn handle_online_state_change(&mut self, online_state: OnlineState) {
        self.print(SessionLine::OnlineState { state: online_state });
    }

    fn handle_user_change(&mut self, user: User) {
        self.print(SessionLine::User {
            user: user.to_string(),
        });
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> std::collections::BTreeSet<DocumentKey> {
        self.persistence.remote_keys_for_target(target_id)
    }
}

/// Runs the simulate command.
pub fn run(options: SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(simulate(options, format == "json"))
}

async fn simulate(options: SimulateOptions, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let backend = LoopbackBackend::new();
    for n in 0..options.documents {
        backend.set_document(document_key(&options.collection, n)?, serde_json::json!({ "index": n }));
    }

    let config = SyncConfig::new().with_retry(
        RetryConfig::new(Duration::from_millis(200)).with_max_delay(Duration::from_secs(2)),
    );
    let persistence = Arc::new(MemoryPersistence::new(config.lru.clone()));
    let identity = StaticIdentity::new(User::new("simulator"));
    let syncer = PrintingSyncer {
        persistence: Arc::clone(&persistence),
        json,
    };

    let stream_backend = backend.clone();
    let retry = config.retry.clone();
    let client = SyncClient::start(
        config,
        move |sink| LoopbackWatchStream::new(stream_backend, sink, retry),
        syncer,
        Arc::clone(&persistence),
        &identity,
    );

    let target = persistence.allocate_target(Query::at_path(&options.collection)?);
    client.listen(target).await?;
    if let Some(path) = &options.deny {
        backend.deny_path(path.clone());
        let denied = persistence.allocate_target(Query::at_path(path)?);
        client.listen(denied).await?;
    }
    tokio::time::sleep(SETTLE).await;

    for n in 0..options.writes {
        let index = options.documents + n;
        backend.set_document(
            document_key(&options.collection, index)?,
            serde_json::json!({ "index": index, "written": true }),
        );
        tokio::time::sleep(SETTLE).await;
    }

    if let Some(outage) = options.outage {
        info!(outage_ms = outage.as_millis() as u64, "Taking backend offline");
        backend.set_reachable(false);
        tokio::time::sleep(outage).await;
        backend.set_reachable(true);
        wait_for_connection(&backend, Duration::from_secs(5)).await;
        tokio::time::sleep(SETTLE).await;
    }

    client.shutdown().await?;
    info!(
        documents = persistence.document_count(),
        version = %backend.snapshot_version(),
        "Simulation finished"
    );
    Ok(())
}

fn document_key(collection: &str, index: usize) -> Result<DocumentKey, Box<dyn std::error::Error>> {
    Ok(DocumentKey::parse(&format!("{collection}/doc{index}"))?)
}

async fn wait_for_connection(backend: &LoopbackBackend, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while backend.connection_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(SETTLE).await;
    }
}

//! Durable position journal
//!
//! Every position mutation is recorded keyed by position id so a restart can
//! rebuild the live set and reconcile it against the exchange.
//!
//! Snapshots carry a monotonically increasing `version`. Journals keep the
//! highest version per id, so two tasks recording out of order (both having
//! released the store lock before writing) never regress durable state, and
//! replaying the same journal twice yields the same live set.

use crate::error::StoreResult;
use async_trait::async_trait;
use perpguard_domain::{Position, PositionId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

// =============================================================================
// Port
// =============================================================================

/// Persistence port for position snapshots
#[async_trait]
pub trait PositionJournal: Send + Sync {
    /// Record the latest snapshot of a live position
    async fn record(&self, position: &Position) -> StoreResult<()>;

    /// Record a position as closed and removed from the live set
    async fn archive(&self, position: &Position) -> StoreResult<()>;

    /// Load the highest-version snapshot of every non-archived position
    async fn load_live(&self) -> StoreResult<Vec<Position>>;
}

/// Keep `incoming` only if it is newer than what is already held
fn keep_newest(live: &mut HashMap<PositionId, Position>, incoming: Position) {
    match live.get(&incoming.id) {
        Some(existing) if existing.version >= incoming.version => {},
        _ => {
            live.insert(incoming.id, incoming);
        },
    }
}

// =============================================================================
// Memory Journal
// =============================================================================

#[derive(Default)]
struct MemoryJournalState {
    live: HashMap<PositionId, Position>,
    archived: HashSet<PositionId>,
    writes: usize,
}

/// In-memory journal for tests and stub mode
#[derive(Default)]
pub struct MemoryJournal {
    state: Mutex<MemoryJournalState>,
}

impl MemoryJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Total record/archive calls seen
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).writes
    }

    /// Latest recorded snapshot of a live position
    pub fn latest(&self, id: PositionId) -> Option<Position> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).live.get(&id).cloned()
    }

    /// True if the id has been archived
    pub fn is_archived(&self, id: PositionId) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).archived.contains(&id)
    }
}

#[async_trait]
impl PositionJournal for MemoryJournal {
    async fn record(&self, position: &Position) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.writes += 1;
        if state.archived.contains(&position.id) {
            return Ok(());
        }
        keep_newest(&mut state.live, position.clone());
        Ok(())
    }

    async fn archive(&self, position: &Position) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.writes += 1;
        state.live.remove(&position.id);
        state.archived.insert(position.id);
        Ok(())
    }

    async fn load_live(&self) -> StoreResult<Vec<Position>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.live.values().cloned().collect())
    }
}

// =============================================================================
// File Journal (JSON lines)
// =============================================================================

/// One line of the journal file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum JournalEntry {
    Record { position: Position },
    Archive { position: Position },
}

/// Append-only JSON-lines journal
///
/// Each write appends one line. Replay folds the file into the highest
/// version per id and drops archived ids. A torn trailing line (crash while
/// appending) is skipped with a warning.
pub struct FileJournal {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileJournal {
    /// Journal backed by `path` (created on first write)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: &JournalEntry) -> StoreResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PositionJournal for FileJournal {
    async fn record(&self, position: &Position) -> StoreResult<()> {
        self.append(&JournalEntry::Record {
            position: position.clone(),
        })
        .await
    }

    async fn archive(&self, position: &Position) -> StoreResult<()> {
        self.append(&JournalEntry::Archive {
            position: position.clone(),
        })
        .await
    }

    async fn load_live(&self) -> StoreResult<Vec<Position>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut live: HashMap<PositionId, Position> = HashMap::new();
        let mut archived: HashSet<PositionId> = HashSet::new();

        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(JournalEntry::Record { position }) => keep_newest(&mut live, position),
                Ok(JournalEntry::Archive { position }) => {
                    archived.insert(position.id);
                },
                Err(e) => {
                    warn!(path = %self.path.display(), line = line_no + 1, error = %e, "Skipping unreadable journal line");
                },
            }
        }

        live.retain(|id, _| !archived.contains(id));
        debug!(path = %self.path.display(), live = live.len(), archived = archived.len(), "Journal replayed");
        Ok(live.into_values().collect())
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Position store
//!
//! Single source of truth for open-position state. Every operation takes the
//! store's one lock for its whole critical section and never calls into
//! another component while holding it. Journal writes happen after the lock
//! is released, using the snapshot copied out under the lock.

use crate::error::{StoreError, StoreResult};
use crate::journal::PositionJournal;
use chrono::Utc;
use perpguard_domain::{Position, PositionId, PositionPatch, PositionStatus, Side, Symbol};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Outcome of [`PositionStore::create_if_absent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new position was inserted
    Created(PositionId),
    /// A live position for the same symbol and side already existed
    Existing(PositionId),
}

impl CreateOutcome {
    /// Id of the created or existing position
    pub fn id(&self) -> PositionId {
        match self {
            CreateOutcome::Created(id) | CreateOutcome::Existing(id) => *id,
        }
    }
}

/// Thread-safe store of live positions
pub struct PositionStore {
    positions: Mutex<HashMap<PositionId, Position>>,
    journal: Arc<dyn PositionJournal>,
}

impl PositionStore {
    /// Create an empty store writing to `journal`
    pub fn new(journal: Arc<dyn PositionJournal>) -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            journal,
        }
    }

    // A poisoned guard still holds consistent data: every method validates
    // before writing and writes each position in a single assignment.
    fn lock(&self) -> MutexGuard<'_, HashMap<PositionId, Position>> {
        self.positions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self, snapshot: &Position) {
        if let Err(e) = self.journal.record(snapshot).await {
            error!(position_id = %snapshot.id, version = snapshot.version, error = %e, "Failed to journal position");
        }
    }

    // =========================================================================
    // Core contract
    // =========================================================================

    /// Insert a new position
    ///
    /// # Errors
    /// - `Duplicate` if the id is already live
    pub async fn create(&self, position: Position) -> StoreResult<PositionId> {
        let id = position.id;
        let snapshot = {
            let mut positions = self.lock();
            if positions.contains_key(&id) {
                return Err(StoreError::duplicate("position", id.to_string()));
            }
            positions.insert(id, position.clone());
            position
        };

        debug!(position_id = %id, symbol = %snapshot.symbol, side = ?snapshot.side, "Position created");
        self.persist(&snapshot).await;
        Ok(id)
    }

    /// Get a copy of a live position
    ///
    /// # Errors
    /// - `NotFound` if the id is unknown
    pub fn get(&self, id: PositionId) -> StoreResult<Position> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("position", id.to_string()))
    }

    /// Positions with status `Open`, oldest first
    pub fn list_open(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self.lock().values().filter(|p| p.is_open()).cloned().collect();
        open.sort_by_key(|p| p.created_at);
        open
    }

    /// Every live position regardless of status, oldest first
    pub fn list_live(&self) -> Vec<Position> {
        let mut live: Vec<Position> = self.lock().values().cloned().collect();
        live.sort_by_key(|p| p.created_at);
        live
    }

    /// Apply a patch to one position under a single critical section.
    ///
    /// Returns `Ok(false)` if the id is unknown or the position is closed.
    ///
    /// # Errors
    /// - `Domain` if the patch requests a forbidden status transition; the
    ///   position is left untouched
    pub async fn compound_update(&self, id: PositionId, patch: &PositionPatch) -> StoreResult<bool> {
        let snapshot = {
            let mut positions = self.lock();
            let Some(position) = positions.get_mut(&id) else {
                return Ok(false);
            };
            if position.status.is_terminal() {
                return Ok(false);
            }
            // Apply to a copy so a rejected patch leaves the stored value intact
            let mut updated = position.clone();
            updated.apply(patch, Utc::now())?;
            *position = updated.clone();
            updated
        };

        self.persist(&snapshot).await;
        Ok(true)
    }

    /// Remove a position from the live set and archive it as closed.
    ///
    /// Returns the removed position, or `None` if it was already gone. Only
    /// the caller that receives `Some` may release its margin.
    pub async fn remove(&self, id: PositionId) -> Option<Position> {
        let mut removed = self.lock().remove(&id)?;

        removed.status = PositionStatus::Closed;
        removed.last_updated_at = Utc::now();
        removed.version += 1;

        info!(position_id = %id, symbol = %removed.symbol, side = ?removed.side, "Position removed");
        if let Err(e) = self.journal.archive(&removed).await {
            error!(position_id = %id, error = %e, "Failed to archive position");
        }
        Some(removed)
    }

    // =========================================================================
    // Extended operations
    // =========================================================================

    /// Live (not closed) position for `symbol` and `side`
    pub fn find_open_by_symbol(&self, symbol: &Symbol, side: Side) -> Option<Position> {
        self.lock()
            .values()
            .find(|p| &p.symbol == symbol && p.side == side)
            .cloned()
    }

    /// Insert unless a live position for the same symbol and side exists.
    ///
    /// Check and insert happen under one lock, so two racing
    /// reconciliations cannot both import the same exchange position.
    pub async fn create_if_absent(&self, position: Position) -> StoreResult<CreateOutcome> {
        let snapshot = {
            let mut positions = self.lock();
            if let Some(existing) = positions
                .values()
                .find(|p| p.symbol == position.symbol && p.side == position.side)
            {
                return Ok(CreateOutcome::Existing(existing.id));
            }
            if positions.contains_key(&position.id) {
                return Err(StoreError::duplicate("position", position.id.to_string()));
            }
            positions.insert(position.id, position.clone());
            position
        };

        self.persist(&snapshot).await;
        Ok(CreateOutcome::Created(snapshot.id))
    }

    /// Compare-and-set on status.
    ///
    /// Returns `Ok(true)` only for the caller whose `from` matched, which is
    /// how one loop claims the exclusive right to close a position.
    pub async fn try_transition(
        &self,
        id: PositionId,
        from: PositionStatus,
        to: PositionStatus,
    ) -> StoreResult<bool> {
        let snapshot = {
            let mut positions = self.lock();
            let Some(position) = positions.get_mut(&id) else {
                return Ok(false);
            };
            if position.status != from {
                return Ok(false);
            }
            let mut updated = position.clone();
            updated.apply(&PositionPatch::status(to), Utc::now())?;
            *position = updated.clone();
            updated
        };

        self.persist(&snapshot).await;
        Ok(true)
    }

    /// Number of live positions (any status), used for capacity limits
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    /// Symbols that currently have a live position
    pub fn held_symbols(&self) -> HashSet<Symbol> {
        self.lock().values().map(|p| p.symbol.clone()).collect()
    }

    /// Load journaled positions after a restart.
    ///
    /// Replaces by id and keeps the higher version, so restoring the same
    /// snapshots twice yields the same set. Closed snapshots are ignored.
    /// Returns only the positions newly inserted; an id already live is
    /// updated in place and not returned, so its margin is never counted twice.
    pub fn restore(&self, snapshots: Vec<Position>) -> Vec<Position> {
        let mut positions = self.lock();
        let mut restored = Vec::new();

        for snapshot in snapshots {
            if snapshot.status.is_terminal() {
                continue;
            }
            let replace = positions
                .get(&snapshot.id)
                .map(|existing| existing.version < snapshot.version)
                .unwrap_or(true);
            if replace {
                let previous = positions.insert(snapshot.id, snapshot.clone());
                if previous.is_none() {
                    restored.push(snapshot);
                }
            }
        }

        info!(restored = restored.len(), live = positions.len(), "Positions restored from journal");
        restored
    }
}

// =============================================================================
// Tests
// =============================================================================

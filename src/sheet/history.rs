//! Bounded per-entity undo/redo.
//!
//! Every view and part sheet owns its own `HistoryState`. Snapshots are value
//! copies of the entity's visible fields; the history itself is never captured.

use std::collections::VecDeque;

/// Default maximum depth of an undo stack.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Undo and redo stacks, oldest entry first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryState<T> {
    undo_stack: VecDeque<T>,
    redo_stack: Vec<T>,
    limit: usize,
}

impl<T> Default for HistoryState<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl<T> HistoryState<T> {
    /// Creates an empty history bounded to `limit` entries (at least one).
    pub fn new(limit: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Records a pre-mutation snapshot. Clears the redo stack and evicts the
    /// oldest undo entry once the bound is exceeded.
    pub fn record(&mut self, snapshot: T) {
        self.redo_stack.clear();
        self.push_undo(snapshot);
    }

    /// Pops the most recent snapshot, parking `current` on the redo stack.
    /// Returns `None` (and drops `current`) when there is nothing to undo.
    pub fn undo(&mut self, current: T) -> Option<T> {
        let previous = self.undo_stack.pop_back()?;
        self.redo_stack.push(current);
        Some(previous)
    }

    /// Mirror of [`HistoryState::undo`].
    pub fn redo(&mut self, current: T) -> Option<T> {
        let next = self.redo_stack.pop()?;
        self.push_undo(current);
        Some(next)
    }

    fn push_undo(&mut self, snapshot: T) {
        self.undo_stack.push_back(snapshot);
        while self.undo_stack.len() > self.limit {
            self.undo_stack.pop_front();
        }
    }

    /// Check if undo is available
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Check if redo is available
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Undo snapshots, oldest first.
    pub fn undo_entries(&self) -> impl Iterator<Item = &T> {
        self.undo_stack.iter()
    }

    /// Redo snapshots, oldest first.
    pub fn redo_entries(&self) -> impl Iterator<Item = &T> {
        self.redo_stack.iter()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

/// An entity with snapshot-based history.
///
/// Undo and redo are pure local state transitions; nothing here talks to the
/// collaborator.
pub trait Versioned {
    /// Value copy of the visible fields.
    type Snapshot: Clone;

    fn snapshot(&self) -> Self::Snapshot;

    fn restore(&mut self, snapshot: Self::Snapshot);

    fn history(&self) -> &HistoryState<Self::Snapshot>;

    fn history_mut(&mut self) -> &mut HistoryState<Self::Snapshot>;

    /// Pushes the current visible state before a mutating operation commits.
    fn snapshot_before_change(&mut self) {
        let snapshot = self.snapshot();
        self.history_mut().record(snapshot);
    }

    /// Restores the previous snapshot. Returns false when there is nothing to undo.
    fn undo(&mut self) -> bool {
        if !self.history().can_undo() {
            return false;
        }
        let current = self.snapshot();
        match self.history_mut().undo(current) {
            Some(previous) => {
                self.restore(previous);
                true
            }
            None => false,
        }
    }

    /// Re-applies the last undone snapshot. Returns false when there is nothing to redo.
    fn redo(&mut self) -> bool {
        if !self.history().can_redo() {
            return false;
        }
        let current = self.snapshot();
        match self.history_mut().redo(current) {
            Some(next) => {
                self.restore(next);
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

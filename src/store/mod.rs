use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::model::{Bookmark, BookmarkId};
use crate::realtime::{ChangeEvent, RawChange};
use crate::search::filter_and_sort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingDelete {
    Pending,
    Committed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Added { id: BookmarkId, title: String },
    Deleted { id: BookmarkId },
}

impl Notification {
    pub fn message(&self) -> &'static str {
        match self {
            Notification::Added { .. } => "Bookmark added",
            Notification::Deleted { .. } => "Bookmark deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub kept: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Client-side view of the bookmark collection. Snapshots, realtime events and
/// local deletes all land here; none of them needs to know about the others.
///
/// Tombstones live as long as the view and grow by one id per delete seen.
/// A local delete stays in `pending` until both the backend answer and the
/// realtime delete have arrived, or until a failed delete is restored.
#[derive(Debug, Default)]
pub struct BookmarkStore {
    rows: IndexMap<BookmarkId, Arc<Bookmark>>,
    tombstones: HashSet<BookmarkId>,
    pending: HashMap<BookmarkId, PendingDelete>,
    removed: HashMap<BookmarkId, Arc<Bookmark>>,
    revision: u64,
}

impl BookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Vec<Bookmark>) -> Self {
        let mut store = Self::new();
        store.merge_snapshot(snapshot);
        store
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: BookmarkId) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn get(&self, id: BookmarkId) -> Option<&Arc<Bookmark>> {
        self.rows.get(&id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &Arc<Bookmark>> {
        self.rows.values()
    }

    pub fn is_tombstoned(&self, id: BookmarkId) -> bool {
        self.tombstones.contains(&id)
    }

    pub fn visible(&self, query: &str) -> Vec<Arc<Bookmark>> {
        filter_and_sort(self.rows.values(), query)
    }

    /// Adds snapshot rows the view does not know yet. Known rows keep their
    /// in-memory value, and nothing is ever removed here.
    pub fn merge_snapshot(&mut self, snapshot: Vec<Bookmark>) -> MergeStats {
        let mut stats = MergeStats::default();
        for bookmark in snapshot {
            if self.rows.contains_key(&bookmark.id) {
                stats.kept += 1;
                continue;
            }
            if self.tombstones.contains(&bookmark.id) {
                tracing::debug!(id = %bookmark.id, "snapshot row was deleted locally, not merging");
                stats.skipped += 1;
                continue;
            }
            self.rows.insert(bookmark.id, Arc::new(bookmark));
            stats.inserted += 1;
        }
        if stats.inserted > 0 {
            self.revision += 1;
        }
        stats
    }

    /// Merges `snapshot`, then drops rows from `baseline` it no longer
    /// contains. `baseline` must be the ids held before the snapshot was
    /// requested, so rows that arrived during the fetch are left alone.
    pub fn reconcile_snapshot(
        &mut self,
        snapshot: Vec<Bookmark>,
        baseline: &HashSet<BookmarkId>,
    ) -> MergeStats {
        let present: HashSet<BookmarkId> = snapshot.iter().map(|row| row.id).collect();
        let mut stats = self.merge_snapshot(snapshot);
        for id in baseline.difference(&present) {
            if self.remove(*id).is_some() {
                tracing::debug!(%id, "row missing from authoritative snapshot");
                stats.removed += 1;
            }
        }
        stats
    }

    pub fn ids(&self) -> HashSet<BookmarkId> {
        self.rows.keys().copied().collect()
    }

    pub fn apply_change(&mut self, change: &RawChange) -> Option<Notification> {
        match change.parse() {
            Ok(event) => self.apply_event(event),
            Err(err) => {
                tracing::warn!(error = %err, event_type = %change.event_type, "dropping malformed change event");
                None
            }
        }
    }

    pub fn apply_event(&mut self, event: ChangeEvent) -> Option<Notification> {
        match event {
            ChangeEvent::Insert(bookmark) if self.pending.contains_key(&bookmark.id) => {
                tracing::debug!(id = %bookmark.id, "insert for locally deleted row stays hidden");
                if let Some(row) = self.removed.get_mut(&bookmark.id) {
                    *row = Arc::new(bookmark);
                }
                None
            }
            ChangeEvent::Insert(bookmark) => {
                let notification = Notification::Added {
                    id: bookmark.id,
                    title: bookmark.title.clone(),
                };
                self.upsert(bookmark);
                Some(notification)
            }
            ChangeEvent::Delete { id } => {
                self.remove(id);
                match self.pending.get(&id).cloned() {
                    Some(PendingDelete::Pending) => {
                        tracing::debug!(%id, "realtime delete confirms local delete");
                        self.pending.insert(id, PendingDelete::Committed);
                        self.removed.remove(&id);
                    }
                    Some(_) => {
                        self.pending.remove(&id);
                        self.removed.remove(&id);
                    }
                    None => {}
                }
                Some(Notification::Deleted { id })
            }
            ChangeEvent::Ignored(kind) => {
                tracing::trace!(%kind, "ignoring change event");
                None
            }
        }
    }

    pub fn begin_delete(&mut self, id: BookmarkId) -> bool {
        let already_deleted = self.tombstones.contains(&id) && !self.pending.contains_key(&id);
        let removed = self.remove(id);
        let was_visible = removed.is_some();
        if let Some(row) = removed {
            self.removed.insert(id, row);
        }
        let state = if already_deleted && !was_visible {
            PendingDelete::Committed
        } else {
            PendingDelete::Pending
        };
        self.pending.insert(id, state);
        was_visible
    }

    /// Records the backend's answer for a delete started with `begin_delete`.
    /// A failure leaves the row removed; see `restore_failed_delete`.
    pub fn finish_delete(&mut self, id: BookmarkId, outcome: Result<(), String>) {
        let next = match (self.pending.get(&id), outcome) {
            (None, _) => {
                tracing::debug!(%id, "delete outcome for unknown mutation");
                return;
            }
            (Some(PendingDelete::Committed), _) => {
                tracing::debug!(%id, "delete already confirmed by realtime feed");
                None
            }
            (Some(_), Ok(())) => {
                self.removed.remove(&id);
                Some(PendingDelete::Committed)
            }
            (Some(_), Err(reason)) => {
                tracing::warn!(%id, %reason, "backend delete failed, row stays hidden");
                Some(PendingDelete::Failed { reason })
            }
        };
        match next {
            Some(state) => {
                self.pending.insert(id, state);
            }
            None => {
                self.pending.remove(&id);
                self.removed.remove(&id);
            }
        }
    }

    pub fn pending_delete(&self, id: BookmarkId) -> Option<&PendingDelete> {
        self.pending.get(&id)
    }

    pub fn failed_deletes(&self) -> Vec<(BookmarkId, &str)> {
        self.pending
            .iter()
            .filter_map(|(id, state)| match state {
                PendingDelete::Failed { reason } => Some((*id, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn restore_failed_delete(&mut self, id: BookmarkId) -> bool {
        if !matches!(self.pending.get(&id), Some(PendingDelete::Failed { .. })) {
            return false;
        }
        self.pending.remove(&id);
        self.tombstones.remove(&id);
        match self.removed.remove(&id) {
            Some(row) => {
                self.rows.insert(id, row);
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    fn upsert(&mut self, bookmark: Bookmark) {
        if self.tombstones.remove(&bookmark.id) {
            tracing::debug!(id = %bookmark.id, "realtime insert revives tombstoned id");
        }
        match self.rows.get_mut(&bookmark.id) {
            Some(existing) if **existing == bookmark => {}
            Some(existing) => {
                *existing = Arc::new(bookmark);
                self.revision += 1;
            }
            None => {
                self.rows.insert(bookmark.id, Arc::new(bookmark));
                self.revision += 1;
            }
        }
    }

    fn remove(&mut self, id: BookmarkId) -> Option<Arc<Bookmark>> {
        self.tombstones.insert(id);
        let removed = self.rows.shift_remove(&id);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }
}

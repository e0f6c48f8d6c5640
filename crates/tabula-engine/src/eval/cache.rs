use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};

use crate::value::Value;

/// Identity of a cell across collaborating workbooks:
/// `(workbook, sheet, row, column)`, all 0-indexed. The workbook index
/// discriminates entries when several evaluators share one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellLoc {
    pub book: u32,
    pub sheet: u32,
    pub row: u32,
    pub col: u32,
}

/// Stable id of a cache entry. Dependency edges are stored as pairs of
/// ids in adjacency sets, never as pointers, so invalidation stays safe
/// under entry deletion.
pub type EntryId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Value of a non-formula cell, created on first read. Destroyed when
    /// the cell is updated or deleted.
    Plain,
    /// Result of a formula cell. `value == None` marks a cleared (or
    /// never-computed) result; the entry itself persists until the cell
    /// is deleted.
    Formula,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub loc: CellLoc,
    pub kind: EntryKind,
    pub value: Option<Value>,
    /// Entries this formula read while computing its value.
    pub inputs: AHashSet<EntryId>,
    /// Formula entries whose cached value depends on this entry.
    pub consumers: AHashSet<EntryId>,
    /// Set when the last evaluation read a volatile or indeterminate
    /// input; such entries keep recording dependencies even for cells a
    /// stability classifier declared final.
    pub input_sensitive: bool,
}

impl CacheEntry {
    fn new(loc: CellLoc, kind: EntryKind) -> Self {
        Self {
            loc,
            kind,
            value: None,
            inputs: AHashSet::new(),
            consumers: AHashSet::new(),
            input_sensitive: false,
        }
    }
}

/// The shared evaluation cache: one entry per cell identity, holding
/// either a plain value or a formula result plus the dependency graph
/// between them.
#[derive(Debug, Default)]
pub struct EvaluationCache {
    entries: AHashMap<EntryId, CacheEntry>,
    by_loc: AHashMap<CellLoc, EntryId>,
    next_id: EntryId,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, id: EntryId) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    pub fn entry_at(&self, loc: CellLoc) -> Option<(EntryId, &CacheEntry)> {
        let id = *self.by_loc.get(&loc)?;
        Some((id, self.entries.get(&id)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn alloc(&mut self, loc: CellLoc, kind: EntryKind) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, CacheEntry::new(loc, kind));
        self.by_loc.insert(loc, id);
        id
    }

    /// Find or create the formula entry for `loc`.
    ///
    /// A plain entry at the same location means the cell changed type
    /// without a notification; it is invalidated and replaced.
    pub fn get_or_create_formula_entry(&mut self, loc: CellLoc) -> EntryId {
        if let Some(&id) = self.by_loc.get(&loc) {
            let kind = self.entries[&id].kind;
            match kind {
                EntryKind::Formula => return id,
                EntryKind::Plain => {
                    self.clear_consumers_transitively(id);
                    self.remove_entry(id);
                }
            }
        }
        self.alloc(loc, EntryKind::Formula)
    }

    /// Find or create the plain-value entry for `loc`, refreshing its
    /// stored value. Returns the entry id for dependency recording.
    pub fn update_plain_value(&mut self, loc: CellLoc, value: &Value) -> EntryId {
        if let Some(&id) = self.by_loc.get(&loc) {
            if self.entries[&id].kind == EntryKind::Plain {
                let entry = self.entries.get_mut(&id).expect("entry exists");
                if entry.value.as_ref() != Some(value) {
                    entry.value = Some(value.clone());
                    self.clear_consumers_transitively(id);
                }
                return id;
            }
            // The cell stopped being a formula without a notification.
            self.clear_consumers_transitively(id);
            self.remove_entry(id);
        }
        let id = self.alloc(loc, EntryKind::Plain);
        self.entries
            .get_mut(&id)
            .expect("entry just created")
            .value = Some(value.clone());
        id
    }

    /// Commit a formula result: store the value, replace the entry's
    /// input edges, and keep the reverse edges consistent.
    pub fn commit_formula_result(
        &mut self,
        id: EntryId,
        value: Value,
        inputs: AHashSet<EntryId>,
        input_sensitive: bool,
    ) {
        self.disconnect_inputs(id);
        for &input in &inputs {
            if let Some(entry) = self.entries.get_mut(&input) {
                entry.consumers.insert(id);
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            debug_assert_eq!(entry.kind, EntryKind::Formula);
            entry.value = Some(value);
            entry.inputs = inputs;
            entry.input_sensitive = input_sensitive;
        }
    }

    /// The cell's plain value or formula definition changed: drop its
    /// cached state and clear every transitive consumer.
    pub fn notify_update_cell(&mut self, loc: CellLoc) {
        let Some(&id) = self.by_loc.get(&loc) else {
            return;
        };
        self.clear_consumers_transitively(id);
        let kind = self.entries[&id].kind;
        match kind {
            EntryKind::Plain => self.remove_entry(id),
            EntryKind::Formula => {
                self.disconnect_inputs(id);
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.value = None;
                }
            }
        }
    }

    /// The cell was deleted: like an update, but the entry itself is
    /// removed as well.
    pub fn notify_delete_cell(&mut self, loc: CellLoc) {
        let Some(&id) = self.by_loc.get(&loc) else {
            return;
        };
        self.clear_consumers_transitively(id);
        self.remove_entry(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_loc.clear();
    }

    /// Clear the cached value of every formula entry transitively
    /// reachable from `start` through consumer edges. Worklist with a
    /// visited set; each entry is enqueued at most once.
    fn clear_consumers_transitively(&mut self, start: EntryId) {
        let mut queue: VecDeque<EntryId> = VecDeque::new();
        let mut visited: AHashSet<EntryId> = AHashSet::new();
        if let Some(entry) = self.entries.get(&start) {
            queue.extend(entry.consumers.iter().copied());
        }
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.value = None;
                queue.extend(entry.consumers.iter().copied());
            }
        }
    }

    /// Remove `id`'s outgoing input edges (and their reverse edges).
    fn disconnect_inputs(&mut self, id: EntryId) {
        let inputs = match self.entries.get_mut(&id) {
            Some(entry) => std::mem::take(&mut entry.inputs),
            None => return,
        };
        for input in inputs {
            if let Some(entry) = self.entries.get_mut(&input) {
                entry.consumers.remove(&id);
            }
        }
    }

    fn remove_entry(&mut self, id: EntryId) {
        self.disconnect_inputs(id);
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.by_loc.remove(&entry.loc);
        for consumer in entry.consumers {
            if let Some(c) = self.entries.get_mut(&consumer) {
                c.inputs.remove(&id);
            }
        }
    }

    /// Check the bidirectional-edge and committed-value invariants. Test
    /// support; O(edges).
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (&id, entry) in &self.entries {
            for input in &entry.inputs {
                let other = self.entries.get(input).expect("input edge to live entry");
                assert!(
                    other.consumers.contains(&id),
                    "input edge {input}->{id} missing reverse consumer edge"
                );
            }
            for consumer in &entry.consumers {
                let other = self
                    .entries
                    .get(consumer)
                    .expect("consumer edge to live entry");
                assert!(
                    other.inputs.contains(&id),
                    "consumer edge {id}->{consumer} missing reverse input edge"
                );
            }
            if entry.kind == EntryKind::Formula && entry.value.is_some() {
                for input in &entry.inputs {
                    assert!(
                        self.entries[input].value.is_some(),
                        "committed entry {id} has uncommitted input {input}"
                    );
                }
            }
        }
    }
}

//! Per-link frame index → box cache

use std::collections::BTreeMap;

use crate::capture::BoundingBox;

/// Results a tracker produced, keyed by the frame index they were dispatched
/// for. Holds at most `window` entries; the lowest index goes first.
#[derive(Debug)]
pub struct ResultCache {
    entries: BTreeMap<u64, Option<BoundingBox>>,
    window: usize,
}

impl ResultCache {
    pub fn new(window: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            window: window.max(1),
        }
    }

    /// Record the reply for `index`; `None` means the tracker answered with
    /// no box
    pub fn insert(&mut self, index: u64, bbox: Option<BoundingBox>) {
        self.entries.insert(index, bbox);
        while self.entries.len() > self.window {
            self.entries.pop_first();
        }
    }

    /// Box for `index`, or `None` if there is no box (unanswered or empty)
    pub fn get(&self, index: u64) -> Option<BoundingBox> {
        self.entries.get(&index).copied().flatten()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

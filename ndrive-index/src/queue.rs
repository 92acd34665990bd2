//! The seam between the store and whatever drains pending pairs.

use crate::pair::{DocPair, PairState};

/// A reference to a pair waiting for a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub id: i64,
    pub folderish: bool,
    pub pair_state: PairState,
}

impl QueueItem {
    pub fn new(id: i64, folderish: bool, pair_state: PairState) -> Self {
        Self {
            id,
            folderish,
            pair_state,
        }
    }
}

impl From<&DocPair> for QueueItem {
    fn from(pair: &DocPair) -> Self {
        Self::new(pair.id, pair.folderish, pair.pair_state)
    }
}

/// Receives the pairs the store decides need work.
pub trait PairQueue: Send + Sync {
    fn push(&self, item: QueueItem);

    /// A pair entered the conflicted state.
    fn new_conflict(&self, _id: i64) {}

    /// Ask processors working under `path` to give up their pair.
    fn interrupt_processors_on(&self, _path: &str, _exact_match: bool) {}
}

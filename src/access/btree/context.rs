//! Per-operation scratch state.
//!
//! A context lives for exactly one index operation and is owned by the thread
//! running it. It remembers the page versions seen on the way down, the tree
//! lock and pins an in-flight structure modification holds, and how often the
//! operation has restarted.

use crate::access::btree::error::{IndexError, IndexResult};
use crate::access::comparator::MultiComparator;
use crate::access::tuple::Tuple;
use crate::storage::buffer::PinnedPage;
use crate::storage::page::PageId;
use log::{trace, warn};
use parking_lot::{ArcMutexGuard, RawMutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Insert,
    Update,
    Delete,
    Upsert,
    Search,
}

/// Boundary produced by a page split: `left` keeps keys up to and including
/// `separator`, `right` holds the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitKey {
    pub separator: Tuple,
    pub left: PageId,
    pub right: PageId,
}

/// Change a child reports to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureChange {
    Split(SplitKey),
    /// The child lost its last entry and was retired.
    Emptied(PageId),
}

/// Outcome of one step of a descent.
#[derive(Debug)]
pub enum Descent {
    Completed(Option<StructureChange>),
    /// The path is stale; resume from the lowest ancestor that is unchanged.
    Restart,
}

#[derive(Debug, Clone, Copy)]
pub struct TrailEntry {
    pub page_id: PageId,
    pub version: u32,
}

pub struct OperationContext<'a> {
    pub op: IndexOp,
    pub cmp: &'a MultiComparator,
    trail: Vec<TrailEntry>,
    smo_guard: Option<ArcMutexGuard<RawMutex, ()>>,
    /// Pins of the validated ancestors, indexed by depth.
    ancestors: Vec<Option<PinnedPage>>,
    /// Pages allocated up front for the structure modification.
    reserved: Vec<PinnedPage>,
    /// Pages whose SMO flag is set and must be cleared at the end.
    flagged: Vec<PinnedPage>,
    /// Pages unlinked from the tree, released once the operation is done.
    retired: Vec<PageId>,
    restarts: u32,
    max_restarts: u32,
}

impl<'a> OperationContext<'a> {
    pub fn new(op: IndexOp, cmp: &'a MultiComparator, max_restarts: u32) -> Self {
        Self {
            op,
            cmp,
            trail: Vec::new(),
            smo_guard: None,
            ancestors: Vec::new(),
            reserved: Vec::new(),
            flagged: Vec::new(),
            retired: Vec::new(),
            restarts: 0,
            max_restarts,
        }
    }

    /// Records the version of the page latched at `depth`, forgetting
    /// anything recorded deeper.
    pub fn record(&mut self, depth: usize, page_id: PageId, version: u32) {
        self.trail.truncate(depth);
        self.trail.push(TrailEntry { page_id, version });
    }

    /// Forgets the versions recorded at `depth` and below, so a resuming
    /// descent treats those pages as unseen.
    pub fn truncate_trail(&mut self, depth: usize) {
        self.trail.truncate(depth);
    }

    pub fn trail(&self) -> &[TrailEntry] {
        &self.trail
    }

    pub fn trail_version(&self, depth: usize) -> Option<u32> {
        self.trail.get(depth).map(|entry| entry.version)
    }

    pub fn count_restart(&mut self) -> IndexResult<()> {
        self.restarts += 1;
        trace!("{:?} restart #{}", self.op, self.restarts);
        if self.restarts > self.max_restarts {
            warn!(
                "{:?} gave up after {} restarts",
                self.op, self.max_restarts
            );
            return Err(IndexError::RestartsExhausted {
                restarts: self.max_restarts,
            });
        }
        Ok(())
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn holds_smo_lock(&self) -> bool {
        self.smo_guard.is_some()
    }

    pub fn set_smo_guard(&mut self, guard: ArcMutexGuard<RawMutex, ()>) {
        self.smo_guard = Some(guard);
    }

    pub fn release_smo_lock(&mut self) {
        self.smo_guard = None;
    }

    pub fn set_ancestors(&mut self, pins: Vec<PinnedPage>) {
        self.ancestors = pins.into_iter().map(Some).collect();
    }

    pub fn take_ancestor(&mut self, depth: usize) -> IndexResult<PinnedPage> {
        self.ancestors
            .get_mut(depth)
            .and_then(Option::take)
            .ok_or_else(|| {
                IndexError::InvalidOperation(format!(
                    "no validated ancestor at depth {} for the structure modification",
                    depth
                ))
            })
    }

    pub fn add_reserved(&mut self, pin: PinnedPage) {
        self.reserved.push(pin);
    }

    pub fn take_reserved(&mut self) -> IndexResult<PinnedPage> {
        self.reserved.pop().ok_or_else(|| {
            IndexError::InvalidOperation("structure modification ran out of reserved pages".into())
        })
    }

    pub fn drain_reserved(&mut self) -> Vec<PinnedPage> {
        std::mem::take(&mut self.reserved)
    }

    pub fn add_flagged(&mut self, pin: PinnedPage) {
        self.flagged.push(pin);
    }

    pub fn drain_flagged(&mut self) -> Vec<PinnedPage> {
        std::mem::take(&mut self.flagged)
    }

    pub fn retire(&mut self, page_id: PageId) {
        self.retired.push(page_id);
    }

    pub fn drain_retired(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.retired)
    }

    /// Drops the ancestor pins of an abandoned structure modification.
    pub fn clear_ancestors(&mut self) {
        self.ancestors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::FieldType;

    #[test]
    fn test_trail_truncates_deeper_levels() {
        let cmp = MultiComparator::new(&[FieldType::Int32]);
        let mut ctx = OperationContext::new(IndexOp::Insert, &cmp, 10);
        ctx.record(0, PageId(1), 5);
        ctx.record(1, PageId(7), 2);
        ctx.record(2, PageId(9), 0);
        ctx.record(1, PageId(8), 3);

        assert_eq!(ctx.trail().len(), 2);
        assert_eq!(ctx.trail()[1].page_id, PageId(8));
        assert_eq!(ctx.trail_version(1), Some(3));
        assert_eq!(ctx.trail_version(2), None);

        ctx.truncate_trail(0);
        assert_eq!(ctx.trail_version(0), None);
        assert!(ctx.trail().is_empty());
    }

    #[test]
    fn test_restarts_are_bounded() {
        let cmp = MultiComparator::new(&[FieldType::Int32]);
        let mut ctx = OperationContext::new(IndexOp::Delete, &cmp, 2);
        assert!(ctx.count_restart().is_ok());
        assert!(ctx.count_restart().is_ok());
        let err = ctx.count_restart().unwrap_err();
        assert!(matches!(err, IndexError::RestartsExhausted { restarts: 2 }));
        assert_eq!(ctx.restarts(), 3);
    }

    #[test]
    fn test_missing_reservation_is_an_error() {
        let cmp = MultiComparator::new(&[FieldType::Int32]);
        let mut ctx = OperationContext::new(IndexOp::Insert, &cmp, 2);
        assert!(ctx.take_reserved().is_err());
        assert!(ctx.take_ancestor(0).is_err());
        assert!(!ctx.holds_smo_lock());
    }
}

//! Range and disk-order scans.
//!
//! A range cursor keeps exactly one leaf read-latched between calls. Moving
//! right it latches the next leaf before letting go of the current one.
//! Moving left it may only try the previous leaf's latch; when that fails it
//! lets go, waits for the previous leaf, and re-checks that the two are still
//! neighbours. If they are not, it searches again from the root for the keys
//! below the leaf it just finished.

use crate::access::btree::context::{IndexOp, OperationContext};
use crate::access::btree::error::IndexResult;
use crate::access::btree::BTree;
use crate::access::comparator::MultiComparator;
use crate::access::tuple::{Tuple, TupleRef};
use crate::storage::buffer::PageReadGuard;
use crate::storage::page::btree_page::BTreePage;
use crate::storage::page::slot::{FindMode, NoMatchPolicy, SlotProbe};
use crate::storage::page::{PageId, ROOT_PAGE_ID};
use std::cmp::Ordering;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Forward,
    Backward,
}

/// Key range of a scan. Bounds may be key prefixes; an absent bound leaves
/// that side open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangePredicate {
    pub low: Option<Tuple>,
    pub low_inclusive: bool,
    pub high: Option<Tuple>,
    pub high_inclusive: bool,
    pub direction: ScanDirection,
}

impl RangePredicate {
    /// Every tuple, in key order.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(
        low: Option<Tuple>,
        low_inclusive: bool,
        high: Option<Tuple>,
        high_inclusive: bool,
    ) -> Self {
        Self {
            low,
            low_inclusive,
            high,
            high_inclusive,
            direction: ScanDirection::Forward,
        }
    }

    /// All tuples whose key equals `key` (or starts with it, for a prefix).
    pub fn prefix(key: Tuple) -> Self {
        Self::new(Some(key.clone()), true, Some(key), true)
    }

    pub fn with_low(mut self, key: Tuple, inclusive: bool) -> Self {
        self.low = Some(key);
        self.low_inclusive = inclusive;
        self
    }

    pub fn with_high(mut self, key: Tuple, inclusive: bool) -> Self {
        self.high = Some(key);
        self.high_inclusive = inclusive;
        self
    }

    pub fn backward(mut self) -> Self {
        self.direction = ScanDirection::Backward;
        self
    }

    /// Where a candidate falls relative to the range, seen in scan order.
    fn classify(&self, tuple: &TupleRef<'_>, cmp: &MultiComparator) -> Placement {
        let below_low = self.low.as_ref().is_some_and(|low| {
            match cmp.compare(tuple, &low.view()) {
                Ordering::Less => true,
                Ordering::Equal => !self.low_inclusive,
                Ordering::Greater => false,
            }
        });
        let above_high = self.high.as_ref().is_some_and(|high| {
            match cmp.compare(tuple, &high.view()) {
                Ordering::Greater => true,
                Ordering::Equal => !self.high_inclusive,
                Ordering::Less => false,
            }
        });

        match self.direction {
            ScanDirection::Forward if below_low => Placement::Before,
            ScanDirection::Forward if above_high => Placement::Past,
            ScanDirection::Backward if above_high => Placement::Before,
            ScanDirection::Backward if below_low => Placement::Past,
            _ => Placement::Within,
        }
    }

    /// Where the scan enters the tree.
    fn start(&self) -> (Option<Tuple>, StartKind) {
        match self.direction {
            ScanDirection::Forward => match &self.low {
                Some(low) if self.low_inclusive => (Some(low.clone()), StartKind::AtLeast),
                Some(low) => (Some(low.clone()), StartKind::Above),
                None => (None, StartKind::First),
            },
            ScanDirection::Backward => match &self.high {
                Some(high) if self.high_inclusive => (Some(high.clone()), StartKind::AtMost),
                Some(high) => (Some(high.clone()), StartKind::Below),
                None => (None, StartKind::Last),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Not reached yet; skip it.
    Before,
    Within,
    /// Beyond the far bound; the scan is over.
    Past,
}

#[derive(Debug, Clone, Copy)]
enum StartKind {
    First,
    Last,
    AtLeast,
    Above,
    AtMost,
    Below,
}

/// Where a search should land.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SeekTarget<'k> {
    First,
    Last,
    /// First tuple `>= key`.
    AtLeast(TupleRef<'k>),
    /// First tuple `> key`.
    Above(TupleRef<'k>),
    /// Last tuple `<= key`.
    AtMost(TupleRef<'k>),
    /// Last tuple `< key`.
    Below(TupleRef<'k>),
}

impl<'k> SeekTarget<'k> {
    fn from_start(kind: StartKind, key: Option<&'k Tuple>) -> Self {
        match (kind, key) {
            (StartKind::AtLeast, Some(key)) => SeekTarget::AtLeast(key.view()),
            (StartKind::Above, Some(key)) => SeekTarget::Above(key.view()),
            (StartKind::AtMost, Some(key)) => SeekTarget::AtMost(key.view()),
            (StartKind::Below, Some(key)) => SeekTarget::Below(key.view()),
            (StartKind::Last, _) => SeekTarget::Last,
            _ => SeekTarget::First,
        }
    }

    /// Child of an interior page to follow.
    pub(crate) fn child_index<B: AsRef<[u8]>>(
        &self,
        page: &BTreePage<B>,
        cmp: &MultiComparator,
    ) -> usize {
        match self {
            SeekTarget::First => 0,
            SeekTarget::Last => page.tuple_count(),
            SeekTarget::AtLeast(key) | SeekTarget::Below(key) => page.child_index(key, cmp),
            SeekTarget::Above(key) => {
                match page.find_tuple_index(key, cmp, FindMode::Insensitive, NoMatchPolicy::LowerKey)
                {
                    SlotProbe::Index(i) => i + 1,
                    _ => 0,
                }
            }
            SeekTarget::AtMost(key) => {
                match page.find_tuple_index(key, cmp, FindMode::Insensitive, NoMatchPolicy::LowerKey)
                {
                    // A full key equal to the separator ends in that child.
                    SlotProbe::Index(i)
                        if key.field_count() >= cmp.key_field_count()
                            && cmp.compare(key, &page.tuple(i)) == Ordering::Equal =>
                    {
                        i
                    }
                    SlotProbe::Index(i) => i + 1,
                    _ => 0,
                }
            }
        }
    }

    /// First slot to look at in the leaf; may be outside the page, in which
    /// case the scan moves on to the neighbour.
    fn leaf_position<B: AsRef<[u8]>>(&self, page: &BTreePage<B>, cmp: &MultiComparator) -> isize {
        let count = page.tuple_count() as isize;
        let probe = |key: &TupleRef<'_>, policy| {
            page.find_tuple_index(key, cmp, FindMode::Insensitive, policy)
        };
        match self {
            SeekTarget::First => 0,
            SeekTarget::Last => count - 1,
            SeekTarget::AtLeast(key) => match probe(key, NoMatchPolicy::HigherKey) {
                SlotProbe::Index(i) => i as isize,
                _ => count,
            },
            SeekTarget::Above(key) => match probe(key, NoMatchPolicy::LowerKey) {
                SlotProbe::Index(i) => i as isize + 1,
                _ => 0,
            },
            SeekTarget::AtMost(key) => match probe(key, NoMatchPolicy::LowerKey) {
                SlotProbe::Index(i) => i as isize,
                _ => -1,
            },
            SeekTarget::Below(key) => match probe(key, NoMatchPolicy::HigherKey) {
                SlotProbe::Index(i) => i as isize - 1,
                _ => count - 1,
            },
        }
    }
}

enum Step {
    Emit(Tuple),
    Skip,
    Stop,
    NextLeaf,
}

/// Ordered scan over a key range. Created unopened by the accessor and
/// positioned by `BTreeAccessor::search`; can be reopened with another range.
pub struct RangeCursor<'t> {
    tree: &'t BTree,
    predicate: RangePredicate,
    leaf: Option<PageReadGuard>,
    position: isize,
    pending: Option<Tuple>,
    exhausted: bool,
}

impl<'t> RangeCursor<'t> {
    pub(crate) fn new(tree: &'t BTree) -> Self {
        Self {
            tree,
            predicate: RangePredicate::default(),
            leaf: None,
            position: 0,
            pending: None,
            exhausted: true,
        }
    }

    /// Positions the cursor at the start of `predicate`, dropping whatever it
    /// pointed at before.
    pub(crate) fn open(&mut self, predicate: RangePredicate) -> IndexResult<()> {
        self.close();
        for bound in [&predicate.low, &predicate.high].into_iter().flatten() {
            self.tree.check_bound(bound)?;
        }

        let (key, kind) = predicate.start();
        self.predicate = predicate;
        self.exhausted = false;
        if let Err(err) = self.seek(&SeekTarget::from_start(kind, key.as_ref())) {
            self.close();
            return Err(err);
        }
        Ok(())
    }

    fn seek(&mut self, target: &SeekTarget<'_>) -> IndexResult<()> {
        let mut ctx = OperationContext::new(
            IndexOp::Search,
            self.tree.comparator(),
            self.tree.config().max_restarts,
        );
        let leaf = self.tree.find_leaf(&mut ctx, target)?;
        self.position = target.leaf_position(&BTreePage::new(&leaf[..]), self.tree.comparator());
        self.leaf = Some(leaf);
        Ok(())
    }

    pub fn has_next(&mut self) -> IndexResult<bool> {
        if self.pending.is_none() && !self.exhausted {
            match self.advance() {
                Ok(Some(tuple)) => self.pending = Some(tuple),
                Ok(None) => self.finish(),
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            }
        }
        Ok(self.pending.is_some())
    }

    pub fn get_next(&mut self) -> IndexResult<Option<Tuple>> {
        self.has_next()?;
        Ok(self.pending.take())
    }

    /// Releases the current leaf. Safe to call more than once.
    pub fn close(&mut self) {
        self.pending = None;
        self.finish();
    }

    fn finish(&mut self) {
        self.leaf = None;
        self.exhausted = true;
    }

    fn advance(&mut self) -> IndexResult<Option<Tuple>> {
        loop {
            let step = {
                let Some(leaf) = self.leaf.as_ref() else {
                    return Ok(None);
                };
                let page = BTreePage::new(&leaf[..]);
                if (0..page.tuple_count() as isize).contains(&self.position) {
                    let tuple = page.tuple(self.position as usize);
                    match self.predicate.classify(&tuple, self.tree.comparator()) {
                        Placement::Before => Step::Skip,
                        Placement::Within => Step::Emit(tuple.to_tuple()),
                        Placement::Past => Step::Stop,
                    }
                } else {
                    Step::NextLeaf
                }
            };

            match step {
                Step::Emit(tuple) => {
                    self.step_position();
                    return Ok(Some(tuple));
                }
                Step::Skip => self.step_position(),
                Step::Stop => return Ok(None),
                Step::NextLeaf => match self.predicate.direction {
                    ScanDirection::Forward => self.step_right()?,
                    ScanDirection::Backward => self.step_left()?,
                },
            }
        }
    }

    fn step_position(&mut self) {
        match self.predicate.direction {
            ScanDirection::Forward => self.position += 1,
            ScanDirection::Backward => self.position -= 1,
        }
    }

    fn step_right(&mut self) -> IndexResult<()> {
        let Some(current) = self.leaf.take() else {
            return Ok(());
        };
        let Some(next_id) = BTreePage::new(&current[..]).next_leaf() else {
            return Ok(());
        };
        let next = self.tree.pin(next_id)?.read();
        drop(current);
        self.leaf = Some(next);
        self.position = 0;
        Ok(())
    }

    fn step_left(&mut self) -> IndexResult<()> {
        let Some(current) = self.leaf.take() else {
            return Ok(());
        };
        let current_id = current.page_id();
        let (prev_id, first_key) = {
            let page = BTreePage::new(&current[..]);
            let first_key = (page.tuple_count() > 0)
                .then(|| page.tuple(0).prefix(self.tree.comparator().key_field_count()));
            (page.prev_leaf(), first_key)
        };
        let Some(prev_id) = prev_id else {
            return Ok(());
        };

        let prev = match self.tree.pin(prev_id)?.try_read() {
            Ok(prev) => prev,
            Err(pinned) => {
                drop(current);
                let prev = pinned.read();
                let still_linked = {
                    let page = BTreePage::new(&prev[..]);
                    page.is_leaf() && !page.is_free() && page.next_leaf() == Some(current_id)
                };
                if !still_linked {
                    drop(prev);
                    return match first_key {
                        Some(key) => self.seek(&SeekTarget::Below(key.view())),
                        None => Ok(()),
                    };
                }
                prev
            }
        };
        self.position = BTreePage::new(&prev[..]).tuple_count() as isize - 1;
        self.leaf = Some(prev);
        Ok(())
    }
}

impl Iterator for RangeCursor<'_> {
    type Item = IndexResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

/// Visits live leaf tuples in page id order rather than key order. Pages are
/// latched one at a time, so a scan running next to writers is not a
/// snapshot.
pub struct DiskOrderScanCursor<'t> {
    tree: &'t BTree,
    next_page: u32,
    last_page: u32,
    buffered: VecDeque<Tuple>,
}

impl<'t> DiskOrderScanCursor<'t> {
    pub(crate) fn new(tree: &'t BTree) -> Self {
        Self {
            tree,
            next_page: ROOT_PAGE_ID.0,
            last_page: tree.max_page().0,
            buffered: VecDeque::new(),
        }
    }

    fn load_page(&mut self, page_id: PageId) -> IndexResult<()> {
        let Some(pinned) = self.tree.pin_existing(page_id)? else {
            return Ok(());
        };
        let guard = pinned.read();
        let page = BTreePage::new(&guard[..]);
        if page.is_leaf() && !page.is_free() {
            self.buffered
                .extend((0..page.tuple_count()).map(|i| page.tuple(i).to_tuple()));
        }
        Ok(())
    }
}

impl Iterator for DiskOrderScanCursor<'_> {
    type Item = IndexResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tuple) = self.buffered.pop_front() {
                return Some(Ok(tuple));
            }
            if self.next_page > self.last_page {
                return None;
            }
            let page_id = PageId(self.next_page);
            self.next_page += 1;
            if let Err(err) = self.load_page(page_id) {
                self.next_page = self.last_page + 1;
                return Some(Err(err));
            }
        }
    }
}

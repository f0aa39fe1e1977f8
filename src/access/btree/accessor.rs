use crate::access::btree::context::IndexOp;
use crate::access::btree::cursor::{DiskOrderScanCursor, RangeCursor, RangePredicate};
use crate::access::btree::error::IndexResult;
use crate::access::btree::BTree;
use crate::access::tuple::Tuple;

/// Handle for running operations against a tree. Accessors are cheap; each
/// thread creates its own.
#[derive(Clone, Copy)]
pub struct BTreeAccessor<'t> {
    tree: &'t BTree,
}

impl<'t> BTreeAccessor<'t> {
    pub(crate) fn new(tree: &'t BTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &'t BTree {
        self.tree
    }

    /// Fails with `DuplicateKey` if a tuple with the same key exists.
    pub fn insert(&self, tuple: &Tuple) -> IndexResult<()> {
        self.tree.modify(IndexOp::Insert, tuple)
    }

    /// Replaces the tuple with the same key. Fails with `NonexistentKey` if
    /// there is none.
    pub fn update(&self, tuple: &Tuple) -> IndexResult<()> {
        self.tree.modify(IndexOp::Update, tuple)
    }

    /// Removes the tuple whose key is `key`. Fields past the key are ignored.
    pub fn delete(&self, key: &Tuple) -> IndexResult<()> {
        self.tree.modify(IndexOp::Delete, key)
    }

    /// Updates the tuple with the same key, or inserts it if there is none.
    pub fn upsert(&self, tuple: &Tuple) -> IndexResult<()> {
        self.tree.modify(IndexOp::Upsert, tuple)
    }

    pub fn point_search(&self, key: &Tuple) -> IndexResult<Option<Tuple>> {
        self.tree.point_search(key)
    }

    /// An unopened cursor; position it with [`Self::search`].
    pub fn create_cursor(&self) -> RangeCursor<'t> {
        RangeCursor::new(self.tree)
    }

    /// Opens `cursor` on `predicate`, closing whatever scan it ran before.
    pub fn search(&self, cursor: &mut RangeCursor<'t>, predicate: RangePredicate) -> IndexResult<()> {
        cursor.open(predicate)
    }

    /// Shorthand for a fresh cursor opened on `predicate`.
    pub fn range(&self, predicate: RangePredicate) -> IndexResult<RangeCursor<'t>> {
        let mut cursor = self.create_cursor();
        cursor.open(predicate)?;
        Ok(cursor)
    }

    pub fn disk_order_scan(&self) -> DiskOrderScanCursor<'t> {
        DiskOrderScanCursor::new(self.tree)
    }
}

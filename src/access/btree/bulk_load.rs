//! Bottom-up construction of a tree from sorted input.
//!
//! The loader keeps one open page per level, the right edge of the tree
//! being built. Tuples are appended to the leaf at the edge; when it reaches
//! the fill budget a new leaf is started and a separator goes up to the edge
//! of the level above, which may in turn start a new page. When the input
//! ends, the topmost page is copied into the fixed root.

use crate::access::btree::context::IndexOp;
use crate::access::btree::error::{IndexError, IndexResult};
use crate::access::btree::BTree;
use crate::access::tuple::Tuple;
use crate::storage::buffer::PageWriteGuard;
use crate::storage::page::btree_page::{interior_entry, BTreePage, SpaceStatus};
use crate::storage::page::slot::SLOT_SIZE;
use crate::storage::page::{PageId, ROOT_PAGE_ID};
use log::{debug, info, warn};
use std::cmp::Ordering;

pub struct BulkLoader<'t> {
    tree: &'t BTree,
    /// Fill budget per page in bytes, header included.
    budget: usize,
    /// Right edge of every level built so far; index 0 is the leaf level.
    edges: Vec<PageWriteGuard>,
    /// Every page taken from the free pool, released again if the load is
    /// abandoned.
    allocated: Vec<PageId>,
    last_key: Option<Tuple>,
    tuple_count: u64,
    finished: bool,
}

impl<'t> BulkLoader<'t> {
    pub(crate) fn new(tree: &'t BTree, budget: usize) -> IndexResult<Self> {
        let mut loader = Self {
            tree,
            budget,
            edges: Vec::new(),
            allocated: Vec::new(),
            last_key: None,
            tuple_count: 0,
            finished: false,
        };
        // On failure the loader is dropped, which ends the bulk load.
        let leaf = loader.start_page(0)?;
        loader.edges.push(leaf);
        Ok(loader)
    }

    fn start_page(&mut self, level: u8) -> IndexResult<PageWriteGuard> {
        let mut guard = self.tree.allocate_page()?.write();
        self.allocated.push(guard.page_id());
        let mut page = BTreePage::new(&mut guard[..]);
        page.init(level);
        page.bump_version();
        Ok(guard)
    }

    /// Whether appending `entry_len` more bytes would overfill the page.
    fn is_full(&self, level: usize, entry_len: usize) -> bool {
        let page = BTreePage::new(&self.edges[level][..]);
        page.tuple_count() > 0
            && (page.used_space() + entry_len + SLOT_SIZE > self.budget
                || page.space_for(entry_len) == SpaceStatus::Insufficient)
    }

    /// Appends the next tuple. Keys must be strictly ascending.
    pub fn add(&mut self, tuple: &Tuple) -> IndexResult<()> {
        let tree = self.tree;
        tree.check_tuple(IndexOp::Insert, tuple)?;
        let cmp = tree.comparator();
        if let Some(last) = &self.last_key {
            match cmp.compare(&tuple.view(), &last.view()) {
                Ordering::Less => return Err(IndexError::UnsortedInput),
                Ordering::Equal => return Err(IndexError::DuplicateKey),
                Ordering::Greater => {}
            }
        }

        if self.is_full(0, tuple.len()) {
            let separator = self
                .last_key
                .clone()
                .ok_or_else(|| IndexError::InvalidOperation("full leaf without keys".into()))?;
            let mut right = self.start_page(0)?;
            let left_id = self.edges[0].page_id();
            let right_id = right.page_id();
            BTreePage::new(&mut self.edges[0][..]).set_next_leaf(Some(right_id));
            BTreePage::new(&mut right[..]).set_prev_leaf(Some(left_id));
            self.edges[0] = right;
            self.push_separator(1, separator, left_id, right_id)?;
        }

        BTreePage::new(&mut self.edges[0][..]).append_entry(tuple.as_bytes());
        self.last_key = Some(tuple.view().prefix(cmp.key_field_count()));
        self.tuple_count += 1;
        Ok(())
    }

    /// Records that keys up to `separator` live under `left` and the rest
    /// under `right`, on the edge page of `level`.
    fn push_separator(
        &mut self,
        level: usize,
        separator: Tuple,
        left: PageId,
        right: PageId,
    ) -> IndexResult<()> {
        let entry = interior_entry(&separator.view(), left);

        if level == self.edges.len() {
            let mut node = self.start_page(level as u8)?;
            let mut page = BTreePage::new(&mut node[..]);
            page.append_entry(&entry);
            page.set_right_most_child(Some(right));
            self.edges.push(node);
            return Ok(());
        }

        if !self.is_full(level, entry.len()) {
            let mut page = BTreePage::new(&mut self.edges[level][..]);
            page.append_entry(&entry);
            page.set_right_most_child(Some(right));
            return Ok(());
        }

        // The full edge keeps `left` as its right-most child; `right` starts
        // the next page of this level.
        let mut node = self.start_page(level as u8)?;
        BTreePage::new(&mut node[..]).set_right_most_child(Some(right));
        let closed = std::mem::replace(&mut self.edges[level], node);
        let (closed_id, node_id) = (closed.page_id(), self.edges[level].page_id());
        drop(closed);
        self.push_separator(level + 1, separator, closed_id, node_id)
    }

    /// Installs the built tree under the root page.
    pub fn end(mut self) -> IndexResult<()> {
        let top = match self.edges.pop() {
            Some(top) => top,
            None => return Err(IndexError::InvalidOperation("bulk load has no pages".into())),
        };
        self.edges.clear();

        let height = BTreePage::new(&top[..]).level() as u32 + 1;
        {
            let mut root = self.tree.pin(ROOT_PAGE_ID)?.write();
            let mut page = BTreePage::new(&mut root[..]);
            let version = page.version();
            page.copy_from(&BTreePage::new(&top[..]));
            page.set_version(version.wrapping_add(1));
            page.set_smo_flag(false);
        }

        let top_id = top.page_id();
        self.tree.release_page(top.unlatch());
        self.allocated.retain(|&page_id| page_id != top_id);
        self.finished = true;

        info!(
            "bulk loaded {} tuples into {} pages, height {}",
            self.tuple_count,
            self.allocated.len() + 1,
            height
        );
        Ok(())
    }
}

impl Drop for BulkLoader<'_> {
    fn drop(&mut self) {
        self.edges.clear();
        if !self.finished {
            debug!(
                "abandoned bulk load, releasing {} pages",
                self.allocated.len()
            );
            for page_id in self.allocated.drain(..) {
                match self.tree.pin(page_id) {
                    Ok(pinned) => self.tree.release_page(pinned),
                    Err(err) => warn!("failed to release page {:?}: {}", page_id, err),
                }
            }
        }
        self.tree.end_bulk_load();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::cursor::RangePredicate;
    use crate::access::value::{FieldType, Value};
    use crate::config::{IndexConfig, IndexDescriptor};
    use crate::storage::buffer::BufferPoolManager;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn tree() -> Result<(BTree, TempDir)> {
        let dir = tempdir()?;
        let config = IndexConfig {
            page_size: 256,
            buffer_frames: 32,
            ..Default::default()
        };
        let pool = BufferPoolManager::with_lru(config.page_size, config.buffer_frames)?;
        let descriptor = IndexDescriptor::new(vec![FieldType::Int64, FieldType::Int64], 1)?;
        let tree = BTree::create(pool, &dir.path().join("bulk.idx"), descriptor, config)?;
        Ok((tree, dir))
    }

    fn row(k: i64) -> Tuple {
        Tuple::from_values(&[Value::Int64(k), Value::Int64(k * k)])
    }

    #[test]
    fn test_load_builds_valid_tree() -> Result<()> {
        let (tree, _dir) = tree()?;
        let mut loader = tree.begin_bulk_load(0.7)?;
        for k in 0..1000 {
            loader.add(&row(k))?;
        }
        loader.end()?;

        tree.verify()?;
        let stats = tree.statistics()?;
        assert_eq!(stats.tuple_count, 1000);
        assert!(stats.height >= 3);

        let accessor = tree.create_accessor();
        let scanned: Vec<Tuple> = accessor.range(RangePredicate::all())?.collect::<Result<_, _>>()?;
        assert_eq!(scanned, (0..1000).map(row).collect::<Vec<_>>());

        // The loaded tree takes regular modifications.
        accessor.insert(&row(5000))?;
        accessor.delete(&Tuple::from_values(&[Value::Int64(3)]))?;
        tree.verify()?;
        assert_eq!(tree.buffer_pool().pinned_frames(), 0);
        Ok(())
    }

    #[test]
    fn test_rejects_unsorted_and_duplicate_input() -> Result<()> {
        let (tree, _dir) = tree()?;
        let mut loader = tree.begin_bulk_load(1.0)?;
        loader.add(&row(10))?;
        assert!(matches!(loader.add(&row(5)), Err(IndexError::UnsortedInput)));
        assert!(matches!(loader.add(&row(10)), Err(IndexError::DuplicateKey)));
        loader.add(&row(11))?;
        loader.end()?;

        let accessor = tree.create_accessor();
        assert_eq!(accessor.range(RangePredicate::all())?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_needs_empty_index_and_single_loader() -> Result<()> {
        let (tree, _dir) = tree()?;
        {
            let _loader = tree.begin_bulk_load(0.5)?;
            assert!(tree.begin_bulk_load(0.5).is_err());
            assert!(tree.create_accessor().insert(&row(1)).is_err());
        }
        assert!(tree.begin_bulk_load(0.0).is_err());

        tree.create_accessor().insert(&row(1))?;
        assert!(matches!(
            tree.begin_bulk_load(0.5),
            Err(IndexError::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_abandoned_load_frees_its_pages() -> Result<()> {
        let (tree, _dir) = tree()?;
        {
            let mut loader = tree.begin_bulk_load(0.8)?;
            for k in 0..200 {
                loader.add(&row(k))?;
            }
        }
        let stats = tree.statistics()?;
        assert_eq!(stats.tuple_count, 0);
        assert_eq!(stats.free_pages as u32, stats.max_page - 1);

        // An empty load leaves an empty tree.
        tree.begin_bulk_load(0.8)?.end()?;
        tree.verify()?;
        assert_eq!(tree.statistics()?.tuple_count, 0);
        Ok(())
    }
}

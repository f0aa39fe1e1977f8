//! Concurrent B+-tree index.
//!
//! Readers descend with shared latch coupling; writers couple shared latches
//! through interior pages and take an exclusive latch only on the leaf. Any
//! change to the shape of the tree (a split, a retired page, a grown root)
//! is a structure modification: it runs under the tree-wide SMO lock, marks
//! the pages it rewrites with the SMO flag, and bumps their versions.
//! Operations that meet a flagged or outdated page step back to the lowest
//! ancestor whose version they last saw unchanged and continue from there.
//!
//! The root is always page 1. It grows by moving its content into two new
//! children, so nothing outside the tree ever has to learn a new root id.

pub mod accessor;
pub mod bulk_load;
pub mod context;
pub mod cursor;
pub mod error;

use self::context::{Descent, IndexOp, OperationContext, SplitKey, StructureChange};
use self::cursor::SeekTarget;
use crate::access::comparator::MultiComparator;
use crate::access::tuple::Tuple;
use crate::config::{validate_fill_factor, IndexConfig, IndexDescriptor};
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard, PinnedPage};
use crate::storage::disk::{PageManager, MAX_PAGE_SIZE};
use crate::storage::error::StorageError;
use crate::storage::free_page::{FreePageManager, InMemoryFreePageManager};
use crate::storage::metadata::IndexMetadata;
use crate::storage::page::btree_page::{
    interior_entry, max_tuple_size, BTreePage, SpaceStatus, CHILD_POINTER_SIZE,
};
use crate::storage::page::{PageId, FREE_PAGE_LEVEL, METADATA_PAGE_ID, ROOT_PAGE_ID};
use crate::storage::FileId;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

pub use self::accessor::BTreeAccessor;
pub use self::bulk_load::BulkLoader;
pub use self::cursor::{DiskOrderScanCursor, RangeCursor, RangePredicate, ScanDirection};
pub use self::error::{IndexError, IndexResult};

/// A page latched on the way down.
enum Latched {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

impl Latched {
    fn bytes(&self) -> &[u8] {
        match self {
            Latched::Read(guard) => &guard[..],
            Latched::Write(guard) => &guard[..],
        }
    }
}

/// Shape and size of a quiescent tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BTreeStatistics {
    /// Number of levels, 1 for a tree that is a single leaf.
    pub height: u32,
    pub interior_pages: u64,
    pub leaf_pages: u64,
    pub tuple_count: u64,
    pub free_pages: usize,
    /// Highest page id the file has ever used.
    pub max_page: u32,
}

#[derive(Debug)]
struct LeafLinks {
    page_id: PageId,
    prev: Option<PageId>,
    next: Option<PageId>,
}

pub struct BTree {
    pool: BufferPoolManager,
    file_id: FileId,
    path: PathBuf,
    free_pages: Box<dyn FreePageManager>,
    descriptor: IndexDescriptor,
    cmp: MultiComparator,
    smo_lock: Arc<Mutex<()>>,
    config: IndexConfig,
    bulk_loading: AtomicBool,
}

fn invalid_input(err: anyhow::Error) -> IndexError {
    IndexError::InvalidOperation(format!("{:#}", err))
}

fn is_missing_page(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::PageNotFound(_))
    )
}

fn corrupted(page_id: PageId, reason: impl Into<String>) -> IndexError {
    IndexError::Corrupted {
        page_id,
        reason: reason.into(),
    }
}

/// Points child `index` (or the right-most child) at `child`.
fn redirect<B>(page: &mut BTreePage<B>, index: usize, child: PageId)
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    if index < page.tuple_count() {
        page.set_child(index, child);
    } else {
        page.set_right_most_child(Some(child));
    }
}

impl BTree {
    /// Creates a new index file holding a single empty root leaf.
    pub fn create(
        pool: BufferPoolManager,
        path: &Path,
        descriptor: IndexDescriptor,
        config: IndexConfig,
    ) -> IndexResult<Self> {
        config.validate().map_err(invalid_input)?;
        descriptor.validate().map_err(invalid_input)?;
        Self::check_pool(&pool, &config)?;

        let file_id = pool.create_file(path)?;
        let free_pages = Box::new(InMemoryFreePageManager::new(config.page_limit));
        let tree = Self::assemble(pool, file_id, path, descriptor, config, free_pages);
        {
            let mut root = tree.pool.pin(file_id, ROOT_PAGE_ID, true)?.write();
            BTreePage::new(&mut root[..]).init(0);
        }
        tree.write_metadata()?;

        info!(
            "created index {} ({} fields, {} key fields, {} byte pages)",
            tree.path.display(),
            tree.descriptor.field_count(),
            tree.descriptor.key_field_count,
            tree.config.page_size
        );
        Ok(tree)
    }

    /// Opens an existing index file. The page size comes from the file; the
    /// free list is rebuilt from the level byte of every page.
    pub fn open(pool: BufferPoolManager, path: &Path, mut config: IndexConfig) -> IndexResult<Self> {
        let header = PageManager::read_prefix(path, MAX_PAGE_SIZE)?;
        let metadata = IndexMetadata::read_from(&header)?;
        config.page_size = metadata.page_size as usize;
        config.validate().map_err(invalid_input)?;
        Self::check_pool(&pool, &config)?;

        let file_id = pool.open_file(path)?;
        let free = match Self::scan_free_pages(&pool, file_id, metadata.max_page()) {
            Ok(free) => free,
            Err(err) => {
                if let Err(close_err) = pool.close_file(file_id) {
                    warn!("failed to close {} after a failed open: {}", path.display(), close_err);
                }
                return Err(err);
            }
        };

        info!(
            "opened index {} ({} pages, {} free)",
            path.display(),
            metadata.max_page + 1,
            free.len()
        );
        let free_pages = Box::new(InMemoryFreePageManager::with_pages(
            metadata.max_page(),
            free,
            config.page_limit,
        ));
        Ok(Self::assemble(
            pool,
            file_id,
            path,
            metadata.descriptor,
            config,
            free_pages,
        ))
    }

    fn assemble(
        pool: BufferPoolManager,
        file_id: FileId,
        path: &Path,
        descriptor: IndexDescriptor,
        config: IndexConfig,
        free_pages: Box<dyn FreePageManager>,
    ) -> Self {
        let cmp = MultiComparator::new(descriptor.key_types());
        Self {
            pool,
            file_id,
            path: path.to_path_buf(),
            free_pages,
            descriptor,
            cmp,
            smo_lock: Arc::new(Mutex::new(())),
            config,
            bulk_loading: AtomicBool::new(false),
        }
    }

    fn check_pool(pool: &BufferPoolManager, config: &IndexConfig) -> IndexResult<()> {
        if pool.page_size() != config.page_size {
            return Err(IndexError::InvalidOperation(format!(
                "buffer pool uses {} byte pages but the index needs {}",
                pool.page_size(),
                config.page_size
            )));
        }
        Ok(())
    }

    fn scan_free_pages(
        pool: &BufferPoolManager,
        file_id: FileId,
        max_page: PageId,
    ) -> IndexResult<Vec<PageId>> {
        let mut free = Vec::new();
        for raw in ROOT_PAGE_ID.0 + 1..=max_page.0 {
            let page_id = PageId(raw);
            match pool.pin(file_id, page_id, false) {
                Ok(pin) => {
                    let guard = pin.read();
                    if BTreePage::new(&guard[..]).is_free() {
                        free.push(page_id);
                    }
                }
                // Handed out but never written back.
                Err(err) if is_missing_page(&err) => free.push(page_id),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(free)
    }

    /// Writes the metadata page and every dirty page to disk.
    pub fn flush(&self) -> IndexResult<()> {
        self.write_metadata()?;
        self.pool.flush_file(self.file_id)?;
        Ok(())
    }

    /// Flushes the index and unregisters its file from the buffer pool.
    pub fn close(self) -> IndexResult<()> {
        self.write_metadata()?;
        self.pool.close_file(self.file_id)?;
        info!("closed index {}", self.path.display());
        Ok(())
    }

    fn write_metadata(&self) -> IndexResult<()> {
        let metadata = IndexMetadata::new(
            self.config.page_size,
            self.descriptor.clone(),
            self.free_pages.max_page(),
        );
        let mut guard = self.pool.pin(self.file_id, METADATA_PAGE_ID, true)?.write();
        metadata.write_to(&mut guard[..])?;
        Ok(())
    }

    pub fn create_accessor(&self) -> BTreeAccessor<'_> {
        BTreeAccessor::new(self)
    }

    /// Starts filling an empty index from input sorted by key. Pages are
    /// packed up to `fill_factor` of their size.
    pub fn begin_bulk_load(&self, fill_factor: f64) -> IndexResult<BulkLoader<'_>> {
        validate_fill_factor(fill_factor).map_err(invalid_input)?;
        if self.bulk_loading.swap(true, AtomicOrdering::SeqCst) {
            return Err(IndexError::InvalidOperation(
                "a bulk load is already running on this index".into(),
            ));
        }

        let empty = self.pin(ROOT_PAGE_ID).map(|pin| {
            let guard = pin.read();
            let root = BTreePage::new(&guard[..]);
            root.is_leaf() && root.tuple_count() == 0
        });
        match empty {
            Ok(true) => {}
            Ok(false) => {
                self.bulk_loading.store(false, AtomicOrdering::SeqCst);
                return Err(IndexError::InvalidOperation(
                    "bulk load needs an empty index".into(),
                ));
            }
            Err(err) => {
                self.bulk_loading.store(false, AtomicOrdering::SeqCst);
                return Err(err);
            }
        }

        let budget = (fill_factor * self.config.page_size as f64) as usize;
        BulkLoader::new(self, budget)
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn comparator(&self) -> &MultiComparator {
        &self.cmp
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn root_page_id(&self) -> PageId {
        ROOT_PAGE_ID
    }

    pub fn buffer_pool(&self) -> &BufferPoolManager {
        &self.pool
    }

    /// Largest tuple a single page accepts.
    pub fn max_tuple_size(&self) -> usize {
        max_tuple_size(self.config.page_size)
    }

    pub(crate) fn max_page(&self) -> PageId {
        self.free_pages.max_page()
    }

    pub(crate) fn is_bulk_loading(&self) -> bool {
        self.bulk_loading.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn end_bulk_load(&self) {
        self.bulk_loading.store(false, AtomicOrdering::SeqCst);
    }

    pub(crate) fn pin(&self, page_id: PageId) -> IndexResult<PinnedPage> {
        Ok(self.pool.pin(self.file_id, page_id, false)?)
    }

    /// Pins a page that may lie beyond the end of the file.
    pub(crate) fn pin_existing(&self, page_id: PageId) -> IndexResult<Option<PinnedPage>> {
        match self.pool.pin(self.file_id, page_id, false) {
            Ok(pin) => Ok(Some(pin)),
            Err(err) if is_missing_page(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Takes a page from the free pool and pins it. A recycled page keeps its
    /// on-disk version so that versions only ever grow.
    pub(crate) fn allocate_page(&self) -> IndexResult<PinnedPage> {
        let page_id = self.free_pages.get_free_page()?;
        let pinned = match self.pin_existing(page_id) {
            Ok(Some(pin)) => Ok(pin),
            Ok(None) => self
                .pool
                .pin(self.file_id, page_id, true)
                .map_err(IndexError::from),
            Err(err) => Err(err),
        };
        if pinned.is_err() {
            self.free_pages.add_free_page(page_id);
        }
        pinned
    }

    /// Formats a page as free and hands it back to the free pool.
    pub(crate) fn release_page(&self, pin: PinnedPage) {
        let page_id = pin.page_id();
        {
            let mut guard = pin.write();
            let mut page = BTreePage::new(&mut guard[..]);
            page.init(FREE_PAGE_LEVEL);
            page.bump_version();
        }
        self.free_pages.add_free_page(page_id);
    }

    /// Checks that the first `count` fields have the width their type demands.
    fn check_field_widths(&self, tuple: &Tuple, count: usize) -> IndexResult<()> {
        for (index, field_type) in self.descriptor.field_types.iter().take(count).enumerate() {
            if let Some(size) = field_type.fixed_size() {
                let len = tuple.field(index).len();
                if len != size {
                    return Err(IndexError::InvalidOperation(format!(
                        "field {} is {} bytes, expected {} for {:?}",
                        index, len, size, field_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validates a full tuple for insert, update or upsert.
    pub(crate) fn check_tuple(&self, op: IndexOp, tuple: &Tuple) -> IndexResult<()> {
        let expected = self.descriptor.field_count();
        if tuple.field_count() != expected {
            return Err(IndexError::InvalidOperation(format!(
                "{:?} needs {} fields, got {}",
                op,
                expected,
                tuple.field_count()
            )));
        }
        if matches!(op, IndexOp::Update | IndexOp::Upsert)
            && expected == self.descriptor.key_field_count
        {
            return Err(IndexError::InvalidOperation(format!(
                "{:?} is meaningless when every field is part of the key",
                op
            )));
        }
        let max = self.max_tuple_size();
        if tuple.len() > max {
            return Err(IndexError::TupleTooLarge {
                size: tuple.len(),
                max,
            });
        }
        self.check_field_widths(tuple, expected)
    }

    /// Validates a search or delete key: it must carry the whole key.
    pub(crate) fn check_key(&self, key: &Tuple) -> IndexResult<()> {
        let key_fields = self.descriptor.key_field_count;
        if key.field_count() < key_fields {
            return Err(IndexError::InvalidOperation(format!(
                "key needs {} fields, got {}",
                key_fields,
                key.field_count()
            )));
        }
        self.check_bound(key)
    }

    /// Validates a range bound, which may be a key prefix.
    pub(crate) fn check_bound(&self, key: &Tuple) -> IndexResult<()> {
        let max = self.max_tuple_size();
        if key.len() > max {
            return Err(IndexError::TupleTooLarge {
                size: key.len(),
                max,
            });
        }
        let count = key.field_count().min(self.descriptor.key_field_count);
        self.check_field_widths(key, count)
    }

    /// Runs one modifying operation to completion. Whatever happens, the
    /// structure modification state is cleaned up before returning.
    pub(crate) fn modify(&self, op: IndexOp, tuple: &Tuple) -> IndexResult<()> {
        match op {
            IndexOp::Delete => self.check_key(tuple)?,
            IndexOp::Search => {
                return Err(IndexError::InvalidOperation(
                    "search does not modify the index".into(),
                ))
            }
            _ => self.check_tuple(op, tuple)?,
        }
        if self.is_bulk_loading() {
            return Err(IndexError::InvalidOperation(
                "the index is being bulk loaded".into(),
            ));
        }

        let mut ctx = OperationContext::new(op, &self.cmp, self.config.max_restarts);
        let result = self.descend(&mut ctx, tuple, ROOT_PAGE_ID, 0, None, None);
        self.finish_smo(&mut ctx);
        if ctx.restarts() > 0 {
            trace!("{:?} finished after {} restarts", op, ctx.restarts());
        }

        match result? {
            Descent::Completed(None) => Ok(()),
            Descent::Completed(Some(change)) => Err(corrupted(
                ROOT_PAGE_ID,
                format!("structure change {:?} escaped the root", change),
            )),
            Descent::Restart => Err(corrupted(ROOT_PAGE_ID, "restart escaped the root")),
        }
    }

    /// Waits for a running structure modification to finish.
    fn fence(&self, ctx: &OperationContext<'_>) {
        if !ctx.holds_smo_lock() {
            drop(self.smo_lock.lock());
        }
    }

    /// One level of a modifying descent. `parent` is released once this page
    /// is latched. Returns `Restart` to the parent when this page turned out
    /// to be stale; the root handles its own restarts.
    fn descend(
        &self,
        ctx: &mut OperationContext<'_>,
        tuple: &Tuple,
        page_id: PageId,
        depth: usize,
        expected_level: Option<u8>,
        mut parent: Option<PageReadGuard>,
    ) -> IndexResult<Descent> {
        let mut resuming = false;
        loop {
            let pinned = self.pin(page_id)?;
            let mut node = if expected_level == Some(0) {
                Latched::Write(pinned.write())
            } else {
                Latched::Read(pinned.read())
            };
            drop(parent.take());

            let (level, stale) = {
                let page = BTreePage::new(node.bytes());
                let stale = page.smo_flag()
                    || page.is_free()
                    || expected_level.is_some_and(|level| level != page.level())
                    || (resuming && depth > 0 && ctx.trail_version(depth) != Some(page.version()));
                (page.level(), stale)
            };
            if stale {
                drop(node);
                self.fence(ctx);
                if depth > 0 {
                    return Ok(Descent::Restart);
                }
                ctx.count_restart()?;
                continue;
            }

            if level == 0 {
                if let Latched::Read(guard) = node {
                    // Only the root is reached without knowing its level.
                    let pinned = guard.unlatch();
                    let guard = pinned.write();
                    if !BTreePage::new(&guard[..]).is_leaf() {
                        drop(guard);
                        ctx.count_restart()?;
                        continue;
                    }
                    node = Latched::Write(guard);
                }
            }

            let version = BTreePage::new(node.bytes()).version();
            ctx.record(depth, page_id, version);

            let guard = match node {
                Latched::Write(leaf) => match self.modify_leaf(ctx, tuple, leaf, depth)? {
                    Descent::Restart if depth == 0 => {
                        ctx.count_restart()?;
                        continue;
                    }
                    outcome => return Ok(outcome),
                },
                Latched::Read(guard) => guard,
            };

            let child = {
                let page = BTreePage::new(&guard[..]);
                let index = page.child_index(&tuple.view(), &self.cmp);
                page.child_at(index)
                    .ok_or_else(|| corrupted(page_id, "interior page without right-most child"))?
            };
            match self.descend(ctx, tuple, child, depth + 1, Some(level - 1), Some(guard))? {
                Descent::Completed(None) => return Ok(Descent::Completed(None)),
                Descent::Completed(Some(change)) => {
                    return self.absorb(ctx, tuple, page_id, depth, change)
                }
                Descent::Restart => {
                    ctx.count_restart()?;
                    resuming = true;
                }
            }
        }
    }

    fn modify_leaf(
        &self,
        ctx: &mut OperationContext<'_>,
        tuple: &Tuple,
        mut leaf: PageWriteGuard,
        depth: usize,
    ) -> IndexResult<Descent> {
        let cmp = &self.cmp;
        let mut page = BTreePage::new(&mut leaf[..]);
        let op = match ctx.op {
            IndexOp::Upsert => match page.exact_index(&tuple.view(), cmp) {
                Ok(_) => IndexOp::Update,
                Err(_) => IndexOp::Insert,
            },
            op => op,
        };

        match op {
            IndexOp::Insert => {
                let index = page.insert_index(&tuple.view(), cmp)?;
                if page.ensure_space(tuple.len()) {
                    page.insert_entry(index, tuple.as_bytes());
                    return Ok(Descent::Completed(None));
                }
                self.split_leaf(ctx, tuple, leaf, depth, None)
            }
            IndexOp::Update => {
                let index = page.exact_index(&tuple.view(), cmp)?;
                let old_len = page.tuple(index).len();
                if old_len == tuple.len() {
                    page.overwrite_entry(index, tuple.as_bytes());
                    return Ok(Descent::Completed(None));
                }
                if page.total_free_space() + old_len >= tuple.len() {
                    page.delete_entry(index);
                    let fits = page.ensure_space(tuple.len());
                    debug_assert!(fits);
                    page.insert_entry(index, tuple.as_bytes());
                    return Ok(Descent::Completed(None));
                }
                self.split_leaf(ctx, tuple, leaf, depth, Some(index))
            }
            IndexOp::Delete => {
                let index = page.exact_index(&tuple.view(), cmp)?;
                if page.tuple_count() > 1 || depth == 0 {
                    page.delete_entry(index);
                    return Ok(Descent::Completed(None));
                }
                self.retire_leaf(ctx, leaf, depth, index)
            }
            IndexOp::Upsert | IndexOp::Search => Err(IndexError::InvalidOperation(format!(
                "{:?} cannot modify a leaf",
                op
            ))),
        }
    }

    /// Takes the SMO lock without waiting. On `false` the caller must drop its
    /// latches and call [`Self::wait_for_smo_lock`].
    fn try_enter_smo(&self, ctx: &mut OperationContext<'_>) -> bool {
        if ctx.holds_smo_lock() {
            return true;
        }
        match self.smo_lock.try_lock_arc() {
            Some(guard) => {
                ctx.set_smo_guard(guard);
                true
            }
            None => false,
        }
    }

    fn wait_for_smo_lock(&self, ctx: &mut OperationContext<'_>) {
        trace!("{:?} waits for the SMO lock", ctx.op);
        ctx.set_smo_guard(self.smo_lock.lock_arc());
    }

    /// Re-checks the recorded path above `depth` and keeps the ancestors
    /// pinned for the modification. For each ancestor, reports whether it can
    /// take one more separator without splitting. `None` means the path
    /// changed since the descent; the trail is then cut at the first ancestor
    /// that failed, so the restart climbs back to it.
    fn validate_ancestors(
        &self,
        ctx: &mut OperationContext<'_>,
        depth: usize,
    ) -> IndexResult<Option<Vec<bool>>> {
        let entry_bound = self.max_tuple_size() + CHILD_POINTER_SIZE;
        let trail = ctx.trail()[..depth].to_vec();
        let mut pins = Vec::with_capacity(depth);
        let mut has_room = Vec::with_capacity(depth);

        for (level, entry) in trail.into_iter().enumerate() {
            // The leaf latch is still held, so ancestor latches are never
            // waited for. A writer queued on the root would otherwise block
            // this reader while it waits on readers stuck behind the leaf.
            let Ok(guard) = self.pin(entry.page_id)?.try_read() else {
                ctx.truncate_trail(level);
                return Ok(None);
            };
            let room = {
                let page = BTreePage::new(&guard[..]);
                if page.version() != entry.version || page.smo_flag() || page.is_free() {
                    drop(guard);
                    ctx.truncate_trail(level);
                    return Ok(None);
                }
                page.space_for(entry_bound) != SpaceStatus::Insufficient
            };
            has_room.push(room);
            pins.push(guard.unlatch());
        }

        ctx.set_ancestors(pins);
        Ok(Some(has_room))
    }

    /// Worst-case number of new pages a split at `depth` can consume: one per
    /// splitting page, two for a splitting root.
    fn pages_for_split(depth: usize, has_room: &[bool]) -> usize {
        if depth == 0 {
            return 2;
        }
        let mut needed = 1;
        for level in (0..depth).rev() {
            if has_room[level] {
                return needed;
            }
            needed += if level == 0 { 2 } else { 1 };
        }
        needed
    }

    fn reserve_pages(&self, ctx: &mut OperationContext<'_>, count: usize) -> IndexResult<()> {
        for _ in 0..count {
            match self.allocate_page() {
                Ok(pin) => ctx.add_reserved(pin),
                Err(err) => {
                    warn!(
                        "cannot reserve {} pages for a structure modification: {}",
                        count, err
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Common entry of every structure modification: the SMO lock, a valid
    /// path and latches on the leaf neighbours. `None` means restart.
    fn enter_smo(
        &self,
        ctx: &mut OperationContext<'_>,
        leaf: PageWriteGuard,
        depth: usize,
    ) -> IndexResult<Option<(PageWriteGuard, Vec<bool>)>> {
        if !self.try_enter_smo(ctx) {
            drop(leaf);
            self.wait_for_smo_lock(ctx);
            return Ok(None);
        }
        match self.validate_ancestors(ctx, depth)? {
            Some(has_room) => Ok(Some((leaf, has_room))),
            None => {
                drop(leaf);
                ctx.clear_ancestors();
                Ok(None)
            }
        }
    }

    fn split_leaf(
        &self,
        ctx: &mut OperationContext<'_>,
        tuple: &Tuple,
        leaf: PageWriteGuard,
        depth: usize,
        replaced: Option<usize>,
    ) -> IndexResult<Descent> {
        let Some((mut leaf, has_room)) = self.enter_smo(ctx, leaf, depth)? else {
            return Ok(Descent::Restart);
        };
        let leaf_id = leaf.page_id();

        let next_id = BTreePage::new(&leaf[..]).next_leaf();
        let mut next = match next_id {
            Some(id) => Some(self.pin(id)?.write()),
            None => None,
        };
        self.reserve_pages(ctx, Self::pages_for_split(depth, &has_room))?;

        if depth == 0 {
            let left = ctx.take_reserved()?;
            let right = ctx.take_reserved()?;
            let mut root = BTreePage::new(&mut leaf[..]);
            if let Some(index) = replaced {
                root.delete_entry(index);
            }
            self.grow_root(ctx, &mut root, left, right, |left, right| {
                left.split_leaf(right, &tuple.view(), &self.cmp)
            });
            return Ok(Descent::Completed(None));
        }

        let mut right = ctx.take_reserved()?.write();
        let right_id = right.page_id();
        let separator = {
            let mut left_page = BTreePage::new(&mut leaf[..]);
            let mut right_page = BTreePage::new(&mut right[..]);
            right_page.init(0);
            if let Some(index) = replaced {
                left_page.delete_entry(index);
            }
            let separator = left_page.split_leaf(&mut right_page, &tuple.view(), &self.cmp);

            right_page.set_prev_leaf(Some(leaf_id));
            right_page.set_next_leaf(next_id);
            left_page.set_next_leaf(Some(right_id));
            if let Some(next) = next.as_mut() {
                BTreePage::new(&mut next[..]).set_prev_leaf(Some(right_id));
            }
            for page in [&mut left_page, &mut right_page] {
                page.bump_version();
                page.set_smo_flag(true);
            }
            separator
        };
        drop(next);

        debug!(
            "split leaf {:?}, new right sibling {:?} at separator {:?}",
            leaf_id, right_id, separator
        );
        ctx.add_flagged(leaf.unlatch());
        ctx.add_flagged(right.unlatch());
        Ok(Descent::Completed(Some(StructureChange::Split(SplitKey {
            separator,
            left: leaf_id,
            right: right_id,
        }))))
    }

    /// Moves the content of the full root into `left`, splits it with `split`
    /// into `left` and `right`, and rewrites the root as their parent.
    fn grow_root<F>(
        &self,
        ctx: &mut OperationContext<'_>,
        root: &mut BTreePage<&mut [u8]>,
        left: PinnedPage,
        right: PinnedPage,
        split: F,
    ) where
        F: FnOnce(&mut BTreePage<&mut [u8]>, &mut BTreePage<&mut [u8]>) -> Tuple,
    {
        let level = root.level();
        let mut left_guard = left.write();
        let mut right_guard = right.write();
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();
        {
            let mut left_page = BTreePage::new(&mut left_guard[..]);
            let mut right_page = BTreePage::new(&mut right_guard[..]);

            let left_version = left_page.version();
            left_page.copy_from(&*root);
            left_page.set_version(left_version.wrapping_add(1));
            right_page.init(level);
            right_page.bump_version();

            let separator = split(&mut left_page, &mut right_page);
            if level == 0 {
                left_page.set_next_leaf(Some(right_id));
                right_page.set_prev_leaf(Some(left_id));
            }
            left_page.set_smo_flag(true);
            right_page.set_smo_flag(true);

            root.init(level + 1);
            root.append_entry(&interior_entry(&separator.view(), left_id));
            root.set_right_most_child(Some(right_id));
            root.bump_version();
        }

        debug!(
            "root grew to level {} over {:?} and {:?}",
            level + 1,
            left_id,
            right_id
        );
        ctx.add_flagged(left_guard.unlatch());
        ctx.add_flagged(right_guard.unlatch());
    }

    fn retire_leaf(
        &self,
        ctx: &mut OperationContext<'_>,
        leaf: PageWriteGuard,
        depth: usize,
        index: usize,
    ) -> IndexResult<Descent> {
        let Some((mut leaf, _)) = self.enter_smo(ctx, leaf, depth)? else {
            return Ok(Descent::Restart);
        };
        let leaf_id = leaf.page_id();
        let (prev_id, next_id) = {
            let page = BTreePage::new(&leaf[..]);
            (page.prev_leaf(), page.next_leaf())
        };

        // Leaf latches are only waited for from left to right.
        let mut prev = match prev_id {
            Some(id) => match self.pin(id)?.try_write() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    drop(leaf);
                    ctx.clear_ancestors();
                    std::thread::yield_now();
                    return Ok(Descent::Restart);
                }
            },
            None => None,
        };
        let mut next = match next_id {
            Some(id) => Some(self.pin(id)?.write()),
            None => None,
        };

        {
            let mut page = BTreePage::new(&mut leaf[..]);
            page.delete_entry(index);
            if let Some(prev) = prev.as_mut() {
                BTreePage::new(&mut prev[..]).set_next_leaf(next_id);
            }
            if let Some(next) = next.as_mut() {
                BTreePage::new(&mut next[..]).set_prev_leaf(prev_id);
            }
            page.set_level(FREE_PAGE_LEVEL);
            page.set_smo_flag(true);
            page.bump_version();
        }
        drop(prev);
        drop(next);

        debug!("retired empty leaf {:?}", leaf_id);
        ctx.retire(leaf_id);
        ctx.add_flagged(leaf.unlatch());
        Ok(Descent::Completed(Some(StructureChange::Emptied(leaf_id))))
    }

    /// Applies a child's structure change to the ancestor at `depth`.
    fn absorb(
        &self,
        ctx: &mut OperationContext<'_>,
        tuple: &Tuple,
        page_id: PageId,
        depth: usize,
        change: StructureChange,
    ) -> IndexResult<Descent> {
        let pinned = ctx.take_ancestor(depth)?;
        if pinned.page_id() != page_id {
            return Err(corrupted(
                page_id,
                format!("validated ancestor at depth {} is {:?}", depth, pinned.page_id()),
            ));
        }
        let guard = pinned.write();
        match change {
            StructureChange::Split(split) => self.absorb_split(ctx, guard, depth, split),
            StructureChange::Emptied(child) => {
                self.absorb_emptied(ctx, tuple, guard, depth, child)
            }
        }
    }

    fn absorb_split(
        &self,
        ctx: &mut OperationContext<'_>,
        mut guard: PageWriteGuard,
        depth: usize,
        split: SplitKey,
    ) -> IndexResult<Descent> {
        let page_id = guard.page_id();
        let separator = split.separator.view();
        let entry = interior_entry(&separator, split.left);

        let mut page = BTreePage::new(&mut guard[..]);
        let index = page.child_index(&separator, &self.cmp);
        if page.child_at(index) != Some(split.left) {
            return Err(corrupted(
                page_id,
                format!("split child {:?} is not at slot {}", split.left, index),
            ));
        }

        if page.space_for(entry.len()) != SpaceStatus::Insufficient {
            redirect(&mut page, index, split.right);
            page.ensure_space(entry.len());
            page.insert_entry(index, &entry);
            page.bump_version();
            return Ok(Descent::Completed(None));
        }

        if depth == 0 {
            let left = ctx.take_reserved()?;
            let right = ctx.take_reserved()?;
            redirect(&mut page, index, split.right);
            self.grow_root(ctx, &mut page, left, right, |left, right| {
                left.split_interior(right, &separator, split.left, &self.cmp)
            });
            return Ok(Descent::Completed(None));
        }

        let mut right = ctx.take_reserved()?.write();
        let right_id = right.page_id();
        let promoted = {
            let mut right_page = BTreePage::new(&mut right[..]);
            right_page.init(page.level());
            redirect(&mut page, index, split.right);
            let promoted = page.split_interior(&mut right_page, &separator, split.left, &self.cmp);
            page.bump_version();
            page.set_smo_flag(true);
            right_page.bump_version();
            right_page.set_smo_flag(true);
            promoted
        };

        debug!(
            "split interior page {:?}, new right sibling {:?}",
            page_id, right_id
        );
        ctx.add_flagged(guard.unlatch());
        ctx.add_flagged(right.unlatch());
        Ok(Descent::Completed(Some(StructureChange::Split(SplitKey {
            separator: promoted,
            left: page_id,
            right: right_id,
        }))))
    }

    fn absorb_emptied(
        &self,
        ctx: &mut OperationContext<'_>,
        tuple: &Tuple,
        mut guard: PageWriteGuard,
        depth: usize,
        child: PageId,
    ) -> IndexResult<Descent> {
        let page_id = guard.page_id();
        let mut page = BTreePage::new(&mut guard[..]);
        let index = page.child_index(&tuple.view(), &self.cmp);
        if page.child_at(index) != Some(child) {
            return Err(corrupted(
                page_id,
                format!("emptied child {:?} is not at slot {}", child, index),
            ));
        }

        let count = page.tuple_count();
        if index < count {
            page.delete_entry(index);
        } else if count > 0 {
            let last = page.child(count - 1);
            page.delete_entry(count - 1);
            page.set_right_most_child(Some(last));
        } else if depth == 0 {
            page.init(0);
            page.bump_version();
            debug!("last leaf emptied, root is a leaf again");
            return Ok(Descent::Completed(None));
        } else {
            page.set_level(FREE_PAGE_LEVEL);
            page.set_smo_flag(true);
            page.bump_version();
            drop(page);
            debug!("retired empty interior page {:?}", page_id);
            ctx.retire(page_id);
            ctx.add_flagged(guard.unlatch());
            return Ok(Descent::Completed(Some(StructureChange::Emptied(page_id))));
        }
        page.bump_version();
        Ok(Descent::Completed(None))
    }

    /// Clears SMO flags, frees retired and unused reserved pages, and
    /// releases the SMO lock. Runs after every modifying operation.
    fn finish_smo(&self, ctx: &mut OperationContext<'_>) {
        for pinned in ctx.drain_flagged() {
            let mut guard = pinned.write();
            BTreePage::new(&mut guard[..]).set_smo_flag(false);
        }
        for page_id in ctx.drain_retired() {
            self.free_pages.add_free_page(page_id);
        }
        for pinned in ctx.drain_reserved() {
            self.release_page(pinned);
        }
        ctx.clear_ancestors();
        ctx.release_smo_lock();
    }

    /// Read-only descent to the leaf where `target` starts. Stale pages send
    /// the search back to the deepest ancestor it saw unchanged.
    pub(crate) fn find_leaf(
        &self,
        ctx: &mut OperationContext<'_>,
        target: &SeekTarget<'_>,
    ) -> IndexResult<PageReadGuard> {
        let mut node = self.pin(ROOT_PAGE_ID)?.read();
        let mut depth = 0;
        loop {
            let (child_id, child_level) = {
                let page = BTreePage::new(&node[..]);
                if page.is_leaf() {
                    return Ok(node);
                }
                ctx.record(depth, node.page_id(), page.version());
                let index = target.child_index(&page, &self.cmp);
                let child = page.child_at(index).ok_or_else(|| {
                    corrupted(node.page_id(), "interior page without right-most child")
                })?;
                (child, page.level() - 1)
            };

            let child = self.pin(child_id)?.read();
            drop(node);
            let usable = {
                let page = BTreePage::new(&child[..]);
                !page.smo_flag() && !page.is_free() && page.level() == child_level
            };
            if usable {
                node = child;
                depth += 1;
                continue;
            }

            drop(child);
            self.fence(ctx);
            ctx.count_restart()?;
            (node, depth) = self.resume_search(ctx, depth)?;
        }
    }

    fn resume_search(
        &self,
        ctx: &OperationContext<'_>,
        depth: usize,
    ) -> IndexResult<(PageReadGuard, usize)> {
        for level in (1..=depth).rev() {
            let entry = ctx.trail()[level];
            let guard = self.pin(entry.page_id)?.read();
            let unchanged = {
                let page = BTreePage::new(&guard[..]);
                page.version() == entry.version && !page.smo_flag() && !page.is_free()
            };
            if unchanged {
                return Ok((guard, level));
            }
        }
        Ok((self.pin(ROOT_PAGE_ID)?.read(), 0))
    }

    pub(crate) fn point_search(&self, key: &Tuple) -> IndexResult<Option<Tuple>> {
        self.check_key(key)?;
        let mut ctx = OperationContext::new(IndexOp::Search, &self.cmp, self.config.max_restarts);
        let leaf = self.find_leaf(&mut ctx, &SeekTarget::AtLeast(key.view()))?;
        let page = BTreePage::new(&leaf[..]);
        Ok(page
            .exact_index(&key.view(), &self.cmp)
            .ok()
            .map(|index| page.tuple(index).to_tuple()))
    }

    /// Copies a page out of the pool so it can be inspected without holding
    /// its latch.
    fn page_image(&self, page_id: PageId) -> IndexResult<BTreePage<Vec<u8>>> {
        let guard = self.pin(page_id)?.read();
        Ok(BTreePage::new(guard.to_vec()))
    }

    /// Counts pages and tuples reachable from the root. Meant for a quiescent
    /// index.
    pub fn statistics(&self) -> IndexResult<BTreeStatistics> {
        let mut stats = BTreeStatistics {
            free_pages: self.free_pages.free_page_count(),
            max_page: self.free_pages.max_page().0,
            ..Default::default()
        };
        let mut pending = vec![ROOT_PAGE_ID];
        while let Some(page_id) = pending.pop() {
            let page = self.page_image(page_id)?;
            if page_id == ROOT_PAGE_ID {
                stats.height = page.level() as u32 + 1;
            }
            if page.is_leaf() {
                stats.leaf_pages += 1;
                stats.tuple_count += page.tuple_count() as u64;
                continue;
            }
            stats.interior_pages += 1;
            for index in 0..=page.tuple_count() {
                if let Some(child) = page.child_at(index) {
                    pending.push(child);
                }
            }
        }
        Ok(stats)
    }

    /// Walks the whole tree and checks its invariants: sorted pages, keys
    /// within their separator bounds, consistent levels, no reachable free or
    /// flagged page, and a leaf chain that matches key order. Meant for a
    /// quiescent index.
    pub fn verify(&self) -> IndexResult<()> {
        let mut leaves = Vec::new();
        self.verify_page(ROOT_PAGE_ID, None, None, None, &mut leaves)?;

        for (i, leaf) in leaves.iter().enumerate() {
            let expected_prev = i.checked_sub(1).map(|j| leaves[j].page_id);
            let expected_next = leaves.get(i + 1).map(|l| l.page_id);
            if leaf.prev != expected_prev || leaf.next != expected_next {
                return Err(corrupted(
                    leaf.page_id,
                    format!(
                        "leaf links {:?}/{:?}, expected {:?}/{:?}",
                        leaf.prev, leaf.next, expected_prev, expected_next
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Checks one subtree whose keys must lie in `(low, high]`.
    fn verify_page(
        &self,
        page_id: PageId,
        expected_level: Option<u8>,
        low: Option<&Tuple>,
        high: Option<&Tuple>,
        leaves: &mut Vec<LeafLinks>,
    ) -> IndexResult<()> {
        let page = self.page_image(page_id)?;
        if page.is_free() {
            return Err(corrupted(page_id, "free page is reachable"));
        }
        if page.smo_flag() {
            return Err(corrupted(page_id, "SMO flag left set"));
        }
        if let Some(level) = expected_level {
            if page.level() != level {
                return Err(corrupted(
                    page_id,
                    format!("level {} under a parent expecting {}", page.level(), level),
                ));
            }
        }
        if !page.is_sorted(&self.cmp) {
            return Err(corrupted(page_id, "keys out of order"));
        }

        let count = page.tuple_count();
        if count > 0 {
            if let Some(low) = low {
                if self.cmp.compare(&page.tuple(0), &low.view()) != std::cmp::Ordering::Greater {
                    return Err(corrupted(page_id, "key at or below the lower separator"));
                }
            }
            if let Some(high) = high {
                if self.cmp.compare(&page.tuple(count - 1), &high.view())
                    == std::cmp::Ordering::Greater
                {
                    return Err(corrupted(page_id, "key above the upper separator"));
                }
            }
        }

        if page.is_leaf() {
            if count == 0 && page_id != ROOT_PAGE_ID {
                return Err(corrupted(page_id, "empty leaf is still linked"));
            }
            leaves.push(LeafLinks {
                page_id,
                prev: page.prev_leaf(),
                next: page.next_leaf(),
            });
            return Ok(());
        }

        let child_level = page.level() - 1;
        let keys: Vec<Tuple> = (0..count).map(|i| page.tuple(i).to_tuple()).collect();
        for index in 0..=count {
            let child = page
                .child_at(index)
                .ok_or_else(|| corrupted(page_id, "interior page without right-most child"))?;
            let child_low = if index == 0 { low } else { keys.get(index - 1) };
            let child_high = if index == count { high } else { keys.get(index) };
            self.verify_page(child, Some(child_level), child_low, child_high, leaves)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::{FieldType, Value};
    use anyhow::Result;
    use std::collections::BTreeSet;
    use tempfile::{tempdir, TempDir};

    const PAGE_SIZE: usize = 128;

    fn small_tree(page_limit: Option<u32>) -> Result<(BTree, TempDir)> {
        let dir = tempdir()?;
        let config = IndexConfig {
            page_size: PAGE_SIZE,
            buffer_frames: 64,
            page_limit,
            ..Default::default()
        };
        let pool = BufferPoolManager::with_lru(PAGE_SIZE, config.buffer_frames)?;
        let descriptor = IndexDescriptor::new(vec![FieldType::Int32, FieldType::Int32], 1)?;
        let tree = BTree::create(pool, &dir.path().join("test.idx"), descriptor, config)?;
        Ok((tree, dir))
    }

    fn row(key: i32, payload: i32) -> Tuple {
        Tuple::from_values(&[Value::Int32(key), Value::Int32(payload)])
    }

    fn key(key: i32) -> Tuple {
        Tuple::from_values(&[Value::Int32(key)])
    }

    fn keys_in_order(tree: &BTree) -> Result<Vec<i32>> {
        let accessor = tree.create_accessor();
        let mut keys = Vec::new();
        for tuple in accessor.range(RangePredicate::all())? {
            let values = tuple?.to_values(&[FieldType::Int32, FieldType::Int32])?;
            match values[0] {
                Value::Int32(k) => keys.push(k),
                ref other => panic!("unexpected value {:?}", other),
            }
        }
        Ok(keys)
    }

    #[test]
    fn test_root_stays_in_place_while_growing() -> Result<()> {
        let (tree, _dir) = small_tree(None)?;
        let accessor = tree.create_accessor();
        for k in 0..200 {
            accessor.insert(&row(k, k * 10))?;
        }

        assert_eq!(tree.root_page_id(), PageId(1));
        tree.verify()?;
        let stats = tree.statistics()?;
        assert!(stats.height >= 3, "height {}", stats.height);
        assert_eq!(stats.tuple_count, 200);
        assert_eq!(keys_in_order(&tree)?, (0..200).collect::<Vec<_>>());
        assert_eq!(tree.buffer_pool().pinned_frames(), 0);
        Ok(())
    }

    #[test]
    fn test_descending_inserts() -> Result<()> {
        let (tree, _dir) = small_tree(None)?;
        let accessor = tree.create_accessor();
        for k in (0..150).rev() {
            accessor.insert(&row(k, -k))?;
        }
        tree.verify()?;
        assert_eq!(keys_in_order(&tree)?, (0..150).collect::<Vec<_>>());
        assert_eq!(accessor.point_search(&key(77))?, Some(row(77, -77)));
        Ok(())
    }

    #[test]
    fn test_delete_everything_returns_to_single_leaf() -> Result<()> {
        let (tree, _dir) = small_tree(None)?;
        let accessor = tree.create_accessor();
        for k in 0..120 {
            accessor.insert(&row(k, k))?;
        }
        for k in 0..120 {
            accessor.delete(&key(k))?;
            if k % 20 == 0 {
                tree.verify()?;
            }
        }

        tree.verify()?;
        let stats = tree.statistics()?;
        assert_eq!(stats.height, 1);
        assert_eq!(stats.tuple_count, 0);
        assert_eq!(stats.leaf_pages, 1);
        // Every page but the root went back to the free pool.
        assert_eq!(stats.free_pages as u32, stats.max_page - 1);

        // Freed pages are reused.
        let max_page = stats.max_page;
        for k in 0..120 {
            accessor.insert(&row(k, k))?;
        }
        assert_eq!(tree.statistics()?.max_page, max_page);
        tree.verify()?;
        Ok(())
    }

    #[test]
    fn test_missing_and_duplicate_keys() -> Result<()> {
        let (tree, _dir) = small_tree(None)?;
        let accessor = tree.create_accessor();
        accessor.insert(&row(1, 1))?;
        assert!(matches!(
            accessor.insert(&row(1, 2)),
            Err(IndexError::DuplicateKey)
        ));
        assert!(matches!(
            accessor.delete(&key(2)),
            Err(IndexError::NonexistentKey)
        ));
        assert!(matches!(
            accessor.update(&row(2, 0)),
            Err(IndexError::NonexistentKey)
        ));
        assert_eq!(accessor.point_search(&key(1))?, Some(row(1, 1)));
        Ok(())
    }

    #[test]
    fn test_rejects_malformed_input() -> Result<()> {
        let (tree, _dir) = small_tree(None)?;
        let accessor = tree.create_accessor();
        assert!(matches!(
            accessor.insert(&key(1)),
            Err(IndexError::InvalidOperation(_))
        ));
        let short = Tuple::from_fields([&[1u8, 2][..], &[0u8; 4][..]]);
        assert!(matches!(
            accessor.insert(&short),
            Err(IndexError::InvalidOperation(_))
        ));
        assert!(matches!(
            accessor.point_search(&Tuple::from_fields(std::iter::empty::<&[u8]>())),
            Err(IndexError::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_allocation_failure_leaves_tree_unchanged() -> Result<()> {
        let (tree, _dir) = small_tree(Some(4))?;
        let accessor = tree.create_accessor();

        let mut inserted = BTreeSet::new();
        let mut k = 0;
        let err = loop {
            match accessor.insert(&row(k, k)) {
                Ok(()) => {
                    inserted.insert(k);
                    k += 1;
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(err, IndexError::PageAllocationExhausted));
        assert!(err.is_transient());

        tree.verify()?;
        assert_eq!(
            keys_in_order(&tree)?,
            inserted.iter().copied().collect::<Vec<_>>()
        );
        assert_eq!(tree.buffer_pool().pinned_frames(), 0);

        // The failed insert goes in once its leaf has room again.
        accessor.delete(&key(k - 1))?;
        accessor.insert(&row(k, k))?;
        tree.verify()?;
        Ok(())
    }

    #[test]
    fn test_concurrent_inserts_and_deletes() -> Result<()> {
        let (tree, _dir) = small_tree(None)?;
        let threads = 4;
        let per_thread = 150;

        std::thread::scope(|s| {
            for t in 0..threads {
                let tree = &tree;
                s.spawn(move || {
                    let accessor = tree.create_accessor();
                    for i in 0..per_thread {
                        let k = i * threads + t;
                        accessor.insert(&row(k, t)).unwrap();
                    }
                    for i in (0..per_thread).step_by(2) {
                        let k = i * threads + t;
                        accessor.delete(&key(k)).unwrap();
                    }
                });
            }
        });

        tree.verify()?;
        let expected: Vec<i32> = (0..per_thread)
            .filter(|i| i % 2 == 1)
            .flat_map(|i| (0..threads).map(move |t| i * threads + t))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(keys_in_order(&tree)?, expected);
        assert_eq!(tree.buffer_pool().pinned_frames(), 0);
        Ok(())
    }
}

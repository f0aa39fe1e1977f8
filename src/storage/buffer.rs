pub mod lru;
pub mod replacer;

use crate::storage::disk::{validate_page_size, PageManager};
use crate::storage::error::StorageError;
use crate::storage::page::PageId;
use crate::storage::FileId;
use anyhow::{Context, Result};
use dashmap::DashMap;
use log::debug;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

type PageKey = (FileId, PageId);

/// A buffer frame. The page bytes live inside the frame's latch, so holding
/// a latch guard is the only way to look at or change them.
struct Frame {
    latch: Arc<RwLock<Box<[u8]>>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            latch: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }
}

/// Page table and frame ownership, guarded by one mutex so that pin and
/// eviction decisions never race.
struct PoolState {
    page_table: HashMap<PageKey, FrameId>,
    owners: Vec<Option<PageKey>>,
    free_frames: Vec<FrameId>,
    replacer: Box<dyn Replacer>,
}

struct BufferPoolInner {
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    files: DashMap<FileId, Mutex<PageManager>>,
    next_file_id: AtomicU32,
    page_size: usize,
}

/// Process-wide page cache shared by every open index file.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

impl BufferPoolManager {
    pub fn new(page_size: usize, replacer: Box<dyn Replacer>, max_frames: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let frames = (0..max_frames).map(|_| Frame::new(page_size)).collect();
        let free_frames = (0..max_frames as FrameId).rev().collect();

        Ok(Self {
            inner: Arc::new(BufferPoolInner {
                frames,
                state: Mutex::new(PoolState {
                    page_table: HashMap::with_capacity(max_frames),
                    owners: vec![None; max_frames],
                    free_frames,
                    replacer,
                }),
                files: DashMap::new(),
                next_file_id: AtomicU32::new(0),
                page_size,
            }),
        })
    }

    pub fn with_lru(page_size: usize, max_frames: usize) -> Result<Self> {
        Self::new(page_size, Box::new(lru::LruReplacer::new(max_frames)), max_frames)
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Creates (truncating) a file and registers it with the pool.
    pub fn create_file(&self, path: &Path) -> Result<FileId> {
        let page_manager = PageManager::create(path, self.inner.page_size)?;
        Ok(self.register(page_manager))
    }

    /// Opens an existing file and registers it with the pool.
    pub fn open_file(&self, path: &Path) -> Result<FileId> {
        let page_manager = PageManager::open(path, self.inner.page_size)?;
        Ok(self.register(page_manager))
    }

    fn register(&self, page_manager: PageManager) -> FileId {
        let file_id = FileId(self.inner.next_file_id.fetch_add(1, Ordering::SeqCst));
        self.inner.files.insert(file_id, Mutex::new(page_manager));
        file_id
    }

    /// Flushes a file, drops its cached pages and unregisters it.
    /// Fails if any of its pages is still pinned.
    pub fn close_file(&self, file_id: FileId) -> Result<()> {
        self.flush_file(file_id)?;

        let mut state = self.inner.state.lock();
        let keys: Vec<(PageKey, FrameId)> = state
            .page_table
            .iter()
            .filter(|(key, _)| key.0 == file_id)
            .map(|(key, frame_id)| (*key, *frame_id))
            .collect();

        if keys
            .iter()
            .any(|(_, frame_id)| self.frame(*frame_id).pin_count.load(Ordering::SeqCst) > 0)
        {
            return Err(StorageError::FileInUse(file_id).into());
        }

        for (key, frame_id) in keys {
            state.page_table.remove(&key);
            state.owners[frame_id as usize] = None;
            state.replacer.remove(frame_id);
            state.free_frames.push(frame_id);
            self.frame(frame_id).is_dirty.store(false, Ordering::SeqCst);
        }
        drop(state);

        self.inner.files.remove(&file_id);
        Ok(())
    }

    /// Pins a page. With `is_new` the page is not read from disk: a page that
    /// is not resident starts out zeroed.
    pub fn pin(&self, file_id: FileId, page_id: PageId, is_new: bool) -> Result<PinnedPage> {
        let key = (file_id, page_id);
        let mut state = self.inner.state.lock();

        if let Some(&frame_id) = state.page_table.get(&key) {
            self.frame(frame_id).pin_count.fetch_add(1, Ordering::SeqCst);
            state.replacer.pin(frame_id);
            return Ok(self.pinned(frame_id, key));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = self.frame(frame_id);

        {
            // The frame is unowned, so nobody else can be holding its latch.
            let mut data = frame.latch.write();
            if is_new {
                data.fill(0);
            } else if let Err(err) = self.read_from_disk(file_id, page_id, &mut data) {
                state.free_frames.push(frame_id);
                return Err(err);
            }
        }

        frame.is_dirty.store(is_new, Ordering::SeqCst);
        frame.pin_count.store(1, Ordering::SeqCst);
        state.page_table.insert(key, frame_id);
        state.owners[frame_id as usize] = Some(key);
        state.replacer.pin(frame_id);

        Ok(self.pinned(frame_id, key))
    }

    /// Pins a page only if it is already cached.
    fn pin_if_resident(&self, file_id: FileId, page_id: PageId) -> Option<PinnedPage> {
        let key = (file_id, page_id);
        let mut state = self.inner.state.lock();
        let frame_id = *state.page_table.get(&key)?;
        self.frame(frame_id).pin_count.fetch_add(1, Ordering::SeqCst);
        state.replacer.pin(frame_id);
        Some(self.pinned(frame_id, key))
    }

    pub fn flush_page(&self, file_id: FileId, page_id: PageId) -> Result<()> {
        if let Some(pinned) = self.pin_if_resident(file_id, page_id) {
            let guard = pinned.read();
            self.write_back(&guard)?;
        }
        Ok(())
    }

    /// Writes every dirty cached page of the file and syncs it.
    pub fn flush_file(&self, file_id: FileId) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let state = self.inner.state.lock();
            state
                .page_table
                .keys()
                .filter(|key| key.0 == file_id)
                .map(|key| key.1)
                .collect()
        };

        for page_id in page_ids {
            self.flush_page(file_id, page_id)?;
        }

        let file = self
            .inner
            .files
            .get(&file_id)
            .ok_or(StorageError::FileNotRegistered(file_id))?;
        let mut page_manager = file.lock();
        page_manager.sync()
    }

    /// Number of frames currently pinned by anyone.
    pub fn pinned_frames(&self) -> usize {
        self.inner
            .frames
            .iter()
            .filter(|frame| frame.pin_count.load(Ordering::SeqCst) > 0)
            .count()
    }

    fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.inner.frames[frame_id as usize]
    }

    fn pinned(&self, frame_id: FrameId, key: PageKey) -> PinnedPage {
        PinnedPage {
            inner: self.inner.clone(),
            frame_id,
            file_id: key.0,
            page_id: key.1,
        }
    }

    fn read_from_disk(&self, file_id: FileId, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let file = self
            .inner
            .files
            .get(&file_id)
            .ok_or(StorageError::FileNotRegistered(file_id))?;
        let mut page_manager = file.lock();
        page_manager
            .read_page(page_id, buf)
            .with_context(|| format!("Failed to load page {:?} of {:?}", page_id, file_id))
    }

    fn write_back(&self, guard: &PageReadGuard) -> Result<()> {
        let frame = self.frame(guard.pin.frame_id);
        if !frame.is_dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let file = self
            .inner
            .files
            .get(&guard.pin.file_id)
            .ok_or(StorageError::FileNotRegistered(guard.pin.file_id))?;
        let mut page_manager = file.lock();
        if let Err(err) = page_manager.write_page(guard.pin.page_id, guard) {
            frame.is_dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_frames.pop() {
            return Ok(frame_id);
        }

        let victim = state
            .replacer
            .evict()
            .ok_or(StorageError::BufferPoolFull)?;

        if let Some((file_id, page_id)) = state.owners[victim as usize].take() {
            let frame = self.frame(victim);
            if frame.is_dirty.load(Ordering::SeqCst) {
                // Unpinned frames are never latched.
                let data = frame.latch.read();
                let written = match self.inner.files.get(&file_id) {
                    Some(file) => file.lock().write_page(page_id, &data),
                    None => Err(StorageError::FileNotRegistered(file_id).into()),
                };
                if let Err(err) = written {
                    state.owners[victim as usize] = Some((file_id, page_id));
                    state.replacer.unpin(victim);
                    return Err(err);
                }
                frame.is_dirty.store(false, Ordering::SeqCst);
            }
            state.page_table.remove(&(file_id, page_id));
            debug!("evicted page {:?} of {:?} from frame {}", page_id, file_id, victim);
        }

        Ok(victim)
    }
}

/// A pinned page. Dropping it unpins the page; latching consumes it into a
/// guard that releases the latch and then the pin.
pub struct PinnedPage {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    file_id: FileId,
    page_id: PageId,
}

impl PinnedPage {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    fn latch(&self) -> &Arc<RwLock<Box<[u8]>>> {
        &self.inner.frames[self.frame_id as usize].latch
    }

    fn mark_dirty(&self) {
        self.inner.frames[self.frame_id as usize]
            .is_dirty
            .store(true, Ordering::SeqCst);
    }

    pub fn read(self) -> PageReadGuard {
        let latch = self.latch().read_arc();
        PageReadGuard { latch, pin: self }
    }

    pub fn write(self) -> PageWriteGuard {
        let latch = self.latch().write_arc();
        self.mark_dirty();
        PageWriteGuard { latch, pin: self }
    }

    pub fn try_read(self) -> std::result::Result<PageReadGuard, PinnedPage> {
        let latch = self.latch().try_read_arc();
        match latch {
            Some(latch) => Ok(PageReadGuard { latch, pin: self }),
            None => Err(self),
        }
    }

    pub fn try_write(self) -> std::result::Result<PageWriteGuard, PinnedPage> {
        let latch = self.latch().try_write_arc();
        match latch {
            Some(latch) => {
                self.mark_dirty();
                Ok(PageWriteGuard { latch, pin: self })
            }
            None => Err(self),
        }
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let frame = &self.inner.frames[self.frame_id as usize];
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.replacer.unpin(self.frame_id);
        }
    }
}

/// Shared latch on a pinned page. Field order matters: the latch is released
/// before the pin.
pub struct PageReadGuard {
    latch: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    pin: PinnedPage,
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Releases the latch but keeps the page pinned.
    pub fn unlatch(self) -> PinnedPage {
        let PageReadGuard { latch, pin } = self;
        drop(latch);
        pin
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.latch
    }
}

/// Exclusive latch on a pinned page.
pub struct PageWriteGuard {
    latch: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    pin: PinnedPage,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn unlatch(self) -> PinnedPage {
        let PageWriteGuard { latch, pin } = self;
        drop(latch);
        pin
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.latch
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    const PAGE_SIZE: usize = 256;

    fn create_test_pool(max_frames: usize) -> Result<(BufferPoolManager, FileId, TempDir)> {
        let dir = tempdir()?;
        let pool = BufferPoolManager::with_lru(PAGE_SIZE, max_frames)?;
        let file_id = pool.create_file(&dir.path().join("test.idx"))?;
        Ok((pool, file_id, dir))
    }

    #[test]
    fn test_new_page_roundtrip() -> Result<()> {
        let (pool, file, _dir) = create_test_pool(4)?;

        let mut guard = pool.pin(file, PageId(0), true)?.write();
        assert!(guard.iter().all(|&b| b == 0));
        guard[0] = 42;
        guard[1] = 43;
        drop(guard);

        let guard = pool.pin(file, PageId(0), false)?.read();
        assert_eq!(guard[0], 42);
        assert_eq!(guard[1], 43);
        assert_eq!(guard.page_id(), PageId(0));

        Ok(())
    }

    #[test]
    fn test_eviction_writes_back() -> Result<()> {
        let (pool, file, _dir) = create_test_pool(2)?;

        for i in 0..3u32 {
            let mut guard = pool.pin(file, PageId(i), true)?.write();
            guard[0] = i as u8 + 1;
        }

        // Page 0 was evicted to make room for page 2 and must come back from disk.
        for i in 0..3u32 {
            let guard = pool.pin(file, PageId(i), false)?.read();
            assert_eq!(guard[0], i as u8 + 1);
        }
        assert_eq!(pool.pinned_frames(), 0);

        Ok(())
    }

    #[test]
    fn test_pool_full_when_everything_pinned() -> Result<()> {
        let (pool, file, _dir) = create_test_pool(2)?;

        let _a = pool.pin(file, PageId(0), true)?;
        let _b = pool.pin(file, PageId(1), true)?;
        let err = pool.pin(file, PageId(2), true).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::BufferPoolFull)
        ));
        assert_eq!(pool.pinned_frames(), 2);

        Ok(())
    }

    #[test]
    fn test_pin_counts_are_shared() -> Result<()> {
        let (pool, file, _dir) = create_test_pool(2)?;

        let first = pool.pin(file, PageId(0), true)?;
        let second = pool.pin(file, PageId(0), false)?;
        assert_eq!(pool.pinned_frames(), 1);
        drop(first);
        assert_eq!(pool.pinned_frames(), 1);
        drop(second);
        assert_eq!(pool.pinned_frames(), 0);

        Ok(())
    }

    #[test]
    fn test_write_latch_excludes_readers() -> Result<()> {
        let (pool, file, _dir) = create_test_pool(4)?;

        let writer = pool.pin(file, PageId(0), true)?.write();
        let reader = pool.pin(file, PageId(0), false)?;
        let reader = match reader.try_read() {
            Ok(_) => panic!("read latch granted while write latched"),
            Err(pinned) => pinned,
        };
        drop(writer);

        let shared = reader.try_read().ok().unwrap();
        let other = pool.pin(file, PageId(0), false)?.try_read();
        assert!(other.is_ok());
        let pinned = shared.unlatch();
        assert!(pinned.try_write().is_err());

        Ok(())
    }

    #[test]
    fn test_missing_page_releases_frame() -> Result<()> {
        let (pool, file, _dir) = create_test_pool(1)?;

        assert!(pool.pin(file, PageId(7), false).is_err());
        // The frame went back to the free list.
        let guard = pool.pin(file, PageId(0), true)?.read();
        assert_eq!(guard.len(), PAGE_SIZE);

        Ok(())
    }

    #[test]
    fn test_close_and_reopen_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.idx");
        let pool = BufferPoolManager::with_lru(PAGE_SIZE, 4)?;

        let file = pool.create_file(&path)?;
        {
            let mut guard = pool.pin(file, PageId(1), true)?.write();
            guard[5] = 99;
        }
        let pinned = pool.pin(file, PageId(1), false)?;
        assert!(pool.close_file(file).is_err());
        drop(pinned);
        pool.close_file(file)?;

        let file = pool.open_file(&path)?;
        let guard = pool.pin(file, PageId(1), false)?.read();
        assert_eq!(guard[5], 99);

        Ok(())
    }
}

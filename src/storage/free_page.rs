use crate::storage::error::StorageError;
use crate::storage::page::{PageId, ROOT_PAGE_ID};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Source of unused page ids for one index file.
pub trait FreePageManager: Send + Sync {
    /// Returns a page id nobody references. The page content is undefined.
    fn get_free_page(&self) -> Result<PageId>;

    /// Takes back a page that is no longer reachable.
    fn add_free_page(&self, page_id: PageId);

    /// Highest page id ever handed out.
    fn max_page(&self) -> PageId;

    fn free_page_count(&self) -> usize;
}

#[derive(Debug)]
struct FreeList {
    free: BTreeSet<PageId>,
    max_page: PageId,
}

/// Free list kept in memory and rebuilt from page levels when a file is
/// opened. Recycled pages are handed out lowest id first; only when none is
/// left does the file grow.
#[derive(Debug)]
pub struct InMemoryFreePageManager {
    state: Mutex<FreeList>,
    page_limit: Option<u32>,
}

impl InMemoryFreePageManager {
    /// A manager for a fresh file holding only the metadata page and the root.
    /// With `page_limit` the file never grows beyond that many pages.
    pub fn new(page_limit: Option<u32>) -> Self {
        Self::with_pages(ROOT_PAGE_ID, std::iter::empty(), page_limit)
    }

    pub fn with_pages<I>(max_page: PageId, free_pages: I, page_limit: Option<u32>) -> Self
    where
        I: IntoIterator<Item = PageId>,
    {
        Self {
            state: Mutex::new(FreeList {
                free: free_pages.into_iter().collect(),
                max_page,
            }),
            page_limit,
        }
    }
}

impl FreePageManager for InMemoryFreePageManager {
    fn get_free_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(page_id) = state.free.pop_first() {
            return Ok(page_id);
        }

        let next = state.max_page.0 + 1;
        if let Some(limit) = self.page_limit {
            if next >= limit {
                return Err(StorageError::PageAllocationExhausted { limit }.into());
            }
        }
        state.max_page = PageId(next);
        Ok(state.max_page)
    }

    fn add_free_page(&self, page_id: PageId) {
        let mut state = self.state.lock();
        debug_assert!(page_id > ROOT_PAGE_ID && page_id <= state.max_page);
        state.free.insert(page_id);
    }

    fn max_page(&self) -> PageId {
        self.state.lock().max_page
    }

    fn free_page_count(&self) -> usize {
        self.state.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_after_root() -> Result<()> {
        let fpm = InMemoryFreePageManager::new(None);
        assert_eq!(fpm.max_page(), PageId(1));
        assert_eq!(fpm.get_free_page()?, PageId(2));
        assert_eq!(fpm.get_free_page()?, PageId(3));
        assert_eq!(fpm.max_page(), PageId(3));
        Ok(())
    }

    #[test]
    fn test_recycles_lowest_first() -> Result<()> {
        let fpm = InMemoryFreePageManager::new(None);
        for _ in 0..4 {
            fpm.get_free_page()?;
        }
        fpm.add_free_page(PageId(4));
        fpm.add_free_page(PageId(2));
        assert_eq!(fpm.free_page_count(), 2);

        assert_eq!(fpm.get_free_page()?, PageId(2));
        assert_eq!(fpm.get_free_page()?, PageId(4));
        assert_eq!(fpm.get_free_page()?, PageId(6));
        Ok(())
    }

    #[test]
    fn test_page_limit() -> Result<()> {
        let fpm = InMemoryFreePageManager::new(Some(4));
        assert_eq!(fpm.get_free_page()?, PageId(2));
        assert_eq!(fpm.get_free_page()?, PageId(3));

        let err = fpm.get_free_page().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::PageAllocationExhausted { limit: 4 })
        ));

        // Returned pages can still be reused at the limit.
        fpm.add_free_page(PageId(3));
        assert_eq!(fpm.get_free_page()?, PageId(3));
        Ok(())
    }

    #[test]
    fn test_rebuilt_state() -> Result<()> {
        let fpm = InMemoryFreePageManager::with_pages(PageId(9), [PageId(5), PageId(7)], None);
        assert_eq!(fpm.free_page_count(), 2);
        assert_eq!(fpm.get_free_page()?, PageId(5));
        assert_eq!(fpm.get_free_page()?, PageId(7));
        assert_eq!(fpm.get_free_page()?, PageId(10));
        Ok(())
    }
}

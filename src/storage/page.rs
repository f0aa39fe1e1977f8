pub mod btree_page;
pub mod slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl PageId {
    /// Raw encoding of "no page" in sibling and child pointers.
    pub const INVALID: u32 = u32::MAX;

    pub(crate) fn from_raw(raw: u32) -> Option<PageId> {
        (raw != Self::INVALID).then_some(PageId(raw))
    }

    pub(crate) fn to_raw(page_id: Option<PageId>) -> u32 {
        page_id.map_or(Self::INVALID, |p| p.0)
    }
}

/// Page 0 holds the index metadata.
pub const METADATA_PAGE_ID: PageId = PageId(0);

/// The root never moves.
pub const ROOT_PAGE_ID: PageId = PageId(1);

/// Level value of a page that is retired or sitting in the free pool.
pub const FREE_PAGE_LEVEL: u8 = 0xFF;

pub use btree_page::BTreePage;

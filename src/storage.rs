//! Storage layer of vibetree.
//!
//! Everything below the index algorithms lives here:
//!
//! - **PageManager**: fixed-size page I/O against one index file
//! - **BufferPoolManager**: shared page cache with pin counts, per-frame
//!   read/write latches and LRU eviction
//! - **FreePageManager**: hands out unused page ids and takes retired ones back
//! - **BTreePage**: typed view over the header, tuples and slot array of a
//!   B+-tree page
//! - **IndexMetadata**: the descriptor stored on page 0
//!
//! The index only talks to pages through pins and latch guards; the bytes of a
//! cached page are reachable only while its latch is held.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod free_page;
pub mod metadata;
pub mod page;

/// Identifies a file registered with the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

pub use buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard, PinnedPage};
pub use disk::{PageManager, DEFAULT_PAGE_SIZE};
pub use free_page::{FreePageManager, InMemoryFreePageManager};
pub use page::{BTreePage, PageId};

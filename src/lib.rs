pub mod access;
pub mod config;
pub mod storage;

pub use access::btree::{BTree, BTreeAccessor, BTreeStatistics, IndexError, IndexResult};
pub use config::{IndexConfig, IndexDescriptor};

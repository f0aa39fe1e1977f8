//! Access layer of vibetree.
//!
//! - **Value / FieldType**: typed field values and their byte encodings
//! - **Tuple / TupleRef**: a field-count header, field end offsets, then the
//!   field bytes
//! - **MultiComparator**: orders tuples by their leading key fields, one
//!   binary comparator per field
//! - **BTree**: the concurrent B+-tree built on the storage layer, with its
//!   accessor, range and disk-order cursors, and bulk loader

pub mod btree;
pub mod comparator;
pub mod tuple;
pub mod value;

pub use btree::{BTree, BTreeAccessor, IndexError, IndexResult, RangePredicate, ScanDirection};
pub use comparator::MultiComparator;
pub use tuple::{Tuple, TupleRef};
pub use value::{FieldType, Value};

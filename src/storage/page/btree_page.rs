//! Byte layout of B+-tree pages.
//!
//! ```text
//! +--------+-----------------------+------------+-----------------+
//! | header | tuples (grow ->)      | free space | (<- grow) slots |
//! +--------+-----------------------+------------+-----------------+
//! ```
//!
//! Header (little endian):
//!
//! | offset | size | field              |
//! |--------|------|--------------------|
//! | 0      | 4    | page version       |
//! | 4      | 2    | tuple count        |
//! | 6      | 2    | free space offset  |
//! | 8      | 2    | total free space   |
//! | 10     | 1    | level              |
//! | 11     | 1    | SMO flag           |
//! | 12     | 4    | previous leaf      |
//! | 16     | 4    | next leaf          |
//! | 20     | 4    | right-most child   |
//!
//! Leaf entries are plain tuples. Interior entries are a key tuple followed by
//! the page id of the child holding keys up to and including that key; keys
//! greater than the last entry live under the right-most child.

use super::slot::{self, FindMode, NoMatchPolicy, SlotProbe, SLOT_SIZE};
use super::{PageId, FREE_PAGE_LEVEL};
use crate::access::btree::error::{IndexError, IndexResult};
use crate::access::comparator::MultiComparator;
use crate::access::tuple::{Tuple, TupleRef};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

const PAGE_VERSION_OFFSET: usize = 0;
const TUPLE_COUNT_OFFSET: usize = 4;
const FREE_SPACE_OFFSET_OFFSET: usize = 6;
const TOTAL_FREE_SPACE_OFFSET: usize = 8;
const LEVEL_OFFSET: usize = 10;
const SMO_FLAG_OFFSET: usize = 11;
const PREV_LEAF_OFFSET: usize = 12;
const NEXT_LEAF_OFFSET: usize = 16;
const RIGHT_MOST_CHILD_OFFSET: usize = 20;

pub const HEADER_SIZE: usize = 24;
pub const CHILD_POINTER_SIZE: usize = 4;

/// Largest tuple an index with this page size accepts. A tuple, its slot and
/// a child pointer take at most a quarter of the usable space, so a page
/// split at the byte median always leaves room for one more entry.
pub fn max_tuple_size(page_size: usize) -> usize {
    (page_size - HEADER_SIZE) / 4 - SLOT_SIZE - CHILD_POINTER_SIZE
}

/// Encodes an interior entry.
pub fn interior_entry(key: &TupleRef<'_>, child: PageId) -> Vec<u8> {
    let mut entry = Vec::with_capacity(key.len() + CHILD_POINTER_SIZE);
    entry.extend_from_slice(key.as_bytes());
    let mut child_bytes = [0u8; CHILD_POINTER_SIZE];
    LittleEndian::write_u32(&mut child_bytes, child.0);
    entry.extend_from_slice(&child_bytes);
    entry
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceStatus {
    Contiguous,
    AfterCompact,
    Insufficient,
}

/// Typed view over the bytes of one page.
pub struct BTreePage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> BTreePage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn page_size(&self) -> usize {
        self.as_bytes().len()
    }

    fn read_u16(&self, offset: usize) -> usize {
        LittleEndian::read_u16(&self.as_bytes()[offset..]) as usize
    }

    fn read_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.as_bytes()[offset..])
    }

    pub fn version(&self) -> u32 {
        self.read_u32(PAGE_VERSION_OFFSET)
    }

    pub fn tuple_count(&self) -> usize {
        self.read_u16(TUPLE_COUNT_OFFSET)
    }

    pub fn free_space_offset(&self) -> usize {
        self.read_u16(FREE_SPACE_OFFSET_OFFSET)
    }

    pub fn total_free_space(&self) -> usize {
        self.read_u16(TOTAL_FREE_SPACE_OFFSET)
    }

    pub fn level(&self) -> u8 {
        self.as_bytes()[LEVEL_OFFSET]
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn is_free(&self) -> bool {
        self.level() == FREE_PAGE_LEVEL
    }

    pub fn smo_flag(&self) -> bool {
        self.as_bytes()[SMO_FLAG_OFFSET] != 0
    }

    pub fn prev_leaf(&self) -> Option<PageId> {
        PageId::from_raw(self.read_u32(PREV_LEAF_OFFSET))
    }

    pub fn next_leaf(&self) -> Option<PageId> {
        PageId::from_raw(self.read_u32(NEXT_LEAF_OFFSET))
    }

    pub fn right_most_child(&self) -> Option<PageId> {
        PageId::from_raw(self.read_u32(RIGHT_MOST_CHILD_OFFSET))
    }

    /// Bytes between the end of the tuple area and the slot array.
    pub fn contiguous_free_space(&self) -> usize {
        self.page_size() - self.tuple_count() * SLOT_SIZE - self.free_space_offset()
    }

    /// Header, live entries and slots.
    pub fn used_space(&self) -> usize {
        self.page_size() - self.total_free_space()
    }

    fn slot(&self, index: usize) -> usize {
        self.read_u16(slot::slot_offset(self.page_size(), index))
    }

    pub fn tuple(&self, index: usize) -> TupleRef<'_> {
        TupleRef::new(&self.as_bytes()[self.slot(index)..])
    }

    /// Raw entry bytes, including the child pointer on interior pages.
    pub fn entry(&self, index: usize) -> &[u8] {
        let start = self.slot(index);
        let len = self.entry_len(index);
        &self.as_bytes()[start..start + len]
    }

    fn entry_len(&self, index: usize) -> usize {
        let tuple_len = TupleRef::encoded_len(&self.as_bytes()[self.slot(index)..]);
        if self.is_leaf() {
            tuple_len
        } else {
            tuple_len + CHILD_POINTER_SIZE
        }
    }

    /// Child pointer of interior entry `index`.
    pub fn child(&self, index: usize) -> PageId {
        let start = self.slot(index);
        let tuple_len = TupleRef::encoded_len(&self.as_bytes()[start..]);
        PageId(self.read_u32(start + tuple_len))
    }

    /// Child `index`, where `index == tuple_count()` names the right-most child.
    pub fn child_at(&self, index: usize) -> Option<PageId> {
        if index == self.tuple_count() {
            self.right_most_child()
        } else {
            Some(self.child(index))
        }
    }

    pub fn find_tuple_index(
        &self,
        key: &TupleRef<'_>,
        cmp: &MultiComparator,
        mode: FindMode,
        policy: NoMatchPolicy,
    ) -> SlotProbe {
        slot::find_tuple_index(
            self.tuple_count(),
            |i| cmp.compare(key, &self.tuple(i)),
            mode,
            policy,
        )
    }

    /// Index of the child whose key range covers `key`; `tuple_count()` means
    /// the right-most child.
    pub fn child_index(&self, key: &TupleRef<'_>, cmp: &MultiComparator) -> usize {
        match self.find_tuple_index(key, cmp, FindMode::Insensitive, NoMatchPolicy::HigherKey) {
            SlotProbe::Index(i) => i,
            _ => self.tuple_count(),
        }
    }

    /// Position at which `tuple` belongs in a leaf. Fails if its key exists.
    pub fn insert_index(&self, tuple: &TupleRef<'_>, cmp: &MultiComparator) -> IndexResult<usize> {
        match self.find_tuple_index(tuple, cmp, FindMode::Exclusive, NoMatchPolicy::HigherKey) {
            SlotProbe::Index(i) => Ok(i),
            SlotProbe::ExactMatchRejected => Err(IndexError::DuplicateKey),
            _ => Ok(self.tuple_count()),
        }
    }

    /// Slot holding exactly `key`.
    pub fn exact_index(&self, key: &TupleRef<'_>, cmp: &MultiComparator) -> IndexResult<usize> {
        match self.find_tuple_index(key, cmp, FindMode::Exact, NoMatchPolicy::HigherKey) {
            SlotProbe::Index(i) => Ok(i),
            _ => Err(IndexError::NonexistentKey),
        }
    }

    pub fn space_for(&self, entry_len: usize) -> SpaceStatus {
        let needed = entry_len + SLOT_SIZE;
        if self.contiguous_free_space() >= needed {
            SpaceStatus::Contiguous
        } else if self.total_free_space() >= needed {
            SpaceStatus::AfterCompact
        } else {
            SpaceStatus::Insufficient
        }
    }

    /// Checks that keys are strictly increasing.
    pub fn is_sorted(&self, cmp: &MultiComparator) -> bool {
        (1..self.tuple_count())
            .all(|i| cmp.compare(&self.tuple(i - 1), &self.tuple(i)) == Ordering::Less)
    }

    /// First entry that goes to the right page when splitting. Splits at the
    /// byte median but leaves at least one entry on each side.
    fn split_point(&self) -> usize {
        let count = self.tuple_count();
        debug_assert!(count >= 2);
        let total: usize = (0..count).map(|i| self.entry_len(i)).sum();

        let mut acc = 0;
        for i in 0..count {
            acc += self.entry_len(i);
            if acc * 2 >= total {
                return (i + 1).clamp(1, count - 1);
            }
        }
        count / 2
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreePage<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    fn write_u16(&mut self, offset: usize, value: usize) {
        LittleEndian::write_u16(&mut self.bytes_mut()[offset..offset + 2], value as u16);
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.bytes_mut()[offset..offset + 4], value);
    }

    /// Formats an empty page. The version is left alone; callers bump it.
    pub fn init(&mut self, level: u8) {
        let page_size = self.page_size();
        self.set_tuple_count(0);
        self.set_free_space_offset(HEADER_SIZE);
        self.set_total_free_space(page_size - HEADER_SIZE);
        self.set_level(level);
        self.set_smo_flag(false);
        self.set_prev_leaf(None);
        self.set_next_leaf(None);
        self.set_right_most_child(None);
    }

    pub fn set_version(&mut self, version: u32) {
        self.write_u32(PAGE_VERSION_OFFSET, version);
    }

    pub fn bump_version(&mut self) {
        let next = self.version().wrapping_add(1);
        self.set_version(next);
    }

    fn set_tuple_count(&mut self, count: usize) {
        self.write_u16(TUPLE_COUNT_OFFSET, count);
    }

    fn set_free_space_offset(&mut self, offset: usize) {
        self.write_u16(FREE_SPACE_OFFSET_OFFSET, offset);
    }

    fn set_total_free_space(&mut self, free: usize) {
        self.write_u16(TOTAL_FREE_SPACE_OFFSET, free);
    }

    pub fn set_level(&mut self, level: u8) {
        self.bytes_mut()[LEVEL_OFFSET] = level;
    }

    pub fn set_smo_flag(&mut self, flag: bool) {
        self.bytes_mut()[SMO_FLAG_OFFSET] = flag as u8;
    }

    pub fn set_prev_leaf(&mut self, page_id: Option<PageId>) {
        self.write_u32(PREV_LEAF_OFFSET, PageId::to_raw(page_id));
    }

    pub fn set_next_leaf(&mut self, page_id: Option<PageId>) {
        self.write_u32(NEXT_LEAF_OFFSET, PageId::to_raw(page_id));
    }

    pub fn set_right_most_child(&mut self, page_id: Option<PageId>) {
        self.write_u32(RIGHT_MOST_CHILD_OFFSET, PageId::to_raw(page_id));
    }

    fn set_slot(&mut self, index: usize, tuple_offset: usize) {
        let at = slot::slot_offset(self.page_size(), index);
        self.write_u16(at, tuple_offset);
    }

    pub fn set_child(&mut self, index: usize, child: PageId) {
        let start = self.slot(index);
        let tuple_len = TupleRef::encoded_len(&self.as_bytes()[start..]);
        self.write_u32(start + tuple_len, child.0);
    }

    /// Replaces the whole page image, version included.
    pub fn copy_from<R: AsRef<[u8]>>(&mut self, other: &BTreePage<R>) {
        self.bytes_mut().copy_from_slice(other.as_bytes());
    }

    /// Inserts an entry at slot `index`. The caller has checked that the
    /// contiguous free space suffices.
    pub fn insert_entry(&mut self, index: usize, entry: &[u8]) {
        debug_assert!(self.contiguous_free_space() >= entry.len() + SLOT_SIZE);
        let page_size = self.page_size();
        let count = self.tuple_count();
        let offset = self.free_space_offset();

        self.bytes_mut()[offset..offset + entry.len()].copy_from_slice(entry);

        let slots_start = page_size - count * SLOT_SIZE;
        let slots_end = page_size - index * SLOT_SIZE;
        self.bytes_mut()
            .copy_within(slots_start..slots_end, slots_start - SLOT_SIZE);

        self.set_tuple_count(count + 1);
        self.set_slot(index, offset);
        self.set_free_space_offset(offset + entry.len());
        let free = self.total_free_space();
        self.set_total_free_space(free - entry.len() - SLOT_SIZE);
    }

    pub fn append_entry(&mut self, entry: &[u8]) {
        let count = self.tuple_count();
        self.insert_entry(count, entry);
    }

    /// Removes slot `index`. Tuple bytes stay behind as a hole unless they
    /// were the last ones written.
    pub fn delete_entry(&mut self, index: usize) {
        let page_size = self.page_size();
        let count = self.tuple_count();
        let offset = self.slot(index);
        let len = self.entry_len(index);

        let slots_start = page_size - count * SLOT_SIZE;
        let slots_end = page_size - (index + 1) * SLOT_SIZE;
        self.bytes_mut()
            .copy_within(slots_start..slots_end, slots_start + SLOT_SIZE);

        self.set_tuple_count(count - 1);
        let free = self.total_free_space();
        self.set_total_free_space(free + len + SLOT_SIZE);
        if offset + len == self.free_space_offset() {
            self.set_free_space_offset(offset);
        }
    }

    /// Overwrites entry `index` with bytes of the same length.
    pub fn overwrite_entry(&mut self, index: usize, entry: &[u8]) {
        debug_assert_eq!(self.entry_len(index), entry.len());
        let start = self.slot(index);
        self.bytes_mut()[start..start + entry.len()].copy_from_slice(entry);
    }

    /// Rewrites live entries back to back after the header.
    pub fn compact(&mut self) {
        let count = self.tuple_count();
        let mut packed = Vec::with_capacity(self.page_size());
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            offsets.push(HEADER_SIZE + packed.len());
            packed.extend_from_slice(self.entry(i));
        }

        let end = HEADER_SIZE + packed.len();
        self.bytes_mut()[HEADER_SIZE..end].copy_from_slice(&packed);
        for (i, offset) in offsets.into_iter().enumerate() {
            self.set_slot(i, offset);
        }
        let page_size = self.page_size();
        self.set_free_space_offset(end);
        self.set_total_free_space(page_size - end - count * SLOT_SIZE);
    }

    /// Makes `entry_len` bytes contiguously available if the page has them.
    pub fn ensure_space(&mut self, entry_len: usize) -> bool {
        match self.space_for(entry_len) {
            SpaceStatus::Contiguous => true,
            SpaceStatus::AfterCompact => {
                self.compact();
                true
            }
            SpaceStatus::Insufficient => false,
        }
    }

    /// Keeps the first `count` entries.
    fn truncate(&mut self, count: usize) {
        self.set_tuple_count(count);
        self.compact();
    }

    fn move_tail_to<R>(&mut self, from: usize, right: &mut BTreePage<R>)
    where
        R: AsRef<[u8]> + AsMut<[u8]>,
    {
        for i in from..self.tuple_count() {
            right.append_entry(self.entry(i));
        }
        self.truncate(from);
    }

    /// Splits a full leaf into `self` and the empty, already formatted
    /// `right`, then inserts `tuple` on whichever side its key belongs.
    /// Returns the separator: the key of the last tuple left on `self`.
    pub fn split_leaf<R>(
        &mut self,
        right: &mut BTreePage<R>,
        tuple: &TupleRef<'_>,
        cmp: &MultiComparator,
    ) -> Tuple
    where
        R: AsRef<[u8]> + AsMut<[u8]>,
    {
        let split_at = self.split_point();
        self.move_tail_to(split_at, right);
        let separator = self.tuple(split_at - 1).prefix(cmp.key_field_count());

        if cmp.compare(tuple, &separator.view()) == Ordering::Greater {
            let index = right.insert_position(tuple, cmp);
            right.insert_entry(index, tuple.as_bytes());
        } else {
            let index = self.insert_position(tuple, cmp);
            self.insert_entry(index, tuple.as_bytes());
        }
        separator
    }

    /// Splits a full interior page. The last entry left on `self` is pushed
    /// up: its child becomes the right-most child of `self` and its key is
    /// returned. The new `(key, child)` entry then lands on its side.
    pub fn split_interior<R>(
        &mut self,
        right: &mut BTreePage<R>,
        key: &TupleRef<'_>,
        child: PageId,
        cmp: &MultiComparator,
    ) -> Tuple
    where
        R: AsRef<[u8]> + AsMut<[u8]>,
    {
        let split_at = self.split_point();
        right.set_right_most_child(self.right_most_child());
        self.move_tail_to(split_at, right);

        let promoted = self.tuple(split_at - 1).to_tuple();
        let promoted_child = self.child(split_at - 1);
        self.truncate(split_at - 1);
        self.set_right_most_child(Some(promoted_child));

        let entry = interior_entry(key, child);
        if cmp.compare(key, &promoted.view()) == Ordering::Less {
            let index = self.child_index(key, cmp);
            self.insert_entry(index, &entry);
        } else {
            let index = right.child_index(key, cmp);
            right.insert_entry(index, &entry);
        }
        promoted
    }

    fn insert_position(&self, tuple: &TupleRef<'_>, cmp: &MultiComparator) -> usize {
        match self.find_tuple_index(tuple, cmp, FindMode::Insensitive, NoMatchPolicy::HigherKey) {
            SlotProbe::Index(i) => i,
            _ => self.tuple_count(),
        }
    }
}

//! Ordered slot search.
//!
//! Slots are kept sorted by key, so every lookup is a binary search whose
//! outcome depends on how exact matches are treated and which neighbour is
//! wanted when there is no exact match. In `Insensitive` mode a run of equal
//! keys resolves to its first slot under `HigherKey` and its last slot under
//! `LowerKey`.

use std::cmp::Ordering;

pub const SLOT_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    /// Only an exact match is a hit.
    Exact,
    /// An exact match is an error (insert point lookup).
    Exclusive,
    /// Exact matches and neighbours are both fine.
    Insensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatchPolicy {
    /// Greatest slot whose key is below the search key.
    LowerKey,
    /// Smallest slot whose key is above the search key.
    HigherKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotProbe {
    Index(usize),
    /// The wanted neighbour lies outside `0..tuple_count`.
    OutOfRange,
    /// `FindMode::Exclusive` found the key.
    ExactMatchRejected,
    /// `FindMode::Exact` did not find the key.
    NoExactMatch,
}

/// Binary search over `tuple_count` sorted slots. `compare_at(i)` orders the
/// search key against the key in slot `i`.
pub fn find_tuple_index<F>(
    tuple_count: usize,
    mut compare_at: F,
    mode: FindMode,
    policy: NoMatchPolicy,
) -> SlotProbe
where
    F: FnMut(usize) -> Ordering,
{
    let mut low = 0usize;
    let mut high = tuple_count;
    let mut matched = None;

    while low < high {
        let mid = low + (high - low) / 2;
        match compare_at(mid) {
            Ordering::Less => high = mid,
            Ordering::Greater => low = mid + 1,
            Ordering::Equal => match mode {
                FindMode::Exclusive => return SlotProbe::ExactMatchRejected,
                FindMode::Exact => return SlotProbe::Index(mid),
                // A prefix key can match a run of slots; keep narrowing
                // towards the end of the run the policy asks for.
                FindMode::Insensitive => {
                    matched = Some(mid);
                    match policy {
                        NoMatchPolicy::HigherKey => high = mid,
                        NoMatchPolicy::LowerKey => low = mid + 1,
                    }
                }
            },
        }
    }

    if let Some(index) = matched {
        return SlotProbe::Index(index);
    }
    if mode == FindMode::Exact {
        return SlotProbe::NoExactMatch;
    }

    // `low` is now the first slot greater than the key.
    match policy {
        NoMatchPolicy::HigherKey if low < tuple_count => SlotProbe::Index(low),
        NoMatchPolicy::LowerKey if low > 0 => SlotProbe::Index(low - 1),
        _ => SlotProbe::OutOfRange,
    }
}

/// Byte offset of slot `index` in a page of `page_size` bytes. Slot 0 sits at
/// the very end of the page and the array grows towards the header.
pub fn slot_offset(page_size: usize, index: usize) -> usize {
    page_size - (index + 1) * SLOT_SIZE
}

use crate::access::tuple::TupleRef;
use crate::access::value::FieldType;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt::Debug;

/// Orders the encoded bytes of one field.
pub trait BinaryComparator: Send + Sync + Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[derive(Debug, Default)]
pub struct Int32Comparator;

impl BinaryComparator for Int32Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        LittleEndian::read_i32(a).cmp(&LittleEndian::read_i32(b))
    }
}

#[derive(Debug, Default)]
pub struct Int64Comparator;

impl BinaryComparator for Int64Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        LittleEndian::read_i64(a).cmp(&LittleEndian::read_i64(b))
    }
}

/// Lexicographic byte order. For UTF-8 this is also code point order.
#[derive(Debug, Default)]
pub struct BytesComparator;

impl BinaryComparator for BytesComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

pub struct ComparatorFactory;

impl ComparatorFactory {
    pub fn create(field_type: FieldType) -> Box<dyn BinaryComparator> {
        match field_type {
            FieldType::Int32 => Box::new(Int32Comparator),
            FieldType::Int64 => Box::new(Int64Comparator),
            FieldType::Utf8 | FieldType::Bytes => Box::new(BytesComparator),
        }
    }
}

/// Lexicographic comparison over the key fields of two tuples.
///
/// Only the fields both tuples have are compared, so a tuple holding a
/// prefix of the key compares equal to every tuple starting with it.
#[derive(Debug)]
pub struct MultiComparator {
    comparators: Vec<Box<dyn BinaryComparator>>,
}

impl MultiComparator {
    pub fn new(key_types: &[FieldType]) -> Self {
        Self {
            comparators: key_types
                .iter()
                .map(|t| ComparatorFactory::create(*t))
                .collect(),
        }
    }

    pub fn key_field_count(&self) -> usize {
        self.comparators.len()
    }

    pub fn compare(&self, a: &TupleRef<'_>, b: &TupleRef<'_>) -> Ordering {
        let fields = self
            .comparators
            .len()
            .min(a.field_count())
            .min(b.field_count());

        for i in 0..fields {
            match self.comparators[i].compare(a.field(i), b.field(i)) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

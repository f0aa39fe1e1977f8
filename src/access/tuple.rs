use crate::access::value::{FieldType, Value};
use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

const FIELD_COUNT_SIZE: usize = 2;
const FIELD_END_SIZE: usize = 2;

/// Borrowed view of an encoded tuple.
///
/// Layout: `[u16 field count][u16 end offset of each field][field bytes]`.
/// End offsets are relative to the start of the field bytes.
#[derive(Clone, Copy)]
pub struct TupleRef<'a> {
    data: &'a [u8],
}

impl<'a> TupleRef<'a> {
    /// Reads a tuple from the start of `bytes`. Trailing bytes are ignored.
    pub fn new(bytes: &'a [u8]) -> Self {
        let len = Self::encoded_len(bytes);
        Self { data: &bytes[..len] }
    }

    /// Size of the tuple that starts at `bytes[0]`.
    pub fn encoded_len(bytes: &[u8]) -> usize {
        let field_count = LittleEndian::read_u16(bytes) as usize;
        let header = FIELD_COUNT_SIZE + field_count * FIELD_END_SIZE;
        if field_count == 0 {
            return header;
        }
        let last_end = LittleEndian::read_u16(&bytes[header - FIELD_END_SIZE..]) as usize;
        header + last_end
    }

    pub fn field_count(&self) -> usize {
        LittleEndian::read_u16(self.data) as usize
    }

    fn header_len(&self) -> usize {
        FIELD_COUNT_SIZE + self.field_count() * FIELD_END_SIZE
    }

    fn field_end(&self, index: usize) -> usize {
        let at = FIELD_COUNT_SIZE + index * FIELD_END_SIZE;
        LittleEndian::read_u16(&self.data[at..]) as usize
    }

    pub fn field(&self, index: usize) -> &'a [u8] {
        let start = if index == 0 { 0 } else { self.field_end(index - 1) };
        let end = self.field_end(index);
        let base = self.header_len();
        &self.data[base + start..base + end]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    pub fn to_tuple(&self) -> Tuple {
        Tuple {
            data: self.data.to_vec(),
        }
    }

    /// A detached copy of the first `field_count` fields.
    pub fn prefix(&self, field_count: usize) -> Tuple {
        let count = field_count.min(self.field_count());
        if count == self.field_count() {
            return self.to_tuple();
        }
        Tuple::from_fields((0..count).map(|i| self.field(i)))
    }

    pub fn to_values(&self, field_types: &[FieldType]) -> Result<Vec<Value>> {
        if field_types.len() < self.field_count() {
            bail!(
                "Tuple has {} fields but only {} types were given",
                self.field_count(),
                field_types.len()
            );
        }
        (0..self.field_count())
            .map(|i| Value::decode(self.field(i), field_types[i]))
            .collect()
    }
}

impl fmt::Debug for TupleRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries((0..self.field_count()).map(|i| self.field(i)))
            .finish()
    }
}

/// An owned encoded tuple.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    data: Vec<u8>,
}

impl Tuple {
    pub fn from_fields<'f, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = &'f [u8]>,
    {
        let fields: Vec<&[u8]> = fields.into_iter().collect();
        let header = FIELD_COUNT_SIZE + fields.len() * FIELD_END_SIZE;
        let body: usize = fields.iter().map(|f| f.len()).sum();

        let mut data = vec![0u8; header];
        data.reserve(body);
        LittleEndian::write_u16(&mut data[0..2], fields.len() as u16);

        let mut end = 0usize;
        for (i, field) in fields.iter().enumerate() {
            end += field.len();
            let at = FIELD_COUNT_SIZE + i * FIELD_END_SIZE;
            LittleEndian::write_u16(&mut data[at..at + 2], end as u16);
        }
        for field in fields {
            data.extend_from_slice(field);
        }

        Self { data }
    }

    pub fn from_values(values: &[Value]) -> Self {
        let encoded: Vec<Vec<u8>> = values.iter().map(Value::encode).collect();
        Self::from_fields(encoded.iter().map(|v| v.as_slice()))
    }

    /// Wraps bytes produced by [`Tuple::as_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        TupleRef::new(bytes).to_tuple()
    }

    pub fn view(&self) -> TupleRef<'_> {
        TupleRef { data: &self.data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    pub fn field_count(&self) -> usize {
        self.view().field_count()
    }

    pub fn field(&self, index: usize) -> &[u8] {
        self.view().field(index)
    }

    pub fn prefix(&self, field_count: usize) -> Tuple {
        self.view().prefix(field_count)
    }

    pub fn to_values(&self, field_types: &[FieldType]) -> Result<Vec<Value>> {
        self.view().to_values(field_types)
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view().fmt(f)
    }
}

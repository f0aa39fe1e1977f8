use crate::config::IndexDescriptor;
use crate::storage::page::PageId;
use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

pub const METADATA_MAGIC: u32 = 0x5642_5452;
pub const FORMAT_VERSION: u16 = 1;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Contents of page 0: `[u32 length][bincode IndexMetadata]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub magic: u32,
    pub format_version: u16,
    pub page_size: u32,
    pub descriptor: IndexDescriptor,
    pub max_page: u32,
}

impl IndexMetadata {
    pub fn new(page_size: usize, descriptor: IndexDescriptor, max_page: PageId) -> Self {
        Self {
            magic: METADATA_MAGIC,
            format_version: FORMAT_VERSION,
            page_size: page_size as u32,
            descriptor,
            max_page: max_page.0,
        }
    }

    pub fn max_page(&self) -> PageId {
        PageId(self.max_page)
    }

    pub fn write_to(&self, page: &mut [u8]) -> Result<()> {
        let encoded = bincode::serialize(self).context("Failed to encode index metadata")?;
        if LENGTH_PREFIX_SIZE + encoded.len() > page.len() {
            bail!(
                "Index metadata needs {} bytes but a page holds {}",
                LENGTH_PREFIX_SIZE + encoded.len(),
                page.len()
            );
        }

        page.fill(0);
        LittleEndian::write_u32(&mut page[..LENGTH_PREFIX_SIZE], encoded.len() as u32);
        page[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }

    pub fn read_from(page: &[u8]) -> Result<Self> {
        if page.len() < LENGTH_PREFIX_SIZE {
            bail!("Index file is too short to hold metadata");
        }
        let len = LittleEndian::read_u32(&page[..LENGTH_PREFIX_SIZE]) as usize;
        let end = LENGTH_PREFIX_SIZE + len;
        if len == 0 || end > page.len() {
            bail!("Index metadata length {} is out of range", len);
        }

        let metadata: IndexMetadata = bincode::deserialize(&page[LENGTH_PREFIX_SIZE..end])
            .context("Failed to decode index metadata")?;
        if metadata.magic != METADATA_MAGIC {
            bail!("Not an index file (magic {:#x})", metadata.magic);
        }
        if metadata.format_version != FORMAT_VERSION {
            bail!(
                "Unsupported index format version {}",
                metadata.format_version
            );
        }
        metadata.descriptor.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::FieldType;

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor::new(vec![FieldType::Int64, FieldType::Utf8], 1).unwrap()
    }

    #[test]
    fn test_write_and_read() -> Result<()> {
        let metadata = IndexMetadata::new(4096, descriptor(), PageId(42));
        let mut page = vec![0xAAu8; 4096];
        metadata.write_to(&mut page)?;

        let read = IndexMetadata::read_from(&page)?;
        assert_eq!(read, metadata);
        assert_eq!(read.max_page(), PageId(42));
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_page() {
        assert!(IndexMetadata::read_from(&[0u8; 128]).is_err());
        assert!(IndexMetadata::read_from(&[0xFFu8; 128]).is_err());
        assert!(IndexMetadata::read_from(&[1, 0]).is_err());
    }

    #[test]
    fn test_rejects_bad_magic() -> Result<()> {
        let mut metadata = IndexMetadata::new(4096, descriptor(), PageId(1));
        metadata.magic = 0xDEAD_BEEF;
        let mut page = vec![0u8; 4096];
        metadata.write_to(&mut page)?;
        assert!(IndexMetadata::read_from(&page).is_err());
        Ok(())
    }

    #[test]
    fn test_too_large_for_page() {
        let descriptor = IndexDescriptor::new(vec![FieldType::Bytes; 200], 1).unwrap();
        let metadata = IndexMetadata::new(128, descriptor, PageId(1));
        let mut page = vec![0u8; 128];
        assert!(metadata.write_to(&mut page).is_err());
    }
}

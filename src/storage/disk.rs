use crate::storage::error::StorageError;
use crate::storage::page::PageId;
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 128;
pub const MAX_PAGE_SIZE: usize = 32768;

/// Checks that a page size can be addressed by the 16-bit offsets used in page headers.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(StorageError::InvalidPageSize(page_size).into());
    }
    Ok(())
}

/// Reads and writes fixed-size pages of a single index file.
pub struct PageManager {
    file: File,
    page_size: usize,
}

impl PageManager {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file, page_size })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self { file, page_size })
    }

    /// Reads the first `len` bytes of a file without knowing its page size yet.
    pub fn read_prefix(path: &Path, len: usize) -> Result<Vec<u8>> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
        let mut buf = Vec::with_capacity(len);
        Read::by_ref(&mut file)
            .take(len as u64)
            .read_to_end(&mut buf)
            .context("Failed to read file header")?;
        Ok(buf)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            bail!(
                "Buffer size must be the page size ({}), got {}",
                self.page_size,
                buf.len()
            );
        }

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id).into());
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            bail!(
                "Data size must be the page size ({}), got {}",
                self.page_size,
                data.len()
            );
        }

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset >= file_size {
            let new_size = offset + self.page_size as u64;
            self.file
                .set_len(new_size)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().context("Failed to sync")
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / self.page_size as u64) as u32)
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.0 as u64 * self.page_size as u64
    }
}

use crate::access::value::FieldType;
use crate::storage::disk::{validate_page_size, DEFAULT_PAGE_SIZE};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Runtime settings of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub page_size: usize,
    /// Frames in a buffer pool created for this index.
    pub buffer_frames: usize,
    /// Restarts one operation may take before giving up.
    pub max_restarts: u32,
    /// Maximum number of pages in the index file, metadata page included.
    pub page_limit: Option<u32>,
    pub default_fill_factor: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_frames: 256,
            max_restarts: 1000,
            page_limit: None,
            default_fill_factor: 0.8,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.buffer_frames < 8 {
            bail!("buffer_frames must be at least 8, got {}", self.buffer_frames);
        }
        if self.max_restarts == 0 {
            bail!("max_restarts must be positive");
        }
        if let Some(limit) = self.page_limit {
            if limit < 2 {
                bail!("page_limit must leave room for the metadata and root pages");
            }
        }
        validate_fill_factor(self.default_fill_factor)?;
        Ok(())
    }
}

pub fn validate_fill_factor(fill_factor: f64) -> Result<()> {
    if !(fill_factor > 0.0 && fill_factor <= 1.0) {
        bail!("fill factor must be in (0, 1], got {}", fill_factor);
    }
    Ok(())
}

/// Shape of the tuples an index stores. The first `key_field_count` fields
/// are the key; the rest is payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub field_types: Vec<FieldType>,
    pub key_field_count: usize,
}

impl IndexDescriptor {
    pub fn new(field_types: Vec<FieldType>, key_field_count: usize) -> Result<Self> {
        let descriptor = Self {
            field_types,
            key_field_count,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_field_count == 0 || self.key_field_count > self.field_types.len() {
            bail!(
                "key_field_count must be between 1 and {}, got {}",
                self.field_types.len(),
                self.key_field_count
            );
        }
        Ok(())
    }

    pub fn key_types(&self) -> &[FieldType] {
        &self.field_types[..self.key_field_count]
    }

    pub fn field_count(&self) -> usize {
        self.field_types.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = IndexConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.page_limit, None);
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = IndexConfig {
            page_size: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IndexConfig {
            default_fill_factor: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IndexConfig {
            page_limit: Some(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor() -> Result<()> {
        let descriptor = IndexDescriptor::new(vec![FieldType::Utf8, FieldType::Int64], 1)?;
        assert_eq!(descriptor.key_types(), &[FieldType::Utf8]);
        assert_eq!(descriptor.field_count(), 2);

        assert!(IndexDescriptor::new(vec![FieldType::Int32], 0).is_err());
        assert!(IndexDescriptor::new(vec![FieldType::Int32], 2).is_err());
        Ok(())
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Runtime knobs for the storage engine. `Default` sizes the pools for a
/// production process; tests build small explicit configs instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the volume's page files.
    pub data_dir: String,
    /// Number of frames in the single-page buffer pool.
    pub page_buf_frames: usize,
    /// Number of frames in the large-object leaf train pool.
    pub lot_leaf_frames: usize,
    /// Bulk flushing is accepted in the config for compatibility but the
    /// buffer manager refuses to allocate frames while it is on.
    pub use_bulk_flush: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/data/".to_string(),
            page_buf_frames: 1024,
            lot_leaf_frames: 128,
            use_bulk_flush: false,
        }
    }
}

impl StorageConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())
            .with_context(|| format!("config file {}", path.as_ref().display()))?;
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert!(config.page_buf_frames > config.lot_leaf_frames);
        assert!(!config.use_bulk_flush);
    }

    #[test]
    fn test_from_json_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("slotdb_cfg_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"data_dir": "data/x/", "page_buf_frames": 8, "use_bulk_flush": true}"#,
        )?;

        let config = StorageConfig::from_json_file(&path)?;
        assert_eq!(config.data_dir, "data/x/");
        assert_eq!(config.page_buf_frames, 8);
        // omitted fields fall back to defaults
        assert_eq!(config.lot_leaf_frames, 128);
        assert!(config.use_bulk_flush);

        std::fs::remove_file(path)?;
        Ok(())
    }
}

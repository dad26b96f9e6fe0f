use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::FetchError;
use crate::probe::ServerCapability;
use crate::resume::SCHEMA_VERSION;
use crate::storage;

/// Single-stream resume record (`<dest>.resume`). The temp file itself holds the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleStreamRecord {
    pub schema_version: u32,
    pub url: String,
    pub total_size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub bytes_written: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SingleStreamRecord {
    pub fn new(url: &str, cap: &ServerCapability) -> Self {
        let now = storage::unix_timestamp();
        Self {
            schema_version: SCHEMA_VERSION,
            url: url.to_string(),
            total_size: cap.content_length,
            etag: cap.etag.clone(),
            last_modified: cap.last_modified.clone(),
            bytes_written: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>, FetchError> {
        super::load_versioned(path, |r: &Self| r.schema_version)
    }

    pub fn save(&mut self, path: &Path) -> Result<(), FetchError> {
        self.updated_at = storage::unix_timestamp();
        storage::write_json_atomic(path, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin.resume");
        let cap = ServerCapability {
            content_length: Some(42),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            ..ServerCapability::default()
        };
        let mut r = SingleStreamRecord::new("http://h/a.bin", &cap);
        r.bytes_written = 21;
        r.save(&path).unwrap();
        let loaded = SingleStreamRecord::load(&path).unwrap().unwrap();
        assert_eq!(loaded, r);
        assert_eq!(loaded.total_size, Some(42));
    }
}

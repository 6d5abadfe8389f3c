// File system operations for reports and content hashes
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Calculate SHA256 hash of data
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA256 of a file's contents
pub fn hash_file(path: &Path) -> StorageResult<String> {
    let data = fs::read(path)?;
    Ok(calculate_sha256(&data))
}

/// Write a value as pretty JSON, creating parent directories. Returns the SHA256 of the bytes written.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(path, &data)?;
    Ok(calculate_sha256(&data))
}

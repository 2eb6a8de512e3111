mod fs;
mod memory;
mod staged;

use thiserror::Error;

pub use fs::FsFileStore;
pub use memory::MemoryFileStore;
pub use staged::{StagedFiles, unclaimed_name, with_staged_files};

type Result<T> = std::result::Result<T, FileStoreError>;

/// Error type for file storage operations.
#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("I/O error on {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Abstract interface for the storage that holds certificate and CRL files.
pub trait FileStore: Send + Sync {
    /// Save `data` under `name`, replacing any previous content.
    /// Returns the name the file is stored under.
    fn save(&self, name: &str, data: &[u8]) -> Result<String>;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Load the content stored under `name`, if any.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing file is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    fn url(&self, name: &str) -> String;
}

/// Reject names that would escape the storage root.
fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(FileStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

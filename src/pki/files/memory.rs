use std::sync::Arc;

use dashmap::DashMap;

use super::{FileStore, Result, validate_name};

/// An in-memory file store.
///
/// Useful for testing and development.
#[derive(Debug, Default, Clone)]
pub struct MemoryFileStore {
    files: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FileStore for MemoryFileStore {
    fn save(&self, name: &str, data: &[u8]) -> Result<String> {
        validate_name(name)?;
        self.files.insert(name.to_string(), data.to_vec());
        Ok(name.to_string())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.contains_key(name))
    }

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(name).map(|entry| entry.value().clone()))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.files.remove(name);
        Ok(())
    }

    fn url(&self, name: &str) -> String {
        format!("memory:///{name}")
    }
}

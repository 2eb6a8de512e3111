//! File writes that are reverted when the surrounding store transaction fails.

use parking_lot::Mutex;
use tracing::warn;

use super::{FileStore, Result};

#[derive(Debug)]
enum Undo {
    /// The file did not exist before the write.
    Remove(String),
    /// The file held these bytes before the write.
    Restore(String, Vec<u8>),
}

/// A [`FileStore`] view that remembers how to revert every write made
/// through it.
pub struct StagedFiles<'a> {
    inner: &'a dyn FileStore,
    undo: Mutex<Vec<Undo>>,
}

impl<'a> StagedFiles<'a> {
    pub fn new(inner: &'a dyn FileStore) -> Self {
        Self {
            inner,
            undo: Mutex::new(Vec::new()),
        }
    }

    fn remember(&self, name: &str) -> Result<()> {
        let step = match self.inner.load(name)? {
            Some(previous) => Undo::Restore(name.to_string(), previous),
            None => Undo::Remove(name.to_string()),
        };
        self.undo.lock().push(step);
        Ok(())
    }

    /// Revert every write, newest first.
    pub fn rollback(self) {
        let Self { inner, undo } = self;
        for step in undo.into_inner().into_iter().rev() {
            let (name, result) = match step {
                Undo::Remove(name) => {
                    let result = inner.delete(&name);
                    (name, result)
                }
                Undo::Restore(name, previous) => {
                    let result = inner.save(&name, &previous).map(|_| ());
                    (name, result)
                }
            };
            match result {
                Ok(()) => warn!("Reverted file {} after failed transaction", name),
                Err(e) => warn!("Failed to revert file {}: {}", name, e),
            }
        }
    }
}

impl FileStore for StagedFiles<'_> {
    fn save(&self, name: &str, data: &[u8]) -> Result<String> {
        self.remember(name)?;
        self.inner.save(name, data)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        if let Some(previous) = self.inner.load(name)? {
            self.undo
                .lock()
                .push(Undo::Restore(name.to_string(), previous));
        }
        self.inner.delete(name)
    }

    fn url(&self, name: &str) -> String {
        self.inner.url(name)
    }
}

/// Run `f` against staged files, reverting its writes when it fails.
pub fn with_staged_files<T, E, F>(files: &dyn FileStore, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&dyn FileStore) -> std::result::Result<T, E>,
{
    let staged = StagedFiles::new(files);
    let result = f(&staged);
    if result.is_err() {
        staged.rollback();
    }
    result
}

/// `name` when it is free, otherwise `name` with a tag taken from
/// `fingerprint` inserted before the extension.
pub fn unclaimed_name(files: &dyn FileStore, name: &str, fingerprint: &str) -> Result<String> {
    if !files.exists(name)? {
        return Ok(name.to_string());
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains('/') => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let tag = fingerprint.get(..16).unwrap_or(fingerprint);

    let mut candidate = format!("{stem}_{tag}{ext}");
    let mut n = 1;
    while files.exists(&candidate)? {
        n += 1;
        candidate = format!("{stem}_{tag}_{n}{ext}");
    }
    Ok(candidate)
}

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::debug;

use super::{FileStore, FileStoreError, Result, validate_name};

/// Files under a directory on the local filesystem, served from `base_url`.
#[derive(Debug, Clone)]
pub struct FsFileStore {
    root: PathBuf,
    base_url: String,
}

impl FsFileStore {
    pub fn new<P: Into<PathBuf>>(root: P, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            root: root.into(),
            base_url,
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

fn io_error(name: &str) -> impl FnOnce(std::io::Error) -> FileStoreError + '_ {
    move |source| FileStoreError::Io {
        name: name.to_string(),
        source,
    }
}

impl FileStore for FsFileStore {
    fn save(&self, name: &str, data: &[u8]) -> Result<String> {
        let path = self.path(name)?;
        let dir = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&dir).map_err(io_error(name))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_error(name))?;
        tmp.write_all(data).map_err(io_error(name))?;
        tmp.persist(&path).map_err(|e| io_error(name)(e.error))?;
        debug!("Stored {} bytes at {:?}", data.len(), path);
        Ok(name.to_string())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name)?.is_file())
    }

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(name)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(name)(e)),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(name)(e)),
        }
    }

    fn url(&self, name: &str) -> String {
        format!("{}{}", self.base_url, name)
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{StorageBackend, StorageError};

/// Local-directory backend, selected by `file://` bucket URIs. Objects
/// are plain files under the root; writes go through a temp file and
/// rename so readers never observe a half-written object.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(FsBackend { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(StorageError::Io(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }

    fn prepare_write(&self, key: &str) -> Result<(PathBuf, PathBuf), StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        Ok((path, tmp))
    }

    fn commit(path: &Path, tmp: &Path) -> Result<(), StorageError> {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
        fs::rename(tmp, path).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn map_read_err(key: &str, err: io::Error) -> StorageError {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err.to_string())
        }
    }
}

impl StorageBackend for FsBackend {
    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let (path, tmp) = self.prepare_write(key)?;
        fs::write(&tmp, bytes).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::commit(&path, &tmp)
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key)?;
        fs::read(&path).map_err(|e| Self::map_read_err(key, e))
    }

    fn put_file(&self, key: &str, source: &Path) -> Result<(), StorageError> {
        let (path, tmp) = self.prepare_write(key)?;
        fs::copy(source, &tmp).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::commit(&path, &tmp)
    }

    fn get_file(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        fs::copy(&path, dest).map_err(|e| Self::map_read_err(key, e))
    }

    fn size_of(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        let md = fs::metadata(&path).map_err(|e| Self::map_read_err(key, e))?;
        Ok(md.len())
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        // Probe via metadata so a degraded bucket (permissions, bad
        // mount) surfaces as an error instead of reading as absent.
        match fs::metadata(&path) {
            Ok(md) => Ok(md.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let key = key.join("/");
            if key.starts_with(prefix) && !key.ends_with(".tmp") {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

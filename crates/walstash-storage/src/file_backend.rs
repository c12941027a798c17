use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::{BlobStore, BodyReader, ObjectBody, ObjectMeta, Result, StorageError};

/// Blob store on the local filesystem, rooted at the prefix directory.
///
/// Used for `file://` prefixes and as the test backend; keys map directly
/// to paths under the root.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    /// Reject keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::Fatal("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(StorageError::Fatal(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(StorageError::Fatal(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(ObjectMeta {
                        key,
                        size: entry.metadata()?.len(),
                        last_modified: None,
                    });
                }
            }
        }
        Ok(())
    }
}

impl BlobStore for FileStore {
    fn put(&self, key: &str, len: u64, body: &mut dyn ObjectBody) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        let copied = std::io::copy(&mut BodyReader(body).take(len), &mut file)?;
        if copied != len {
            fs::remove_file(&path).ok();
            return Err(StorageError::Fatal(format!(
                "short body for {key}: declared {len} bytes, read {copied}"
            )));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(key)?;
        match fs::File::open(&path) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // A key prefix is not necessarily a directory boundary; list from
        // the deepest enclosing directory and filter.
        let (dir_part, _) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part)?
        };
        let mut all = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&dir, &mut all)?,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        all.retain(|m| m.key.starts_with(prefix));
        Ok(all)
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.resolve(key)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn put_bytes(store: &FileStore, key: &str, data: &[u8]) {
        store
            .put(key, data.len() as u64, &mut Cursor::new(data.to_vec()))
            .unwrap();
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = store();
        put_bytes(&store, "wal_005/AA.lzo", b"hello");
        let mut out = Vec::new();
        store.get("wal_005/AA.lzo").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = store();
        match store.get("absent") {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {}", match other {
                Ok(_) => "Ok".to_string(),
                Err(e) => e.to_string(),
            }),
        }
    }

    #[test]
    fn list_filters_by_key_prefix() {
        let (_dir, store) = store();
        put_bytes(&store, "basebackups_005/base_A_1_backup_stop_sentinel.json", b"{}");
        put_bytes(&store, "basebackups_005/base_A_1/tar_partitions/part_0.tar.lzo", b"x");
        put_bytes(&store, "wal_005/AA.lzo", b"y");

        let keys: Vec<_> = store
            .list("basebackups_005/base_A_1")
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("basebackups_005/base_A_1")));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        put_bytes(&store, "wal_005/AA.lzo", b"y");
        let keys = vec!["wal_005/AA.lzo".to_string(), "wal_005/absent.lzo".to_string()];
        store.delete(&keys).unwrap();
        store.delete(&keys).unwrap();
        assert!(!store.exists("wal_005/AA.lzo").unwrap());
    }

    #[test]
    fn unsafe_keys_rejected() {
        let (_dir, store) = store();
        assert!(store.get("../../etc/passwd").is_err());
        assert!(store.exists("/absolute").is_err());
    }

    #[test]
    fn short_body_fails_put() {
        let (_dir, store) = store();
        let err = store
            .put("k", 10, &mut Cursor::new(b"abc".to_vec()))
            .unwrap_err();
        assert!(err.to_string().contains("short body"));
        assert!(!store.exists("k").unwrap());
    }
}

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::{Backend, Bucket, StoreError};

/// Disk-backed backend
///
/// The whole map is kept in memory and a bincode snapshot is written
/// (to a temporary file, then renamed over the old one) on every
/// successful update. A failed write leaves both disk and memory unchanged.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<Bucket>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let bucket = if path.exists() {
            let bytes = fs::read(&path)?;
            bincode::deserialize(&bytes).map_err(|e| StoreError::Encoding(e.to_string()))?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Bucket::new()
        };
        tracing::debug!(path = %path.display(), entries = bucket.len(), "opened file store");
        Ok(Self {
            path,
            inner: RwLock::new(bucket),
        })
    }

    fn persist(&self, bucket: &Bucket) -> Result<(), StoreError> {
        let bytes = bincode::serialize(bucket).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Backend for FileStore {
    fn view(
        &self,
        f: &mut dyn FnMut(&Bucket) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let inner = self.inner.read();
        f(&inner)
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut Bucket) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let mut staged = inner.clone();
        f(&mut staged)?;
        self.persist(&staged)?;
        *inner = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use super::*;

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("db.bin");

        {
            let store = Store::file(&path).unwrap();
            store
                .scope("pki")
                .update(|tx| {
                    tx.put(b"root", b"pem".to_vec());
                    Ok(())
                })
                .unwrap();
        }

        let store = Store::file(&path).unwrap();
        let value = store.scope("pki").view(|tx| Ok(tx.get(b"root"))).unwrap();
        assert_eq!(value, Some(b"pem".to_vec()));
    }
}

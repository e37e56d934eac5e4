//! On-disk chunk store. Layout under the storage root:
//!   chunks/<file-id-hex>/<chunk-no>   one file per chunk
//!   restored/<file-name>              reassembled restores
//! Used space is tracked in memory and rebuilt by scanning at startup.

use std::fs;
use std::path::{Path, PathBuf};

use burrow_core::{ChunkStore, FileId, StoreError};
use parking_lot::Mutex;

pub struct DiskStore {
    chunks_dir: PathBuf,
    restored_dir: PathBuf,
    capacity: u64,
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    used: u64,
    /// Arrival order of chunks; reclaim evicts oldest-first.
    order: Vec<(FileId, u32)>,
}

impl DiskStore {
    /// Open (or create) a store under `root`, scanning any chunks left by a
    /// previous run so space accounting survives restarts.
    pub fn open(root: &Path, capacity: u64) -> Result<Self, StoreError> {
        let chunks_dir = root.join("chunks");
        let restored_dir = root.join("restored");
        fs::create_dir_all(&chunks_dir)?;
        fs::create_dir_all(&restored_dir)?;

        let mut used = 0u64;
        let mut order = Vec::new();
        for entry in fs::read_dir(&chunks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(file_id) = name.to_str().and_then(FileId::from_hex) else {
                tracing::warn!(dir = %entry.path().display(), "skipping unrecognized chunk directory");
                continue;
            };
            for chunk in fs::read_dir(entry.path())? {
                let chunk = chunk?;
                let Some(chunk_no) = chunk.file_name().to_str().and_then(|s| s.parse().ok())
                else {
                    continue;
                };
                used += chunk.metadata()?.len();
                order.push((file_id, chunk_no));
            }
        }
        order.sort();
        tracing::debug!(chunks = order.len(), used, "chunk store opened");

        Ok(DiskStore {
            chunks_dir,
            restored_dir,
            capacity,
            inner: Mutex::new(DiskInner { used, order }),
        })
    }

    fn chunk_path(&self, file_id: &FileId, chunk_no: u32) -> PathBuf {
        self.chunks_dir.join(file_id.to_string()).join(chunk_no.to_string())
    }
}

impl ChunkStore for DiskStore {
    fn save(&self, file_id: &FileId, chunk_no: u32, body: &[u8]) -> Result<(), StoreError> {
        let path = self.chunk_path(file_id, chunk_no);
        let mut inner = self.inner.lock();

        // Overwriting the same chunk replaces its accounted size.
        let previous = match fs::metadata(&path) {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };
        let net = body.len() as u64;
        let used_after = inner.used - previous.unwrap_or(0) + net;
        if used_after > self.capacity {
            return Err(StoreError::InsufficientSpace {
                needed: net,
                available: self.capacity.saturating_sub(inner.used),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, body)?;
        inner.used = used_after;
        if previous.is_none() {
            inner.order.push((*file_id, chunk_no));
        }
        Ok(())
    }

    fn load(&self, file_id: &FileId, chunk_no: u32) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.chunk_path(file_id, chunk_no)) {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::MissingChunk {
                    file_id: *file_id,
                    chunk_no,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, file_id: &FileId, chunk_no: u32) -> Result<(), StoreError> {
        let path = self.chunk_path(file_id, chunk_no);
        let mut inner = self.inner.lock();
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            // Absent already: deleting twice is a no-op.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(&path)?;
        inner.used = inner.used.saturating_sub(len);
        inner.order.retain(|entry| entry != &(*file_id, chunk_no));
        // Drop the per-file directory once its last chunk is gone.
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    fn available_space(&self) -> u64 {
        self.capacity.saturating_sub(self.inner.lock().used)
    }

    fn used_space(&self) -> u64 {
        self.inner.lock().used
    }

    fn eviction_order(&self) -> Vec<(FileId, u32)> {
        self.inner.lock().order.clone()
    }

    fn store_restored(&self, file_path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        // Restores land under the store root named after the original file;
        // the backed-up path may not exist (or be writable) on this host.
        let name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "restored.bin".to_string());
        fs::write(self.restored_dir.join(name), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(b: u8) -> FileId {
        FileId::from_bytes([b; 32])
    }

    #[test]
    fn save_load_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1 << 20).unwrap();

        store.save(&fid(1), 0, &[1, 2, 3]).unwrap();
        assert_eq!(store.load(&fid(1), 0).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.used_space(), 3);

        store.delete(&fid(1), 0).unwrap();
        assert_eq!(store.used_space(), 0);
        assert!(matches!(
            store.load(&fid(1), 0),
            Err(StoreError::MissingChunk { .. })
        ));
        // Double delete is fine.
        store.delete(&fid(1), 0).unwrap();
    }

    #[test]
    fn capacity_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 10).unwrap();

        store.save(&fid(1), 0, &[0; 8]).unwrap();
        assert!(matches!(
            store.save(&fid(1), 1, &[0; 8]),
            Err(StoreError::InsufficientSpace { .. })
        ));
        // Overwriting the same chunk does not double-count.
        store.save(&fid(1), 0, &[0; 9]).unwrap();
        assert_eq!(store.used_space(), 9);
    }

    #[test]
    fn reopen_rescans_existing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
            store.save(&fid(2), 0, &[5; 100]).unwrap();
            store.save(&fid(2), 1, &[5; 50]).unwrap();
        }
        let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(store.used_space(), 150);
        assert_eq!(store.eviction_order().len(), 2);
        assert_eq!(store.load(&fid(2), 1).unwrap(), vec![5; 50]);
    }

    #[test]
    fn restored_file_lands_under_restored_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
        store
            .store_restored("/somewhere/else/report.pdf", &[9; 4])
            .unwrap();
        let written = fs::read(dir.path().join("restored/report.pdf")).unwrap();
        assert_eq!(written, vec![9; 4]);
    }

    #[test]
    fn eviction_order_is_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
        store.save(&fid(3), 1, &[1]).unwrap();
        store.save(&fid(3), 0, &[1]).unwrap();
        assert_eq!(store.eviction_order(), vec![(fid(3), 1), (fid(3), 0)]);
    }
}

//! Chunk store collaborator: the narrow interface the protocol engine uses
//! for chunk bytes and disk accounting, plus an in-memory store for tests
//! and simulation.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::identity::FileId;

/// On-disk chunk store contract. `save` may be called concurrently for
/// different chunks; duplicate PUTCHUNK handling de-duplicates same-chunk
/// writers before this layer.
pub trait ChunkStore: Send + Sync {
    /// Persist a chunk body. Fails with `InsufficientSpace` when the body
    /// does not fit in the remaining capacity.
    fn save(&self, file_id: &FileId, chunk_no: u32, body: &[u8]) -> Result<(), StoreError>;

    fn load(&self, file_id: &FileId, chunk_no: u32) -> Result<Vec<u8>, StoreError>;

    /// Remove a chunk. Removing an absent chunk is not an error.
    fn delete(&self, file_id: &FileId, chunk_no: u32) -> Result<(), StoreError>;

    fn available_space(&self) -> u64;

    fn used_space(&self) -> u64;

    /// Chunks in the order the store would evict them. The policy is the
    /// store's; the reclaim initiator only walks the list.
    fn eviction_order(&self) -> Vec<(FileId, u32)>;

    /// Persist a fully reassembled file on restore completion.
    fn store_restored(&self, file_path: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("insufficient space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("chunk {chunk_no} of file {file_id} not found")]
    MissingChunk { file_id: FileId, chunk_no: u32 },
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory chunk store. Capacity-accounted like the disk store; eviction
/// order is insertion order.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    capacity: u64,
}

struct MemoryInner {
    chunks: HashMap<(FileId, u32), Vec<u8>>,
    // Insertion order, kept in sync with `chunks`.
    order: Vec<(FileId, u32)>,
    restored: HashMap<String, Vec<u8>>,
    used: u64,
}

impl MemoryStore {
    pub fn new(capacity: u64) -> Self {
        MemoryStore {
            inner: Mutex::new(MemoryInner {
                chunks: HashMap::new(),
                order: Vec::new(),
                restored: HashMap::new(),
                used: 0,
            }),
            capacity,
        }
    }

    /// Restored file bytes, if a restore for `file_path` completed.
    pub fn restored_file(&self, file_path: &str) -> Option<Vec<u8>> {
        self.inner.lock().restored.get(file_path).cloned()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }
}

impl ChunkStore for MemoryStore {
    fn save(&self, file_id: &FileId, chunk_no: u32, body: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (*file_id, chunk_no);
        if inner.chunks.contains_key(&key) {
            return Ok(());
        }
        let needed = body.len() as u64;
        let available = self.capacity.saturating_sub(inner.used);
        if needed > available {
            return Err(StoreError::InsufficientSpace { needed, available });
        }
        inner.used += needed;
        inner.chunks.insert(key, body.to_vec());
        inner.order.push(key);
        Ok(())
    }

    fn load(&self, file_id: &FileId, chunk_no: u32) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock();
        inner
            .chunks
            .get(&(*file_id, chunk_no))
            .cloned()
            .ok_or(StoreError::MissingChunk {
                file_id: *file_id,
                chunk_no,
            })
    }

    fn delete(&self, file_id: &FileId, chunk_no: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (*file_id, chunk_no);
        if let Some(body) = inner.chunks.remove(&key) {
            inner.used = inner.used.saturating_sub(body.len() as u64);
            inner.order.retain(|k| *k != key);
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
        self.inner
            .lock()
            .restored
            .insert(file_path.to_string(), bytes.to_vec());
        Ok(())
    }
}

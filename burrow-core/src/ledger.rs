//! Replication ledger: the per-peer in-memory index every component reads
//! and writes. Each table sits behind its own lock; no operation holds two
//! tables at once, and per-key updates are serialized by the table lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identity::{FileId, PeerId};

/// Unique identifier of a chunk instance anywhere in the system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub chunk_no: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, chunk_no: u32) -> Self {
        ChunkKey { file_id, chunk_no }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}#{}", self.file_id.to_string(), self.chunk_no)
    }
}

/// Replication-tracking record for one chunk. Reporters are the distinct
/// peers confirmed storing it, so duplicate STORED from one sender cannot
/// double-count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub desired_replication: u32,
    reporters: BTreeSet<PeerId>,
    /// Retained only while the chunk is reclaimed but needs redistribution.
    pub body: Option<Vec<u8>>,
}

impl ChunkInfo {
    pub fn new(desired_replication: u32) -> Self {
        ChunkInfo {
            desired_replication,
            reporters: BTreeSet::new(),
            body: None,
        }
    }

    pub fn with_body(desired_replication: u32, body: Vec<u8>) -> Self {
        ChunkInfo {
            desired_replication,
            reporters: BTreeSet::new(),
            body: Some(body),
        }
    }

    pub fn observed(&self) -> u32 {
        self.reporters.len() as u32
    }

    pub fn achieved_desired(&self) -> bool {
        self.observed() >= self.desired_replication
    }

    /// Returns true if the reporter was not already counted.
    pub fn add_reporter(&mut self, peer: PeerId) -> bool {
        self.reporters.insert(peer)
    }

    pub fn remove_reporter(&mut self, peer: PeerId) -> bool {
        self.reporters.remove(&peer)
    }
}

/// A file this peer originated for backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_path: String,
    pub file_id: FileId,
    pub chunk_count: u32,
}

/// Restore in progress for one file: ordered, duplicate-free chunk bodies.
#[derive(Debug, Clone)]
struct RestoreState {
    file_path: String,
    chunk_count: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
}

/// Produced by the ledger when the last missing chunk of a restore arrives.
#[derive(Debug)]
pub struct RestoreCompletion {
    pub file_path: String,
    pub bytes: Vec<u8>,
}

/// Per-peer replication ledger. Created once per process, optionally
/// restored from a snapshot, mutated for the process lifetime.
#[derive(Default)]
pub struct Ledger {
    /// Chunks physically on this peer's disk: file -> chunk numbers.
    stored_index: RwLock<HashMap<FileId, BTreeSet<u32>>>,
    /// Replication table for chunks this peer stores.
    stored_chunks: RwLock<HashMap<ChunkKey, ChunkInfo>>,
    /// Initiator-side STORED tracking for chunks this peer is backing up.
    backed_up_chunks: RwLock<HashMap<ChunkKey, ChunkInfo>>,
    /// Peers known to store chunks of a file this peer originated.
    peers_backing_up: RwLock<HashMap<FileId, BTreeSet<PeerId>>>,
    /// Enhanced only: STORED replies overheard before committing to store.
    pending_confirmations: RwLock<HashMap<ChunkKey, ChunkInfo>>,
    /// Files this peer originated, keyed by local path.
    originated_files: RwLock<HashMap<String, FileRecord>>,
    /// Restore-in-progress flag per chunk: armed false on GETCHUNK receipt,
    /// flipped true when a CHUNK reply is overheard.
    being_restored: RwLock<HashMap<ChunkKey, bool>>,
    /// Restore collections, present only while a restore is active.
    restoring: RwLock<HashMap<FileId, RestoreState>>,
    /// Chunks evicted during reclaim whose degree is unmet elsewhere; the
    /// body is retained so redistribution needs no disk round-trip.
    reclaimed_chunks: RwLock<HashMap<ChunkKey, ChunkInfo>>,
    /// Enhanced delete bookkeeping: holders yet to acknowledge deletion.
    deleted_files: RwLock<HashMap<FileId, BTreeSet<PeerId>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    // ---- backup (initiator side) ----

    /// Register intent to observe STORED replies for a chunk before any
    /// PUTCHUNK is sent, so no reply can arrive before tracking exists.
    pub fn listen_for_stored(&self, key: ChunkKey, desired: u32) {
        self.backed_up_chunks
            .write()
            .entry(key)
            .or_insert_with(|| ChunkInfo::new(desired));
    }

    /// Register a file as being backed up by this peer. Arms the holder set
    /// used by the self-storage guard and by enhanced delete.
    pub fn register_backup(&self, file_id: FileId) {
        self.peers_backing_up.write().entry(file_id).or_default();
    }

    pub fn backed_up_degree(&self, key: &ChunkKey) -> u32 {
        self.backed_up_chunks
            .read()
            .get(key)
            .map(|info| info.observed())
            .unwrap_or(0)
    }

    pub fn add_originated(&self, record: FileRecord) {
        self.originated_files
            .write()
            .insert(record.file_path.clone(), record);
    }

    pub fn originated_by_path(&self, file_path: &str) -> Option<FileRecord> {
        self.originated_files.read().get(file_path).cloned()
    }

    /// Whether this peer originated (or is currently backing up) the file.
    /// A peer never stores chunks of its own files.
    pub fn originates_file(&self, file_id: &FileId) -> bool {
        if self.peers_backing_up.read().contains_key(file_id) {
            return true;
        }
        self.originated_files
            .read()
            .values()
            .any(|r| r.file_id == *file_id)
    }

    pub fn holders_of(&self, file_id: &FileId) -> BTreeSet<PeerId> {
        self.peers_backing_up
            .read()
            .get(file_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop all originator-side state for a file (on delete).
    pub fn remove_originated(&self, file_path: &str) -> Option<FileRecord> {
        let record = self.originated_files.write().remove(file_path)?;
        self.peers_backing_up.write().remove(&record.file_id);
        self.backed_up_chunks
            .write()
            .retain(|key, _| key.file_id != record.file_id);
        Some(record)
    }

    // ---- STORED accounting ----

    /// Record one STORED reply. Updates whichever tables track the chunk:
    /// the initiator's backup table, the holder set when this peer
    /// originated the file, the stored-chunk table for chunks this peer
    /// holds, and (enhanced) the pending-confirmation table.
    pub fn record_stored_ack(&self, key: ChunkKey, sender: PeerId) {
        if let Some(info) = self.backed_up_chunks.write().get_mut(&key) {
            info.add_reporter(sender);
        }
        {
            let mut holders = self.peers_backing_up.write();
            if let Some(set) = holders.get_mut(&key.file_id) {
                set.insert(sender);
                return;
            }
        }
        if let Some(info) = self.stored_chunks.write().get_mut(&key) {
            info.add_reporter(sender);
        }
        if let Some(info) = self.pending_confirmations.write().get_mut(&key) {
            info.add_reporter(sender);
        }
    }

    // ---- stored chunks (responder side) ----

    pub fn has_stored_chunk(&self, key: &ChunkKey) -> bool {
        self.stored_index
            .read()
            .get(&key.file_id)
            .is_some_and(|set| set.contains(&key.chunk_no))
    }

    /// Mark a chunk as stored locally: index entry plus this peer's own
    /// presence in the replication table. Idempotent.
    pub fn add_stored_chunk(&self, key: ChunkKey, desired: u32, self_id: PeerId) {
        self.stored_index
            .write()
            .entry(key.file_id)
            .or_default()
            .insert(key.chunk_no);
        self.stored_chunks
            .write()
            .entry(key)
            .or_insert_with(|| ChunkInfo::new(desired))
            .add_reporter(self_id);
    }

    pub fn stored_chunk_nos(&self, file_id: &FileId) -> Option<BTreeSet<u32>> {
        self.stored_index.read().get(file_id).cloned()
    }

    /// Remove every trace of a stored file (on DELETE). Returns the chunk
    /// numbers that were held, empty if the file was unknown.
    pub fn take_stored_file(&self, file_id: &FileId) -> BTreeSet<u32> {
        let chunk_nos = self
            .stored_index
            .write()
            .remove(file_id)
            .unwrap_or_default();
        self.stored_chunks
            .write()
            .retain(|key, _| key.file_id != *file_id);
        self.reclaimed_chunks
            .write()
            .retain(|key, _| key.file_id != *file_id);
        chunk_nos
    }

    /// Current (observed, desired) replication of a chunk this peer stores.
    pub fn stored_degree(&self, key: &ChunkKey) -> Option<(u32, u32)> {
        self.stored_chunks
            .read()
            .get(key)
            .map(|info| (info.observed(), info.desired_replication))
    }

    /// REMOVED observed for a chunk this peer stores: drop the sender from
    /// the reporter set and return the updated (observed, desired) pair.
    /// `None` when the chunk is not in the stored table.
    pub fn remove_stored_reporter(&self, key: &ChunkKey, sender: PeerId) -> Option<(u32, u32)> {
        let mut table = self.stored_chunks.write();
        let info = table.get_mut(key)?;
        info.remove_reporter(sender);
        Some((info.observed(), info.desired_replication))
    }

    /// Evict a chunk from the stored tables (reclaim). Returns its
    /// replication record with this peer removed from the reporters.
    pub fn evict_stored_chunk(&self, key: &ChunkKey, self_id: PeerId) -> Option<ChunkInfo> {
        {
            let mut index = self.stored_index.write();
            if let Some(set) = index.get_mut(&key.file_id) {
                set.remove(&key.chunk_no);
                if set.is_empty() {
                    index.remove(&key.file_id);
                }
            }
        }
        let mut info = self.stored_chunks.write().remove(key)?;
        info.remove_reporter(self_id);
        Some(info)
    }

    // ---- pending confirmations (enhanced) ----

    pub fn arm_pending_confirmation(&self, key: ChunkKey, desired: u32) {
        self.pending_confirmations
            .write()
            .entry(key)
            .or_insert_with(|| ChunkInfo::new(desired));
    }

    pub fn pending_confirmation_achieved(&self, key: &ChunkKey) -> bool {
        self.pending_confirmations
            .read()
            .get(key)
            .is_some_and(|info| info.achieved_desired())
    }

    // ---- restore ----

    /// Arm the restore-in-progress flag for a chunk (GETCHUNK receipt).
    /// Never downgrades an already-overheard reply back to false.
    pub fn arm_being_restored(&self, key: ChunkKey) {
        self.being_restored.write().entry(key).or_insert(false);
    }

    /// A CHUNK reply for this key is on the wire; any local reply intent,
    /// armed or yet to arm, must be suppressed.
    pub fn mark_chunk_reply_seen(&self, key: ChunkKey) {
        self.being_restored.write().insert(key, true);
    }

    /// Raw restore-in-progress flag: `None` when not armed.
    pub fn being_restored_state(&self, key: &ChunkKey) -> Option<bool> {
        self.being_restored.read().get(key).copied()
    }

    /// True if a CHUNK reply for this key was overheard while armed.
    pub fn chunk_reply_overheard(&self, key: &ChunkKey) -> bool {
        self.being_restored.read().get(key).copied().unwrap_or(false)
    }

    pub fn clear_being_restored(&self, key: &ChunkKey) {
        self.being_restored.write().remove(key);
    }

    pub fn register_restore(&self, file_id: FileId, file_path: String, chunk_count: u32) {
        self.restoring.write().insert(
            file_id,
            RestoreState {
                file_path,
                chunk_count,
                chunks: BTreeMap::new(),
            },
        );
    }

    pub fn is_restoring(&self, file_id: &FileId) -> bool {
        self.restoring.read().contains_key(file_id)
    }

    /// Insert a restored chunk body (deduplicated, ordered by chunk number).
    /// When the collection covers every index in `[0, chunk_count)`, the
    /// restore state is removed (exactly once) and the reassembled bytes
    /// are returned for persistence.
    pub fn add_restored_chunk(
        &self,
        file_id: FileId,
        chunk_no: u32,
        body: Vec<u8>,
    ) -> Option<RestoreCompletion> {
        let completion = {
            let mut restoring = self.restoring.write();
            let state = restoring.get_mut(&file_id)?;
            if chunk_no >= state.chunk_count {
                return None;
            }
            state.chunks.entry(chunk_no).or_insert(body);
            if state.chunks.len() as u32 != state.chunk_count {
                return None;
            }
            let state = restoring.remove(&file_id)?;
            let mut bytes = Vec::new();
            for chunk in state.chunks.into_values() {
                bytes.extend_from_slice(&chunk);
            }
            RestoreCompletion {
                file_path: state.file_path,
                bytes,
            }
        };
        self.being_restored
            .write()
            .retain(|key, _| key.file_id != file_id);
        Some(completion)
    }

    // ---- reclaim ----

    pub fn add_reclaimed_chunk(&self, key: ChunkKey, info: ChunkInfo) {
        self.reclaimed_chunks.write().insert(key, info);
    }

    /// One-shot: a reclaimed chunk is redistributed at most once.
    pub fn take_reclaimed_chunk(&self, key: &ChunkKey) -> Option<ChunkInfo> {
        self.reclaimed_chunks.write().remove(key)
    }

    // ---- enhanced delete bookkeeping ----

    pub fn mark_file_deleted(&self, file_id: FileId, holders: BTreeSet<PeerId>) {
        if holders.is_empty() {
            return;
        }
        self.deleted_files.write().insert(file_id, holders);
    }

    /// Deleted files for which `peer` is still an outstanding holder (used
    /// to replay DELETE when the peer announces itself).
    pub fn deleted_files_held_by(&self, peer: PeerId) -> Vec<FileId> {
        self.deleted_files
            .read()
            .iter()
            .filter(|(_, holders)| holders.contains(&peer))
            .map(|(file_id, _)| *file_id)
            .collect()
    }

    /// Record an ACK_DELETE; the file's bookkeeping is dropped once every
    /// holder has complied.
    pub fn acknowledge_delete(&self, file_id: &FileId, sender: PeerId) {
        let mut deleted = self.deleted_files.write();
        if let Some(holders) = deleted.get_mut(file_id) {
            holders.remove(&sender);
            if holders.is_empty() {
                deleted.remove(file_id);
            }
        }
    }

    // ---- snapshot & inspection ----

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            stored_index: self.stored_index.read().clone(),
            stored_chunks: self.stored_chunks.read().clone(),
            backed_up_chunks: self.backed_up_chunks.read().clone(),
            peers_backing_up: self.peers_backing_up.read().clone(),
            originated_files: self.originated_files.read().clone(),
            reclaimed_chunks: self.reclaimed_chunks.read().clone(),
            deleted_files: self.deleted_files.read().clone(),
        }
    }

    /// Rebuild a ledger from a persisted snapshot. Transient restore state
    /// is intentionally not part of a snapshot.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Ledger {
            stored_index: RwLock::new(snapshot.stored_index),
            stored_chunks: RwLock::new(snapshot.stored_chunks),
            backed_up_chunks: RwLock::new(snapshot.backed_up_chunks),
            peers_backing_up: RwLock::new(snapshot.peers_backing_up),
            pending_confirmations: RwLock::new(HashMap::new()),
            originated_files: RwLock::new(snapshot.originated_files),
            being_restored: RwLock::new(HashMap::new()),
            restoring: RwLock::new(HashMap::new()),
            reclaimed_chunks: RwLock::new(snapshot.reclaimed_chunks),
            deleted_files: RwLock::new(snapshot.deleted_files),
        }
    }

    pub fn report(&self) -> StateReport {
        let originated = self
            .originated_files
            .read()
            .values()
            .map(|r| FileSummary {
                file_path: r.file_path.clone(),
                file_id: r.file_id.to_string(),
                chunk_count: r.chunk_count,
            })
            .collect();
        let stored = self
            .stored_chunks
            .read()
            .iter()
            .map(|(key, info)| ChunkSummary {
                file_id: key.file_id.to_string(),
                chunk_no: key.chunk_no,
                desired_replication: info.desired_replication,
                observed_replication: info.observed(),
            })
            .collect();
        let backed_up = self
            .backed_up_chunks
            .read()
            .iter()
            .map(|(key, info)| ChunkSummary {
                file_id: key.file_id.to_string(),
                chunk_no: key.chunk_no,
                desired_replication: info.desired_replication,
                observed_replication: info.observed(),
            })
            .collect();
        let reclaimed = self
            .reclaimed_chunks
            .read()
            .iter()
            .map(|(key, info)| ChunkSummary {
                file_id: key.file_id.to_string(),
                chunk_no: key.chunk_no,
                desired_replication: info.desired_replication,
                observed_replication: info.observed(),
            })
            .collect();
        let restoring = self
            .restoring
            .read()
            .iter()
            .map(|(file_id, state)| RestoreSummary {
                file_id: file_id.to_string(),
                file_path: state.file_path.clone(),
                received: state.chunks.len() as u32,
                expected: state.chunk_count,
            })
            .collect();
        let deleting = self
            .deleted_files
            .read()
            .iter()
            .map(|(file_id, holders)| DeleteSummary {
                file_id: file_id.to_string(),
                outstanding_holders: holders.iter().map(|p| p.0).collect(),
            })
            .collect();
        StateReport {
            originated,
            stored,
            backed_up,
            reclaimed,
            restoring,
            deleting,
        }
    }
}

/// Serialized image of the durable ledger tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    stored_index: HashMap<FileId, BTreeSet<u32>>,
    stored_chunks: HashMap<ChunkKey, ChunkInfo>,
    backed_up_chunks: HashMap<ChunkKey, ChunkInfo>,
    peers_backing_up: HashMap<FileId, BTreeSet<PeerId>>,
    originated_files: HashMap<String, FileRecord>,
    reclaimed_chunks: HashMap<ChunkKey, ChunkInfo>,
    deleted_files: HashMap<FileId, BTreeSet<PeerId>>,
}

/// Human/CLI-facing dump of the ledger's tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    pub originated: Vec<FileSummary>,
    pub stored: Vec<ChunkSummary>,
    pub backed_up: Vec<ChunkSummary>,
    pub reclaimed: Vec<ChunkSummary>,
    pub restoring: Vec<RestoreSummary>,
    pub deleting: Vec<DeleteSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub file_path: String,
    pub file_id: String,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub file_id: String,
    pub chunk_no: u32,
    pub desired_replication: u32,
    pub observed_replication: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub file_id: String,
    pub file_path: String,
    pub received: u32,
    pub expected: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub file_id: String,
    pub outstanding_holders: Vec<u32>,
}

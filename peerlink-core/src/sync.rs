//! Knowledge sync: incremental change exchange with conflict resolution.
//!
//! A round against one peer: scan the local store for records newer than that peer's watermark,
//! send them as `sync:changes`, receive the peer's own changes in `sync:reply`, resolve conflicts,
//! apply the winners locally and advance the watermark to the round's start time. The responder
//! does the same in one step when it receives `sync:changes`. Tie-breaks are symmetric so both
//! sides pick the same winner.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::event::{ErrorKind, ManagerAction, P2pEvent};
use crate::message::SendOptions;
use crate::protocol::{kinds, PeerId};

/// One note as the local store holds it. Timestamps share the host clock passed to `tick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub id: String,
    pub title: String,
    pub content: String,
    pub updated_at: u64,
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteData {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub note_id: String,
    pub timestamp: u64,
    pub version: u64,
    pub hash: String,
    pub data: NoteData,
    #[serde(default)]
    pub deleted: bool,
}

impl ChangeRecord {
    pub fn from_record(record: &NoteRecord) -> Self {
        ChangeRecord {
            note_id: record.id.clone(),
            timestamp: record.updated_at,
            version: record.version,
            hash: calculate_hash(record),
            data: NoteData {
                title: record.title.clone(),
                content: record.content.clone(),
            },
            deleted: record.deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Both sides edited the note.
    Content,
    /// One side deleted the note, the other edited it.
    Deletion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub note_id: String,
    pub local: ChangeRecord,
    pub remote: ChangeRecord,
    pub conflict_type: ConflictType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LatestWins,
    PreferLocal,
    PreferRemote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub note_id: String,
    pub winner: ChangeRecord,
    pub side: Side,
    pub strategy: ConflictStrategy,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Guard checked under the store's own lock before a sync write lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The stored record still hashes to this value, i.e. nobody edited it since it was read.
    /// An absent record fails the check.
    Unchanged(String),
    /// The stored record, if any, is not newer than the incoming change.
    NotNewer,
}

/// Local change store. Implementations must tolerate concurrent writers (the host keeps editing).
pub trait ChangeStore: Send + Sync {
    /// Every record (tombstones included) with `updated_at > since`.
    fn records_updated_after(&self, since: u64) -> Result<Vec<NoteRecord>, StoreError>;

    fn get(&self, note_id: &str) -> Result<Option<NoteRecord>, StoreError>;

    /// Write a change. Returns false when the stored content already has the same hash.
    /// The stored version never decreases.
    fn upsert(&self, change: &ChangeRecord) -> Result<bool, StoreError>;

    /// Compare-and-set form of [`upsert`](Self::upsert): writes only if `precondition` holds
    /// at write time. Returns false when skipped or unchanged.
    fn upsert_if(&self, change: &ChangeRecord, precondition: &Precondition) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct MemoryChangeStore {
    notes: Mutex<BTreeMap<String, NoteRecord>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local edit by the host application: bumps the version and stamps `updated_at`.
    pub fn write(
        &self,
        note_id: &str,
        title: &str,
        content: &str,
        updated_at: u64,
    ) -> Result<NoteRecord, StoreError> {
        self.edit(note_id, updated_at, |r| {
            r.title = title.to_string();
            r.content = content.to_string();
            r.deleted = false;
        })
    }

    /// Soft delete: the record stays as a tombstone.
    pub fn delete(&self, note_id: &str, updated_at: u64) -> Result<NoteRecord, StoreError> {
        self.edit(note_id, updated_at, |r| r.deleted = true)
    }

    pub fn len(&self) -> usize {
        self.notes.lock().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn edit(
        &self,
        note_id: &str,
        updated_at: u64,
        apply: impl FnOnce(&mut NoteRecord),
    ) -> Result<NoteRecord, StoreError> {
        let mut notes = self.notes.lock().map_err(|_| StoreError::Poisoned)?;
        let record = notes
            .entry(note_id.to_string())
            .or_insert_with(|| NoteRecord {
                id: note_id.to_string(),
                title: String::new(),
                content: String::new(),
                updated_at,
                version: 0,
                deleted: false,
            });
        apply(record);
        record.version += 1;
        record.updated_at = updated_at;
        Ok(record.clone())
    }
}

impl ChangeStore for MemoryChangeStore {
    fn records_updated_after(&self, since: u64) -> Result<Vec<NoteRecord>, StoreError> {
        let notes = self.notes.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(notes
            .values()
            .filter(|r| r.updated_at > since)
            .cloned()
            .collect())
    }

    fn get(&self, note_id: &str) -> Result<Option<NoteRecord>, StoreError> {
        let notes = self.notes.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(notes.get(note_id).cloned())
    }

    fn upsert(&self, change: &ChangeRecord) -> Result<bool, StoreError> {
        let mut notes = self.notes.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(upsert_locked(&mut notes, change))
    }

    fn upsert_if(&self, change: &ChangeRecord, precondition: &Precondition) -> Result<bool, StoreError> {
        let mut notes = self.notes.lock().map_err(|_| StoreError::Poisoned)?;
        let existing = notes.get(&change.note_id);
        let holds = match precondition {
            Precondition::Unchanged(hash) => existing.is_some_and(|r| calculate_hash(r) == *hash),
            Precondition::NotNewer => existing.map_or(true, |r| r.updated_at <= change.timestamp),
        };
        if !holds {
            return Ok(false);
        }
        Ok(upsert_locked(&mut notes, change))
    }
}

fn upsert_locked(notes: &mut BTreeMap<String, NoteRecord>, change: &ChangeRecord) -> bool {
    let version = match notes.get(&change.note_id) {
        Some(existing) if calculate_hash(existing) == change.hash => return false,
        Some(existing) => (existing.version + 1).max(change.version),
        None => change.version,
    };
    notes.insert(
        change.note_id.clone(),
        NoteRecord {
            id: change.note_id.clone(),
            title: change.data.title.clone(),
            content: change.data.content.clone(),
            updated_at: change.timestamp,
            version,
            deleted: change.deleted,
        },
    );
    true
}

/// Content digest over title and body (plus the tombstone flag). Timestamps and versions are
/// left out so equal content always hashes equal.
pub fn calculate_hash(record: &NoteRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.title.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.content.as_bytes());
    if record.deleted {
        hasher.update(b"\0deleted");
    }
    hex::encode(hasher.finalize())
}

/// Changes newer than `since`, one per record, tombstones only when asked for.
pub fn detect_local_changes(
    store: &dyn ChangeStore,
    since: u64,
    include_tombstones: bool,
) -> Result<Vec<ChangeRecord>, StoreError> {
    Ok(store
        .records_updated_after(since)?
        .iter()
        .filter(|r| include_tombstones || !r.deleted)
        .map(ChangeRecord::from_record)
        .collect())
}

/// One conflict per note present on both sides with differing hashes, in remote order.
pub fn detect_conflicts(local: &[ChangeRecord], remote: &[ChangeRecord]) -> Vec<Conflict> {
    let by_id: HashMap<&str, &ChangeRecord> =
        local.iter().map(|c| (c.note_id.as_str(), c)).collect();
    remote
        .iter()
        .filter_map(|r| {
            let l = by_id.get(r.note_id.as_str())?;
            if l.hash == r.hash {
                return None;
            }
            let conflict_type = if l.deleted != r.deleted {
                ConflictType::Deletion
            } else {
                ConflictType::Content
            };
            Some(Conflict {
                note_id: r.note_id.clone(),
                local: (*l).clone(),
                remote: r.clone(),
                conflict_type,
            })
        })
        .collect()
}

/// Latest write wins. Equal timestamps: higher version, then the greater hash.
fn latest(local: &ChangeRecord, remote: &ChangeRecord) -> Side {
    let order = local
        .timestamp
        .cmp(&remote.timestamp)
        .then(local.version.cmp(&remote.version))
        .then_with(|| local.hash.cmp(&remote.hash));
    match order {
        Ordering::Less => Side::Remote,
        _ => Side::Local,
    }
}

pub fn resolve_conflict(conflict: &Conflict, strategy: ConflictStrategy) -> Resolution {
    let side = match strategy {
        ConflictStrategy::LatestWins => latest(&conflict.local, &conflict.remote),
        ConflictStrategy::PreferLocal => Side::Local,
        ConflictStrategy::PreferRemote => Side::Remote,
    };
    let winner = match side {
        Side::Local => conflict.local.clone(),
        Side::Remote => conflict.remote.clone(),
    };
    Resolution {
        note_id: conflict.note_id.clone(),
        winner,
        side,
        strategy,
    }
}

pub fn resolve_conflicts(conflicts: &[Conflict], strategy: ConflictStrategy) -> Vec<Resolution> {
    conflicts
        .iter()
        .map(|c| resolve_conflict(c, strategy))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enable_auto_sync: bool,
    pub sync_interval_ms: u64,
    /// A round with no reply after this long is abandoned.
    pub round_timeout_ms: u64,
    pub include_tombstones: bool,
    pub strategy: ConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_auto_sync: true,
            sync_interval_ms: 30_000,
            round_timeout_ms: 30_000,
            include_tombstones: true,
            strategy: ConflictStrategy::LatestWins,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("bad sync payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Body of `sync:changes` and `sync:reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChanges {
    pub round_id: String,
    pub since: u64,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub rounds_timed_out: u64,
    pub rounds_answered: u64,
    pub changes_sent: u64,
    pub changes_applied: u64,
    pub conflicts: u64,
}

struct Round {
    id: String,
    started_at: u64,
    deadline: u64,
    local_changes: Vec<ChangeRecord>,
}

#[derive(Default)]
struct PeerSync {
    watermark: u64,
    round: Option<Round>,
    rerun: bool,
    next_auto_at: Option<u64>,
}

pub struct SyncManager {
    config: SyncConfig,
    store: Arc<dyn ChangeStore>,
    now_ms: u64,
    peers: HashMap<PeerId, PeerSync>,
    actions: Vec<ManagerAction>,
    stats: SyncStats,
}

impl SyncManager {
    pub fn new(config: SyncConfig, store: Arc<dyn ChangeStore>) -> Self {
        Self {
            config,
            store,
            now_ms: 0,
            peers: HashMap::new(),
            actions: Vec::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn detect_local_changes(&self, since: u64) -> Result<Vec<ChangeRecord>, StoreError> {
        detect_local_changes(self.store.as_ref(), since, self.config.include_tombstones)
    }

    pub fn resolve_conflicts(&self, conflicts: &[Conflict]) -> Vec<Resolution> {
        resolve_conflicts(conflicts, self.config.strategy)
    }

    /// Start tracking a peer; schedules its first automatic round when auto sync is on.
    pub fn add_peer(&mut self, peer: &PeerId) {
        let next = self
            .config
            .enable_auto_sync
            .then(|| self.now_ms + self.config.sync_interval_ms);
        self.peers.entry(peer.clone()).or_insert_with(|| PeerSync {
            next_auto_at: next,
            ..PeerSync::default()
        });
    }

    /// Forget the peer's running round and schedule. The watermark is kept for reconnects.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.round = None;
            state.rerun = false;
            state.next_auto_at = None;
        }
    }

    pub fn watermark(&self, peer: &PeerId) -> u64 {
        self.peers.get(peer).map_or(0, |p| p.watermark)
    }

    pub fn is_syncing(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|p| p.round.is_some())
    }

    /// Start a round with `peer`. Returns false when one is already running; the request is
    /// then queued as a single rerun.
    pub fn trigger_sync(&mut self, peer: &PeerId) -> Result<bool, SyncError> {
        let state = self.peers.entry(peer.clone()).or_default();
        if state.round.is_some() {
            state.rerun = true;
            debug!(peer = %peer, "sync round already running, queued rerun");
            return Ok(false);
        }
        let since = state.watermark;
        let local_changes = self.detect_local_changes(since)?;
        let round_id = uuid::Uuid::new_v4().to_string();
        let body = SyncChanges {
            round_id: round_id.clone(),
            since,
            changes: local_changes.clone(),
        };
        let payload = serde_json::to_value(&body)?;
        self.stats.rounds_started += 1;
        self.stats.changes_sent += local_changes.len() as u64;
        debug!(peer = %peer, since, changes = local_changes.len(), "sync round started");
        if let Some(state) = self.peers.get_mut(peer) {
            state.round = Some(Round {
                id: round_id,
                started_at: self.now_ms,
                deadline: self.now_ms + self.config.round_timeout_ms,
                local_changes,
            });
        }
        self.actions.push(ManagerAction::Send {
            peer: peer.clone(),
            options: SendOptions::of_kind(kinds::SYNC_CHANGES).with_ack().immediate(),
            payload,
        });
        Ok(true)
    }

    /// Handle a `sync:` message from `peer`.
    pub fn handle_message(
        &mut self,
        peer: &PeerId,
        kind: &str,
        payload: Value,
    ) -> Result<(), SyncError> {
        match kind {
            kinds::SYNC_CHANGES => self.answer(peer, serde_json::from_value(payload)?),
            kinds::SYNC_REPLY => self.finish_round(peer, serde_json::from_value(payload)?),
            other => {
                debug!(peer = %peer, kind = other, "ignoring unknown sync message");
                Ok(())
            }
        }
    }

    fn answer(&mut self, peer: &PeerId, body: SyncChanges) -> Result<(), SyncError> {
        let started_at = self.now_ms;
        let since = self.watermark(peer);
        let local_changes = self.detect_local_changes(since)?;
        let (applied, conflicts) = self.apply_remote(peer, &local_changes, &body.changes)?;
        let reply = SyncChanges {
            round_id: body.round_id,
            since,
            changes: local_changes,
        };
        let payload = serde_json::to_value(&reply)?;
        self.stats.changes_sent += reply.changes.len() as u64;
        self.stats.rounds_answered += 1;
        self.actions.push(ManagerAction::Send {
            peer: peer.clone(),
            options: SendOptions::of_kind(kinds::SYNC_REPLY).with_ack().immediate(),
            payload,
        });
        self.advance_watermark(peer, started_at);
        self.actions.push(ManagerAction::Emit(P2pEvent::SyncCompleted {
            peer: peer.clone(),
            applied,
            conflicts,
        }));
        Ok(())
    }

    fn finish_round(&mut self, peer: &PeerId, body: SyncChanges) -> Result<(), SyncError> {
        let round = match self.peers.get_mut(peer) {
            Some(state) if state.round.as_ref().is_some_and(|r| r.id == body.round_id) => {
                state.round.take()
            }
            _ => None,
        };
        let Some(round) = round else {
            debug!(peer = %peer, round = %body.round_id, "reply for unknown sync round");
            return Ok(());
        };
        let result = self.apply_remote(peer, &round.local_changes, &body.changes);
        // The round is over either way; a store failure leaves the watermark where it was.
        let (applied, conflicts) = match result {
            Ok(counts) => counts,
            Err(e) => {
                self.rerun_if_queued(peer)?;
                return Err(e);
            }
        };
        self.advance_watermark(peer, round.started_at);
        self.stats.rounds_completed += 1;
        info!(peer = %peer, applied, conflicts, "sync round completed");
        self.actions.push(ManagerAction::Emit(P2pEvent::SyncCompleted {
            peer: peer.clone(),
            applied,
            conflicts,
        }));
        self.rerun_if_queued(peer)
    }

    /// Resolve and apply the peer's changes against ours. Returns (applied, conflicts).
    fn apply_remote(
        &mut self,
        peer: &PeerId,
        local: &[ChangeRecord],
        remote: &[ChangeRecord],
    ) -> Result<(usize, usize), SyncError> {
        let conflicts = detect_conflicts(local, remote);
        let mut applied = 0;
        for conflict in &conflicts {
            warn!(peer = %peer, note = %conflict.note_id, kind = ?conflict.conflict_type, "sync conflict");
            self.actions.push(ManagerAction::Emit(P2pEvent::SyncConflict {
                peer: peer.clone(),
                conflict: conflict.clone(),
            }));
        }
        // `local` may be a snapshot from when the round started; writes only land on records
        // the host has not touched since.
        for (conflict, resolution) in conflicts.iter().zip(self.resolve_conflicts(&conflicts)) {
            if resolution.side != Side::Remote {
                continue;
            }
            let unchanged = Precondition::Unchanged(conflict.local.hash.clone());
            if self.store.upsert_if(&resolution.winner, &unchanged)? {
                applied += 1;
            } else {
                debug!(peer = %peer, note = %conflict.note_id, "local edit during sync round kept");
            }
        }
        let local_ids: HashMap<&str, ()> = local.iter().map(|c| (c.note_id.as_str(), ())).collect();
        for change in remote.iter().filter(|c| !local_ids.contains_key(c.note_id.as_str())) {
            if self.store.upsert_if(change, &Precondition::NotNewer)? {
                applied += 1;
            }
        }
        self.stats.changes_applied += applied as u64;
        self.stats.conflicts += conflicts.len() as u64;
        Ok((applied, conflicts.len()))
    }

    fn advance_watermark(&mut self, peer: &PeerId, to: u64) {
        let state = self.peers.entry(peer.clone()).or_default();
        state.watermark = state.watermark.max(to);
    }

    fn rerun_if_queued(&mut self, peer: &PeerId) -> Result<(), SyncError> {
        let queued = self
            .peers
            .get_mut(peer)
            .is_some_and(|s| std::mem::take(&mut s.rerun));
        if queued {
            self.trigger_sync(peer)?;
        }
        Ok(())
    }

    /// Advance time: abandon rounds past their timeout, start scheduled automatic rounds.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ManagerAction> {
        self.now_ms = now_ms;

        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| s.round.as_ref().is_some_and(|r| now_ms >= r.deadline))
            .map(|(p, _)| p.clone())
            .collect();
        for peer in expired {
            if let Some(state) = self.peers.get_mut(&peer) {
                state.round = None;
            }
            self.stats.rounds_timed_out += 1;
            warn!(peer = %peer, "sync round timed out");
            self.actions.push(ManagerAction::Emit(P2pEvent::Error {
                kind: ErrorKind::Sync,
                message: format!("sync round with {} timed out", peer),
            }));
            if let Err(e) = self.rerun_if_queued(&peer) {
                self.report(&peer, e);
            }
        }

        let interval = self.config.sync_interval_ms;
        let due: Vec<PeerId> = self
            .peers
            .iter_mut()
            .filter_map(|(p, s)| match s.next_auto_at {
                Some(at) if now_ms >= at => {
                    s.next_auto_at = Some(now_ms + interval);
                    Some(p.clone())
                }
                _ => None,
            })
            .collect();
        for peer in due {
            if let Err(e) = self.trigger_sync(&peer) {
                self.report(&peer, e);
            }
        }

        self.drain_actions()
    }

    pub fn drain_actions(&mut self) -> Vec<ManagerAction> {
        std::mem::take(&mut self.actions)
    }

    /// Cancel all rounds and schedules.
    pub fn stop(&mut self) {
        for state in self.peers.values_mut() {
            state.round = None;
            state.rerun = false;
            state.next_auto_at = None;
        }
    }

    fn report(&mut self, peer: &PeerId, e: SyncError) {
        warn!(peer = %peer, "sync failed: {}", e);
        self.actions.push(ManagerAction::Emit(P2pEvent::Error {
            kind: ErrorKind::Sync,
            message: e.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, content: &str, timestamp: u64, version: u64) -> ChangeRecord {
        ChangeRecord::from_record(&NoteRecord {
            id: id.into(),
            title: "t".into(),
            content: content.into(),
            updated_at: timestamp,
            version,
            deleted: false,
        })
    }

    fn manager(store: Arc<MemoryChangeStore>) -> SyncManager {
        let config = SyncConfig {
            enable_auto_sync: false,
            ..SyncConfig::default()
        };
        SyncManager::new(config, store)
    }

    fn sends(actions: &[ManagerAction]) -> Vec<(String, Value)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ManagerAction::Send {
                    options, payload, ..
                } => Some((options.kind.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hash_is_pure_and_ignores_metadata() {
        let mut r = NoteRecord {
            id: "n".into(),
            title: "Title".into(),
            content: "Body".into(),
            updated_at: 1,
            version: 1,
            deleted: false,
        };
        let h = calculate_hash(&r);
        assert_eq!(h, calculate_hash(&r));
        r.updated_at = 99;
        r.version = 7;
        assert_eq!(h, calculate_hash(&r));
        r.content = "Other".into();
        assert_ne!(h, calculate_hash(&r));
    }

    #[test]
    fn local_changes_after_watermark() {
        let store = MemoryChangeStore::new();
        store.write("a", "A", "x", 100).unwrap();
        store.write("b", "B", "y", 200).unwrap();
        store.delete("a", 300).unwrap();
        let changes = detect_local_changes(&store, 150, false).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].note_id, "b");
        let with_tombstones = detect_local_changes(&store, 150, true).unwrap();
        assert_eq!(with_tombstones.len(), 2);
    }

    #[test]
    fn conflicts_only_on_differing_hashes() {
        let local = vec![change("n", "mine", 1_000, 1)];
        let remote = vec![change("n", "theirs", 2_000, 1), change("m", "new", 5, 1)];
        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].note_id, "n");
        assert_eq!(conflicts[0].conflict_type, ConflictType::Content);

        let same = vec![change("n", "mine", 2_000, 4)];
        assert!(detect_conflicts(&local, &same).is_empty());
    }

    #[test]
    fn latest_wins_by_timestamp() {
        let conflicts = detect_conflicts(
            &[change("n", "mine", 1_000, 1)],
            &[change("n", "theirs", 2_000, 1)],
        );
        let resolutions = resolve_conflicts(&conflicts, ConflictStrategy::LatestWins);
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].winner.timestamp, 2_000);
        assert_eq!(resolutions[0].side, Side::Remote);
        assert_eq!(resolutions[0].strategy, ConflictStrategy::LatestWins);
    }

    #[test]
    fn tie_break_is_symmetric() {
        let a = change("n", "alpha", 1_000, 2);
        let b = change("n", "beta", 1_000, 2);
        let from_a = resolve_conflicts(&detect_conflicts(&[a.clone()], &[b.clone()]), ConflictStrategy::LatestWins);
        let from_b = resolve_conflicts(&detect_conflicts(&[b.clone()], &[a.clone()]), ConflictStrategy::LatestWins);
        assert_eq!(from_a[0].winner, from_b[0].winner);

        let newer_version = change("n", "gamma", 1_000, 3);
        let r = resolve_conflicts(&detect_conflicts(&[a], &[newer_version.clone()]), ConflictStrategy::LatestWins);
        assert_eq!(r[0].winner, newer_version);
    }

    #[test]
    fn deletion_conflict_and_fixed_strategies() {
        let mut gone = change("n", "x", 10, 1);
        gone.deleted = true;
        gone.hash = "deleted".into();
        let conflicts = detect_conflicts(&[change("n", "x", 20, 1)], &[gone]);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Deletion);
        assert_eq!(
            resolve_conflicts(&conflicts, ConflictStrategy::PreferRemote)[0].side,
            Side::Remote
        );
        assert_eq!(
            resolve_conflicts(&conflicts, ConflictStrategy::PreferLocal)[0].side,
            Side::Local
        );
    }

    #[test]
    fn upsert_keeps_version_monotonic() {
        let store = MemoryChangeStore::new();
        for _ in 0..5 {
            store.write("n", "t", "v", 10).unwrap();
        }
        assert_eq!(store.get("n").unwrap().unwrap().version, 5);
        assert!(store.upsert(&change("n", "older copy", 5, 2)).unwrap());
        assert_eq!(store.get("n").unwrap().unwrap().version, 6);
        assert!(store.upsert(&change("n", "newer", 50, 40)).unwrap());
        assert_eq!(store.get("n").unwrap().unwrap().version, 40);
        // Same content again is a no-op.
        assert!(!store.upsert(&change("n", "newer", 60, 41)).unwrap());
        assert_eq!(store.get("n").unwrap().unwrap().version, 40);
    }

    /// Run one full round between two managers by hand-carrying the messages.
    fn exchange(a: &mut SyncManager, b: &mut SyncManager, pa: &PeerId, pb: &PeerId) {
        assert!(a.trigger_sync(pb).unwrap());
        let out = sends(&a.drain_actions());
        assert_eq!(out[0].0, kinds::SYNC_CHANGES);
        b.handle_message(pa, &out[0].0, out[0].1.clone()).unwrap();
        let back = sends(&b.drain_actions());
        assert_eq!(back[0].0, kinds::SYNC_REPLY);
        a.handle_message(pb, &back[0].0, back[0].1.clone()).unwrap();
    }

    #[test]
    fn round_converges_both_stores() {
        let (pa, pb) = (PeerId::from("a"), PeerId::from("b"));
        let store_a = Arc::new(MemoryChangeStore::new());
        let store_b = Arc::new(MemoryChangeStore::new());
        store_a.write("only-a", "A", "from a", 100).unwrap();
        store_b.write("only-b", "B", "from b", 110).unwrap();
        store_a.write("shared", "S", "a edit", 120).unwrap();
        store_b.write("shared", "S", "b edit", 130).unwrap();

        let mut a = manager(store_a.clone());
        let mut b = manager(store_b.clone());
        a.tick(1_000);
        b.tick(1_000);
        exchange(&mut a, &mut b, &pa, &pb);

        for store in [&store_a, &store_b] {
            assert_eq!(store.len(), 3);
            assert_eq!(store.get("shared").unwrap().unwrap().content, "b edit");
            assert_eq!(store.get("only-a").unwrap().unwrap().content, "from a");
            assert_eq!(store.get("only-b").unwrap().unwrap().content, "from b");
        }
        assert_eq!(a.watermark(&pb), 1_000);
        assert_eq!(b.watermark(&pa), 1_000);
        assert_eq!(a.stats().rounds_completed, 1);
        assert_eq!(a.stats().conflicts, 1);
        assert_eq!(b.stats().rounds_answered, 1);
        assert!(!a.is_syncing(&pb));
    }

    #[test]
    fn watermark_limits_next_round() {
        let (pa, pb) = (PeerId::from("a"), PeerId::from("b"));
        let store_a = Arc::new(MemoryChangeStore::new());
        store_a.write("old", "t", "x", 100).unwrap();
        let mut a = manager(store_a.clone());
        let mut b = manager(Arc::new(MemoryChangeStore::new()));
        a.tick(500);
        exchange(&mut a, &mut b, &pa, &pb);
        store_a.write("new", "t", "y", 600).unwrap();
        a.tick(700);
        a.trigger_sync(&pb).unwrap();
        let out = sends(&a.drain_actions());
        let body: SyncChanges = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(body.since, 500);
        assert_eq!(body.changes.len(), 1);
        assert_eq!(body.changes[0].note_id, "new");
    }

    #[test]
    fn remote_only_change_does_not_clobber_newer_local() {
        let store = Arc::new(MemoryChangeStore::new());
        store.write("n", "t", "fresh local", 900).unwrap();
        let mut mgr = manager(store.clone());
        let peer = PeerId::from("b");
        mgr.tick(1_000);
        // Watermark is past the local edit, so "n" is not in our change set.
        mgr.advance_watermark(&peer, 950);
        let body = SyncChanges {
            round_id: "r".into(),
            since: 0,
            changes: vec![change("n", "stale remote", 100, 1)],
        };
        mgr.handle_message(&peer, kinds::SYNC_CHANGES, serde_json::to_value(body).unwrap())
            .unwrap();
        assert_eq!(store.get("n").unwrap().unwrap().content, "fresh local");
    }

    #[test]
    fn overlapping_triggers_queue_one_rerun() {
        let peer = PeerId::from("b");
        let mut mgr = manager(Arc::new(MemoryChangeStore::new()));
        assert!(mgr.trigger_sync(&peer).unwrap());
        assert!(!mgr.trigger_sync(&peer).unwrap());
        assert!(!mgr.trigger_sync(&peer).unwrap());
        let out = sends(&mgr.drain_actions());
        assert_eq!(out.len(), 1);
        let body: SyncChanges = serde_json::from_value(out[0].1.clone()).unwrap();
        let reply = SyncChanges {
            round_id: body.round_id,
            since: 0,
            changes: vec![],
        };
        mgr.handle_message(&peer, kinds::SYNC_REPLY, serde_json::to_value(reply).unwrap())
            .unwrap();
        // Exactly one queued rerun starts right away.
        assert_eq!(sends(&mgr.drain_actions()).len(), 1);
        assert!(mgr.is_syncing(&peer));
        assert_eq!(mgr.stats().rounds_started, 2);
    }

    #[test]
    fn stale_reply_is_ignored() {
        let peer = PeerId::from("b");
        let mut mgr = manager(Arc::new(MemoryChangeStore::new()));
        mgr.trigger_sync(&peer).unwrap();
        let reply = SyncChanges {
            round_id: "someone-else".into(),
            since: 0,
            changes: vec![],
        };
        mgr.handle_message(&peer, kinds::SYNC_REPLY, serde_json::to_value(reply).unwrap())
            .unwrap();
        assert!(mgr.is_syncing(&peer));
    }

    #[test]
    fn round_times_out() {
        let peer = PeerId::from("b");
        let mut mgr = manager(Arc::new(MemoryChangeStore::new()));
        mgr.tick(0);
        mgr.trigger_sync(&peer).unwrap();
        mgr.drain_actions();
        assert!(mgr.tick(29_999).is_empty());
        let actions = mgr.tick(30_000);
        assert!(actions.iter().any(|a| matches!(
            a,
            ManagerAction::Emit(P2pEvent::Error { kind: ErrorKind::Sync, .. })
        )));
        assert!(!mgr.is_syncing(&peer));
        assert_eq!(mgr.stats().rounds_timed_out, 1);
        assert_eq!(mgr.watermark(&peer), 0);
    }

    #[test]
    fn auto_sync_fires_on_interval() {
        let peer = PeerId::from("b");
        let config = SyncConfig {
            sync_interval_ms: 1_000,
            round_timeout_ms: 500,
            ..SyncConfig::default()
        };
        let mut mgr = SyncManager::new(config, Arc::new(MemoryChangeStore::new()));
        mgr.tick(0);
        mgr.add_peer(&peer);
        assert!(sends(&mgr.tick(999)).is_empty());
        assert_eq!(sends(&mgr.tick(1_000)).len(), 1);
        // Round times out at 1_500, next automatic round at 2_000.
        mgr.tick(1_500);
        assert_eq!(sends(&mgr.tick(2_000)).len(), 1);
        mgr.stop();
        assert!(sends(&mgr.tick(10_000)).is_empty());
    }

    #[test]
    fn local_edit_during_round_survives_older_remote_winner() {
        let peer = PeerId::from("b");
        let store = Arc::new(MemoryChangeStore::new());
        store.write("n", "t", "old local", 1_000).unwrap();
        let mut mgr = manager(store.clone());
        mgr.tick(1_500);
        mgr.trigger_sync(&peer).unwrap();
        let out = sends(&mgr.drain_actions());
        let body: SyncChanges = serde_json::from_value(out[0].1.clone()).unwrap();

        // The host keeps editing while the round is in flight.
        store.write("n", "t", "concurrent local", 3_000).unwrap();
        let reply = SyncChanges {
            round_id: body.round_id,
            since: 0,
            changes: vec![change("n", "remote", 2_000, 1)],
        };
        mgr.handle_message(&peer, kinds::SYNC_REPLY, serde_json::to_value(reply).unwrap())
            .unwrap();

        let note = store.get("n").unwrap().unwrap();
        assert_eq!(note.content, "concurrent local");
        assert_eq!(note.updated_at, 3_000);
        assert_eq!(mgr.stats().conflicts, 1);
        assert_eq!(mgr.stats().changes_applied, 0);
        // The kept edit is past the new watermark, so the next round carries it.
        assert!(mgr.watermark(&peer) < 3_000);
    }

    #[test]
    fn remote_winner_applies_when_local_is_untouched() {
        let store = MemoryChangeStore::new();
        let local = store.write("n", "t", "old local", 1_000).unwrap();
        let snapshot = ChangeRecord::from_record(&local);
        let winner = change("n", "remote", 2_000, 1);
        let guard = Precondition::Unchanged(snapshot.hash.clone());
        assert!(store.upsert_if(&winner, &guard).unwrap());
        assert_eq!(store.get("n").unwrap().unwrap().content, "remote");
        // Hash no longer matches the snapshot.
        assert!(!store.upsert_if(&change("n", "again", 3_000, 1), &guard).unwrap());
        assert!(!store
            .upsert_if(&change("absent", "x", 1, 1), &Precondition::Unchanged(snapshot.hash))
            .unwrap());
        assert!(!store
            .upsert_if(&change("n", "stale", 10, 1), &Precondition::NotNewer)
            .unwrap());
        assert!(store
            .upsert_if(&change("fresh", "x", 10, 1), &Precondition::NotNewer)
            .unwrap());
    }

    #[test]
    fn unknown_sync_kinds_are_ignored_whatever_the_payload() {
        let mut mgr = manager(Arc::new(MemoryChangeStore::new()));
        mgr.handle_message(&PeerId::from("b"), "sync:presence", Value::from("hello"))
            .unwrap();
        assert!(mgr.drain_actions().is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut mgr = manager(Arc::new(MemoryChangeStore::new()));
        let r = mgr.handle_message(&PeerId::from("b"), kinds::SYNC_CHANGES, Value::from(3));
        assert!(matches!(r, Err(SyncError::Payload(_))));
    }
}

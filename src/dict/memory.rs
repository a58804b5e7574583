//! In-memory dictionary backend
//!
//! BTreeMap-based dictionary with RwLock for concurrency.
//!
//! ## Layout
//! - `shared/...` keys live in one table visible to everybody
//! - `priv/...` keys live in one table per user
//!
//! Lookups and commits complete immediately, invoking their callback before
//! returning. Iterations created with `IterateFlags::ASYNC` release rows in
//! batches and fire the iterator callback for each batch, which is how
//! network-backed drivers behave.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::protocol::is_private_key;
use super::{
    CommitCallback, CommitResult, Dict, DictIterator, DictRow, DictTransaction, IterateCallback,
    IterateFlags, LookupCallback, LookupResult, OpSettings, Timestamp,
};

/// A stored value
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    written_at: Timestamp,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct DictData {
    shared: BTreeMap<Vec<u8>, Entry>,
    private: HashMap<String, BTreeMap<Vec<u8>, Entry>>,
}

impl DictData {
    /// Table holding `key`; `None` if it is a private key of an unknown user
    fn table(&self, key: &[u8], user: Option<&str>) -> Option<&BTreeMap<Vec<u8>, Entry>> {
        if is_private_key(key) {
            user.and_then(|u| self.private.get(u))
        } else {
            Some(&self.shared)
        }
    }

    /// Table holding `key`; `None` if it is a private key without a user
    fn table_mut(&mut self, key: &[u8], user: Option<&str>) -> Option<&mut BTreeMap<Vec<u8>, Entry>> {
        if is_private_key(key) {
            user.map(|u| self.private.entry(u.to_string()).or_default())
        } else {
            Some(&mut self.shared)
        }
    }

    fn get_live(&self, key: &[u8], user: Option<&str>, now: Instant) -> Option<&Entry> {
        self.table(key, user)?.get(key).filter(|e| e.is_live(now))
    }
}

fn private_key_error(key: &[u8]) -> String {
    format!("Private key {} requires username", String::from_utf8_lossy(key))
}

/// In-memory dictionary backend
pub struct MemoryDict {
    data: Arc<RwLock<DictData>>,
    batch_size: usize,
}

impl MemoryDict {
    /// Create a new empty dictionary
    pub fn new() -> Self {
        Self::with_batch_size(64)
    }

    /// Create a dictionary whose async iterations release `batch_size` rows at a time
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(DictData::default())),
            batch_size: batch_size.max(1),
        }
    }

    /// Store a value directly, bypassing transactions
    pub fn insert(&self, key: &[u8], value: &[u8], user: Option<&str>) -> bool {
        let mut data = self.data.write();
        match data.table_mut(key, user) {
            Some(table) => {
                table.insert(
                    key.to_vec(),
                    Entry {
                        value: value.to_vec(),
                        expires_at: None,
                        written_at: Timestamp::now(),
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Read a live value directly
    pub fn get(&self, key: &[u8], user: Option<&str>) -> Option<Vec<u8>> {
        let data = self.data.read();
        data.get_live(key, user, Instant::now()).map(|e| e.value.clone())
    }

    /// Timestamp recorded for a live value
    pub fn written_at(&self, key: &[u8], user: Option<&str>) -> Option<Timestamp> {
        let data = self.data.read();
        data.get_live(key, user, Instant::now()).map(|e| e.written_at)
    }

    /// Number of stored entries across all namespaces (expired ones included)
    pub fn entry_count(&self) -> usize {
        let data = self.data.read();
        data.shared.len() + data.private.values().map(BTreeMap::len).sum::<usize>()
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

impl Default for MemoryDict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict for MemoryDict {
    fn lookup_async(&self, set: &OpSettings, key: &[u8], callback: LookupCallback) {
        let result = if is_private_key(key) && set.user().is_none() {
            LookupResult::Failed(private_key_error(key))
        } else {
            let data = self.data.read();
            match data.get_live(key, set.user(), Instant::now()) {
                Some(entry) => LookupResult::Found(vec![entry.value.clone()]),
                None => LookupResult::NotFound,
            }
        };
        callback(result);
    }

    fn iterate_init(&self, set: &OpSettings, path: &[u8], flags: IterateFlags) -> Box<dyn DictIterator> {
        if is_private_key(path) && set.user().is_none() {
            return Box::new(MemoryIterator::failed(private_key_error(path)));
        }

        let now = Instant::now();
        let data = self.data.read();
        let mut rows: Vec<DictRow> = match data.table(path, set.user()) {
            Some(table) => table
                .range(path.to_vec()..)
                .take_while(|(key, _)| key.starts_with(path))
                .filter(|(key, entry)| entry.is_live(now) && path_matches(path, key, flags))
                .map(|(key, entry)| DictRow {
                    key: key.clone(),
                    values: if flags.contains(IterateFlags::NO_VALUE) {
                        Vec::new()
                    } else {
                        vec![entry.value.clone()]
                    },
                })
                .collect(),
            None => Vec::new(),
        };
        drop(data);

        // Keys come out of the BTreeMap sorted already.
        if flags.contains(IterateFlags::SORT_BY_VALUE) && !flags.contains(IterateFlags::NO_VALUE) {
            rows.sort_by(|a, b| a.values.cmp(&b.values));
        }

        Box::new(MemoryIterator::new(
            rows,
            flags.contains(IterateFlags::ASYNC),
            self.batch_size,
        ))
    }

    fn transaction_begin(&self, set: &OpSettings) -> Box<dyn DictTransaction> {
        Box::new(MemoryTransaction {
            data: Arc::clone(&self.data),
            settings: set.clone(),
            changes: Vec::new(),
            timestamp: None,
            hide_log_values: false,
        })
    }
}

/// Whether `key` (already known to start with `path`) is part of the iteration
fn path_matches(path: &[u8], key: &[u8], flags: IterateFlags) -> bool {
    if flags.contains(IterateFlags::EXACT_KEY) {
        return key == path;
    }
    let rest = &key[path.len()..];
    if rest.is_empty() {
        return false;
    }
    flags.contains(IterateFlags::RECURSE) || !rest.contains(&b'/')
}

// =============================================================================
// Iterator
// =============================================================================

/// Iterator over a snapshot of matching rows
pub struct MemoryIterator {
    /// Rows not yet returned, ready or not
    pending: VecDeque<DictRow>,
    /// How many of the front rows in `pending` are available now
    ready: usize,
    batch_size: usize,
    async_mode: bool,
    limit: Option<u64>,
    returned: u64,
    callback: Option<IterateCallback>,
    error: Option<String>,
}

impl MemoryIterator {
    fn new(rows: Vec<DictRow>, async_mode: bool, batch_size: usize) -> Self {
        let ready = if async_mode { 0 } else { rows.len() };
        Self {
            pending: rows.into(),
            ready,
            batch_size,
            async_mode,
            limit: None,
            returned: 0,
            callback: None,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        let mut iter = Self::new(Vec::new(), false, 1);
        iter.error = Some(error);
        iter
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.returned >= limit)
    }

    /// Make the next batch available and tell the consumer about it
    fn release_batch(&mut self) {
        self.ready = self.batch_size.min(self.pending.len());
        if let Some(callback) = self.callback.as_mut() {
            callback();
        }
    }
}

impl DictIterator for MemoryIterator {
    fn set_limit(&mut self, max_rows: u64) {
        self.limit = Some(max_rows);
    }

    fn set_async_callback(&mut self, callback: IterateCallback) {
        self.callback = Some(callback);
        if self.async_mode && self.ready == 0 && !self.pending.is_empty() {
            self.release_batch();
        }
    }

    fn next_row(&mut self) -> Option<DictRow> {
        if self.error.is_some() || self.limit_reached() {
            return None;
        }
        if self.ready == 0 {
            if self.async_mode && !self.pending.is_empty() {
                self.release_batch();
            }
            return None;
        }
        self.ready -= 1;
        self.returned += 1;
        self.pending.pop_front()
    }

    fn has_more(&self) -> bool {
        self.error.is_none() && !self.limit_reached() && !self.pending.is_empty()
    }

    fn deinit(self: Box<Self>) -> Result<(), String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Debug, Clone)]
enum ChangeOp {
    Set(Vec<u8>),
    Unset,
    AtomicInc(i64),
}

#[derive(Debug, Clone)]
struct Change {
    key: Vec<u8>,
    op: ChangeOp,
    timestamp: Option<Timestamp>,
}

/// Write transaction buffering changes until commit
pub struct MemoryTransaction {
    data: Arc<RwLock<DictData>>,
    settings: OpSettings,
    changes: Vec<Change>,
    timestamp: Option<Timestamp>,
    hide_log_values: bool,
}

impl MemoryTransaction {
    fn stage(&mut self, key: &[u8], op: ChangeOp) {
        match &op {
            ChangeOp::Set(value) if !self.hide_log_values => tracing::debug!(
                user = self.settings.user().unwrap_or(""),
                "Staged set {} = {}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ),
            ChangeOp::Set(_) => tracing::debug!(
                user = self.settings.user().unwrap_or(""),
                "Staged set {} = <hidden>",
                String::from_utf8_lossy(key)
            ),
            ChangeOp::Unset => tracing::debug!("Staged unset {}", String::from_utf8_lossy(key)),
            ChangeOp::AtomicInc(diff) => {
                tracing::debug!("Staged atomic_inc {} by {}", String::from_utf8_lossy(key), diff)
            }
        }
        self.changes.push(Change {
            key: key.to_vec(),
            op,
            timestamp: self.timestamp,
        });
    }

    /// Apply all staged changes atomically
    fn apply(&self) -> CommitResult {
        let user = self.settings.user();
        let now = Instant::now();
        let expires_at = (self.settings.expire_secs > 0)
            .then(|| now + Duration::from_secs(u64::from(self.settings.expire_secs)));

        let mut data = self.data.write();
        let mut overlay: BTreeMap<Vec<u8>, Option<Entry>> = BTreeMap::new();
        let mut not_found = false;

        for change in &self.changes {
            if is_private_key(&change.key) && user.is_none() {
                return CommitResult::Failed(private_key_error(&change.key));
            }
            let written_at = change.timestamp.unwrap_or_else(Timestamp::now);
            let current = match overlay.get(&change.key) {
                Some(staged) => staged.clone(),
                None => data.get_live(&change.key, user, now).cloned(),
            };
            let updated = match &change.op {
                ChangeOp::Set(value) => Some(Entry {
                    value: value.clone(),
                    expires_at,
                    written_at,
                }),
                ChangeOp::Unset => None,
                ChangeOp::AtomicInc(diff) => {
                    let Some(entry) = current else {
                        not_found = true;
                        continue;
                    };
                    let number = std::str::from_utf8(&entry.value)
                        .ok()
                        .and_then(|s| s.trim().parse::<i64>().ok());
                    let Some(number) = number else {
                        return CommitResult::Failed(format!(
                            "Key {} value is not a number",
                            String::from_utf8_lossy(&change.key)
                        ));
                    };
                    let Some(sum) = number.checked_add(*diff) else {
                        return CommitResult::Failed(format!(
                            "Key {} counter overflow",
                            String::from_utf8_lossy(&change.key)
                        ));
                    };
                    Some(Entry {
                        value: sum.to_string().into_bytes(),
                        expires_at: entry.expires_at,
                        written_at,
                    })
                }
            };
            overlay.insert(change.key.clone(), updated);
        }

        for (key, entry) in overlay {
            // User presence was checked above, so the table always exists.
            if let Some(table) = data.table_mut(&key, user) {
                match entry {
                    Some(entry) => {
                        table.insert(key, entry);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }

        if not_found {
            CommitResult::NotFound
        } else {
            CommitResult::Ok
        }
    }
}

impl DictTransaction for MemoryTransaction {
    fn settings(&self) -> &OpSettings {
        &self.settings
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.stage(key, ChangeOp::Set(value.to_vec()));
    }

    fn unset(&mut self, key: &[u8]) {
        self.stage(key, ChangeOp::Unset);
    }

    fn atomic_inc(&mut self, key: &[u8], diff: i64) {
        self.stage(key, ChangeOp::AtomicInc(diff));
    }

    fn set_timestamp(&mut self, ts: Timestamp) {
        self.timestamp = Some(ts);
    }

    fn set_hide_log_values(&mut self, hide: bool) {
        self.hide_log_values = hide;
    }

    fn commit_async(self: Box<Self>, callback: CommitCallback) {
        let result = self.apply();
        callback(result);
    }

    fn rollback(self: Box<Self>) {
        tracing::debug!(changes = self.changes.len(), "Transaction rolled back");
    }
}

//! Dictionary Backend Module
//!
//! The narrow interface through which connections reach the storage engine.
//!
//! ## Responsibilities
//! - Asynchronous point lookups
//! - Iterators that may deliver rows in batches, signalling readiness
//! - Write transactions with asynchronous commit
//!
//! Completion callbacks may run on any thread, and they may run before the
//! initiating call returns. Callers must therefore only hand the result off
//! (e.g. into a channel) and never re-enter connection state from inside a
//! callback.

mod memory;

pub use memory::{MemoryDict, MemoryIterator, MemoryTransaction};

use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

/// Settings that scope one backend operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpSettings {
    /// User owning the private namespace; `None` or empty means anonymous
    pub username: Option<String>,

    /// Expiry applied to values written by a transaction (0 = never)
    pub expire_secs: u32,
}

impl OpSettings {
    pub fn for_user(username: Option<String>) -> Self {
        Self {
            username,
            expire_secs: 0,
        }
    }

    /// The username, if one is set and non-empty
    pub fn user(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }
}

bitflags! {
    /// Iteration flags, as sent on the wire
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IterateFlags: u32 {
        /// Descend into all sub-paths instead of only direct children
        const RECURSE = 0x01;
        /// Return rows sorted by key
        const SORT_BY_KEY = 0x02;
        /// Return rows sorted by value
        const SORT_BY_VALUE = 0x04;
        /// Return only keys
        const NO_VALUE = 0x08;
        /// Match only the exact path
        const EXACT_KEY = 0x10;
        /// Deliver rows through the async callback
        const ASYNC = 0x20;
    }
}

/// Write timestamp applied to a transaction's changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub nsecs: u32,
}

impl Timestamp {
    /// The current wall-clock time
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nsecs: d.subsec_nanos(),
            },
            Err(_) => Self { secs: 0, nsecs: 0 },
        }
    }
}

/// Outcome of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// One or more values were found
    Found(Vec<Vec<u8>>),
    NotFound,
    /// The backend failed; the string is never empty
    Failed(String),
}

/// Outcome of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Ok,
    /// A change required an existing key that was missing
    NotFound,
    /// The write may or may not have been applied
    WriteUncertain(String),
    Failed(String),
}

/// One iteration row: key plus zero or more values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictRow {
    pub key: Vec<u8>,
    pub values: Vec<Vec<u8>>,
}

pub type LookupCallback = Box<dyn FnOnce(LookupResult) + Send>;
pub type CommitCallback = Box<dyn FnOnce(CommitResult) + Send>;
pub type IterateCallback = Box<dyn FnMut() + Send>;

/// A key-value dictionary backend
pub trait Dict: Send + Sync {
    /// Look up `key`, reporting through `callback`
    fn lookup_async(&self, set: &OpSettings, key: &[u8], callback: LookupCallback);

    /// Start iterating keys under `path`
    fn iterate_init(&self, set: &OpSettings, path: &[u8], flags: IterateFlags) -> Box<dyn DictIterator>;

    /// Open a write transaction
    fn transaction_begin(&self, set: &OpSettings) -> Box<dyn DictTransaction>;
}

/// An open iteration
pub trait DictIterator {
    /// Stop after `max_rows` rows
    fn set_limit(&mut self, max_rows: u64);

    /// Callback fired whenever more rows become available (ASYNC flag)
    fn set_async_callback(&mut self, callback: IterateCallback);

    /// Next available row; `None` when nothing is ready right now
    fn next_row(&mut self) -> Option<DictRow>;

    /// Whether rows may still arrive later through the callback
    fn has_more(&self) -> bool;

    /// Release the iteration, reporting any error it hit
    fn deinit(self: Box<Self>) -> Result<(), String>;
}

/// An open write transaction
pub trait DictTransaction {
    fn settings(&self) -> &OpSettings;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn unset(&mut self, key: &[u8]);

    fn atomic_inc(&mut self, key: &[u8], diff: i64);

    /// Timestamp for all following changes
    fn set_timestamp(&mut self, ts: Timestamp);

    /// Redact values of following changes in logs
    fn set_hide_log_values(&mut self, hide: bool);

    fn commit_async(self: Box<Self>, callback: CommitCallback);

    fn rollback(self: Box<Self>);
}

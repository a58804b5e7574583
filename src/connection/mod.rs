//! Connection Module
//!
//! One `DictConnection` per client stream. It owns everything the protocol
//! keeps per client and is driven from a single context: request lines and
//! completion events are fed in one at a time, never concurrently.
//!
//! ## Architecture
//! ```text
//!   request line ──► dispatch ──► executor ──► Dict backend
//!                                    │              │ (callback)
//!                                    │              ▼
//!                                    │         Event channel
//!                                    ▼              │
//!                               OutputStream ◄── flow controller
//! ```
//!
//! ## Lifetime
//! The connection is reference counted: the transport holds one reference
//! and every live command holds one more. `destroy` drops the transport's
//! reference; the connection is finished once the last command completes,
//! at which point open transactions are rolled back.

mod commands;
mod flow;
mod transactions;

pub use transactions::{TransactionLookupError, TransactionTable};

use std::fmt::Display;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::Span;

use crate::config::Config;
use crate::dict::{CommitResult, Dict, DictIterator, IterateFlags, LookupResult};
use crate::error::{DictError, Result};
use crate::log_filter::{self, CachedDecision, FilterInput};
use crate::protocol::{CommandKind, WireTime};
use crate::stats::CommandStats;
use crate::stream::OutputStream;

/// Connection-local command identifier (not sent on the wire)
pub type CmdId = u64;

/// Completions and transport notifications delivered to a connection
#[derive(Debug)]
pub enum Event {
    LookupDone { cmd: CmdId, result: LookupResult },
    CommitDone { cmd: CmdId, result: CommitResult },
    /// An iteration has more rows available
    IterateReady { cmd: CmdId },
    /// The output stream has room again
    OutputReady,
}

/// Per-connection settings derived from `Config`
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub dict_name: String,
    pub max_pending_commands: usize,
    pub output_optimal_size: usize,
    pub verbose_proctitle: bool,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dict_name: config.dict_name.clone(),
            max_pending_commands: config.max_pending_commands,
            output_optimal_size: config.output_optimal_size,
            verbose_proctitle: config.verbose_proctitle,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What a command executor did with its command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdOutcome {
    /// Done; any reply is already queued
    Finished,
    /// Completion will arrive later as an `Event`
    Async,
}

// =============================================================================
// Command log context
// =============================================================================

/// Logging context of one command: a span carrying the dict name plus the
/// fields the debug filter matches on
pub(crate) struct CmdLog {
    span: Span,
    dict: String,
    command: &'static str,
    key: Option<String>,
    user: Option<String>,
    prefix: String,
    debug: CachedDecision,
}

impl CmdLog {
    fn new(dict: &str, kind: CommandKind) -> Self {
        let span = tracing::info_span!(
            "dict_cmd",
            dict = %dict,
            cmd = kind.name(),
            key = tracing::field::Empty,
            user = tracing::field::Empty,
        );
        Self {
            span,
            dict: dict.to_string(),
            command: kind.name(),
            key: None,
            user: None,
            prefix: format!("{}: ", kind.name()),
            debug: CachedDecision::default(),
        }
    }

    pub(crate) fn set_key(&mut self, key: &[u8]) {
        let key = String::from_utf8_lossy(key).into_owned();
        self.span.record("key", key.as_str());
        self.key = Some(key);
        self.debug.invalidate();
    }

    pub(crate) fn set_user(&mut self, user: Option<&str>) {
        if let Some(user) = user {
            self.span.record("user", user);
        }
        self.user = user.map(str::to_string);
        self.debug.invalidate();
    }

    /// `"<CMD> <key>: "` or `"<CMD> <key> (user <u>): "`
    pub(crate) fn set_target_prefix(&mut self) {
        let target = match &self.key {
            Some(key) => format!("{} {}", self.command, key),
            None => self.command.to_string(),
        };
        self.prefix = match &self.user {
            Some(user) => format!("{target} (user {user}): "),
            None => format!("{target}: "),
        };
    }

    fn debug_enabled(&mut self) -> bool {
        let input = FilterInput {
            command: Some(self.command),
            dict: Some(&self.dict),
            user: self.user.as_deref(),
            key: self.key.as_deref(),
        };
        self.debug.get(|| log_filter::debug_enabled(&input))
    }

    pub(crate) fn debug(&mut self, dict_event: &'static str, msg: impl Display) {
        if !self.debug_enabled() {
            return;
        }
        let _entered = self.span.enter();
        tracing::debug!(dict_event, "{}{}", self.prefix, msg);
    }

    pub(crate) fn error(&self, dict_event: &'static str, msg: impl Display) {
        let _entered = self.span.enter();
        tracing::error!(dict_event, "{}{}", self.prefix, msg);
    }

    /// Log a malformed-input failure and turn it into a protocol error
    pub(crate) fn broken_input(&self, msg: impl Into<String>) -> DictError {
        let msg = msg.into();
        self.error("dict_server_cmd_failed", &msg);
        DictError::Protocol(msg)
    }
}

// =============================================================================
// Command
// =============================================================================

/// One in-flight command
pub(crate) struct Cmd {
    pub(crate) id: CmdId,
    pub(crate) kind: CommandKind,
    pub(crate) start: WireTime,
    pub(crate) log: CmdLog,
    /// Terminal reply body, set right before it is written
    pub(crate) reply: Option<Vec<u8>>,
    /// 0 until an async id has been assigned
    pub(crate) async_reply_id: u32,
    pub(crate) iter: Option<Box<dyn DictIterator>>,
    pub(crate) iter_flags: IterateFlags,
    /// Transaction id echoed in the commit reply
    pub(crate) trans_id: u32,
    pub(crate) rows: u64,
    /// Uncork the output when this command is freed
    pub(crate) uncork_pending: bool,
}

impl Cmd {
    fn new(id: CmdId, kind: CommandKind, dict_name: &str) -> Self {
        Self {
            id,
            kind,
            start: WireTime::now(),
            log: CmdLog::new(dict_name, kind),
            reply: None,
            async_reply_id: 0,
            iter: None,
            iter_flags: IterateFlags::empty(),
            trans_id: 0,
            rows: 0,
            uncork_pending: false,
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Protocol state of one client connection
pub struct DictConnection<O: OutputStream> {
    settings: ConnectionSettings,
    dict: Arc<dyn Dict>,
    output: O,
    stats: Arc<CommandStats>,
    peer: String,

    /// Live asynchronous commands, in arrival order
    cmds: Vec<Cmd>,
    next_cmd_id: CmdId,
    transactions: TransactionTable,
    async_id_counter: u32,

    refcount: usize,
    destroyed: bool,
    /// Iteration output is paused until the output has room
    iter_flush_pending: bool,
    input_halted: bool,

    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl<O: OutputStream> DictConnection<O> {
    /// Create a connection holding the transport's reference
    pub fn new(
        settings: ConnectionSettings,
        dict: Arc<dyn Dict>,
        output: O,
        stats: Arc<CommandStats>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        stats.client_connected();
        Self {
            settings,
            dict,
            output,
            stats,
            peer: "local".to_string(),
            cmds: Vec::new(),
            next_cmd_id: 1,
            transactions: TransactionTable::new(),
            async_id_counter: 0,
            refcount: 1,
            destroyed: false,
            iter_flush_pending: false,
            input_halted: false,
            events_tx,
            events_rx,
        }
    }

    /// Name the peer for log messages
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Process one request line (without its newline)
    ///
    /// An `Err` means the line was malformed; no reply was sent and the
    /// caller decides whether to keep the connection.
    pub fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        if self.destroyed {
            return Err(DictError::ConnectionClosed);
        }
        let result = self.dispatch(line);
        if !self.input_halted && self.cmds.len() >= self.settings.max_pending_commands {
            tracing::debug!(
                peer = %self.peer,
                pending = self.cmds.len(),
                "Too many pending commands, halting input"
            );
            self.input_halted = true;
        }
        result
    }

    /// Handle one completion or transport event
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::LookupDone { cmd, result } => self.lookup_finished(cmd, result),
            Event::CommitDone { cmd, result } => self.commit_finished(cmd, result),
            Event::IterateReady { cmd } => self.iterate_ready(cmd),
            Event::OutputReady => self.output_ready(),
        }
    }

    /// Handle every event already queued; returns how many were handled
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Sender that backends and transports use to reach this connection
    pub fn event_sender(&self) -> Sender<Event> {
        self.events_tx.clone()
    }

    /// Receiver the driving loop waits on
    pub fn events(&self) -> &Receiver<Event> {
        &self.events_rx
    }

    // =========================================================================
    // Lifetime
    // =========================================================================

    /// The transport closed: finish what can be finished and drop the
    /// transport's reference
    ///
    /// Iterations are ended immediately (their final replies are discarded).
    /// Lookups and commits still waiting on the backend keep the connection
    /// alive until their events arrive.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.input_halted = true;
        self.output.close();
        tracing::debug!(
            peer = %self.peer,
            in_flight = self.cmds.len(),
            transactions = self.transactions.len(),
            "Connection destroyed"
        );

        self.cmds_output_more();
        self.process_events();
        self.conn_unref();
    }

    pub(crate) fn conn_ref(&mut self) {
        self.refcount += 1;
    }

    /// Drop a reference; returns whether the connection is still referenced
    pub(crate) fn conn_unref(&mut self) -> bool {
        debug_assert!(self.refcount > 0);
        self.refcount = self.refcount.saturating_sub(1);
        if self.refcount > 0 {
            return true;
        }
        self.teardown();
        false
    }

    /// Last reference gone: nothing can use the open transactions any more
    fn teardown(&mut self) {
        for (id, ctx) in self.transactions.drain() {
            tracing::debug!(peer = %self.peer, id, "Rolling back unfinished transaction");
            ctx.rollback();
        }
        tracing::debug!(peer = %self.peer, "Connection finished");
    }

    fn input_resume(&mut self) {
        if self.input_halted && self.cmds.len() < self.settings.max_pending_commands {
            self.input_halted = false;
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// All references released; the driver may drop the connection
    pub fn is_finished(&self) -> bool {
        self.refcount == 0
    }

    /// Whether the driver should deliver more request lines
    pub fn wants_input(&self) -> bool {
        !self.destroyed && !self.input_halted
    }

    /// Iteration output waits for the stream to drain
    pub fn iter_flush_pending(&self) -> bool {
        self.iter_flush_pending
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// Number of live asynchronous commands
    pub fn pending_commands(&self) -> usize {
        self.cmds.len()
    }

    pub fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    pub fn has_transaction(&self, id: u32) -> bool {
        self.transactions.contains(id)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn cmd_index(&self, id: CmdId) -> Option<usize> {
        self.cmds.iter().position(|cmd| cmd.id == id)
    }
}

impl<O: OutputStream> Drop for DictConnection<O> {
    fn drop(&mut self) {
        // Iterations must be released even when the driver gives up early.
        for cmd in self.cmds.drain(..) {
            if let Some(iter) = cmd.iter {
                if let Err(error) = iter.deinit() {
                    cmd.log.error("dict_server_iteration_finished", format!("dict_iterate() failed: {error}"));
                }
            }
        }
        for (_, ctx) in self.transactions.drain() {
            ctx.rollback();
        }
        self.stats.client_disconnected();
    }
}

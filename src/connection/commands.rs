//! Command dispatch and executors
//!
//! Each request line becomes a `Cmd`. Executors validate the arguments and
//! call into the backend. Malformed input is reported as a protocol error
//! without any reply; backend failures on well-formed requests become FAIL
//! replies later.

use std::str::FromStr;

use crate::dict::{CommitResult, IterateFlags, LookupResult, OpSettings, Timestamp};
use crate::error::{DictError, Result};
use crate::protocol::escape::tab_escape_into;
use crate::protocol::{
    append_timings, encode_async_id, encode_async_reply, encode_failure, encode_lookup_values,
    is_private_key, parse_command_line, CommandKind, ReplyStatus, WireTime,
};
use crate::stats::StatKind;
use crate::stream::OutputStream;
use super::{Cmd, CmdId, CmdLog, CmdOutcome, DictConnection, Event, TransactionLookupError};

// =============================================================================
// Argument parsing
// =============================================================================

/// Unsigned decimal without sign or whitespace
fn parse_unsigned<T: FromStr>(arg: &[u8]) -> Option<T> {
    if arg.is_empty() || !arg.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/// Decimal with an optional leading '-'
fn parse_signed<T: FromStr>(arg: &[u8]) -> Option<T> {
    let digits = arg.strip_prefix(b"-").unwrap_or(arg);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_bool(arg: &[u8]) -> Option<bool> {
    match arg.to_ascii_lowercase().as_slice() {
        b"yes" | b"y" | b"true" | b"1" => Some(true),
        b"no" | b"n" | b"false" | b"0" => Some(false),
        _ => None,
    }
}

/// Optional username argument; empty means none
fn parse_username(arg: Option<&Vec<u8>>) -> std::result::Result<Option<String>, ()> {
    match arg {
        None => Ok(None),
        Some(arg) if arg.is_empty() => Ok(None),
        Some(arg) => String::from_utf8(arg.clone()).map(Some).map_err(|_| ()),
    }
}

impl<O: OutputStream> DictConnection<O> {
    // =========================================================================
    // Dispatch
    // =========================================================================

    pub(crate) fn dispatch(&mut self, line: &[u8]) -> Result<()> {
        let (kind, args) = parse_command_line(line).map_err(|e| {
            tracing::error!(peer = %self.peer, "{}", e);
            e
        })?;

        let mut cmd = Cmd::new(self.next_cmd_id, kind, &self.settings.dict_name);
        self.next_cmd_id += 1;
        self.conn_ref();

        let outcome = match kind {
            CommandKind::Lookup => self.cmd_lookup(&mut cmd, &args),
            CommandKind::Iterate => self.cmd_iterate(&mut cmd, &args),
            CommandKind::Begin => self.cmd_begin(&mut cmd, &args),
            CommandKind::Commit => self.cmd_commit(&mut cmd, &args),
            CommandKind::Rollback => self.cmd_rollback(&mut cmd, &args),
            CommandKind::Set => self.cmd_set(&mut cmd, &args),
            CommandKind::Unset => self.cmd_unset(&mut cmd, &args),
            CommandKind::AtomicInc => self.cmd_atomic_inc(&mut cmd, &args),
            CommandKind::Timestamp => self.cmd_timestamp(&mut cmd, &args),
            CommandKind::HideLogValues => self.cmd_hide_log_values(&mut cmd, &args),
        };

        match outcome {
            Ok(CmdOutcome::Async) => {
                let streams_rows = cmd.iter.is_some();
                self.cmds.push(cmd);
                if streams_rows {
                    self.cmds_try_output_more();
                }
                Ok(())
            }
            Ok(CmdOutcome::Finished) => {
                self.cmd_free(cmd);
                Ok(())
            }
            Err(e) => {
                self.cmd_free(cmd);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Command lifecycle
    // =========================================================================

    /// Assign the next async id and announce it
    pub(crate) fn cmd_async(&mut self, cmd: &mut Cmd) {
        debug_assert_eq!(cmd.async_reply_id, 0);
        self.async_id_counter = self.async_id_counter.wrapping_add(1);
        if self.async_id_counter == 0 {
            self.async_id_counter = 1;
        }
        cmd.async_reply_id = self.async_id_counter;
        self.output.send(&encode_async_id(cmd.async_reply_id));
    }

    /// Write the command's terminal reply and free it
    pub(crate) fn cmd_try_flush(&mut self, id: CmdId) {
        let Some(idx) = self.cmd_index(id) else {
            return;
        };
        let cmd = &mut self.cmds[idx];
        debug_assert!(cmd.async_reply_id != 0);
        debug_assert!(cmd.reply.is_some());
        if let Some(reply) = cmd.reply.take() {
            let line = encode_async_reply(cmd.async_reply_id, &reply);
            self.output.send(&line);
        }
        self.cmd_remove(id);
    }

    /// Take the command out of the live set and free it
    pub(crate) fn cmd_remove(&mut self, id: CmdId) {
        match self.cmd_index(id) {
            Some(idx) => {
                let cmd = self.cmds.remove(idx);
                self.cmd_free(cmd);
            }
            None => tracing::error!(peer = %self.peer, cmd = id, "Freeing unknown command"),
        }
    }

    pub(crate) fn cmd_free(&mut self, mut cmd: Cmd) {
        if let Some(iter) = cmd.iter.take() {
            if let Err(error) = iter.deinit() {
                cmd.log.error("dict_server_iteration_finished", format!("dict_iterate() failed: {error}"));
            }
        }
        cmd.reply = None;
        if cmd.uncork_pending {
            self.output.uncork();
        }
        if self.conn_unref() && !self.destroyed {
            self.input_resume();
        }
    }

    /// Append the latency fields to a terminal reply and account for them
    pub(crate) fn append_stats(&self, body: &mut Vec<u8>, start: WireTime, kind: StatKind) {
        let end = WireTime::now();
        if self.settings.verbose_proctitle {
            self.stats.record(kind, end.usecs_since(&start));
        }
        append_timings(body, start, end);
    }

    // =========================================================================
    // LOOKUP <key> [<username>]
    // =========================================================================

    fn cmd_lookup(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let Some(key) = args.first() else {
            return Err(cmd.log.broken_input("LOOKUP: broken input"));
        };
        let username = parse_username(args.get(1))
            .map_err(|_| cmd.log.broken_input("LOOKUP: invalid username"))?;
        if is_private_key(key) && username.is_none() {
            return Err(cmd.log.broken_input("LOOKUP: private dict key requires username"));
        }

        self.cmd_async(cmd);
        cmd.log.set_key(key);
        cmd.log.set_user(username.as_deref());
        cmd.log.set_target_prefix();

        let set = OpSettings::for_user(username);
        let events = self.events_tx.clone();
        let id = cmd.id;
        self.dict.lookup_async(
            &set,
            key,
            Box::new(move |result| {
                let _ = events.send(Event::LookupDone { cmd: id, result });
            }),
        );
        Ok(CmdOutcome::Async)
    }

    pub(crate) fn lookup_finished(&mut self, id: CmdId, result: LookupResult) {
        let Some(idx) = self.cmd_index(id) else {
            tracing::warn!(peer = %self.peer, cmd = id, "Lookup finished for unknown command");
            return;
        };
        let mut body = Vec::with_capacity(128);
        let cmd = &mut self.cmds[idx];
        let start = cmd.start;
        match result {
            LookupResult::Found(values) if !values.is_empty() => {
                encode_lookup_values(&mut body, &values);
                cmd.log.debug("dict_server_lookup_finished", "Lookup finished");
            }
            LookupResult::Found(_) | LookupResult::NotFound => {
                body.push(ReplyStatus::NotFound.marker());
                cmd.log.debug(
                    "dict_server_lookup_finished",
                    "Lookup finished without results (key_not_found=yes)",
                );
            }
            LookupResult::Failed(error) => {
                debug_assert!(!error.is_empty());
                cmd.log.error("dict_server_lookup_finished", format!("Lookup failed: {error}"));
                encode_failure(&mut body, ReplyStatus::Fail, &error);
            }
        }
        self.append_stats(&mut body, start, StatKind::Lookup);
        body.push(b'\n');
        self.cmds[idx].reply = Some(body);
        self.cmd_try_flush(id);
    }

    // =========================================================================
    // ITERATE <flags> <max_rows> <path> [<username>]
    // =========================================================================

    fn cmd_iterate(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let (Some(flags), Some(max_rows), Some(path)) = (
            args.first().and_then(|a| parse_unsigned::<u32>(a)),
            args.get(1).and_then(|a| parse_unsigned::<u64>(a)),
            args.get(2),
        ) else {
            return Err(cmd.log.broken_input("ITERATE: broken input"));
        };
        let username = parse_username(args.get(3))
            .map_err(|_| cmd.log.broken_input("ITERATE: invalid username"))?;
        if is_private_key(path) && username.is_none() {
            return Err(cmd.log.broken_input("ITERATE: private dict key requires username"));
        }

        self.cmd_async(cmd);
        // Rows are always pulled through the callback, whatever the client asked.
        let flags = IterateFlags::from_bits_retain(flags) | IterateFlags::ASYNC;
        cmd.log.set_key(path);
        cmd.log.set_user(username.as_deref());
        cmd.log.set_target_prefix();

        let set = OpSettings::for_user(username);
        let mut iter = self.dict.iterate_init(&set, path, flags);
        if max_rows > 0 {
            iter.set_limit(max_rows);
        }
        let events = self.events_tx.clone();
        let id = cmd.id;
        iter.set_async_callback(Box::new(move || {
            let _ = events.send(Event::IterateReady { cmd: id });
        }));
        cmd.iter = Some(iter);
        cmd.iter_flags = flags;
        Ok(CmdOutcome::Async)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Resolve the transaction id argument of a command
    fn transaction_id(&self, cmd: &Cmd, arg: Option<&[u8]>) -> Result<u32> {
        let name = cmd.kind.name();
        let Some(arg) = arg else {
            return Err(cmd.log.broken_input(format!("{name}: broken input")));
        };
        let Some(id) = parse_unsigned::<u32>(arg) else {
            return Err(cmd.log.broken_input(format!(
                "Invalid transaction ID {}",
                String::from_utf8_lossy(arg)
            )));
        };
        if !self.transactions.contains(id) {
            return Err(cmd.log.broken_input(format!("Transaction ID {id} doesn't exist")));
        }
        Ok(id)
    }

    fn lookup_error(log: &CmdLog, id: u32, error: TransactionLookupError) -> DictError {
        match error {
            TransactionLookupError::Missing => {
                log.broken_input(format!("Transaction ID {id} doesn't exist"))
            }
            TransactionLookupError::Committing => {
                log.broken_input(format!("Transaction ID {id} is being committed"))
            }
        }
    }

    /// BEGIN <id> [<username> [<expire_secs>]]
    fn cmd_begin(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let Some(id_arg) = args.first() else {
            return Err(cmd.log.broken_input("BEGIN: broken input"));
        };
        let id = match parse_unsigned::<u32>(id_arg) {
            Some(id) if id != 0 => id,
            _ => {
                return Err(cmd.log.broken_input(format!(
                    "Invalid transaction ID {}",
                    String::from_utf8_lossy(id_arg)
                )))
            }
        };
        let username = parse_username(args.get(1))
            .map_err(|_| cmd.log.broken_input("BEGIN: invalid username"))?;
        let expire_secs = match args.get(2) {
            Some(arg) => parse_unsigned::<u32>(arg).ok_or_else(|| {
                cmd.log.broken_input(format!("Invalid expire_secs {}", String::from_utf8_lossy(arg)))
            })?,
            None => 0,
        };
        if self.transactions.contains(id) {
            return Err(cmd.log.broken_input(format!("Transaction ID {id} already exists")));
        }

        cmd.log.set_user(username.as_deref());
        let set = OpSettings {
            username,
            expire_secs,
        };
        let ctx = self.dict.transaction_begin(&set);
        if let Err(ctx) = self.transactions.insert(id, ctx) {
            ctx.rollback();
            return Err(cmd.log.broken_input(format!("Transaction ID {id} already exists")));
        }
        cmd.log.debug("dict_server_transaction_started", format!("Transaction {id} started"));
        Ok(CmdOutcome::Finished)
    }

    /// COMMIT <id>
    fn cmd_commit(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let trans_id = self.transaction_id(cmd, args.first().map(Vec::as_slice))?;
        let ctx = self
            .transactions
            .take_for_commit(trans_id)
            .map_err(|e| Self::lookup_error(&cmd.log, trans_id, e))?;

        cmd.trans_id = trans_id;
        cmd.log.set_user(ctx.settings().user());
        cmd.log.set_target_prefix();

        self.cmd_async(cmd);
        let events = self.events_tx.clone();
        let id = cmd.id;
        ctx.commit_async(Box::new(move |result| {
            let _ = events.send(Event::CommitDone { cmd: id, result });
        }));
        Ok(CmdOutcome::Async)
    }

    pub(crate) fn commit_finished(&mut self, id: CmdId, result: CommitResult) {
        let Some(idx) = self.cmd_index(id) else {
            tracing::warn!(peer = %self.peer, cmd = id, "Commit finished for unknown command");
            return;
        };
        let cmd = &mut self.cmds[idx];
        let (status, error) = match &result {
            CommitResult::Ok => (ReplyStatus::Ok, None),
            CommitResult::NotFound => (ReplyStatus::NotFound, None),
            CommitResult::WriteUncertain(error) => (ReplyStatus::WriteUncertain, Some(error.as_str())),
            CommitResult::Failed(error) => (ReplyStatus::Fail, Some(error.as_str())),
        };

        let mut body = Vec::with_capacity(64);
        body.push(status.marker());
        body.extend_from_slice(cmd.trans_id.to_string().as_bytes());
        if let Some(error) = error {
            debug_assert!(!error.is_empty());
            body.push(b'\t');
            tab_escape_into(&mut body, error.as_bytes());
        }

        match &result {
            CommitResult::Ok => {
                cmd.log.debug("dict_server_transaction_finished", "Transaction finished")
            }
            CommitResult::NotFound => cmd.log.debug(
                "dict_server_transaction_finished",
                "Transaction finished (key_not_found=yes)",
            ),
            CommitResult::WriteUncertain(error) => cmd.log.error(
                "dict_server_transaction_finished",
                format!("Transaction write uncertain: {error}"),
            ),
            CommitResult::Failed(error) => cmd.log.error(
                "dict_server_transaction_finished",
                format!("Transaction failed: {error}"),
            ),
        }

        let start = cmd.start;
        let trans_id = cmd.trans_id;
        self.append_stats(&mut body, start, StatKind::Commit);
        body.push(b'\n');
        self.cmds[idx].reply = Some(body);

        self.transactions.remove(trans_id);
        self.cmd_try_flush(id);
    }

    /// ROLLBACK <id>
    fn cmd_rollback(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let trans_id = self.transaction_id(cmd, args.first().map(Vec::as_slice))?;
        let user = self
            .transactions
            .get_mut(trans_id)
            .map_err(|e| Self::lookup_error(&cmd.log, trans_id, e))?
            .settings()
            .user()
            .map(str::to_string);
        cmd.log.set_user(user.as_deref());
        if let Some(ctx) = self.transactions.remove(trans_id) {
            ctx.rollback();
        }
        cmd.log.debug("dict_server_transaction_finished", format!("Transaction {trans_id} rolled back"));
        Ok(CmdOutcome::Finished)
    }

    /// Shared validation of the write commands: the transaction must be
    /// open, and private keys need a transaction with a username
    fn write_target(&mut self, cmd: &mut Cmd, id_arg: &[u8], key: Option<&[u8]>) -> Result<u32> {
        let trans_id = self.transaction_id(cmd, Some(id_arg))?;
        let ctx = self
            .transactions
            .get_mut(trans_id)
            .map_err(|e| Self::lookup_error(&cmd.log, trans_id, e))?;
        let user = ctx.settings().user().map(str::to_string);
        if let Some(key) = key {
            if is_private_key(key) && user.is_none() {
                return Err(cmd.log.broken_input(format!(
                    "{}: private dict key requires username",
                    cmd.kind.name()
                )));
            }
        }
        cmd.log.set_user(user.as_deref());
        Ok(trans_id)
    }

    /// SET <id> <key> <value>
    fn cmd_set(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let [id_arg, key, value] = args else {
            return Err(cmd.log.broken_input("SET: broken input"));
        };
        let trans_id = self.write_target(cmd, id_arg, Some(key.as_slice()))?;
        if let Ok(ctx) = self.transactions.get_mut(trans_id) {
            ctx.set(key, value);
        }
        Ok(CmdOutcome::Finished)
    }

    /// UNSET <id> <key>
    fn cmd_unset(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let [id_arg, key] = args else {
            return Err(cmd.log.broken_input("UNSET: broken input"));
        };
        let trans_id = self.write_target(cmd, id_arg, Some(key.as_slice()))?;
        if let Ok(ctx) = self.transactions.get_mut(trans_id) {
            ctx.unset(key);
        }
        Ok(CmdOutcome::Finished)
    }

    /// ATOMIC_INC <id> <key> <diff>
    fn cmd_atomic_inc(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let (id_arg, key, diff) = match args {
            [id_arg, key, diff] => match parse_signed::<i64>(diff) {
                Some(diff) => (id_arg, key, diff),
                None => return Err(cmd.log.broken_input("ATOMIC_INC: broken input")),
            },
            _ => return Err(cmd.log.broken_input("ATOMIC_INC: broken input")),
        };
        let trans_id = self.write_target(cmd, id_arg, Some(key.as_slice()))?;
        if let Ok(ctx) = self.transactions.get_mut(trans_id) {
            ctx.atomic_inc(key, diff);
        }
        Ok(CmdOutcome::Finished)
    }

    /// TIMESTAMP <id> <secs> <nsecs>
    fn cmd_timestamp(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let parsed = match args {
            [id_arg, secs, nsecs] => parse_signed::<i64>(secs)
                .zip(parse_unsigned::<u32>(nsecs).filter(|n| *n < 1_000_000_000))
                .map(|(secs, nsecs)| (id_arg, Timestamp { secs, nsecs })),
            _ => None,
        };
        let Some((id_arg, ts)) = parsed else {
            return Err(cmd.log.broken_input("TIMESTAMP: broken input"));
        };
        let trans_id = self.write_target(cmd, id_arg, None)?;
        if let Ok(ctx) = self.transactions.get_mut(trans_id) {
            ctx.set_timestamp(ts);
        }
        Ok(CmdOutcome::Finished)
    }

    /// HIDE_LOG_VALUES <id> <bool>
    fn cmd_hide_log_values(&mut self, cmd: &mut Cmd, args: &[Vec<u8>]) -> Result<CmdOutcome> {
        let parsed = match args {
            [id_arg, value] => parse_bool(value).map(|hide| (id_arg, hide)),
            _ => None,
        };
        let Some((id_arg, hide)) = parsed else {
            return Err(cmd.log.broken_input("HIDE_LOG_VALUES: broken input"));
        };
        let trans_id = self.write_target(cmd, id_arg, None)?;
        if let Ok(ctx) = self.transactions.get_mut(trans_id) {
            ctx.set_hide_log_values(hide);
        }
        Ok(CmdOutcome::Finished)
    }
}

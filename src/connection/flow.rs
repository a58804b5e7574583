//! Async reply & iteration flow control
//!
//! Iterations are the only commands that can produce a lot of output. Their
//! rows are pulled from the backend and written as long as the output buffer
//! stays below `output_optimal_size`; past that the stream is flushed, and if
//! it cannot drain, iteration output pauses until the transport reports room
//! (`Event::OutputReady`). Rows already pulled are written before pausing,
//! so resuming never skips or repeats a row.
//!
//! Iteration callbacks cork the output around a batch of flushes. If the
//! batch neither finishes a command nor hits backpressure, the uncork is
//! deferred to the moment the iterating command is freed.

use crate::dict::IterateFlags;
use crate::protocol::{encode_failure, encode_iter_row, ReplyStatus};
use crate::stats::StatKind;
use crate::stream::{FlushStatus, OutputStream};
use super::{CmdId, DictConnection};

/// Flush the output if it holds more than `optimal_size` bytes
///
/// Returns false (and arms the flush-pending notification) when the stream
/// could not drain; the caller must stop writing.
fn flush_if_full<O: OutputStream>(output: &mut O, iter_flush_pending: &mut bool, optimal_size: usize) -> bool {
    if output.buffer_used_size() <= optimal_size {
        return true;
    }
    match output.flush() {
        Ok(FlushStatus::Complete) => true,
        Ok(FlushStatus::Partial) | Err(_) => {
            // continue later when there's more space in output buffer
            output.set_flush_pending(true);
            *iter_flush_pending = true;
            false
        }
    }
}

impl<O: OutputStream> DictConnection<O> {
    /// Write out whatever rows the iteration at `idx` has ready
    ///
    /// Returns true once the iteration is over and its terminal reply is set.
    fn iterate_flush(&mut self, idx: usize) -> bool {
        if self.destroyed {
            self.iterate_finish(idx);
            return true;
        }

        let optimal_size = self.settings.output_optimal_size;
        if !flush_if_full(&mut self.output, &mut self.iter_flush_pending, optimal_size) {
            return false;
        }

        let mut line = Vec::with_capacity(256);
        loop {
            let cmd = &mut self.cmds[idx];
            let Some(row) = cmd.iter.as_mut().and_then(|iter| iter.next_row()) else {
                break;
            };
            cmd.rows += 1;

            line.clear();
            if cmd.async_reply_id != 0 {
                line.push(ReplyStatus::AsyncReply.marker());
                line.extend_from_slice(cmd.async_reply_id.to_string().as_bytes());
                line.push(b'\t');
            }
            let values = if cmd.iter_flags.contains(IterateFlags::NO_VALUE) {
                None
            } else {
                Some(row.values.as_slice())
            };
            encode_iter_row(&mut line, &row.key, values);
            self.output.send(&line);

            if !flush_if_full(&mut self.output, &mut self.iter_flush_pending, optimal_size) {
                return false;
            }
        }

        if self.cmds[idx].iter.as_ref().is_some_and(|iter| iter.has_more()) {
            // wait for the next iteration callback
            return false;
        }

        self.iterate_finish(idx);
        true
    }

    /// Release the iteration and build its terminal reply
    fn iterate_finish(&mut self, idx: usize) {
        let destroyed = self.destroyed;
        let cmd = &mut self.cmds[idx];
        let mut body = Vec::with_capacity(64);

        match cmd.iter.take().map(|iter| iter.deinit()) {
            Some(Err(error)) => {
                cmd.log.error(
                    "dict_server_iteration_finished",
                    format!("dict_iterate() failed: {error}"),
                );
                encode_failure(&mut body, ReplyStatus::Fail, &error);
            }
            _ if destroyed => {
                cmd.log.error(
                    "dict_server_iteration_finished",
                    format!("Connection closed after {} rows", cmd.rows),
                );
                encode_failure(&mut body, ReplyStatus::Fail, "Connection closed during iteration");
            }
            _ => {
                let rows = cmd.rows;
                cmd.log.debug(
                    "dict_server_iteration_finished",
                    format!("Iteration finished (rows={rows})"),
                );
            }
        }
        body.push(b'\t');
        body.extend_from_slice(cmd.rows.to_string().as_bytes());

        let start = cmd.start;
        self.append_stats(&mut body, start, StatKind::Iteration);
        body.push(b'\n');
        self.cmds[idx].reply = Some(body);
    }

    /// Give every iterating command a chance to write
    ///
    /// Returns true if a command finished (and was freed); the live set has
    /// changed then and the caller should scan again.
    pub(crate) fn cmds_try_output_more(&mut self) -> bool {
        for idx in 0..self.cmds.len() {
            if self.cmds[idx].iter.is_none() {
                // not an iterator
                continue;
            }
            if self.iterate_flush(idx) {
                let id = self.cmds[idx].id;
                self.cmd_try_flush(id);
                return true;
            }
        }
        false
    }

    /// Keep flushing iterations until none can make progress
    pub(crate) fn cmds_output_more(&mut self) {
        while !self.cmds.is_empty() {
            if !self.cmds_try_output_more() {
                break;
            }
        }
    }

    /// The backend has more rows for iteration `id`
    pub(crate) fn iterate_ready(&mut self, id: CmdId) {
        let Some(idx) = self.cmd_index(id) else {
            // finished through another path already
            return;
        };
        if self.cmds[idx].iter.is_none() {
            return;
        }

        self.conn_ref();
        self.output.cork();
        // Leave the stream corked if we're only waiting for the backend's
        // next batch, so drivers that hand out one row per callback don't
        // cause many tiny writes. Never leave it corked when the output
        // buffer is full.
        self.iter_flush_pending = false;
        self.cmds[idx].uncork_pending = false;
        if self.cmds_try_output_more() {
            self.output.uncork();
        } else if self.iter_flush_pending {
            self.output.uncork();
        } else if let Some(idx) = self.cmd_index(id) {
            self.cmds[idx].uncork_pending = true;
        } else {
            self.output.uncork();
        }
        self.conn_unref();
    }

    /// The transport has room again
    pub(crate) fn output_ready(&mut self) {
        if self.destroyed {
            return;
        }
        match self.output.flush() {
            Err(e) => {
                tracing::warn!(peer = %self.peer, "Output flush failed: {}", e);
                self.destroy();
            }
            Ok(FlushStatus::Partial) => self.output.set_flush_pending(true),
            Ok(FlushStatus::Complete) => {
                self.output.set_flush_pending(false);
                if self.iter_flush_pending {
                    self.output.cork();
                    self.iter_flush_pending = false;
                    self.cmds_output_more();
                    self.output.uncork();
                }
            }
        }
    }
}

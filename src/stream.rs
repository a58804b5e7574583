//! Output Stream Module
//!
//! The transport side a connection writes its replies into.
//!
//! ## Semantics
//! - `send` never blocks: data is buffered and written as room allows
//! - while corked, nothing is written until `uncork` or `flush`
//! - `flush` writes what it can and reports whether the buffer drained
//! - `set_flush_pending(true)` asks the transport to report back (as an
//!   output-ready event) once there is room again

use std::io;

use bytes::{Buf, BytesMut};

/// Result of a non-blocking flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything buffered has been handed to the peer
    Complete,
    /// Some data is still buffered
    Partial,
}

/// Byte stream with cork/uncork batching and backpressure reporting
pub trait OutputStream {
    /// Queue bytes for writing; ignored once the stream is closed
    fn send(&mut self, data: &[u8]);

    fn cork(&mut self);

    /// Stop batching and write out what has been collected
    fn uncork(&mut self);

    fn is_corked(&self) -> bool;

    /// Bytes accepted by `send` but not yet written
    fn buffer_used_size(&self) -> usize;

    fn flush(&mut self) -> io::Result<FlushStatus>;

    fn set_flush_pending(&mut self, pending: bool);

    /// Drop buffered data and ignore all further sends
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// In-process output stream with a controllable write window
///
/// Bytes move from the internal buffer to `written` while the window allows,
/// which lets callers simulate a slow peer deterministically.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    buffer: BytesMut,
    written: Vec<u8>,
    /// Bytes the peer will still accept; `None` is unlimited
    window: Option<usize>,
    corked: bool,
    flush_pending: bool,
    closed: bool,
}

impl MemoryOutput {
    /// An output whose peer accepts everything immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// An output whose peer accepts only `window` bytes until granted more
    pub fn with_window(window: usize) -> Self {
        Self {
            window: Some(window),
            ..Self::default()
        }
    }

    /// Let the peer accept `bytes` more and write what now fits
    pub fn grant(&mut self, bytes: usize) {
        if let Some(window) = self.window.as_mut() {
            *window += bytes;
        }
        self.write_out();
    }

    /// Remove the write window entirely and drain the buffer
    pub fn unthrottle(&mut self) {
        self.window = None;
        self.write_out();
    }

    /// Everything the peer has received so far
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Take the received bytes, leaving the record empty
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    /// Received data split into lines (newline stripped)
    pub fn written_lines(&self) -> Vec<Vec<u8>> {
        self.written
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(<[u8]>::to_vec)
            .collect()
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    fn write_out(&mut self) {
        if self.closed {
            return;
        }
        let n = match self.window {
            Some(window) => window.min(self.buffer.len()),
            None => self.buffer.len(),
        };
        if n == 0 {
            return;
        }
        self.written.extend_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        if let Some(window) = self.window.as_mut() {
            *window -= n;
        }
    }
}

impl OutputStream for MemoryOutput {
    fn send(&mut self, data: &[u8]) {
        if self.closed {
            return;
        }
        self.buffer.extend_from_slice(data);
        if !self.corked {
            self.write_out();
        }
    }

    fn cork(&mut self) {
        self.corked = true;
    }

    fn uncork(&mut self) {
        self.corked = false;
        self.write_out();
    }

    fn is_corked(&self) -> bool {
        self.corked
    }

    fn buffer_used_size(&self) -> usize {
        self.buffer.len()
    }

    fn flush(&mut self) -> io::Result<FlushStatus> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "output closed"));
        }
        self.write_out();
        Ok(if self.buffer.is_empty() {
            FlushStatus::Complete
        } else {
            FlushStatus::Partial
        })
    }

    fn set_flush_pending(&mut self, pending: bool) {
        self.flush_pending = pending;
    }

    fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

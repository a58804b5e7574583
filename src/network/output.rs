//! TCP output stream
//!
//! Replies are collected in a local buffer and handed to a writer thread,
//! which owns the socket's write half. At most `limit` bytes may sit in the
//! writer's queue; whatever does not fit stays in the local buffer and
//! `flush` reports it as partial. Whenever bytes are left behind, or
//! flush-pending is armed, the writer sends `Event::OutputReady` once the
//! queue has drained below half the limit.

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::connection::Event;
use crate::stream::{FlushStatus, OutputStream};

/// State shared between the connection and the writer thread
struct Shared {
    /// Bytes queued to the writer but not yet written to the socket
    queued: AtomicUsize,
    flush_pending: AtomicBool,
    /// Bytes are waiting in the local buffer for room in the queue
    drain_pending: AtomicBool,
    closed: AtomicBool,
    /// The socket failed; nothing more will be written
    failed: AtomicBool,
    low_watermark: usize,
    notifier: Mutex<Option<Sender<Event>>>,
}

impl Shared {
    /// Report room to the connection if it asked for it or has bytes
    /// waiting for the queue
    fn notify_if_drained(&self) {
        if self.queued.load(Ordering::SeqCst) > self.low_watermark {
            return;
        }
        let wanted = self.flush_pending.swap(false, Ordering::SeqCst)
            | self.drain_pending.swap(false, Ordering::SeqCst);
        if !wanted {
            return;
        }
        if let Some(tx) = self.notifier.lock().as_ref() {
            let _ = tx.send(Event::OutputReady);
        }
    }
}

/// `OutputStream` over a TCP socket
pub struct TcpOutput {
    buffer: BytesMut,
    corked: bool,
    limit: usize,
    tx: Option<Sender<Bytes>>,
    writer: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl TcpOutput {
    /// Start the writer thread for `stream`
    ///
    /// `limit` is the high-water mark of the writer queue.
    pub fn spawn(stream: TcpStream, limit: usize, peer: &str) -> io::Result<Self> {
        let limit = limit.max(1);
        let shared = Arc::new(Shared {
            queued: AtomicUsize::new(0),
            flush_pending: AtomicBool::new(false),
            drain_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            low_watermark: limit / 2,
            notifier: Mutex::new(None),
        });
        let (tx, rx) = unbounded::<Bytes>();

        let writer_shared = Arc::clone(&shared);
        let writer_peer = peer.to_string();
        let writer = thread::Builder::new()
            .name("dictkv-writer".to_string())
            .spawn(move || {
                let mut stream = stream;
                for chunk in rx {
                    if writer_shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = stream.write_all(&chunk) {
                        tracing::debug!(peer = %writer_peer, "Write failed: {}", e);
                        writer_shared.failed.store(true, Ordering::SeqCst);
                        // wake the connection so it notices the failure
                        writer_shared.flush_pending.store(true, Ordering::SeqCst);
                        writer_shared.queued.store(0, Ordering::SeqCst);
                        writer_shared.notify_if_drained();
                        break;
                    }
                    writer_shared.queued.fetch_sub(chunk.len(), Ordering::SeqCst);
                    writer_shared.notify_if_drained();
                }
            })?;

        Ok(Self {
            buffer: BytesMut::with_capacity(4096),
            corked: false,
            limit,
            tx: Some(tx),
            writer: Some(writer),
            shared,
        })
    }

    /// Where to deliver `Event::OutputReady`
    pub fn set_notifier(&mut self, tx: Sender<Event>) {
        *self.shared.notifier.lock() = Some(tx);
    }

    /// Bytes still waiting in the writer queue
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Hand as much of the local buffer to the writer as the limit allows
    fn push_out(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let room = self.limit.saturating_sub(self.shared.queued.load(Ordering::SeqCst));
        let n = room.min(self.buffer.len());
        if n > 0 {
            let chunk = self.buffer.split_to(n).freeze();
            self.shared.queued.fetch_add(n, Ordering::SeqCst);
            if tx.send(chunk).is_err() {
                self.shared.failed.store(true, Ordering::SeqCst);
                return;
            }
        }
        if !self.buffer.is_empty() {
            // the rest goes out from output_ready once the writer catches up
            self.shared.drain_pending.store(true, Ordering::SeqCst);
            self.shared.notify_if_drained();
        }
    }

    fn stop_writer(&mut self) {
        self.tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl OutputStream for TcpOutput {
    fn send(&mut self, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.buffer.extend_from_slice(data);
        if !self.corked {
            self.push_out();
        }
    }

    fn cork(&mut self) {
        self.corked = true;
    }

    fn uncork(&mut self) {
        self.corked = false;
        self.push_out();
    }

    fn is_corked(&self) -> bool {
        self.corked
    }

    fn buffer_used_size(&self) -> usize {
        self.buffer.len() + self.shared.queued.load(Ordering::SeqCst)
    }

    fn flush(&mut self) -> io::Result<FlushStatus> {
        if self.shared.failed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket write failed"));
        }
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "output closed"));
        }
        self.push_out();
        Ok(if self.buffer.is_empty() {
            FlushStatus::Complete
        } else {
            FlushStatus::Partial
        })
    }

    fn set_flush_pending(&mut self, pending: bool) {
        self.shared.flush_pending.store(pending, Ordering::SeqCst);
        if pending {
            // the writer may have drained before the flag was set
            self.shared.notify_if_drained();
        }
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.buffer.clear();
        self.tx = None;
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TcpOutput {
    fn drop(&mut self) {
        self.stop_writer();
    }
}

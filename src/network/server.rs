//! TCP Server
//!
//! Accepts connections and runs each one on its own thread.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::dict::Dict;
use crate::error::{DictError, Result};
use crate::stats::CommandStats;
use super::session;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Lets another thread stop a running server
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// TCP server for the dict protocol
pub struct Server {
    config: Config,
    dict: Arc<dyn Dict>,
    listener: TcpListener,
    stats: Arc<CommandStats>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

/// Releases a connection slot when the session thread ends
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server {
    /// Validate the config and bind the listen address
    pub fn bind(config: Config, dict: Arc<dyn Dict>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen_addr).map_err(|e| {
            DictError::Network(format!("Failed to bind {}: {}", config.listen_addr, e))
        })?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            config,
            dict,
            listener,
            stats: Arc::new(CommandStats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound address (useful when listening on port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Process-wide command statistics
    pub fn stats(&self) -> Arc<CommandStats> {
        Arc::clone(&self.stats)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Number of connections currently being served
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the accept loop until shutdown (blocking)
    pub fn run(&self) -> Result<()> {
        tracing::info!(addr = %self.config.listen_addr, dict = %self.config.dict_name, "Server listening");
        let mut last_error = None::<io::ErrorKind>;
        let mut last_title = String::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            if self.config.verbose_proctitle {
                let title = self.stats.proctitle();
                if title != last_title {
                    tracing::info!(target: "dictkv::proctitle", "{}", title);
                    last_title = title;
                }
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    last_error = None;
                    if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
                        tracing::warn!(peer = %addr, "Connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    }
                    stream.set_nonblocking(false)?;
                    self.spawn_session(stream, addr)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
                Err(e) => {
                    if last_error != Some(e.kind()) {
                        tracing::warn!(error = %e, "Accept error");
                    }
                    last_error = Some(e.kind());
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }

        tracing::info!("Server stopped accepting connections");
        Ok(())
    }

    fn spawn_session(&self, stream: std::net::TcpStream, addr: SocketAddr) -> Result<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = SlotGuard(Arc::clone(&self.active));
        let dict = Arc::clone(&self.dict);
        let stats = Arc::clone(&self.stats);
        let config = self.config.clone();

        thread::Builder::new()
            .name("dictkv-conn".to_string())
            .spawn(move || {
                let _guard = guard;
                if let Err(e) = session::serve(stream, dict, &config, stats) {
                    tracing::warn!(peer = %addr, "Connection error: {}", e);
                }
            })?;
        Ok(())
    }
}

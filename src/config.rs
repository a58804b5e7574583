//! Configuration for dictkv
//!
//! Centralized configuration with sensible defaults.

use crate::error::{DictError, Result};
use crate::log_filter::DebugFilter;

/// Main configuration for a dictkv server instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Dictionary Configuration
    // -------------------------------------------------------------------------
    /// Name of the served dictionary, attached to every command's log context
    pub dict_name: String,

    /// Rows handed out per async batch by the in-memory backend
    pub iterate_batch_size: usize,

    // -------------------------------------------------------------------------
    // Connection Flow Control
    // -------------------------------------------------------------------------
    /// Input is halted once this many commands are live on one connection
    pub max_pending_commands: usize,

    /// Iteration output is flushed once this many bytes are buffered
    pub output_optimal_size: usize,

    /// TCP output queue high-water mark; above it a flush counts as partial
    pub output_buffer_limit: usize,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds, 0 = none)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds, 0 = none)
    pub write_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------
    /// Accumulate latency stats into the process title line
    pub verbose_proctitle: bool,

    /// Optional debug filter expression (see `log_filter`)
    pub debug_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dict_name: "default".to_string(),
            iterate_batch_size: 64,
            max_pending_commands: 1000,
            output_optimal_size: 1024,
            output_buffer_limit: 64 * 1024, // 64 KB
            listen_addr: "127.0.0.1:7380".to_string(),
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
            verbose_proctitle: false,
            debug_filter: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dict_name.is_empty() {
            return Err(DictError::Config("dict_name must not be empty".to_string()));
        }
        if self.max_pending_commands == 0 {
            return Err(DictError::Config("max_pending_commands must be > 0".to_string()));
        }
        if self.iterate_batch_size == 0 {
            return Err(DictError::Config("iterate_batch_size must be > 0".to_string()));
        }
        if self.max_connections == 0 {
            return Err(DictError::Config("max_connections must be > 0".to_string()));
        }
        if self.output_buffer_limit < self.output_optimal_size {
            return Err(DictError::Config(format!(
                "output_buffer_limit ({}) must be >= output_optimal_size ({})",
                self.output_buffer_limit, self.output_optimal_size
            )));
        }
        if let Some(filter) = &self.debug_filter {
            DebugFilter::parse(filter)?;
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the dictionary name
    pub fn dict_name(mut self, name: impl Into<String>) -> Self {
        self.config.dict_name = name.into();
        self
    }

    /// Set the in-memory backend's async batch size
    pub fn iterate_batch_size(mut self, rows: usize) -> Self {
        self.config.iterate_batch_size = rows;
        self
    }

    /// Set the live-command limit per connection
    pub fn max_pending_commands(mut self, count: usize) -> Self {
        self.config.max_pending_commands = count;
        self
    }

    /// Set the iteration flush threshold (in bytes)
    pub fn output_optimal_size(mut self, size: usize) -> Self {
        self.config.output_optimal_size = size;
        self
    }

    /// Set the TCP output queue high-water mark (in bytes)
    pub fn output_buffer_limit(mut self, size: usize) -> Self {
        self.config.output_buffer_limit = size;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Enable latency stats in the process title
    pub fn verbose_proctitle(mut self, enabled: bool) -> Self {
        self.config.verbose_proctitle = enabled;
        self
    }

    /// Set the debug filter expression
    pub fn debug_filter(mut self, filter: Option<String>) -> Self {
        self.config.debug_filter = filter;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

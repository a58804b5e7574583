//! # dictkv
//!
//! A server for a pipelined, line-oriented dictionary protocol:
//! - Tab-escaped request and reply lines, many commands in flight per client
//! - Asynchronous lookups, write transactions and streamed iterations
//! - Iteration output that pauses under backpressure and resumes exactly
//! - Process-wide latency statistics and a filterable debug log
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                              │
//! │           (reader / session / writer per client)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ lines            ▲ reply bytes
//! ┌─────────────────────▼──────────────────┴────────────────────┐
//! │                    DictConnection                            │
//! │   dispatcher ─► executors ─► transaction table               │
//! │                     │        flow controller (cork/flush)    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ async calls      ▲ completion events
//!                       ▼                  │
//!               ┌──────────────────────────┴──┐
//!               │        Dict backend          │
//!               │   (MemoryDict or your own)   │
//!               └─────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod dict;
pub mod stream;
pub mod connection;
pub mod stats;
pub mod log_filter;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{DictError, Result};
pub use config::Config;
pub use connection::{ConnectionSettings, DictConnection, Event};
pub use dict::{Dict, MemoryDict};
pub use stats::CommandStats;
pub use stream::{MemoryOutput, OutputStream};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of dictkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

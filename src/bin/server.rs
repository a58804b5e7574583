//! dictkv Server Binary
//!
//! Serves an in-memory dictionary over TCP.

use std::sync::Arc;

use clap::Parser;
use dictkv::log_filter::{self, DebugFilter};
use dictkv::network::Server;
use dictkv::{Config, MemoryDict};
use tracing_subscriber::{fmt, EnvFilter};

/// dictkv Server
#[derive(Parser, Debug)]
#[command(name = "dictkv-server")]
#[command(about = "Pipelined dictionary protocol server")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7380")]
    listen: String,

    /// Dictionary name used in logs
    #[arg(short, long, default_value = "default")]
    dict_name: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Live commands per connection before input is halted
    #[arg(long, default_value = "1000")]
    max_pending: usize,

    /// Iteration output flush threshold in bytes
    #[arg(long, default_value = "1024")]
    output_optimal_size: usize,

    /// Per-connection output queue limit in KB
    #[arg(long, default_value = "64")]
    output_buffer_kb: usize,

    /// Rows per async iteration batch
    #[arg(long, default_value = "64")]
    batch_size: usize,

    /// Read timeout in milliseconds (0 = none)
    #[arg(long, default_value = "0")]
    read_timeout_ms: u64,

    /// Log latency stats whenever they change
    #[arg(long)]
    verbose_proctitle: bool,

    /// Debug filter, e.g. "command=LOOKUP key=priv/*"
    #[arg(long)]
    debug_filter: Option<String>,

    /// Preload a shared entry (KEY=VALUE), repeatable
    #[arg(long = "preload", value_name = "KEY=VALUE")]
    preload: Vec<String>,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dictkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("dictkv Server v{}", dictkv::VERSION);
    tracing::info!("Dictionary: {}", args.dict_name);
    tracing::info!("Listen address: {}", args.listen);

    // Build config from args
    let config = Config::builder()
        .listen_addr(&args.listen)
        .dict_name(&args.dict_name)
        .max_connections(args.max_connections)
        .max_pending_commands(args.max_pending)
        .output_optimal_size(args.output_optimal_size)
        .output_buffer_limit(args.output_buffer_kb * 1024)
        .iterate_batch_size(args.batch_size)
        .read_timeout_ms(args.read_timeout_ms)
        .verbose_proctitle(args.verbose_proctitle)
        .debug_filter(args.debug_filter.clone())
        .build();

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Some(expr) = &config.debug_filter {
        match DebugFilter::parse(expr) {
            Ok(filter) => log_filter::set_global_debug_filter(filter),
            Err(e) => {
                tracing::error!("Invalid debug filter: {}", e);
                std::process::exit(1);
            }
        }
    }

    let dict = MemoryDict::with_batch_size(config.iterate_batch_size);
    for entry in &args.preload {
        let Some((key, value)) = entry.split_once('=') else {
            tracing::error!("Invalid preload entry (expected KEY=VALUE): {}", entry);
            std::process::exit(1);
        };
        if !dict.insert(key.as_bytes(), value.as_bytes(), None) {
            tracing::warn!("Skipping preload of private key {}", key);
        }
    }
    tracing::info!("Dictionary initialized with {} entries", dict.entry_count());

    let server = match Server::bind(config, Arc::new(dict)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}

//! Per-connection session driver
//!
//! Handles individual client connections. A reader thread turns the socket
//! into request lines; this thread owns the `DictConnection` and feeds it
//! lines and completion events one at a time.

use std::io::{self, BufReader};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, never, Receiver};
use crossbeam::select;

use crate::config::Config;
use crate::connection::{ConnectionSettings, DictConnection};
use crate::dict::Dict;
use crate::error::Result;
use crate::protocol::read_line;
use crate::stats::CommandStats;
use super::output::TcpOutput;

/// Lines buffered between the reader thread and the connection
const INPUT_QUEUE_LEN: usize = 64;

enum Input {
    Line(Vec<u8>),
    Eof,
    Failed(io::Error),
}

/// Serve one client until it disconnects and its commands are done
pub fn serve(
    stream: TcpStream,
    dict: Arc<dyn Dict>,
    config: &Config,
    stats: Arc<CommandStats>,
) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    // Disable Nagle's algorithm for low latency
    stream.set_nodelay(true)?;
    if config.read_timeout_ms > 0 {
        stream.set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms)))?;
    }
    if config.write_timeout_ms > 0 {
        stream.set_write_timeout(Some(Duration::from_millis(config.write_timeout_ms)))?;
    }

    let output = TcpOutput::spawn(stream.try_clone()?, config.output_buffer_limit, &peer)?;
    let mut conn = DictConnection::new(ConnectionSettings::from_config(config), dict, output, stats)
        .with_peer(peer.clone());
    let notifier = conn.event_sender();
    conn.output_mut().set_notifier(notifier);

    tracing::debug!("Connection established from {}", peer);

    let (lines_tx, lines_rx) = bounded::<Input>(INPUT_QUEUE_LEN);
    let mut reader = BufReader::new(stream.try_clone()?);
    let reader_thread = thread::Builder::new()
        .name("dictkv-reader".to_string())
        .spawn(move || loop {
            let input = match read_line(&mut reader) {
                Ok(Some(line)) => Input::Line(line),
                Ok(None) => Input::Eof,
                Err(crate::error::DictError::Io(e)) => Input::Failed(e),
                Err(e) => Input::Failed(io::Error::new(io::ErrorKind::Other, e.to_string())),
            };
            let last = !matches!(input, Input::Line(_));
            if lines_tx.send(input).is_err() || last {
                break;
            }
        })?;

    run_event_loop(&mut conn, &lines_rx, &peer);

    // Unblock the reader if the client is still connected
    let _ = stream.shutdown(Shutdown::Both);
    drop(lines_rx);
    let _ = reader_thread.join();

    tracing::debug!("Client {} disconnected", peer);
    Ok(())
}

fn run_event_loop(conn: &mut DictConnection<TcpOutput>, lines: &Receiver<Input>, peer: &str) {
    let events = conn.events().clone();
    let paused = never::<Input>();

    while !conn.is_finished() {
        let input = if conn.wants_input() { lines } else { &paused };
        select! {
            recv(input) -> msg => match msg {
                Ok(Input::Line(line)) => {
                    tracing::trace!("Received command from {}: {:?}", peer, String::from_utf8_lossy(&line));
                    if let Err(e) = conn.handle_line(&line) {
                        tracing::warn!("Closing connection from {}: {}", peer, e);
                        conn.destroy();
                    }
                }
                Ok(Input::Eof) | Err(_) => conn.destroy(),
                Ok(Input::Failed(e)) => {
                    match e.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                            tracing::debug!("Read timeout for client {}", peer)
                        }
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                            tracing::debug!("Connection reset by client {}", peer)
                        }
                        _ => tracing::warn!("Error reading from {}: {}", peer, e),
                    }
                    conn.destroy();
                }
            },
            recv(events) -> event => {
                if let Ok(event) = event {
                    conn.handle_event(event);
                }
            }
        }
    }
}

//! Network Module
//!
//! TCP server and client handling.
//!
//! ## Architecture
//! - Single acceptor thread with a non-blocking accept loop
//! - One session thread per connection, owning its `DictConnection`
//! - Per connection a reader thread (request lines) and a writer thread
//!   (reply bytes, bounded by `output_buffer_limit`)

mod output;
mod server;
mod session;

pub use output::TcpOutput;
pub use server::{Server, ShutdownHandle};
pub use session::serve;

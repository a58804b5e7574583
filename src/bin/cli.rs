//! dictkv CLI Client
//!
//! Command-line interface for interacting with a dictkv server.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;

use clap::{Parser, Subcommand};
use dictkv::dict::IterateFlags;
use dictkv::protocol::{read_reply, write_command, CommandKind, Reply, ReplyBody, ReplyStatus};
use dictkv::{DictError, Result};

/// Transaction id used by the write subcommands
const TRANSACTION_ID: &str = "1";

/// dictkv CLI
#[derive(Parser, Debug)]
#[command(name = "dictkv-cli")]
#[command(about = "CLI for the dictkv dictionary server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7380")]
    server: String,

    /// Username for private (priv/) keys
    #[arg(short, long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Look up a key
    Lookup {
        /// The key to look up
        key: String,
    },

    /// List keys under a path
    Iterate {
        /// Path prefix, e.g. "shared/"
        path: String,

        /// Stop after this many rows (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        max_rows: u64,

        /// Include keys in nested paths
        #[arg(short, long)]
        recurse: bool,

        /// Sort the rows by key
        #[arg(long)]
        sort: bool,

        /// Print keys only
        #[arg(long)]
        no_value: bool,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Unset {
        /// The key to delete
        key: String,
    },

    /// Atomically add to a numeric value
    Inc {
        /// The counter key
        key: String,

        /// Amount to add (may be negative)
        #[arg(allow_hyphen_values = true)]
        diff: i64,
    },
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| DictError::Network(format!("Failed to connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    fn send(&mut self, kind: CommandKind, args: &[&str]) -> Result<()> {
        write_command(&mut self.writer, kind, args)
    }

    /// Wait for the async id of the command just sent
    fn async_id(&mut self) -> Result<u32> {
        match read_reply(&mut self.reader)? {
            Reply::AsyncId(id) => Ok(id),
            other => Err(DictError::protocol(format!("Expected async id, got {other:?}"))),
        }
    }

    /// Next reply tagged with `id`
    fn async_body(&mut self, id: u32) -> Result<ReplyBody> {
        loop {
            match read_reply(&mut self.reader)? {
                Reply::Async { id: got, body } if got == id => return Ok(body),
                _ => continue,
            }
        }
    }
}

fn field_str(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

fn failure(body: &ReplyBody) -> DictError {
    let error = body.first().map(field_str).unwrap_or_default();
    DictError::Network(format!("Server reported failure: {error}"))
}

fn lookup(client: &mut Client, key: &str, user: Option<&str>) -> Result<()> {
    let mut args = vec![key];
    args.extend(user);
    client.send(CommandKind::Lookup, &args)?;
    let id = client.async_id()?;
    let body = client.async_body(id)?;
    match body.status {
        Some(ReplyStatus::Ok) | Some(ReplyStatus::MultiOk) => {
            for value in body.values() {
                println!("{}", field_str(&value));
            }
        }
        Some(ReplyStatus::NotFound) => println!("(not found)"),
        _ => return Err(failure(&body)),
    }
    Ok(())
}

fn iterate(client: &mut Client, path: &str, flags: IterateFlags, max_rows: u64, user: Option<&str>) -> Result<()> {
    let flags = flags.bits().to_string();
    let max_rows = max_rows.to_string();
    let mut args = vec![flags.as_str(), max_rows.as_str(), path];
    args.extend(user);
    client.send(CommandKind::Iterate, &args)?;
    let id = client.async_id()?;
    loop {
        let body = client.async_body(id)?;
        match body.status {
            Some(ReplyStatus::Ok) => {
                let line: Vec<String> = body.fields.iter().map(|f| field_str(f)).collect();
                println!("{}", line.join("\t"));
            }
            None => {
                let rows = body.first().map(field_str).unwrap_or_default();
                eprintln!("({rows} rows)");
                return Ok(());
            }
            _ => return Err(failure(&body)),
        }
    }
}

/// Run one write inside its own transaction and report the commit status
fn write(client: &mut Client, user: Option<&str>, kind: CommandKind, args: &[&str]) -> Result<()> {
    let mut begin = vec![TRANSACTION_ID];
    begin.extend(user);
    client.send(CommandKind::Begin, &begin)?;

    let mut write_args = vec![TRANSACTION_ID];
    write_args.extend_from_slice(args);
    client.send(kind, &write_args)?;

    client.send(CommandKind::Commit, &[TRANSACTION_ID])?;
    let id = client.async_id()?;
    let body = client.async_body(id)?;
    match body.status {
        Some(ReplyStatus::Ok) => println!("OK"),
        Some(ReplyStatus::NotFound) => println!("(not found)"),
        Some(ReplyStatus::WriteUncertain) => {
            let error = body.fields.get(1).map(|f| field_str(f)).unwrap_or_default();
            println!("WRITE UNCERTAIN: {error}");
        }
        _ => {
            let error = body.fields.get(1).map(|f| field_str(f)).unwrap_or_default();
            return Err(DictError::Network(format!("Commit failed: {error}")));
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let mut client = Client::connect(&args.server)?;
    let user = args.user.as_deref();
    match args.command {
        Commands::Lookup { key } => lookup(&mut client, &key, user),
        Commands::Iterate {
            path,
            max_rows,
            recurse,
            sort,
            no_value,
        } => {
            let mut flags = IterateFlags::empty();
            flags.set(IterateFlags::RECURSE, recurse);
            flags.set(IterateFlags::SORT_BY_KEY, sort);
            flags.set(IterateFlags::NO_VALUE, no_value);
            iterate(&mut client, &path, flags, max_rows, user)
        }
        Commands::Set { key, value } => write(&mut client, user, CommandKind::Set, &[&key, &value]),
        Commands::Unset { key } => write(&mut client, user, CommandKind::Unset, &[&key]),
        Commands::Inc { key, diff } => {
            let diff = diff.to_string();
            write(&mut client, user, CommandKind::AtomicInc, &[&key, &diff])
        }
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

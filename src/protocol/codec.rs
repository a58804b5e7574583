//! Protocol codec
//!
//! Encoding and decoding functions for the line protocol.
//!
//! ## Request Format
//! ```text
//! ┌─────────┬──────────────────────────────────────────┬────┐
//! │ Tag (1) │ arg1 \t arg2 \t ...  (each tab-escaped)  │ \n │
//! └─────────┴──────────────────────────────────────────┴────┘
//! ```
//!
//! ## Reply Format
//! ```text
//! ┌────────────┬──────────────────────────────────────┬────┐
//! │ Status (1) │ field1 \t field2 \t ...              │ \n │
//! └────────────┴──────────────────────────────────────┴────┘
//! ```
//! Deferred replies are prefixed with `+<async id>\t`.

use std::io::{BufRead, Write};

use crate::error::{DictError, Result};
use super::escape::{join_tab_escaped, split_tab_escaped, tab_escape_into};
use super::{CommandKind, Reply, ReplyBody, ReplyStatus};

// =============================================================================
// Request Parsing (server side)
// =============================================================================

/// Split a request line into its command kind and unescaped arguments
///
/// The line must not contain the trailing newline.
pub fn parse_command_line(line: &[u8]) -> Result<(CommandKind, Vec<Vec<u8>>)> {
    let (&tag, rest) = line
        .split_first()
        .ok_or_else(|| DictError::protocol("Empty command line"))?;
    let kind = CommandKind::from_tag(tag).ok_or(DictError::UnknownCommand(tag as char))?;
    Ok((kind, split_tab_escaped(rest)))
}

// =============================================================================
// Reply Encoding (server side)
// =============================================================================

/// `*<id>\n`
pub fn encode_async_id(id: u32) -> Vec<u8> {
    format!("{}{}\n", ReplyStatus::AsyncId.marker() as char, id).into_bytes()
}

/// `+<id>\t<body>`; `body` already carries its newline
pub fn encode_async_reply(id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 12);
    out.extend_from_slice(format!("{}{}\t", ReplyStatus::AsyncReply.marker() as char, id).as_bytes());
    out.extend_from_slice(body);
    out
}

/// Append the OK / MULTI-OK body for a successful lookup
///
/// With more than one value, the values are escaped, joined and escaped
/// again so the whole set travels as a single field.
pub fn encode_lookup_values(out: &mut Vec<u8>, values: &[Vec<u8>]) {
    match values {
        [single] => {
            out.push(ReplyStatus::Ok.marker());
            tab_escape_into(out, single);
        }
        _ => {
            out.push(ReplyStatus::MultiOk.marker());
            let joined = join_tab_escaped(values);
            tab_escape_into(out, &joined);
        }
    }
}

/// Append `<status><escaped error>` for a failed operation
pub fn encode_failure(out: &mut Vec<u8>, status: ReplyStatus, error: &str) {
    out.push(status.marker());
    tab_escape_into(out, error.as_bytes());
}

/// Append one iteration row: `O<key>[\t<value>...]\n`
pub fn encode_iter_row(out: &mut Vec<u8>, key: &[u8], values: Option<&[Vec<u8>]>) {
    out.push(ReplyStatus::Ok.marker());
    tab_escape_into(out, key);
    if let Some(values) = values {
        for value in values {
            out.push(b'\t');
            tab_escape_into(out, value);
        }
    }
    out.push(b'\n');
}

// =============================================================================
// Client Side
// =============================================================================

/// Encode a request line (with trailing newline)
pub fn encode_command<I, F>(kind: CommandKind, args: I) -> Vec<u8>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut out = vec![kind.tag()];
    out.extend_from_slice(&join_tab_escaped(args));
    out.push(b'\n');
    out
}

/// Decode one reply line (without the trailing newline)
pub fn decode_reply(line: &[u8]) -> Result<Reply> {
    match line.first() {
        Some(&b'*') => Ok(Reply::AsyncId(parse_id(&line[1..])?)),
        Some(&b'+') => {
            let rest = &line[1..];
            let tab = rest
                .iter()
                .position(|&b| b == b'\t')
                .ok_or_else(|| DictError::protocol("Async reply without body"))?;
            Ok(Reply::Async {
                id: parse_id(&rest[..tab])?,
                body: ReplyBody::parse(&rest[tab + 1..]),
            })
        }
        Some(_) => Ok(Reply::Plain(ReplyBody::parse(line))),
        None => Err(DictError::protocol("Empty reply line")),
    }
}

fn parse_id(digits: &[u8]) -> Result<u32> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DictError::protocol(format!("Invalid async id {:?}", String::from_utf8_lossy(digits))))
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read one line, stripping the LF (and a preceding CR)
///
/// Returns `Ok(None)` on a clean end of stream.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

/// Write a request to a stream
pub fn write_command<W: Write, I, F>(writer: &mut W, kind: CommandKind, args: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    writer.write_all(&encode_command(kind, args))?;
    writer.flush()?;
    Ok(())
}

/// Read and decode the next reply from a stream
pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply> {
    match read_line(reader)? {
        Some(line) => decode_reply(&line),
        None => Err(DictError::ConnectionClosed),
    }
}

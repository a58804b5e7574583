//! Reply definitions
//!
//! Represents reply lines sent back to clients.

use std::time::{SystemTime, UNIX_EPOCH};

use super::escape::split_tab_escaped;

/// Reply status markers (first byte of a reply body)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = b'O',
    MultiOk = b'M',
    NotFound = b'N',
    Fail = b'F',
    WriteUncertain = b'W',
    AsyncCommit = b'A',
    AsyncId = b'*',
    AsyncReply = b'+',
}

impl ReplyStatus {
    /// Parse a status marker byte
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'O' => Some(ReplyStatus::Ok),
            b'M' => Some(ReplyStatus::MultiOk),
            b'N' => Some(ReplyStatus::NotFound),
            b'F' => Some(ReplyStatus::Fail),
            b'W' => Some(ReplyStatus::WriteUncertain),
            b'A' => Some(ReplyStatus::AsyncCommit),
            b'*' => Some(ReplyStatus::AsyncId),
            b'+' => Some(ReplyStatus::AsyncReply),
            _ => None,
        }
    }

    /// The marker byte
    pub fn marker(self) -> u8 {
        self as u8
    }
}

/// Wall-clock time with microsecond resolution, as written on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WireTime {
    pub secs: i64,
    pub usecs: u32,
}

impl WireTime {
    /// The current wall-clock time
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                usecs: d.subsec_micros(),
            },
            Err(_) => Self { secs: 0, usecs: 0 },
        }
    }

    /// Microseconds elapsed from `earlier` to `self`, clamped at zero
    pub fn usecs_since(&self, earlier: &WireTime) -> u64 {
        let diff = (self.secs - earlier.secs) * 1_000_000 + self.usecs as i64 - earlier.usecs as i64;
        diff.max(0) as u64
    }
}

/// Append `\t<start_s>\t<start_us>\t<end_s>\t<end_us>` to a reply body
pub fn append_timings(out: &mut Vec<u8>, start: WireTime, end: WireTime) {
    out.extend_from_slice(
        format!("\t{}\t{}\t{}\t{}", start.secs, start.usecs, end.secs, end.usecs).as_bytes(),
    );
}

/// A decoded reply line (client side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `*<id>`: the command will be answered later under this id
    AsyncId(u32),

    /// `+<id>\t<body>`: a deferred reply for an earlier command
    Async { id: u32, body: ReplyBody },

    /// An untagged reply
    Plain(ReplyBody),
}

/// The body of a reply: a status marker followed by escaped fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBody {
    /// `None` marks the end of an iteration
    pub status: Option<ReplyStatus>,

    /// Set when the body carried the legacy async-commit prefix
    pub async_commit: bool,

    /// Unescaped fields following the marker
    pub fields: Vec<Vec<u8>>,
}

impl ReplyBody {
    /// Parse a body (without the trailing newline)
    pub fn parse(body: &[u8]) -> Self {
        let (async_commit, rest) = match body.first() {
            Some(&b'A') => (true, &body[1..]),
            _ => (false, body),
        };
        match rest.first().and_then(|&b| ReplyStatus::from_marker(b)) {
            Some(status) => Self {
                status: Some(status),
                async_commit,
                fields: split_tab_escaped(&rest[1..]),
            },
            None => {
                // Iteration end: empty marker, so the body starts with the
                // separator before the first field.
                let fields = rest.strip_prefix(b"\t").unwrap_or(rest);
                Self {
                    status: None,
                    async_commit,
                    fields: split_tab_escaped(fields),
                }
            }
        }
    }

    /// First field, if any
    pub fn first(&self) -> Option<&[u8]> {
        self.fields.first().map(|f| f.as_slice())
    }

    /// Values of an OK or MULTI-OK lookup reply
    pub fn values(&self) -> Vec<Vec<u8>> {
        match (self.status, self.first()) {
            (Some(ReplyStatus::Ok), Some(v)) => vec![v.to_vec()],
            (Some(ReplyStatus::MultiOk), Some(v)) => split_tab_escaped(v),
            _ => Vec::new(),
        }
    }

    /// The trailing `(start, end)` timing fields, if present
    pub fn timings(&self) -> Option<(WireTime, WireTime)> {
        let n = self.fields.len();
        if n < 4 {
            return None;
        }
        let num = |i: usize| -> Option<i64> {
            std::str::from_utf8(&self.fields[i]).ok()?.parse().ok()
        };
        Some((
            WireTime { secs: num(n - 4)?, usecs: num(n - 3)? as u32 },
            WireTime { secs: num(n - 2)?, usecs: num(n - 1)? as u32 },
        ))
    }
}

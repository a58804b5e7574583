//! Protocol Module
//!
//! Defines the line protocol for client-server communication.
//!
//! ## Protocol Format
//!
//! One request per line: a one-byte command tag followed by TAB-separated,
//! tab-escaped arguments. Requests are pipelined; replies to asynchronous
//! commands may arrive in any order and are matched by their async id.
//!
//! ### Commands
//! - `L` LOOKUP      `<key> [<username>]`
//! - `I` ITERATE     `<flags> <max_rows> <path> [<username>]`
//! - `B` BEGIN       `<id> [<username> [<expire_secs>]]`
//! - `C` COMMIT      `<id>`
//! - `R` ROLLBACK    `<id>`
//! - `S` SET         `<id> <key> <value>`
//! - `U` UNSET       `<id> <key>`
//! - `A` ATOMIC_INC  `<id> <key> <diff>`
//! - `T` TIMESTAMP   `<id> <secs> <nsecs>`
//! - `V` HIDE_LOG_VALUES `<id> <bool>`
//!
//! ### Reply Markers
//! - `O` OK, `M` MULTI-OK, `N` NOT-FOUND, `F` FAIL, `W` WRITE-UNCERTAIN
//! - `*` async id assignment, `+` async-tagged reply, `A` legacy async commit

mod command;
mod reply;
mod codec;
pub mod escape;

pub use command::{is_private_key, CommandKind, DICT_PATH_PRIVATE, DICT_PATH_SHARED};
pub use reply::{append_timings, Reply, ReplyBody, ReplyStatus, WireTime};
pub use codec::{
    decode_reply, encode_async_id, encode_async_reply, encode_command, encode_failure,
    encode_iter_row, encode_lookup_values, parse_command_line, read_line, read_reply,
    write_command,
};
pub use escape::{join_tab_escaped, split_tab_escaped, tab_escape, tab_unescape};

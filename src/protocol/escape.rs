//! Tab escaping
//!
//! Arguments and reply fields are separated by TAB and lines end with LF, so
//! those bytes (plus CR, NUL and the escape byte itself) are escaped inside a
//! field with a two-byte sequence starting with `0x01`.
//!
//! ```text
//!   0x01 -> 0x01 '1'      TAB -> 0x01 't'      LF -> 0x01 'n'
//!   CR   -> 0x01 'r'      NUL -> 0x01 '0'
//! ```

/// The escape introducer byte
pub const ESCAPE_CHAR: u8 = 0x01;

/// Append the escaped form of `input` to `out`
pub fn tab_escape_into(out: &mut Vec<u8>, input: &[u8]) {
    out.reserve(input.len());
    for &b in input {
        match b {
            ESCAPE_CHAR => out.extend_from_slice(&[ESCAPE_CHAR, b'1']),
            b'\t' => out.extend_from_slice(&[ESCAPE_CHAR, b't']),
            b'\r' => out.extend_from_slice(&[ESCAPE_CHAR, b'r']),
            b'\n' => out.extend_from_slice(&[ESCAPE_CHAR, b'n']),
            0 => out.extend_from_slice(&[ESCAPE_CHAR, b'0']),
            _ => out.push(b),
        }
    }
}

/// Escape a single field
pub fn tab_escape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    tab_escape_into(&mut out, input);
    out
}

/// Reverse `tab_escape`
///
/// An unknown escape sequence decodes to the byte following the escape
/// byte; a trailing lone escape byte is kept as-is.
pub fn tab_unescape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().copied();
    while let Some(b) = iter.next() {
        if b != ESCAPE_CHAR {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'1') => out.push(ESCAPE_CHAR),
            Some(b't') => out.push(b'\t'),
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b'0') => out.push(0),
            Some(other) => out.push(other),
            None => out.push(ESCAPE_CHAR),
        }
    }
    out
}

/// Split a TAB-separated line and unescape every field
///
/// An empty input yields no fields at all.
pub fn split_tab_escaped(line: &[u8]) -> Vec<Vec<u8>> {
    if line.is_empty() {
        return Vec::new();
    }
    line.split(|&b| b == b'\t').map(tab_unescape).collect()
}

/// Escape every field and join them with TAB
pub fn join_tab_escaped<I, F>(fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        tab_escape_into(&mut out, field.as_ref());
    }
    out
}

//! Lock protocol command parser and reply encoder.
//!
//! After a single version line, clients send one command per line:
//! - `set <key>`: acquire a lock
//! - `del <key>`: release a lock held by this connection
//! - `list`: enumerate every held lock
//!
//! Every reply starts with `NNN,<message>\n`, where `NNN` is a three-digit
//! status code.
//!
//! Lines are handled as bytes. Keys and versions are never decoded, so any
//! byte sequence other than whitespace and `\n` can be part of a key.

use crate::registry::LockEntry;

/// Parsed lock command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Acquire a lock
    Set { key: &'a [u8] },

    /// Release a previously acquired lock
    Del { key: &'a [u8] },

    /// List all locks; any argument is ignored
    List,

    /// Anything else
    Unknown { name: &'a [u8] },
}

impl<'a> Command<'a> {
    /// Parse a trimmed protocol line.
    ///
    /// The command name is everything before the first space and is matched
    /// case-sensitively. The key is everything after it, unparsed.
    pub fn parse(line: &'a [u8]) -> Self {
        let (name, arg) = match line.iter().position(|&b| b == b' ') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, &line[line.len()..]),
        };

        match name {
            b"set" => Command::Set { key: arg },
            b"del" => Command::Del { key: arg },
            b"list" => Command::List,
            _ => Command::Unknown { name },
        }
    }
}

/// Whitespace stripped from both ends of a line: space, tab, LF, VT, FF, CR.
fn is_line_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// Strip ASCII whitespace from both ends of a raw line.
///
/// Non-ASCII bytes are never stripped, so a key ending in U+00A0 keeps it.
pub fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|&b| !is_line_whitespace(b))
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|&b| !is_line_whitespace(b))
        .map_or(start, |pos| pos + 1);
    &line[start..end]
}

/// Reply status codes. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 0,
    AlreadyAcquired = 1,
    EmptyKey = 2,
    UnknownCommand = 3,
    NotOwner = 4,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Reply generators, appending to a connection's output buffer.
pub struct Response;

impl Response {
    /// Append `NNN,<message>\n`.
    pub fn status(out: &mut Vec<u8>, status: Status, message: &str) {
        out.extend_from_slice(format!("{:03},{}\n", status.code(), message).as_bytes());
    }

    pub fn ok(out: &mut Vec<u8>) {
        Self::status(out, Status::Ok, "OK");
    }

    pub fn empty_key(out: &mut Vec<u8>) {
        Self::status(out, Status::EmptyKey, "Empty resource key");
    }

    pub fn unknown_command(out: &mut Vec<u8>) {
        Self::status(out, Status::UnknownCommand, "Unknown command");
    }

    pub fn not_owner(out: &mut Vec<u8>) {
        Self::status(out, Status::NotOwner, "Not a previously acquired resource");
    }

    pub fn already_acquired(out: &mut Vec<u8>, entry: &LockEntry) {
        Self::status(
            out,
            Status::AlreadyAcquired,
            &format!(
                "Resource already acquired by {} at {}",
                entry.holder,
                entry.timestamp()
            ),
        );
    }

    /// Header line followed by one tab-separated row per lock.
    ///
    /// Keys and versions are written back exactly as the clients sent them.
    pub fn list(out: &mut Vec<u8>, entries: &[&LockEntry]) {
        Self::status(out, Status::Ok, &format!("OK {} records", entries.len()));

        for entry in entries {
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(format!("\t{}\t{}\t", entry.timestamp(), entry.holder).as_bytes());
            out.extend_from_slice(&entry.protocol_version);
            out.push(b'\n');
        }
    }
}

//! Per-client protocol state machine.
//!
//! A connection buffers raw bytes from its socket, splits them into lines and
//! feeds each complete line to the handler for its current state. Replies are
//! queued in an output buffer that the event loop drains to the socket.
//!
//! Once the queued replies reach the high-water mark the connection stops
//! handling lines; the rest stay buffered until the event loop has written
//! enough for it to continue.
//!
//! The connection owns the set of keys it acquired. Tearing it down through
//! [`Connection::release_all`] hands every one of them back to the registry.

use crate::config::Config;
use crate::protocol::{trim_line, Command, Response};
use crate::registry::{AcquireResult, Holder, LockRegistry};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The next line is the client's protocol version.
    AwaitingVersion,
    /// Accepting lock commands.
    Ready,
}

/// What the event loop should do with a connection after a read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Keep the connection open.
    Continue,
    /// The peer closed the stream.
    Close,
    /// The connection failed and must be torn down.
    CloseWithError,
}

/// Per-connection buffer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Longest unterminated line accepted.
    pub max_line_length: usize,
    /// Queued reply bytes at which line handling pauses.
    pub output_high_water: usize,
    /// Queued reply bytes beyond which the connection fails.
    pub max_pending_output: usize,
}

impl ConnectionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_line_length: config.max_line_length,
            output_high_water: config.output_high_water.max(1),
            max_pending_output: config.max_pending_output,
        }
    }
}

/// A single client session.
#[derive(Debug)]
pub struct Connection {
    holder: Holder,
    state: SessionState,
    /// Unconsumed input, possibly ending in a partial line.
    buffer: BytesMut,
    held: HashSet<Bytes>,
    /// Replies not yet written to the socket.
    output: Vec<u8>,
    limits: ConnectionLimits,
}

impl Connection {
    /// Create a connection for a freshly accepted peer.
    pub fn new(peer: SocketAddr, limits: ConnectionLimits) -> Self {
        Self {
            holder: Holder {
                addr: format!("{}:{}", peer.ip(), peer.port()),
                protocol_version: Bytes::new(),
            },
            state: SessionState::AwaitingVersion,
            buffer: BytesMut::with_capacity(1024),
            held: HashSet::new(),
            output: Vec::new(),
            limits,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Peer address as recorded in the locks this connection takes.
    pub fn peer(&self) -> &str {
        &self.holder.addr
    }

    pub fn protocol_version(&self) -> &[u8] {
        &self.holder.protocol_version
    }

    pub fn holds(&self, key: &[u8]) -> bool {
        self.held.contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Append bytes read from the socket and process the complete lines.
    pub fn receive(&mut self, data: &[u8], registry: &mut LockRegistry) -> ReadOutcome {
        self.buffer.extend_from_slice(data);
        self.process_lines(registry)
    }

    /// Handle buffered lines until input runs out or the output queue
    /// reaches the high-water mark.
    ///
    /// A trailing partial line stays buffered until the rest arrives. If that
    /// fragment grows beyond the line limit, or a reply pushes the queue past
    /// the output cap, the connection is failed.
    pub fn process_lines(&mut self, registry: &mut LockRegistry) -> ReadOutcome {
        while !self.is_backed_up() {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = self.buffer.split_to(pos + 1);
            self.handle_line(trim_line(&line), registry);
        }

        if self.output.len() > self.limits.max_pending_output {
            warn!(
                peer = %self.holder.addr,
                pending = self.output.len(),
                limit = self.limits.max_pending_output,
                "Too much unread output"
            );
            return ReadOutcome::CloseWithError;
        }

        if self.buffer.len() > self.limits.max_line_length && !self.has_complete_line() {
            warn!(
                peer = %self.holder.addr,
                buffered = self.buffer.len(),
                limit = self.limits.max_line_length,
                "Line too long"
            );
            return ReadOutcome::CloseWithError;
        }

        ReadOutcome::Continue
    }

    /// Whether a full line is waiting in the input buffer.
    pub fn has_complete_line(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    /// Queued replies have reached the high-water mark.
    pub fn is_backed_up(&self) -> bool {
        self.output.len() >= self.limits.output_high_water
    }

    fn handle_line(&mut self, line: &[u8], registry: &mut LockRegistry) {
        trace!(
            peer = %self.holder.addr,
            state = ?self.state,
            line = %String::from_utf8_lossy(line),
            "Processing line"
        );

        match self.state {
            SessionState::AwaitingVersion => self.set_version(line),
            SessionState::Ready => self.run_command(line, registry),
        }
    }

    fn set_version(&mut self, version: &[u8]) {
        self.holder.protocol_version = Bytes::copy_from_slice(version);
        self.state = SessionState::Ready;
        debug!(
            peer = %self.holder.addr,
            version = %String::from_utf8_lossy(version),
            "Client version received"
        );
    }

    fn run_command(&mut self, line: &[u8], registry: &mut LockRegistry) {
        match Command::parse(line) {
            Command::Set { key } => self.set_lock(key, registry),
            Command::Del { key } => self.del_lock(key, registry),
            Command::List => Response::list(&mut self.output, &registry.snapshot()),
            Command::Unknown { name } => {
                trace!(
                    peer = %self.holder.addr,
                    command = %String::from_utf8_lossy(name),
                    "Unknown command"
                );
                Response::unknown_command(&mut self.output);
            }
        }
    }

    fn set_lock(&mut self, key: &[u8], registry: &mut LockRegistry) {
        if key.is_empty() {
            Response::empty_key(&mut self.output);
            return;
        }

        match registry.acquire(key, &self.holder) {
            AcquireResult::Acquired => {
                self.held.insert(Bytes::copy_from_slice(key));
                debug!(peer = %self.holder.addr, key = %String::from_utf8_lossy(key), "Lock acquired");
                Response::ok(&mut self.output);
            }
            AcquireResult::Conflict => {
                if let Some(entry) = registry.lookup(key) {
                    debug!(
                        peer = %self.holder.addr,
                        key = %String::from_utf8_lossy(key),
                        holder = %entry.holder,
                        "Lock busy"
                    );
                    Response::already_acquired(&mut self.output, entry);
                }
            }
        }
    }

    fn del_lock(&mut self, key: &[u8], registry: &mut LockRegistry) {
        if key.is_empty() {
            Response::empty_key(&mut self.output);
            return;
        }

        if !self.held.remove(key) {
            Response::not_owner(&mut self.output);
            return;
        }

        registry.release(key);
        debug!(peer = %self.holder.addr, key = %String::from_utf8_lossy(key), "Lock released");
        Response::ok(&mut self.output);
    }

    /// Release every lock this connection holds. Returns how many were freed.
    pub fn release_all(&mut self, registry: &mut LockRegistry) -> usize {
        let count = self.held.len();
        for key in self.held.drain() {
            registry.release(&key);
        }
        if count > 0 {
            debug!(peer = %self.holder.addr, released = count, "Released locks of closed connection");
        }
        count
    }

    /// Replies waiting to be written.
    pub fn pending_output(&self) -> &[u8] {
        &self.output
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Drop the first `n` bytes of pending output after a successful write.
    pub fn consume_output(&mut self, n: usize) {
        let n = n.min(self.output.len());
        self.output.drain(..n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_LINE: usize = 1024;

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            max_line_length: MAX_LINE,
            output_high_water: 1024 * 1024,
            max_pending_output: 4 * 1024 * 1024,
        }
    }

    fn connect_with(port: u16, limits: ConnectionLimits) -> Connection {
        Connection::new(SocketAddr::from(([127, 0, 0, 1], port)), limits)
    }

    fn connect(port: u16) -> Connection {
        connect_with(port, limits())
    }

    /// Feed input and return everything written back.
    fn exchange(
        conn: &mut Connection,
        registry: &mut LockRegistry,
        input: impl AsRef<[u8]>,
    ) -> String {
        assert_eq!(
            conn.receive(input.as_ref(), registry),
            ReadOutcome::Continue
        );
        let reply = String::from_utf8_lossy(conn.pending_output()).into_owned();
        conn.consume_output(conn.pending_output().len());
        reply
    }

    #[test]
    fn test_version_line_then_ready() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        assert_eq!(conn.state(), SessionState::AwaitingVersion);
        assert_eq!(exchange(&mut conn, &mut registry, "v1.2\r\n"), "");
        assert_eq!(conn.state(), SessionState::Ready);
        assert_eq!(conn.protocol_version(), b"v1.2");
        assert_eq!(conn.peer(), "127.0.0.1:4000");
    }

    #[test]
    fn test_version_is_not_interpreted() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        // Looks like a command but is consumed as the version
        assert_eq!(exchange(&mut conn, &mut registry, "set foo\n"), "");
        assert_eq!(conn.protocol_version(), b"set foo");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_and_conflict() {
        let mut registry = LockRegistry::new();
        let mut a = connect(4000);
        let mut b = connect(4001);

        exchange(&mut a, &mut registry, "v1\n");
        exchange(&mut b, &mut registry, "v1\n");

        assert_eq!(exchange(&mut a, &mut registry, "set foo\n"), "000,OK\n");
        assert!(a.holds(b"foo"));

        let reply = exchange(&mut b, &mut registry, "set foo\n");
        assert!(reply.starts_with("001,Resource already acquired by 127.0.0.1:4000 at "));
        assert!(reply.ends_with('\n'));
        assert!(!b.holds(b"foo"));

        // Re-acquiring your own lock is also a conflict
        let reply = exchange(&mut a, &mut registry, "set foo\n");
        assert!(reply.starts_with("001,"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_key() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        exchange(&mut conn, &mut registry, "v1\n");
        assert_eq!(
            exchange(&mut conn, &mut registry, "set \n"),
            "002,Empty resource key\n"
        );
        assert_eq!(
            exchange(&mut conn, &mut registry, "del\n"),
            "002,Empty resource key\n"
        );
        assert!(registry.is_empty());
        assert_eq!(conn.held_count(), 0);
    }

    #[test]
    fn test_del_own_lock() {
        let mut registry = LockRegistry::new();
        let mut a = connect(4000);
        let mut b = connect(4001);

        exchange(&mut a, &mut registry, "v1\nset foo\n");
        assert_eq!(exchange(&mut a, &mut registry, "del foo\n"), "000,OK\n");
        assert!(registry.lookup(b"foo").is_none());

        exchange(&mut b, &mut registry, "v1\n");
        assert_eq!(exchange(&mut b, &mut registry, "set foo\n"), "000,OK\n");
    }

    #[test]
    fn test_del_rejects_foreign_and_unheld_keys() {
        let mut registry = LockRegistry::new();
        let mut a = connect(4000);
        let mut b = connect(4001);

        exchange(&mut a, &mut registry, "v1\nset foo\n");
        exchange(&mut b, &mut registry, "v1\n");

        assert_eq!(
            exchange(&mut b, &mut registry, "del foo\n"),
            "004,Not a previously acquired resource\n"
        );
        assert_eq!(
            exchange(&mut b, &mut registry, "del nothing\n"),
            "004,Not a previously acquired resource\n"
        );
        assert_eq!(registry.lookup(b"foo").unwrap().holder, "127.0.0.1:4000");

        // Releasing twice fails the second time
        assert_eq!(exchange(&mut a, &mut registry, "del foo\n"), "000,OK\n");
        assert_eq!(
            exchange(&mut a, &mut registry, "del foo\n"),
            "004,Not a previously acquired resource\n"
        );
    }

    #[test]
    fn test_unknown_command_keeps_session() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        exchange(&mut conn, &mut registry, "v1\n");
        assert_eq!(
            exchange(&mut conn, &mut registry, "lock foo\n"),
            "003,Unknown command\n"
        );
        assert_eq!(
            exchange(&mut conn, &mut registry, "\n"),
            "003,Unknown command\n"
        );
        assert_eq!(conn.state(), SessionState::Ready);
        assert_eq!(exchange(&mut conn, &mut registry, "set foo\n"), "000,OK\n");
    }

    #[test]
    fn test_list() {
        let mut registry = LockRegistry::new();
        let mut a = connect(4000);
        let mut b = connect(4001);

        exchange(&mut a, &mut registry, "v1\n");
        assert_eq!(
            exchange(&mut a, &mut registry, "list\n"),
            "000,OK 0 records\n"
        );

        exchange(&mut a, &mut registry, "set foo\n");
        exchange(&mut b, &mut registry, "v2\nset bar\n");

        let reply = exchange(&mut a, &mut registry, "list ignored arg\n");
        let mut lines: Vec<&str> = reply.lines().collect();
        assert_eq!(lines.remove(0), "000,OK 2 records");
        lines.sort();

        let foo: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(foo[0], "foo");
        assert_eq!(foo[2], "127.0.0.1:4000");
        assert_eq!(foo[3], "v1");

        let bar: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(bar[0], "bar");
        assert_eq!(bar[2], "127.0.0.1:4001");
        assert_eq!(bar[3], "v2");
    }

    #[test]
    fn test_partial_lines() {
        let mut registry = LockRegistry::new();
        let mut whole = connect(4000);
        let mut split = connect(4001);

        exchange(&mut whole, &mut registry, "v1\n");
        exchange(&mut split, &mut registry, "v1\n");

        let expected = exchange(&mut whole, &mut registry, "set a\nset b\n");
        assert_eq!(expected, "000,OK\n000,OK\n");
        exchange(&mut whole, &mut registry, "del a\ndel b\n");

        assert_eq!(exchange(&mut split, &mut registry, "set a\nse"), "000,OK\n");
        assert_eq!(exchange(&mut split, &mut registry, "t b"), "");
        assert_eq!(exchange(&mut split, &mut registry, "\n"), "000,OK\n");
        assert!(split.holds(b"a") && split.holds(b"b"));
    }

    #[test]
    fn test_line_too_long() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        exchange(&mut conn, &mut registry, "v1\n");
        let long = "x".repeat(MAX_LINE + 1);
        assert_eq!(
            conn.receive(long.as_bytes(), &mut registry),
            ReadOutcome::CloseWithError
        );
    }

    #[test]
    fn test_long_terminated_line_is_fine() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        exchange(&mut conn, &mut registry, "v1\n");
        let input = format!("set {}\n", "k".repeat(MAX_LINE * 2));
        assert_eq!(exchange(&mut conn, &mut registry, &input), "000,OK\n");
    }

    #[test]
    fn test_release_all() {
        let mut registry = LockRegistry::new();
        let mut a = connect(4000);
        let mut b = connect(4001);

        exchange(&mut a, &mut registry, "v1\nset foo\nset bar\n");
        exchange(&mut b, &mut registry, "v1\nset baz\n");

        assert_eq!(a.release_all(&mut registry), 2);
        assert_eq!(a.held_count(), 0);
        assert!(registry.lookup(b"foo").is_none());
        assert!(registry.lookup(b"bar").is_none());
        assert!(registry.lookup(b"baz").is_some());

        assert_eq!(
            exchange(&mut b, &mut registry, "set foo\nset bar\n"),
            "000,OK\n000,OK\n"
        );
    }

    #[test]
    fn test_raw_byte_keys_stay_distinct() {
        let mut registry = LockRegistry::new();
        let mut a = connect(4000);
        let mut b = connect(4001);

        exchange(&mut a, &mut registry, b"v1\n");
        exchange(&mut b, &mut registry, b"v1\n");

        assert_eq!(exchange(&mut a, &mut registry, b"set k\xff\n"), "000,OK\n");
        assert_eq!(exchange(&mut b, &mut registry, b"set k\xfe\n"), "000,OK\n");
        assert!(a.holds(b"k\xff") && !a.holds(b"k\xfe"));
        assert!(b.holds(b"k\xfe"));
        assert_eq!(registry.len(), 2);

        // Only the exact bytes release a lock
        assert_eq!(
            exchange(&mut b, &mut registry, b"del k\xff\n"),
            "004,Not a previously acquired resource\n"
        );
        assert_eq!(exchange(&mut a, &mut registry, b"del k\xff\n"), "000,OK\n");
    }

    #[test]
    fn test_unicode_whitespace_is_part_of_key() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        exchange(&mut conn, &mut registry, "v1\u{a0}\n");
        assert_eq!(conn.protocol_version(), "v1\u{a0}".as_bytes());

        assert_eq!(
            exchange(&mut conn, &mut registry, "set foo\u{a0}\r\n"),
            "000,OK\n"
        );
        assert!(conn.holds("foo\u{a0}".as_bytes()));
        assert!(!conn.holds(b"foo"));

        assert_eq!(exchange(&mut conn, &mut registry, "set foo\n"), "000,OK\n");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_high_water_pauses_line_handling() {
        let mut registry = LockRegistry::new();
        let mut conn = connect_with(
            4000,
            ConnectionLimits {
                output_high_water: 16,
                ..limits()
            },
        );

        let input = format!("v1\n{}", "bogus\n".repeat(10));
        assert_eq!(
            conn.receive(input.as_bytes(), &mut registry),
            ReadOutcome::Continue
        );

        // One 20-byte reply crosses the mark; the rest wait in the buffer
        assert_eq!(conn.pending_output(), b"003,Unknown command\n");
        assert!(conn.is_backed_up());
        assert!(conn.has_complete_line());

        let mut replies = 1;
        while conn.has_complete_line() {
            conn.consume_output(conn.pending_output().len());
            assert!(!conn.is_backed_up());
            assert_eq!(conn.process_lines(&mut registry), ReadOutcome::Continue);
            assert_eq!(conn.pending_output(), b"003,Unknown command\n");
            replies += 1;
        }
        assert_eq!(replies, 10);
    }

    #[test]
    fn test_paused_buffer_is_not_an_overlong_line() {
        let mut registry = LockRegistry::new();
        let mut conn = connect_with(
            4000,
            ConnectionLimits {
                max_line_length: 32,
                output_high_water: 1,
                ..limits()
            },
        );

        exchange(&mut conn, &mut registry, "v1\n");
        let input = "list\n".repeat(20);
        assert_eq!(
            conn.receive(input.as_bytes(), &mut registry),
            ReadOutcome::Continue
        );
        assert!(conn.is_backed_up());
    }

    #[test]
    fn test_output_cap_fails_connection() {
        let mut registry = LockRegistry::new();
        let mut owner = connect(4000);
        let mut reader = connect_with(
            4001,
            ConnectionLimits {
                output_high_water: 16,
                max_pending_output: 256,
                ..limits()
            },
        );

        exchange(&mut owner, &mut registry, "v1\n");
        for i in 0..10 {
            exchange(&mut owner, &mut registry, format!("set lock-{i}\n"));
        }

        // A single list reply larger than the cap
        exchange(&mut reader, &mut registry, "v1\n");
        assert_eq!(
            reader.receive(b"list\n", &mut registry),
            ReadOutcome::CloseWithError
        );
    }

    #[test]
    fn test_consume_output_partially() {
        let mut registry = LockRegistry::new();
        let mut conn = connect(4000);

        conn.receive(b"v1\nbogus\n", &mut registry);
        assert!(conn.has_pending_output());
        conn.consume_output(4);
        assert_eq!(conn.pending_output(), b"Unknown command\n");
        conn.consume_output(100);
        assert!(!conn.has_pending_output());
    }
}

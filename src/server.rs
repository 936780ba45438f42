//! mio event loop driving the lock server.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Everything runs on the calling thread; the lock registry is owned
//! by the loop and mutated only from here.
//!
//! A client that stops reading its replies is not read from either: once its
//! queued output reaches the high-water mark the loop waits for write
//! readiness only, and resumes reading after the queue drains.

use crate::config::Config;
use crate::connection::{Connection, ConnectionLimits, ReadOutcome};
use crate::error::{Error, Result};
use crate::registry::LockRegistry;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// An accepted socket and its protocol state.
struct Session {
    stream: TcpStream,
    conn: Connection,
    /// Interest currently registered with the poller.
    interest: Interest,
    /// Reading stopped because output backed up; socket may hold unread data.
    read_paused: bool,
}

/// Readiness of one token, copied out of the event batch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    hangup: bool,
}

/// Handle for stopping a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the event loop to stop. It closes every connection and the
    /// listener before `serve` returns.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

/// Single-threaded lock server.
pub struct Server {
    poll: Poll,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    sessions: Slab<Session>,
    registry: LockRegistry,
    read_buf: Vec<u8>,
    event_capacity: usize,
    limits: ConnectionLimits,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: &Config) -> Result<Self> {
        let addr = config.bind_addr()?;
        let listener = create_listener(addr, config.backlog)
            .map_err(|source| Error::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, backlog = config.backlog, "Listening");

        Ok(Self {
            poll,
            listener: Some(listener),
            local_addr,
            sessions: Slab::new(),
            registry: LockRegistry::new(),
            read_buf: vec![0; config.read_chunk.max(1)],
            event_capacity: config.event_capacity.max(1),
            limits: ConnectionLimits::from_config(config),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind and run until stopped.
    pub fn start(config: &Config) -> Result<()> {
        let mut server = Self::bind(config)?;
        server.serve()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the event loop until a stop is requested.
    ///
    /// Whether the loop ends normally or fails, all sockets are closed
    /// before returning.
    pub fn serve(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);
        let result = self.event_loop(&mut events);
        if let Err(ref e) = result {
            warn!(error = %e, "Event loop failed, shutting down");
        }
        self.stop();
        result
    }

    fn event_loop(&mut self, events: &mut Events) -> Result<()> {
        let mut ready = Vec::with_capacity(self.event_capacity);

        loop {
            if self.shutdown.load(Ordering::SeqCst) || self.listener.is_none() {
                info!("Stop requested");
                return Ok(());
            }

            if let Err(e) = self.poll.poll(events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(e));
            }

            ready.clear();
            ready.extend(events.iter().map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable(),
                hangup: event.is_read_closed() || event.is_error(),
            }));
            // Tear down hung-up peers before serving anyone else in the batch
            // so the locks they held are already free.
            ready.sort_by_key(|r| !r.hangup);

            for readiness in &ready {
                match readiness.token {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.handle_connection_event(conn_id, *readiness),
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let entry = self.sessions.vacant_entry();
                    let conn_id = entry.key();

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(conn_id), Interest::READABLE)
                    {
                        warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                        continue;
                    }

                    entry.insert(Session {
                        stream,
                        conn: Connection::new(peer_addr, self.limits),
                        interest: Interest::READABLE,
                        read_paused: false,
                    });

                    debug!(conn_id, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, readiness: Readiness) {
        if !self.sessions.contains(conn_id) {
            return;
        }

        let mut outcome = ReadOutcome::Continue;
        if readiness.readable || readiness.hangup {
            outcome = self.read_step(conn_id);
        }
        // Covers both fresh replies and write readiness for backed-up output
        if outcome == ReadOutcome::Continue {
            outcome = self.pump(conn_id);
        }
        if outcome != ReadOutcome::Continue {
            self.close_connection(conn_id, outcome);
        }
    }

    /// Drain the socket, feeding everything read to the connection.
    ///
    /// Stops early, leaving data in the socket, once the connection's output
    /// is backed up.
    fn read_step(&mut self, conn_id: usize) -> ReadOutcome {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return ReadOutcome::Continue;
        };

        loop {
            if session.conn.is_backed_up() {
                if !session.read_paused {
                    trace!(conn_id, "Output backed up, pausing reads");
                }
                session.read_paused = true;
                return ReadOutcome::Continue;
            }

            match session.stream.read(&mut self.read_buf) {
                Ok(0) => return ReadOutcome::Close,
                Ok(n) => {
                    let outcome = session
                        .conn
                        .receive(&self.read_buf[..n], &mut self.registry);
                    if outcome != ReadOutcome::Continue {
                        return outcome;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::Continue
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "Read error");
                    return ReadOutcome::CloseWithError;
                }
            }
        }
    }

    /// Write replies, then work through buffered lines and paused reads for
    /// as long as the socket keeps taking output.
    fn pump(&mut self, conn_id: usize) -> ReadOutcome {
        loop {
            let outcome = self.flush(conn_id);
            if outcome != ReadOutcome::Continue {
                return outcome;
            }

            let Some(session) = self.sessions.get_mut(conn_id) else {
                return ReadOutcome::Continue;
            };
            if session.conn.has_pending_output() {
                break;
            }

            if session.conn.has_complete_line() {
                let outcome = session.conn.process_lines(&mut self.registry);
                if outcome != ReadOutcome::Continue {
                    return outcome;
                }
            } else if session.read_paused {
                trace!(conn_id, "Output drained, resuming reads");
                session.read_paused = false;
                let outcome = self.read_step(conn_id);
                if outcome != ReadOutcome::Continue {
                    return outcome;
                }
            } else {
                break;
            }
        }

        self.update_interest(conn_id)
    }

    /// Write queued replies until the socket would block.
    fn flush(&mut self, conn_id: usize) -> ReadOutcome {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return ReadOutcome::Continue;
        };

        while session.conn.has_pending_output() {
            match session.stream.write(session.conn.pending_output()) {
                Ok(0) => {
                    debug!(conn_id, "Write returned 0");
                    return ReadOutcome::CloseWithError;
                }
                Ok(n) => session.conn.consume_output(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "Write error");
                    return ReadOutcome::CloseWithError;
                }
            }
        }

        ReadOutcome::Continue
    }

    /// Register for the readiness the connection is waiting on: write only
    /// while reads are paused, read plus write while output is queued,
    /// read otherwise.
    ///
    /// Re-registering also re-arms the edge trigger, so input that arrived
    /// while reads were paused is reported again.
    fn update_interest(&mut self, conn_id: usize) -> ReadOutcome {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return ReadOutcome::Continue;
        };

        let interest = match (session.conn.has_pending_output(), session.read_paused) {
            (true, true) => Interest::WRITABLE,
            (true, false) => Interest::READABLE | Interest::WRITABLE,
            (false, _) => Interest::READABLE,
        };
        if interest == session.interest {
            return ReadOutcome::Continue;
        }

        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut session.stream, Token(conn_id), interest)
        {
            debug!(conn_id, error = %e, "Failed to update interest");
            return ReadOutcome::CloseWithError;
        }
        session.interest = interest;

        ReadOutcome::Continue
    }

    /// Release the connection's locks and close its socket.
    fn close_connection(&mut self, conn_id: usize, outcome: ReadOutcome) {
        let Some(mut session) = self.sessions.try_remove(conn_id) else {
            return;
        };

        // A peer that only shut down its write side may still read replies
        if outcome == ReadOutcome::Close && session.conn.has_pending_output() {
            let _ = session.stream.write(session.conn.pending_output());
        }

        let released = session.conn.release_all(&mut self.registry);
        let _ = self.poll.registry().deregister(&mut session.stream);

        debug!(
            conn_id,
            peer = session.conn.peer(),
            released,
            error = outcome == ReadOutcome::CloseWithError,
            "Connection closed"
        );
    }

    /// Close every connection and the listening socket.
    ///
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        let connections = self.sessions.len();
        for mut session in self.sessions.drain() {
            session.conn.release_all(&mut self.registry);
            let _ = self.poll.registry().deregister(&mut session.stream);
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            info!(connections, "Server stopped");
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

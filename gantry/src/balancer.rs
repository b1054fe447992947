//! Request/response balancer: the four-endpoint store-and-forward router.
//!
//! # Architecture
//!
//! ```text
//!              producers                         fitter pool
//!                 │ push                            ▲ pull
//!                 ▼                                 │
//!          ┌─ request_in ──► requests queue ──► request_out ─┐
//!          │                                                 │
//!          │                  Balancer                       │
//!          │                                                 │
//!          └─ response_out ◄── responses queue ◄── response_in ─┘
//!                 ▲ pull                            │ push
//!                 │                                 ▼
//!              producers                         fitter pool
//! ```
//!
//! A single thread polls all four listening endpoints and every accepted
//! connection for readiness. Readable inbound connections are drained
//! completely into the per-direction FIFO queue; ready outbound consumers
//! are handed queued messages one at a time, rotating among them so that
//! idle workers share the load (work-queue delivery).
//!
//! The balancer is payload-blind: a message is a line of bytes. It never
//! decodes, deduplicates, retries, or acknowledges. Once a message's bytes
//! have been handed to a consumer socket it counts as delivered; a consumer
//! that dies with buffered bytes silently loses them (at-most-once). The
//! two queues are unbounded; sustained imbalance grows memory without
//! limit, which is an accepted operational risk, not an error.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::net::{Conn, Endpoint, Listener, ReadStatus};
use crate::trace::{debug, info, trace, warn};
use crate::wire::drain_lines;

const REQUEST_IN: Token = Token(0);
const REQUEST_OUT: Token = Token(1);
const RESPONSE_IN: Token = Token(2);
const RESPONSE_OUT: Token = Token(3);

/// First token handed out to accepted connections.
const FIRST_CONN_TOKEN: usize = 4;

/// Poll timeout so the loop can notice the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the balancer's four bind points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancerConfig {
    /// Producers push requests here.
    pub request_in: Endpoint,
    /// Workers pull requests from here.
    pub request_out: Endpoint,
    /// Workers push responses here.
    pub response_in: Endpoint,
    /// Producers pull responses from here.
    pub response_out: Endpoint,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            request_in: Endpoint::any(7000),
            request_out: Endpoint::any(7001),
            response_in: Endpoint::any(8001),
            response_out: Endpoint::any(8000),
        }
    }
}

impl BalancerConfig {
    /// Configuration with all four endpoints on loopback ephemeral ports.
    ///
    /// Query the actually-bound addresses through [`Balancer::endpoints`].
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            request_in: Endpoint::localhost(0),
            request_out: Endpoint::localhost(0),
            response_in: Endpoint::localhost(0),
            response_out: Endpoint::localhost(0),
        }
    }
}

/// The four addresses a running balancer is actually bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub request_in: Endpoint,
    pub request_out: Endpoint,
    pub response_in: Endpoint,
    pub response_out: Endpoint,
}

/// Message counters, one per direction per hop.
#[derive(Debug, Default)]
pub struct BalancerStats {
    requests_in: AtomicU64,
    requests_out: AtomicU64,
    responses_in: AtomicU64,
    responses_out: AtomicU64,
}

impl BalancerStats {
    /// Returns a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_in: self.requests_in.load(Ordering::Relaxed),
            requests_out: self.requests_out.load(Ordering::Relaxed),
            responses_in: self.responses_in.load(Ordering::Relaxed),
            responses_out: self.responses_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BalancerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests accepted from producers.
    pub requests_in: u64,
    /// Requests handed to workers.
    pub requests_out: u64,
    /// Responses accepted from workers.
    pub responses_in: u64,
    /// Responses handed to producers.
    pub responses_out: u64,
}

/// Error binding or running the balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// One of the four endpoints could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        source: io::Error,
    },
    /// Poll or socket registration failure.
    #[error("poll error: {0}")]
    Io(#[from] io::Error),
}

/// Which of the four endpoint groups a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    RequestIn,
    RequestOut,
    ResponseIn,
    ResponseOut,
}

impl Side {
    const fn is_inbound(self) -> bool {
        matches!(self, Self::RequestIn | Self::ResponseIn)
    }
}

/// Per-connection state.
struct Connection {
    conn: Conn,
    side: Side,
    /// Bytes read but not yet forming a complete line (inbound sides).
    rdbuf: Vec<u8>,
    /// Bytes assigned but not yet written out (outbound sides).
    backlog: Vec<u8>,
    /// Last observed writability (outbound sides).
    writable: bool,
}

/// The single-threaded balancer event loop.
///
/// Use directly when the caller owns the thread (and in tests that drive
/// the loop step by step); [`Balancer::spawn`] wraps it in a thread with a
/// shutdown flag.
pub struct BalancerLoop {
    poll: Poll,
    events: Events,
    request_in: Listener,
    request_out: Listener,
    response_in: Listener,
    response_out: Listener,
    endpoints: Endpoints,
    conns: HashMap<Token, Connection>,
    next_token: usize,
    /// Requests pulled in but not yet handed to a worker. FIFO.
    requests: VecDeque<Vec<u8>>,
    /// Responses pulled in but not yet handed to a producer. FIFO.
    responses: VecDeque<Vec<u8>>,
    /// Worker connections in accept order (request_out consumers).
    workers: Vec<Token>,
    /// Producer connections in accept order (response_out consumers).
    producers: Vec<Token>,
    worker_cursor: usize,
    producer_cursor: usize,
    stats: Arc<BalancerStats>,
}

impl BalancerLoop {
    /// Binds the four endpoints and readies the poll loop.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::Bind`] naming the endpoint that failed, or
    /// [`BalancerError::Io`] if poll setup fails.
    pub fn bind(config: BalancerConfig) -> Result<Self, BalancerError> {
        let poll = Poll::new()?;

        let bind = |endpoint: Endpoint| {
            Listener::bind(endpoint).map_err(|source| BalancerError::Bind { endpoint, source })
        };
        let mut request_in = bind(config.request_in)?;
        let mut request_out = bind(config.request_out)?;
        let mut response_in = bind(config.response_in)?;
        let mut response_out = bind(config.response_out)?;

        let registry = poll.registry();
        registry.register(&mut request_in, REQUEST_IN, Interest::READABLE)?;
        registry.register(&mut request_out, REQUEST_OUT, Interest::READABLE)?;
        registry.register(&mut response_in, RESPONSE_IN, Interest::READABLE)?;
        registry.register(&mut response_out, RESPONSE_OUT, Interest::READABLE)?;

        let endpoints = Endpoints {
            request_in: request_in.local_addr()?,
            request_out: request_out.local_addr()?,
            response_in: response_in.local_addr()?,
            response_out: response_out.local_addr()?,
        };

        info!(
            request_in = %endpoints.request_in,
            request_out = %endpoints.request_out,
            response_in = %endpoints.response_in,
            response_out = %endpoints.response_out,
            "balancer bound"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            request_in,
            request_out,
            response_in,
            response_out,
            endpoints,
            conns: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            workers: Vec::new(),
            producers: Vec::new(),
            worker_cursor: 0,
            producer_cursor: 0,
            stats: Arc::new(BalancerStats::default()),
        })
    }

    /// Returns the four addresses this loop is bound to.
    #[must_use]
    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Returns a handle to the shared message counters.
    #[must_use]
    pub fn stats(&self) -> Arc<BalancerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the loop until `shutdown` is set.
    ///
    /// There is no graceful drain: messages still queued when the flag is
    /// observed are stranded, matching abrupt process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails irrecoverably.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), BalancerError> {
        info!("balancer loop running");
        while !shutdown.load(Ordering::Relaxed) {
            self.poll_once(Some(POLL_INTERVAL))?;
        }
        info!("balancer loop exiting");
        Ok(())
    }

    /// One iteration: poll, accept, drain readable inbound connections,
    /// then flush both outbound directions.
    ///
    /// # Errors
    ///
    /// Returns an error if polling or socket registration fails.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), BalancerError> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            match token {
                REQUEST_IN => self.accept_all(Side::RequestIn)?,
                REQUEST_OUT => self.accept_all(Side::RequestOut)?,
                RESPONSE_IN => self.accept_all(Side::ResponseIn)?,
                RESPONSE_OUT => self.accept_all(Side::ResponseOut)?,
                token => {
                    if readable {
                        self.drain_inbound(token);
                    }
                    if writable {
                        self.mark_writable(token);
                    }
                }
            }
        }

        self.flush(Side::RequestOut);
        self.flush(Side::ResponseOut);
        Ok(())
    }

    /// Accepts every pending connection on the listener for `side`.
    fn accept_all(&mut self, side: Side) -> Result<(), BalancerError> {
        loop {
            let listener = match side {
                Side::RequestIn => &self.request_in,
                Side::RequestOut => &self.request_out,
                Side::ResponseIn => &self.response_in,
                Side::ResponseOut => &self.response_out,
            };
            let accepted = match listener.try_accept() {
                Ok(accepted) => accepted,
                Err(_e) => {
                    warn!(side = ?side, error = %_e, "accept failed");
                    return Ok(());
                }
            };
            let Some((mut conn, _peer)) = accepted else {
                return Ok(());
            };

            let token = Token(self.next_token);
            self.next_token += 1;

            let interest = if side.is_inbound() {
                Interest::READABLE
            } else {
                Interest::WRITABLE
            };
            self.poll.registry().register(&mut conn, token, interest)?;

            match side {
                Side::RequestOut => self.workers.push(token),
                Side::ResponseOut => self.producers.push(token),
                _ => {}
            }

            info!(side = ?side, peer = %_peer, "peer connected");
            self.conns.insert(
                token,
                Connection {
                    conn,
                    side,
                    rdbuf: Vec::new(),
                    backlog: Vec::new(),
                    writable: false,
                },
            );
        }
    }

    /// Drains a readable inbound connection into its direction queue.
    fn drain_inbound(&mut self, token: Token) {
        let (lines, side, closed) = {
            let Some(c) = self.conns.get_mut(&token) else {
                return;
            };
            if !c.side.is_inbound() {
                return;
            }
            match c.conn.try_read(&mut c.rdbuf) {
                Ok(status) => {
                    let lines = drain_lines(&mut c.rdbuf);
                    (lines, c.side, matches!(status, ReadStatus::Closed))
                }
                Err(_e) => {
                    warn!(side = ?c.side, error = %_e, "read failed, dropping connection");
                    (Vec::new(), c.side, true)
                }
            }
        };

        if !lines.is_empty() {
            let count = lines.len() as u64;
            match side {
                Side::RequestIn => {
                    self.stats.requests_in.fetch_add(count, Ordering::Relaxed);
                    self.requests.extend(lines);
                }
                Side::ResponseIn => {
                    self.stats.responses_in.fetch_add(count, Ordering::Relaxed);
                    self.responses.extend(lines);
                }
                _ => {}
            }
        }

        if closed {
            // A partial trailing line from a closed peer is discarded.
            self.remove_conn(token);
        }
    }

    /// Records writability of an outbound connection and finishes any
    /// partially written message.
    fn mark_writable(&mut self, token: Token) {
        let mut failed = false;
        match self.conns.get_mut(&token) {
            Some(c) if !c.side.is_inbound() => {
                c.writable = true;
                failed = !Self::flush_backlog(c);
            }
            _ => return,
        }
        if failed {
            self.remove_conn(token);
        }
    }

    /// Hands queued messages of one direction to its ready consumers.
    ///
    /// Messages leave the queue in FIFO order; each is assigned to exactly
    /// one consumer, rotating among those that are writable with no
    /// backlog. When no consumer qualifies, the queue simply keeps growing.
    fn flush(&mut self, side: Side) {
        let (queue, order, cursor, delivered) = match side {
            Side::RequestOut => (
                &mut self.requests,
                &mut self.workers,
                &mut self.worker_cursor,
                &self.stats.requests_out,
            ),
            Side::ResponseOut => (
                &mut self.responses,
                &mut self.producers,
                &mut self.producer_cursor,
                &self.stats.responses_out,
            ),
            _ => return,
        };
        let conns = &mut self.conns;
        let mut dead: Vec<Token> = Vec::new();

        // Finish off partially written messages before assigning new ones.
        for &token in order.iter() {
            if let Some(c) = conns.get_mut(&token) {
                if c.writable && !c.backlog.is_empty() && !Self::flush_backlog(c) {
                    dead.push(token);
                }
            }
        }

        while !queue.is_empty() && !order.is_empty() {
            let n = order.len();
            let mut pick = None;
            for i in 0..n {
                let idx = (*cursor + i) % n;
                let token = order[idx];
                if dead.contains(&token) {
                    continue;
                }
                if let Some(c) = conns.get(&token) {
                    if c.writable && c.backlog.is_empty() {
                        pick = Some((token, idx));
                        break;
                    }
                }
            }
            let Some((token, idx)) = pick else {
                break;
            };
            *cursor = (idx + 1) % n;

            let Some(c) = conns.get_mut(&token) else {
                continue;
            };
            let Some(line) = queue.pop_front() else {
                break;
            };
            c.backlog.reserve(line.len() + 1);
            c.backlog.extend_from_slice(&line);
            c.backlog.push(b'\n');
            delivered.fetch_add(1, Ordering::Relaxed);
            if !Self::flush_backlog(c) {
                dead.push(token);
            }
        }

        if !queue.is_empty() {
            trace!(side = ?side, queued = queue.len(), "messages waiting for a ready consumer");
        }

        for token in dead {
            self.remove_conn(token);
        }
    }

    /// Writes out as much of the connection's backlog as the socket takes.
    ///
    /// Returns `false` if the connection failed and must be removed.
    fn flush_backlog(c: &mut Connection) -> bool {
        while !c.backlog.is_empty() {
            match c.conn.try_write(&c.backlog) {
                Ok(Some(0)) => break,
                Ok(Some(n)) => {
                    c.backlog.drain(..n);
                }
                Ok(None) => {
                    c.writable = false;
                    break;
                }
                Err(_e) => {
                    warn!(side = ?c.side, error = %_e, "write failed, dropping connection");
                    return false;
                }
            }
        }
        true
    }

    /// Deregisters and forgets a connection.
    fn remove_conn(&mut self, token: Token) {
        let Some(mut c) = self.conns.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut c.conn);
        if !c.backlog.is_empty() {
            warn!(
                side = ?c.side,
                bytes = c.backlog.len(),
                "connection closed with undelivered bytes"
            );
        }
        match c.side {
            Side::RequestOut => Self::forget(&mut self.workers, &mut self.worker_cursor, token),
            Side::ResponseOut => {
                Self::forget(&mut self.producers, &mut self.producer_cursor, token);
            }
            _ => {}
        }
        debug!(side = ?c.side, "peer disconnected");
    }

    /// Removes a token from a consumer rotation, keeping the cursor stable.
    fn forget(order: &mut Vec<Token>, cursor: &mut usize, token: Token) {
        if let Some(pos) = order.iter().position(|&t| t == token) {
            order.remove(pos);
            if *cursor > pos {
                *cursor -= 1;
            }
            if order.is_empty() {
                *cursor = 0;
            } else {
                *cursor %= order.len();
            }
        }
    }
}

/// Handle to a balancer running on its own thread.
///
/// Dropping the handle signals shutdown but does not wait for the loop to
/// exit; use [`Balancer::shutdown`] to join.
pub struct Balancer {
    shutdown_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    endpoints: Endpoints,
    stats: Arc<BalancerStats>,
}

impl Balancer {
    /// Binds the four endpoints and spawns the event loop thread.
    ///
    /// # Errors
    ///
    /// Returns an error if any endpoint cannot be bound.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn(config: BalancerConfig) -> Result<Self, BalancerError> {
        let mut inner = BalancerLoop::bind(config)?;
        let endpoints = inner.endpoints();
        let stats = inner.stats();

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let handle = thread::Builder::new()
            .name("gantry-balancer".into())
            .spawn(move || {
                if let Err(_e) = inner.run(&flag) {
                    warn!(error = %_e, "balancer loop failed");
                }
            })
            .expect("failed to spawn balancer thread");

        Ok(Self {
            shutdown_flag,
            handle: Some(handle),
            endpoints,
            stats,
        })
    }

    /// Returns the four addresses the balancer is bound to.
    #[must_use]
    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Returns a point-in-time copy of the message counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Signals the loop to exit and joins its thread.
    ///
    /// Queued messages are stranded; the fabric defines no graceful drain.
    pub fn shutdown(mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

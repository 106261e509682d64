// src/conn.rs
use crate::cgi::CgiWorker;
use crate::http::{Method, StatusCode};
use crate::parser::RequestParser;
use crate::request::{Request, RequestStatus};
use crate::response::{Progress, Response};
use crate::router::Router;
use crate::syscalls::Socket;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes requested from the socket per read call.
pub const READ_BUF_SIZE: usize = 16 * 1024;
/// Routed-but-unsent exchanges per connection. Parsing pauses at this depth.
pub const MAX_PIPELINE: usize = 16;

/// A finished request and the response it is waiting to have sent.
#[derive(Debug)]
pub struct Exchange {
    pub id: u64,
    pub request: Request,
    pub response: Response,
}

/// One accepted client.
///
/// Requests are parsed as bytes arrive and answered strictly in arrival order:
/// only the front of `queue` is ever written to the socket.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    socket: Option<Socket>,
    peer: Option<SocketAddr>,
    server_index: usize,
    receive_buffer: Vec<u8>,
    parser: RequestParser,
    queue: VecDeque<Exchange>,
    last_activity: Instant,
    next_id: u64,
    /// A request asked for (or forced) the end of the connection; later bytes are ignored.
    stop_reading: bool,
    /// The peer shut down its sending side.
    peer_closed: bool,
    /// The response that ends the connection has been flushed, or sending failed.
    finished: bool,
}

impl Connection {
    pub fn new(
        socket: Socket,
        peer: Option<SocketAddr>,
        server_index: usize,
        max_header_size: usize,
        max_body_size: usize,
        now: Instant,
    ) -> Self {
        Self {
            fd: socket.as_raw_fd(),
            socket: Some(socket),
            peer,
            server_index,
            receive_buffer: Vec::with_capacity(READ_BUF_SIZE),
            parser: RequestParser::new(max_header_size, max_body_size),
            queue: VecDeque::new(),
            last_activity: now,
            next_id: 0,
            stop_reading: false,
            peer_closed: false,
            finished: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn server_index(&self) -> usize {
        self.server_index
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Read what the socket has. `Ok(0)` means the peer closed its side.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.as_mut() {
            Some(socket) => io::Read::read(socket, buf),
            None => Ok(0),
        }
    }

    /// Feed received bytes through the parser. Every request completed (or rejected)
    /// by these bytes is routed and queued; CGI workers it started are returned.
    pub fn append(&mut self, bytes: &[u8], router: &Router, now: Instant) -> Vec<CgiWorker> {
        self.last_activity = now;
        if self.stop_reading {
            return Vec::new();
        }
        self.receive_buffer.extend_from_slice(bytes);
        self.process(router)
    }

    /// Parse and route buffered requests until the pipeline is full. Bytes past
    /// that point wait in the receive buffer for the queue to drain.
    pub fn process(&mut self, router: &Router) -> Vec<CgiWorker> {
        let mut workers = Vec::new();
        while self.queue.len() < MAX_PIPELINE {
            match self.parser.advance(&mut self.receive_buffer) {
                RequestStatus::Complete | RequestStatus::Bad => {}
                RequestStatus::Incomplete | RequestStatus::HeaderComplete => break,
            }
            let request = self.parser.take();
            let routed = router.dispatch(
                self.server_index,
                &request,
                self.peer.map(|p| p.ip()),
            );
            let id = self.next_id;
            self.next_id += 1;

            let mut response = routed.response;
            let close = request.is_bad()
                || request.wants_close()
                || response.status.closes_connection();
            response.set_close(close);
            if request.method == Method::Head {
                response.set_head_only();
            }
            response.build();

            if let Some(mut worker) = routed.worker {
                worker.client_fd = self.fd;
                worker.exchange_id = id;
                workers.push(worker);
            }
            self.queue.push_back(Exchange {
                id,
                request,
                response,
            });

            if close {
                // Nothing after this request is answered
                self.stop_reading = true;
                self.receive_buffer.clear();
                break;
            }
        }
        workers
    }

    /// Drive the front response one step.
    pub fn send_next(&mut self, now: Instant) -> Progress {
        let (Some(socket), Some(front)) = (self.socket.as_mut(), self.queue.front_mut()) else {
            return Progress::Idle;
        };
        let progress = front.response.send(socket);
        match progress {
            Progress::Wrote(_) => self.last_activity = now,
            Progress::SentAll => {
                self.last_activity = now;
                if let Some(done) = self.queue.pop_front() {
                    debug!(
                        fd = self.fd,
                        status = done.response.status.as_u16(),
                        bytes = done.response.bytes_sent(),
                        "response sent"
                    );
                    if done.response.closes_connection() {
                        self.finished = true;
                    }
                }
            }
            Progress::Failed => self.finished = true,
            Progress::Blocked | Progress::Idle => {}
        }
        progress
    }

    /// Front response has bytes ready for the socket.
    pub fn wants_write(&self) -> bool {
        self.queue
            .front()
            .is_some_and(|ex| ex.response.wants_write())
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The socket should be read: more requests may arrive and the pipeline has room.
    pub fn is_reading(&self) -> bool {
        !self.stop_reading && self.queue.len() < MAX_PIPELINE
    }

    /// Received bytes that have not been parsed into a queued exchange yet.
    pub fn has_backlog(&self) -> bool {
        !self.receive_buffer.is_empty() && self.queue.len() < MAX_PIPELINE
    }

    /// The peer shut down its side. The connection lingers until queued responses are out.
    pub fn mark_peer_closed(&mut self) {
        self.peer_closed = true;
        self.stop_reading = true;
    }

    /// Nothing more will be exchanged on this connection.
    pub fn should_close(&self) -> bool {
        self.finished || (self.peer_closed && self.queue.is_empty())
    }

    pub fn is_timed_out(&self, now: Instant, idle: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > idle
    }

    /// Close the socket. Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        match self.socket.take() {
            Some(_) => {
                debug!(fd = self.fd, pending = self.queue.len(), "connection closed");
                true
            }
            None => false,
        }
    }

    fn exchange_mut(&mut self, id: u64) -> Option<&mut Exchange> {
        self.queue.iter_mut().find(|ex| ex.id == id)
    }

    /// The exchange is still queued (CGI output has somewhere to go).
    pub fn has_exchange(&self, id: u64) -> bool {
        self.queue.iter().any(|ex| ex.id == id)
    }

    pub fn push_cgi_output(&mut self, id: u64, bytes: &[u8]) {
        if let Some(ex) = self.exchange_mut(id) {
            ex.response.push_cgi(bytes);
        }
    }

    pub fn finish_cgi_output(&mut self, id: u64) {
        if let Some(ex) = self.exchange_mut(id) {
            ex.response.finish_cgi();
        }
    }

    /// The CGI behind exchange `id` failed or timed out.
    ///
    /// If nothing of its response reached the socket it is replaced by `status`;
    /// otherwise the stream cannot be repaired and the connection must close
    /// (returns `false`).
    pub fn fail_cgi(&mut self, id: u64, status: StatusCode, router: &Router) -> bool {
        let server_index = self.server_index;
        let Some(ex) = self.exchange_mut(id) else {
            return true;
        };
        if ex.response.has_started() {
            self.finished = true;
            return false;
        }
        let mut response = router.error_response(server_index, status);
        response.set_close(ex.request.wants_close());
        if ex.request.method == Method::Head {
            response.set_head_only();
        }
        response.build();
        ex.response = response;
        true
    }
}

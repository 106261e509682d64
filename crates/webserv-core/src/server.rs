// src/server.rs
use crate::cgi::CgiWorker;
use crate::config::{Config, Limits};
use crate::conn::{Connection, READ_BUF_SIZE};
use crate::error::{Error, Result};
use crate::http::StatusCode;
use crate::registry::{Owner, Registry};
use crate::response::Progress;
use crate::router::Router;
use crate::syscalls::{self, Event, Interest, Socket};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long pending responses may take to flush once shutdown starts.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);
/// Send steps per writable event before other descriptors get their turn.
const WRITES_PER_EVENT: usize = 64;

/// Cross-thread request to stop the reactor. Checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trigger this token on SIGINT/SIGTERM. Only one handler may exist per process.
    pub fn install_signal_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            info!("signal received, shutting down");
            token.trigger();
        })
        .map_err(|e| Error::Io(io::Error::other(e)))
    }
}

struct Listener {
    fd: OwnedFd,
    addr: SocketAddr,
}

/// The single-threaded reactor: listening sockets, client connections and CGI pipes
/// multiplexed over one readiness registry.
pub struct Server {
    limits: Limits,
    router: Router,
    registry: Registry,
    listeners: Vec<Listener>,
    conns: HashMap<RawFd, Connection>,
    /// Running CGI workers keyed by their stdout descriptor.
    workers: HashMap<RawFd, CgiWorker>,
    /// Workers whose pipe is closed, waiting to be reaped.
    reaping: Vec<CgiWorker>,
    events: Vec<Event>,
    shutdown: ShutdownToken,
}

impl Server {
    /// Bind one listening socket per virtual server.
    pub fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let mut registry = Registry::new(config.limits.max_connections.min(4096) + 64)?;
        let mut router = Router::new(config.servers.clone());
        let mut listeners = Vec::with_capacity(config.servers.len());

        for (index, server) in config.servers.iter().enumerate() {
            let wanted = server.listen_addr()?;
            let fd = syscalls::create_listen_socket(wanted)
                .map_err(|e| Error::Config(format!("cannot listen on {wanted}: {e}")))?;
            let addr = syscalls::local_addr(fd.as_raw_fd())?;
            registry.register(fd.as_raw_fd(), Interest::READ, Owner::Listener(index))?;
            router.set_bound_port(index, addr.port());
            info!(%addr, server = %server.server_name, "listening");
            listeners.push(Listener { fd, addr });
        }

        Ok(Self {
            limits: config.limits,
            router,
            registry,
            listeners,
            conns: HashMap::new(),
            workers: HashMap::new(),
            reaping: Vec::new(),
            events: Vec::new(),
            shutdown: ShutdownToken::new(),
        })
    }

    /// Use an externally owned token (e.g. one wired to Ctrl-C).
    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Run until the shutdown token fires (or the poller fails), then drain and return.
    pub fn run(&mut self) -> Result<()> {
        let poll_ms = self.limits.poll_interval().as_millis().clamp(1, i32::MAX as u128) as i32;
        let mut draining_since: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if draining_since.is_none() && self.shutdown.is_triggered() {
                self.stop_accepting();
                draining_since = Some(now);
            }
            if let Some(since) = draining_since {
                let idle = self.conns.values().all(|c| !c.has_pending()) && self.workers.is_empty();
                if idle || now.duration_since(since) > DRAIN_WINDOW {
                    break;
                }
            }

            let mut events = std::mem::take(&mut self.events);
            match self.registry.poll(poll_ms) {
                Ok(ready) => {
                    events.clear();
                    events.extend_from_slice(ready);
                }
                Err(e) => {
                    error!(error = %e, "readiness poll failed");
                    self.events = events;
                    if draining_since.is_some() {
                        break;
                    }
                    self.stop_accepting();
                    draining_since = Some(Instant::now());
                    continue;
                }
            }

            let now = Instant::now();
            for ev in &events {
                if let Err(e) = self.dispatch(*ev, now) {
                    error!(error = %e, "reactor aborted");
                    self.events = events;
                    self.teardown();
                    return Err(e);
                }
            }
            self.events = events;
            self.tick(now, draining_since.is_some());
        }

        self.teardown();
        info!("server stopped");
        Ok(())
    }

    fn stop_accepting(&mut self) {
        for listener in self.listeners.drain(..) {
            self.registry.unregister(listener.fd.as_raw_fd());
        }
        info!(connections = self.conns.len(), "no longer accepting, draining");
    }

    fn dispatch(&mut self, ev: Event, now: Instant) -> Result<()> {
        match self.registry.owner(ev.fd) {
            Some(Owner::Listener(index)) => self.accept(ev.fd, index, now),
            Some(Owner::Client) => self.on_client(ev, now),
            Some(Owner::Cgi) => self.on_cgi(ev.fd),
            None => Ok(()),
        }
    }

    // ═══ Listeners ═══

    fn accept(&mut self, listen_fd: RawFd, server_index: usize, now: Instant) -> Result<()> {
        loop {
            let (fd, peer) = match syscalls::accept_connection(listen_fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // EMFILE and friends: leave the rest in the backlog for the next tick
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            };
            if self.conns.len() >= self.limits.max_connections {
                warn!(?peer, limit = self.limits.max_connections, "connection limit reached, refusing");
                drop(fd);
                continue;
            }

            let socket = Socket::new(fd);
            let raw = socket.as_raw_fd();
            let conn = Connection::new(
                socket,
                peer,
                server_index,
                self.limits.max_header_size,
                self.router.max_body_size(server_index),
                now,
            );
            self.registry.register(raw, Interest::READ, Owner::Client)?;
            self.conns.insert(raw, conn);
            debug!(fd = raw, ?peer, "accepted");
        }
    }

    // ═══ Clients ═══

    fn on_client(&mut self, ev: Event, now: Instant) -> Result<()> {
        let fd = ev.fd;
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };

        if ev.error || (ev.hangup && !ev.readable) {
            debug!(fd, "peer hung up");
            self.close_connection(fd);
            return Ok(());
        }

        let mut spawned = Vec::new();
        let mut broken = false;
        if ev.readable {
            let mut buf = [0u8; READ_BUF_SIZE];
            // A full pipeline leaves the rest in the kernel buffer
            while conn.is_reading() {
                match conn.read(&mut buf) {
                    Ok(0) => {
                        conn.mark_peer_closed();
                        break;
                    }
                    Ok(n) => spawned.extend(conn.append(&buf[..n], &self.router, now)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(fd, error = %e, "read failed");
                        broken = true;
                        break;
                    }
                }
            }
        }

        if !broken && ev.writable {
            for _ in 0..WRITES_PER_EVENT {
                match conn.send_next(now) {
                    Progress::Wrote(_) | Progress::SentAll => {}
                    Progress::Blocked | Progress::Idle | Progress::Failed => break,
                }
            }
            if conn.has_backlog() {
                spawned.extend(conn.process(&self.router));
            }
        }

        for worker in spawned {
            self.adopt_worker(worker)?;
        }
        if broken {
            self.close_connection(fd);
            return Ok(());
        }
        self.refresh(fd)
    }

    /// Close the connection if it is done, otherwise align its interest with its state.
    fn refresh(&mut self, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.get(&fd) else {
            return Ok(());
        };
        if conn.should_close() {
            self.close_connection(fd);
            return Ok(());
        }
        let mut interest = if conn.is_reading() {
            Interest::READ
        } else {
            Interest::NONE
        };
        if conn.wants_write() {
            interest = interest | Interest::WRITE;
        }
        self.registry.set_interest(fd, interest)
    }

    fn close_connection(&mut self, fd: RawFd) {
        self.registry.unregister(fd);
        if let Some(mut conn) = self.conns.remove(&fd) {
            conn.close();
        }
        let orphans: Vec<RawFd> = self
            .workers
            .iter()
            .filter(|(_, w)| w.client_fd == fd)
            .map(|(&pipe, _)| pipe)
            .collect();
        for pipe in orphans {
            self.retire_worker(pipe, true);
        }
    }

    // ═══ CGI ═══

    fn adopt_worker(&mut self, worker: CgiWorker) -> Result<()> {
        let Some(pipe) = worker.stdout_fd() else {
            self.reaping.push(worker);
            return Ok(());
        };
        self.registry.register(pipe, Interest::READ, Owner::Cgi)?;
        self.workers.insert(pipe, worker);
        Ok(())
    }

    fn on_cgi(&mut self, pipe: RawFd) -> Result<()> {
        let Some(worker) = self.workers.get_mut(&pipe) else {
            return Ok(());
        };
        let mut output = Vec::new();
        let outcome = worker.drain_stdout(&mut output);
        let (client, id, pid) = (worker.client_fd, worker.exchange_id, worker.pid);

        let client_alive = self
            .conns
            .get(&client)
            .is_some_and(|c| c.has_exchange(id));
        if !client_alive {
            debug!(pid, "client gone, stopping CGI");
            self.retire_worker(pipe, true);
            return Ok(());
        }

        let mut keep = true;
        if let Some(conn) = self.conns.get_mut(&client) {
            if !output.is_empty() {
                conn.push_cgi_output(id, &output);
            }
            match outcome {
                Ok(false) => {}
                Ok(true) => {
                    conn.finish_cgi_output(id);
                    self.retire_worker(pipe, false);
                }
                Err(e) => {
                    warn!(pid, error = %e, "reading CGI output failed");
                    keep = conn.fail_cgi(id, StatusCode::BAD_GATEWAY, &self.router);
                    self.retire_worker(pipe, true);
                }
            }
        }
        if !keep {
            self.close_connection(client);
            return Ok(());
        }
        self.refresh(client)
    }

    /// Take a worker off the registry. `kill` stops a script that is still running.
    fn retire_worker(&mut self, pipe: RawFd, kill: bool) {
        self.registry.unregister(pipe);
        let Some(mut worker) = self.workers.remove(&pipe) else {
            return;
        };
        if kill {
            worker.kill();
        } else {
            worker.finish();
        }
        if !worker.try_reap() {
            self.reaping.push(worker);
        }
    }

    // ═══ Timers ═══

    fn tick(&mut self, now: Instant, draining: bool) {
        let cgi_timeout = self.limits.cgi_timeout();
        let expired: Vec<RawFd> = self
            .workers
            .iter()
            .filter(|(_, w)| w.is_timed_out(now, cgi_timeout))
            .map(|(&pipe, _)| pipe)
            .collect();
        for pipe in expired {
            let Some(worker) = self.workers.get(&pipe) else {
                continue;
            };
            let (client, id, pid) = (worker.client_fd, worker.exchange_id, worker.pid);
            warn!(pid, timeout = ?cgi_timeout, "CGI timed out");
            self.retire_worker(pipe, true);
            let repaired = match self.conns.get_mut(&client) {
                Some(conn) => conn.fail_cgi(id, StatusCode::GATEWAY_TIMEOUT, &self.router),
                None => true,
            };
            if repaired {
                if let Err(e) = self.refresh(client) {
                    warn!(fd = client, error = %e, "cannot update interest");
                }
            } else {
                self.close_connection(client);
            }
        }

        let idle = self.limits.idle_timeout();
        let stale: Vec<RawFd> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_timed_out(now, idle) || (draining && !c.has_pending()))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in stale {
            debug!(fd, "closing idle connection");
            self.close_connection(fd);
        }

        self.reaping.retain_mut(|w| !w.try_reap());
    }

    /// Stop every worker and close every connection.
    fn teardown(&mut self) {
        let pipes: Vec<RawFd> = self.workers.keys().copied().collect();
        for pipe in pipes {
            self.retire_worker(pipe, true);
        }
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close_connection(fd);
        }
        for listener in self.listeners.drain(..) {
            self.registry.unregister(listener.fd.as_raw_fd());
        }
        // Killed children exit promptly; give them a moment before giving up on reaping
        let deadline = Instant::now() + Duration::from_millis(500);
        while !self.reaping.is_empty() && Instant::now() < deadline {
            self.reaping.retain_mut(|w| !w.try_reap());
            std::thread::sleep(Duration::from_millis(5));
        }
        if !self.reaping.is_empty() {
            warn!(count = self.reaping.len(), "CGI processes left unreaped");
        }
    }
}

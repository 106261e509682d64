// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

// ---- Socket Operations ----

/// Listen backlog handed to `listen(2)`.
const BACKLOG: c_int = 512;

/// Create a non-blocking TCP listening socket bound to `addr`.
///
/// SO_REUSEADDR is set so restarts do not trip over sockets in TIME_WAIT.
pub fn create_listen_socket(addr: SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        let raw = libc::socket(domain, libc::SOCK_STREAM, 0);
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        OwnedFd::from_raw_fd(raw)
    };

    set_nonblocking(fd.as_raw_fd())?;
    set_cloexec(fd.as_raw_fd())?;

    let one: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        // SO_NOSIGPIPE on the listener is inherited by accepted sockets (macOS has no MSG_NOSIGNAL)
        #[cfg(target_os = "macos")]
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
    }

    let (storage, len) = socket_addr_to_raw(&addr);
    unsafe {
        if libc::bind(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
        if libc::listen(fd.as_raw_fd(), BACKLOG) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(fd)
}

/// Accept one pending connection.
///
/// Returns `Ok(None)` when the accept queue is drained (would-block).
/// The accepted socket is non-blocking and close-on-exec so CGI children never inherit it.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(OwnedFd, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    #[cfg(target_os = "linux")]
    let raw = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    #[cfg(not(target_os = "linux"))]
    let raw = unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };

    if raw < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            // A peer that vanished between readiness and accept is not our problem
            io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }

    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    #[cfg(not(target_os = "linux"))]
    {
        // accept4 is Linux-only; set the flags by hand
        set_nonblocking(fd.as_raw_fd())?;
        set_cloexec(fd.as_raw_fd())?;
    }

    Ok(Some((fd, raw_to_socket_addr(&storage))))
}

/// Local address a socket is bound to (used to learn ephemeral ports).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    raw_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "unsupported address family"))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            #[cfg(target_os = "macos")]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            #[cfg(target_os = "macos")]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Read whatever is available. `WouldBlock` is surfaced as an error kind,
/// `Ok(0)` always means end-of-stream.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res as usize);
    }
}

/// Write as much as the socket accepts. `WouldBlock` is surfaced as an error kind.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    const FLAGS: c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    const FLAGS: c_int = 0;

    loop {
        let res = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), FLAGS) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res as usize);
    }
}

/// An accepted, non-blocking client socket.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_nonblocking(self.fd.as_raw_fd(), buf)
    }
}

impl io::Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_nonblocking(self.fd.as_raw_fd(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---- Readiness polling ----

/// Interest set for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Registered but not waiting for anything (hangups and errors are still reported).
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const READ_WRITE: Interest = Interest(0b11);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

/// One readiness notification, already translated from the OS representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up (or half-closed its sending side).
    pub hangup: bool,
    pub error: bool,
}

#[cfg(target_os = "linux")]
pub use linux_epoll::Poller;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

    /// Level-triggered epoll instance. Tokens are the raw descriptors themselves.
    pub struct Poller {
        fd: OwnedFd,
        events: Vec<epoll_event>,
    }

    fn mask(interest: Interest) -> u32 {
        let mut bits = 0;
        // A half-closed peer stays readable (EOF); only report it while we still read
        if interest.is_readable() {
            bits |= EPOLLIN | EPOLLRDHUP;
        }
        if interest.is_writable() {
            bits |= EPOLLOUT;
        }
        bits as u32
    }

    impl Poller {
        pub fn new(capacity: usize) -> io::Result<Self> {
            let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(raw) },
                events: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            })
        }

        fn ctl(&self, op: c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
            let mut event = epoll_event {
                events: mask(interest),
                u64: fd as u64,
            };
            if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
        }

        pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
        }

        pub fn delete(&self, fd: RawFd) -> io::Result<()> {
            if unsafe {
                libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut())
            } < 0
            {
                let err = io::Error::last_os_error();
                // Already gone (closed or never added) is fine
                if !matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                    return Err(err);
                }
            }
            Ok(())
        }

        /// Block up to `timeout_ms`. EINTR is reported as zero events.
        pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Event>) -> io::Result<()> {
            out.clear();
            let res = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    timeout_ms,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(err);
            }
            for ev in &self.events[..res as usize] {
                let bits = ev.events as c_int;
                let token = ev.u64;
                out.push(Event {
                    fd: token as RawFd,
                    readable: bits & EPOLLIN != 0,
                    writable: bits & EPOLLOUT != 0,
                    hangup: bits & (EPOLLHUP | EPOLLRDHUP) != 0,
                    error: bits & EPOLLERR != 0,
                });
            }
            Ok(())
        }
    }
}

// ---- kqueue fallback for macOS development ----
#[cfg(target_os = "macos")]
pub use macos_kqueue::Poller;

#[cfg(target_os = "macos")]
mod macos_kqueue {
    use super::*;
    use libc::{EV_ADD, EV_DELETE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, timespec};

    /// Level-triggered kqueue instance mirroring the epoll poller's surface.
    pub struct Poller {
        fd: OwnedFd,
        events: Vec<kevent>,
    }

    fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
        kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        }
    }

    impl Poller {
        pub fn new(capacity: usize) -> io::Result<Self> {
            let raw = unsafe { libc::kqueue() };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(raw) },
                events: vec![unsafe { mem::zeroed::<kevent>() }; capacity.max(1)],
            })
        }

        fn apply(&self, changes: &[kevent]) -> io::Result<()> {
            for ch in changes {
                let res = unsafe {
                    libc::kevent(self.fd.as_raw_fd(), ch, 1, ptr::null_mut(), 0, ptr::null())
                };
                if res < 0 {
                    let err = io::Error::last_os_error();
                    // Deleting a filter that was never added reports ENOENT
                    if ch.flags & EV_DELETE != 0
                        && matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
                    {
                        continue;
                    }
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.modify(fd, interest)
        }

        pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            let read = if interest.is_readable() { EV_ADD } else { EV_DELETE };
            let write = if interest.is_writable() { EV_ADD } else { EV_DELETE };
            self.apply(&[
                change(fd, EVFILT_READ, read),
                change(fd, EVFILT_WRITE, write),
            ])
        }

        pub fn delete(&self, fd: RawFd) -> io::Result<()> {
            self.apply(&[
                change(fd, EVFILT_READ, EV_DELETE),
                change(fd, EVFILT_WRITE, EV_DELETE),
            ])
        }

        pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Event>) -> io::Result<()> {
            out.clear();
            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            let res = unsafe {
                libc::kevent(
                    self.fd.as_raw_fd(),
                    ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    &ts,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(err);
            }
            for ev in &self.events[..res as usize] {
                out.push(Event {
                    fd: ev.ident as RawFd,
                    readable: ev.filter == EVFILT_READ,
                    writable: ev.filter == EVFILT_WRITE,
                    hangup: ev.flags & EV_EOF != 0,
                    error: ev.flags & EV_ERROR != 0,
                });
            }
            Ok(())
        }
    }
}

// src/cgi.rs
use crate::error::{Error, Result};
use crate::http::{Headers, SERVER_SOFTWARE, StatusCode, is_token_char};
use crate::request::Request;
use crate::syscalls;
use memchr::memmem;
use std::io::{self, Read, Seek, Write};
use std::net::IpAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Output beyond this many bytes without a blank line is treated as a body with no header block.
const MAX_CGI_HEAD: usize = 8192;
const READ_CHUNK: usize = 16 * 1024;

// ═══ Output stream ═══

/// Bytes produced by a CGI script that have not been sent yet.
#[derive(Debug, Default)]
pub struct CgiStream {
    buf: Vec<u8>,
    eof: bool,
}

/// Status and headers announced by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: Headers,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeadOutcome {
    /// Need more output before deciding.
    Pending,
    Parsed(CgiHead),
    /// The script ended without writing anything.
    NoOutput,
}

impl CgiStream {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(&mut self) {
        self.eof = true;
    }

    pub fn is_finished(&self) -> bool {
        self.eof
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remove and return up to `max` buffered bytes.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// Try to split a CGI header block off the front of the stream.
    ///
    /// Output that does not start with `Name: value` lines is served as-is
    /// with a `text/html` content type.
    pub fn take_head(&mut self) -> HeadOutcome {
        if self.buf.is_empty() {
            return if self.eof {
                HeadOutcome::NoOutput
            } else {
                HeadOutcome::Pending
            };
        }

        // The first line alone tells whether a header block is present
        if let Some(eol) = memchr::memchr(b'\n', &self.buf) {
            let first = trim_cr(&self.buf[..eol]);
            if first.is_empty() {
                // Empty header block
                self.buf.drain(..=eol);
                return HeadOutcome::Parsed(CgiHead::default());
            }
            if !looks_like_header(first) {
                return HeadOutcome::Parsed(CgiHead::default());
            }
        }

        let separator = [&b"\r\n\r\n"[..], b"\n\n"]
            .iter()
            .filter_map(|sep| memmem::find(&self.buf, sep).map(|pos| (pos, sep.len())))
            .min();

        match separator {
            Some((end, sep_len)) => match parse_head(&self.buf[..end]) {
                Some(head) => {
                    self.buf.drain(..end + sep_len);
                    HeadOutcome::Parsed(head)
                }
                None => HeadOutcome::Parsed(CgiHead::default()),
            },
            None if self.eof || self.buf.len() > MAX_CGI_HEAD => {
                HeadOutcome::Parsed(CgiHead::default())
            }
            None => HeadOutcome::Pending,
        }
    }
}

impl Default for CgiHead {
    fn default() -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");
        Self {
            status: StatusCode::OK,
            headers,
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn looks_like_header(line: &[u8]) -> bool {
    match memchr::memchr(b':', line) {
        Some(colon) => colon > 0 && line[..colon].iter().all(|&b| is_token_char(b)),
        None => false,
    }
}

fn parse_head(block: &[u8]) -> Option<CgiHead> {
    let block = std::str::from_utf8(block).ok()?;
    let mut headers = Headers::new();
    let mut status = None;

    for line in block.split('\n').map(|l| l.trim_end_matches('\r')) {
        if !looks_like_header(line.as_bytes()) {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.get(..3)?.parse().ok()?;
            status = Some(StatusCode::from_u16(code)?);
        } else if name.eq_ignore_ascii_case("content-length") {
            // Framing is ours; the body is always sent chunked
        } else {
            headers.insert(name, value);
        }
    }

    let status = match status {
        Some(status) => status,
        None if headers.contains("location") => StatusCode::FOUND,
        None => StatusCode::OK,
    };
    if !headers.contains("content-type") && status != StatusCode::FOUND {
        headers.insert("Content-Type", "text/html");
    }
    Some(CgiHead { status, headers })
}

// ═══ Environment ═══

/// What the router learned about the script while resolving the request.
#[derive(Debug, Clone)]
pub struct CgiLaunch<'a> {
    /// Program that runs the script; `None` executes the script directly.
    pub interpreter: Option<&'a Path>,
    pub script: &'a Path,
    /// URL path of the script itself.
    pub script_name: &'a str,
    /// URL path below the script.
    pub path_info: &'a str,
    pub server_name: &'a str,
    pub server_port: u16,
    pub remote_addr: Option<IpAddr>,
}

/// CGI/1.1 meta-variables for `request`.
pub fn build_env(request: &Request, launch: &CgiLaunch<'_>) -> Vec<(String, String)> {
    let mut env = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_PROTOCOL".into(), request.version.clone()),
        ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ("SERVER_NAME".into(), launch.server_name.into()),
        ("SERVER_PORT".into(), launch.server_port.to_string()),
        ("REQUEST_METHOD".into(), request.method.as_str().into()),
        ("SCRIPT_NAME".into(), launch.script_name.into()),
        (
            "SCRIPT_FILENAME".into(),
            launch.script.to_string_lossy().into_owned(),
        ),
        ("PATH_INFO".into(), launch.path_info.into()),
        ("QUERY_STRING".into(), request.url.query.clone()),
        ("CONTENT_LENGTH".into(), request.body.len().to_string()),
        (
            "CONTENT_TYPE".into(),
            request.content_type().unwrap_or_default().into(),
        ),
        (
            "REMOTE_ADDR".into(),
            launch
                .remote_addr
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
        ),
        // Required by php-cgi when force-cgi-redirect is on
        ("REDIRECT_STATUS".into(), "200".into()),
    ];
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".into(), path));
    }
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        env.push((key, value.to_owned()));
    }
    env
}

// ═══ Worker ═══

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiStatus {
    Running,
    /// Pipe closed; waiting for the process to be reaped.
    PendingTermination,
    Terminated,
}

/// A running CGI subprocess bound to one exchange of one connection.
#[derive(Debug)]
pub struct CgiWorker {
    pub pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    status: CgiStatus,
    pub client_fd: RawFd,
    pub exchange_id: u64,
    pub started: Instant,
}

impl CgiWorker {
    /// Launch the script with the request body on stdin and a non-blocking stdout pipe.
    pub fn spawn(request: &Request, launch: &CgiLaunch<'_>) -> Result<Self> {
        // Anonymous temp file so a large body never blocks on a pipe we are not polling
        let mut stdin = tempfile::tempfile().map_err(Error::Process)?;
        stdin.write_all(&request.body).map_err(Error::Process)?;
        stdin.rewind().map_err(Error::Process)?;

        // The child runs in the script's directory, so a relative path would dangle
        let script = std::path::absolute(launch.script).map_err(Error::Process)?;
        let launch = &CgiLaunch {
            script: &script,
            ..launch.clone()
        };
        let mut cmd = match launch.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&script);
                cmd
            }
            None => Command::new(&script),
        };
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        cmd.env_clear()
            .envs(build_env(request, launch))
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(Error::Process)?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Process(io::Error::other("stdout was not captured")));
        };
        if let Err(e) = syscalls::set_nonblocking(stdout.as_raw_fd()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Process(e));
        }

        let pid = child.id();
        debug!(pid, script = %launch.script.display(), "CGI started");
        Ok(Self {
            pid,
            child,
            stdout: Some(stdout),
            status: CgiStatus::Running,
            client_fd: -1,
            exchange_id: 0,
            started: Instant::now(),
        })
    }

    pub fn status(&self) -> CgiStatus {
        self.status
    }

    /// Read end of the stdout pipe while the worker is running.
    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|s| s.as_raw_fd())
    }

    /// Append everything the script has written so far to `out`.
    /// Returns `true` once the script closed its stdout.
    pub fn drain_stdout(&mut self, out: &mut Vec<u8>) -> io::Result<bool> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(true);
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The script finished writing: close the pipe and wait for the exit status.
    pub fn finish(&mut self) {
        if self.status == CgiStatus::Running {
            self.stdout = None;
            self.status = CgiStatus::PendingTermination;
        }
    }

    /// Forcefully stop the script (timeout, client gone, shutdown).
    pub fn kill(&mut self) {
        if self.status != CgiStatus::Running {
            return;
        }
        if let Err(e) = self.child.kill() {
            // Already exited: reaping will collect it
            debug!(pid = self.pid, error = %e, "kill failed");
        }
        self.stdout = None;
        self.status = CgiStatus::PendingTermination;
    }

    /// Non-blocking reap. Returns `true` once the process is gone.
    pub fn try_reap(&mut self) -> bool {
        if self.status == CgiStatus::Terminated {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(exit)) => {
                debug!(pid = self.pid, %exit, "CGI reaped");
                self.status = CgiStatus::Terminated;
                true
            }
            Ok(None) => false,
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {
                self.status = CgiStatus::Terminated;
                true
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "waiting for CGI process failed");
                false
            }
        }
    }

    pub fn is_timed_out(&self, now: Instant, limit: Duration) -> bool {
        now.saturating_duration_since(self.started) > limit
    }
}

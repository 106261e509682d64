// src/response.rs
use crate::cgi::{CgiHead, CgiStream, HeadOutcome};
use crate::http::{CRLF, HTTP_1_1, Headers, SERVER_SOFTWARE, StatusCode};
use std::fs::File;
use std::io::{self, Read, Write};
use std::time::SystemTime;
use tracing::{trace, warn};

/// Most body bytes handed to the socket per `send` call.
pub const SEND_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Headers not serialised yet (CGI responses wait here for the script's header block).
    Building,
    Ready,
    Sending,
    SentAll,
    Error,
}

/// Outcome of one `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Wrote(usize),
    /// The socket would block; cursors are unchanged.
    Blocked,
    /// Nothing to send until more CGI output arrives.
    Idle,
    SentAll,
    Failed,
}

/// Payload source of a response.
#[derive(Debug)]
pub enum Body {
    Empty,
    Text { data: Vec<u8>, pos: usize },
    File { file: File, total: u64, sent: u64 },
    Cgi(CgiStream),
}

impl Body {
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Body::Text {
            data: data.into(),
            pos: 0,
        }
    }

    pub fn file(file: File, total: u64) -> Self {
        Body::File {
            file,
            total,
            sent: 0,
        }
    }

    /// Total payload length, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Text { data, .. } => Some(data.len() as u64),
            Body::File { total, .. } => Some(*total),
            Body::Cgi(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Produce up to `max` further payload bytes and whether the payload is exhausted.
    pub fn advance(&mut self, max: usize) -> io::Result<(Vec<u8>, bool)> {
        match self {
            Body::Empty => Ok((Vec::new(), true)),
            Body::Text { data, pos } => {
                let end = (*pos + max).min(data.len());
                let out = data[*pos..end].to_vec();
                *pos = end;
                Ok((out, *pos >= data.len()))
            }
            Body::File { file, total, sent } => {
                let want = (*total - *sent).min(max as u64) as usize;
                let mut out = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    match file.read(&mut out[filled..]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "file shrank while being sent",
                            ));
                        }
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                *sent += want as u64;
                Ok((out, *sent >= *total))
            }
            Body::Cgi(stream) => {
                let out = stream.take(max);
                Ok((out, stream.is_finished() && stream.is_empty()))
            }
        }
    }
}

/// An HTTP response together with its transmission cursors.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    body: Body,
    header_buf: Vec<u8>,
    header_sent: usize,
    /// Body bytes (including chunk framing) written to the socket.
    bytes_sent: u64,
    state: ResponseState,
    /// Body bytes pulled from `body` but not yet accepted by the socket.
    pending: Vec<u8>,
    pending_pos: usize,
    body_done: bool,
    head_only: bool,
    close: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self::with_body(status, Body::Empty)
    }

    pub fn with_body(status: StatusCode, body: Body) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body,
            header_buf: Vec::new(),
            header_sent: 0,
            bytes_sent: 0,
            state: ResponseState::Building,
            pending: Vec::new(),
            pending_pos: 0,
            body_done: false,
            head_only: false,
            close: false,
        }
    }

    pub fn text(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::with_body(status, Body::text(body)).header("Content-Type", content_type)
    }

    pub fn html(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::text(status, "text/html; charset=utf-8", body)
    }

    pub fn file(file: File, len: u64, content_type: &str) -> Self {
        Self::with_body(StatusCode::OK, Body::file(file, len)).header("Content-Type", content_type)
    }

    /// A response streamed from a CGI script. Status and headers come from the script.
    pub fn cgi() -> Self {
        Self::with_body(StatusCode::OK, Body::Cgi(CgiStream::default()))
    }

    /// Small generated HTML page for `status`.
    pub fn error(status: StatusCode) -> Self {
        let page = format!(
            "<!DOCTYPE html>\n<html><head><title>{status}</title></head>\
             <body><h1>{status}</h1><hr><p>{SERVER_SOFTWARE}</p></body></html>\n"
        );
        Self::html(status, page)
    }

    pub fn redirect(status: StatusCode, location: &str) -> Self {
        Self::error(status).header("Location", location)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_cgi(&self) -> bool {
        matches!(self.body, Body::Cgi(_))
    }

    /// Some bytes of this response already reached the socket.
    pub fn has_started(&self) -> bool {
        self.header_sent > 0
    }

    /// The connection ends once this response is flushed.
    pub fn closes_connection(&self) -> bool {
        self.close || self.state == ResponseState::Error
    }

    /// Send headers only (answer to `HEAD`).
    pub fn set_head_only(&mut self) {
        self.head_only = true;
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Serialise the status line and headers. CGI responses stay `Building`
    /// until the script's header block is known.
    pub fn build(&mut self) {
        if self.state != ResponseState::Building {
            return;
        }
        let chunked = match &mut self.body {
            Body::Cgi(stream) => match stream.take_head() {
                HeadOutcome::Pending => return,
                HeadOutcome::Parsed(CgiHead { status, headers }) => {
                    self.status = status;
                    self.close |= status.closes_connection();
                    for (name, value) in headers.iter() {
                        self.headers.insert(name, value);
                    }
                    true
                }
                HeadOutcome::NoOutput => {
                    warn!("CGI script produced no output");
                    let head_only = self.head_only;
                    *self = Response::error(StatusCode::BAD_GATEWAY);
                    self.close = true;
                    self.head_only = head_only;
                    return self.build();
                }
            },
            _ => false,
        };

        if chunked {
            self.headers.remove("content-length");
            self.headers.insert("Transfer-Encoding", "chunked");
        } else if let Some(len) = self.body.len() {
            self.headers.remove("transfer-encoding");
            self.headers.insert("Content-Length", len.to_string());
        }
        self.headers
            .insert("Date", httpdate::fmt_http_date(SystemTime::now()));
        self.headers.insert("Server", SERVER_SOFTWARE);
        self.headers
            .insert("Connection", if self.close { "close" } else { "keep-alive" });

        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(HTTP_1_1.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF);
        }
        buf.extend_from_slice(CRLF);

        self.header_buf = buf;
        if self.head_only {
            self.body = Body::Empty;
        }
        self.state = ResponseState::Ready;
    }

    /// Feed CGI output into the body stream.
    pub fn push_cgi(&mut self, bytes: &[u8]) {
        if let Body::Cgi(stream) = &mut self.body {
            stream.push(bytes);
        }
        self.build();
    }

    /// The script closed its stdout.
    pub fn finish_cgi(&mut self) {
        if let Body::Cgi(stream) = &mut self.body {
            stream.finish();
        }
        self.build();
    }

    /// There is something to hand to the socket right now.
    pub fn wants_write(&self) -> bool {
        match self.state {
            ResponseState::Ready => true,
            ResponseState::Sending => {
                self.header_sent < self.header_buf.len()
                    || self.pending_pos < self.pending.len()
                    || match &self.body {
                        Body::Cgi(stream) => !stream.is_empty() || stream.is_finished(),
                        _ => true,
                    }
            }
            _ => false,
        }
    }

    /// Push the next piece of the response into `sink`.
    ///
    /// The header block goes first and is resumed from its cursor after a partial
    /// write. Body bytes follow, at most `SEND_CHUNK` of them per call.
    pub fn send<W: Write>(&mut self, sink: &mut W) -> Progress {
        match self.state {
            ResponseState::Building => return Progress::Idle,
            ResponseState::SentAll => return Progress::SentAll,
            ResponseState::Error => return Progress::Failed,
            ResponseState::Ready | ResponseState::Sending => {}
        }
        self.state = ResponseState::Sending;

        if self.header_sent < self.header_buf.len() {
            match write_some(sink, &self.header_buf[self.header_sent..]) {
                Ok(n) => {
                    self.header_sent += n;
                    if self.header_sent < self.header_buf.len() {
                        return Progress::Wrote(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Blocked,
                Err(e) => return self.fail(e),
            }
        }

        if self.pending_pos >= self.pending.len() {
            if self.body_done || self.head_only {
                self.state = ResponseState::SentAll;
                return Progress::SentAll;
            }
            if let Err(e) = self.refill() {
                return self.fail(e);
            }
            if self.pending.is_empty() {
                if self.body_done {
                    self.state = ResponseState::SentAll;
                    return Progress::SentAll;
                }
                return Progress::Idle;
            }
        }

        match write_some(sink, &self.pending[self.pending_pos..]) {
            Ok(n) => {
                self.pending_pos += n;
                self.bytes_sent += n as u64;
                trace!(n, total = self.bytes_sent, "body bytes sent");
                if self.pending_pos >= self.pending.len() && self.body_done {
                    self.state = ResponseState::SentAll;
                    return Progress::SentAll;
                }
                Progress::Wrote(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Progress::Blocked,
            Err(e) => self.fail(e),
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let (bytes, done) = self.body.advance(SEND_CHUNK)?;
        self.pending.clear();
        self.pending_pos = 0;
        if self.is_cgi() {
            if !bytes.is_empty() {
                self.pending
                    .extend_from_slice(format!("{:x}\r\n", bytes.len()).as_bytes());
                self.pending.extend_from_slice(&bytes);
                self.pending.extend_from_slice(CRLF);
            }
            if done {
                self.pending.extend_from_slice(b"0\r\n\r\n");
            }
        } else {
            self.pending = bytes;
        }
        self.body_done = done;
        Ok(())
    }

    fn fail(&mut self, err: io::Error) -> Progress {
        warn!(error = %err, status = self.status.as_u16(), "response transmission failed");
        self.state = ResponseState::Error;
        Progress::Failed
    }
}

fn write_some<W: Write>(sink: &mut W, buf: &[u8]) -> io::Result<usize> {
    loop {
        match sink.write(buf) {
            Ok(0) if !buf.is_empty() => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading"));
            }
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    /// Accepts at most `limit` bytes per write and refuses every other call.
    struct Throttled {
        out: Vec<u8>,
        limit: usize,
        calls: usize,
    }

    impl Throttled {
        fn new(limit: usize) -> Self {
            Self {
                out: Vec::new(),
                limit,
                calls: 0,
            }
        }
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn split(raw: &[u8]) -> (String, Vec<u8>) {
        let end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8(raw[..end].to_vec()).unwrap(),
            raw[end + 4..].to_vec(),
        )
    }

    fn drive(resp: &mut Response, sink: &mut Throttled) {
        let mut last = 0;
        for _ in 0..100_000 {
            match resp.send(sink) {
                Progress::SentAll => return,
                Progress::Failed => panic!("send failed"),
                _ => {}
            }
            assert!(resp.bytes_sent() >= last, "bytes_sent went backwards");
            last = resp.bytes_sent();
        }
        panic!("response never completed");
    }

    #[test]
    fn text_response_survives_partial_writes() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut resp = Response::text(StatusCode::OK, "application/octet-stream", payload.clone());
        resp.build();
        assert_eq!(resp.state(), ResponseState::Ready);

        let mut sink = Throttled::new(7);
        drive(&mut resp, &mut sink);
        assert_eq!(resp.state(), ResponseState::SentAll);
        assert_eq!(resp.bytes_sent(), payload.len() as u64);

        let (head, body) = split(&sink.out);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5000"));
        assert!(head.contains("Connection: keep-alive"));
        assert!(head.contains("Date: "));
        assert_eq!(body, payload);
    }

    #[test]
    fn one_body_chunk_per_call() {
        let mut resp = Response::text(StatusCode::OK, "text/plain", vec![b'x'; 3000]);
        resp.build();
        let mut sink = Vec::new();
        // Header only fits in one write to a Vec; body follows in SEND_CHUNK pieces
        assert!(matches!(resp.send(&mut sink), Progress::Wrote(SEND_CHUNK)));
        assert_eq!(resp.bytes_sent(), SEND_CHUNK as u64);
        assert!(matches!(resp.send(&mut sink), Progress::Wrote(SEND_CHUNK)));
        assert_eq!(resp.send(&mut sink), Progress::SentAll);
        assert_eq!(resp.bytes_sent(), 3000);
    }

    #[test]
    fn file_body_streams_and_head_omits_it() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![b'f'; 2500]).unwrap();
        file.rewind().unwrap();

        let mut resp = Response::file(file, 2500, "text/plain");
        resp.build();
        let mut sink = Throttled::new(300);
        drive(&mut resp, &mut sink);
        let (_, body) = split(&sink.out);
        assert_eq!(body.len(), 2500);

        let mut head = Response::text(StatusCode::OK, "text/plain", "hello");
        head.set_head_only();
        head.build();
        let mut sink = Vec::new();
        while head.send(&mut sink) != Progress::SentAll {}
        let (headers, body) = split(&sink);
        assert!(headers.contains("Content-Length: 5"));
        assert!(body.is_empty());
    }

    #[test]
    fn cgi_output_is_chunked_after_its_head() {
        let mut resp = Response::cgi();
        resp.build();
        assert_eq!(resp.state(), ResponseState::Building);
        assert!(!resp.wants_write());

        resp.push_cgi(b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\nhel");
        assert_eq!(resp.state(), ResponseState::Ready);
        assert_eq!(resp.status, StatusCode::CREATED);

        let mut sink = Vec::new();
        assert!(matches!(resp.send(&mut sink), Progress::Wrote(_)));
        assert_eq!(resp.send(&mut sink), Progress::Idle);
        assert!(!resp.wants_write());

        resp.push_cgi(b"lo");
        resp.finish_cgi();
        assert!(resp.wants_write());
        while resp.send(&mut sink) != Progress::SentAll {}

        let (head, body) = split(&sink);
        assert!(head.starts_with("HTTP/1.1 201 Created"));
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(body, b"3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n");
    }

    #[test]
    fn silent_cgi_becomes_bad_gateway() {
        let mut resp = Response::cgi();
        resp.finish_cgi();
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp.state(), ResponseState::Ready);
        assert!(resp.closes_connection());
    }

    #[test]
    fn cgi_error_status_closes_connection() {
        for (raw, code) in [
            (&b"Status: 500 Internal Server Error\r\n\r\noops"[..], 500),
            (b"Status: 400 Bad Request\r\n\r\nno", 400),
        ] {
            let mut resp = Response::cgi();
            resp.push_cgi(raw);
            assert_eq!(resp.status.as_u16(), code);
            assert!(resp.closes_connection());

            resp.finish_cgi();
            let mut sink = Vec::new();
            while resp.send(&mut sink) != Progress::SentAll {}
            let (head, _) = split(&sink);
            assert!(head.contains("Connection: close"), "{head}");
        }

        let mut resp = Response::cgi();
        resp.push_cgi(b"Status: 404 Not Found\r\n\r\n");
        assert!(!resp.closes_connection());
    }

    #[test]
    fn silent_cgi_answering_head_has_no_body() {
        let mut resp = Response::cgi();
        resp.set_head_only();
        resp.finish_cgi();
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);

        let mut sink = Vec::new();
        while resp.send(&mut sink) != Progress::SentAll {}
        let (head, body) = split(&sink);
        assert!(head.starts_with("HTTP/1.1 502"));
        assert!(head.contains("Content-Length: "));
        assert!(body.is_empty());
    }

    #[test]
    fn broken_pipe_moves_to_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut resp = Response::text(StatusCode::OK, "text/plain", "x");
        resp.build();
        assert_eq!(resp.send(&mut Broken), Progress::Failed);
        assert_eq!(resp.state(), ResponseState::Error);
        assert!(resp.closes_connection());
    }
}

// src/parser.rs
use crate::http::{Method, is_token_char};
use crate::request::{RejectReason, Request, RequestStatus};
use crate::url::Url;
use memchr::memmem;
use tracing::debug;

/// Longest chunk-size or trailer line accepted before the framing is declared broken.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(usize),
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

/// Incremental HTTP/1.1 request parser.
///
/// `advance` consumes bytes from the front of the connection's receive buffer,
/// so whatever is left afterwards belongs to the next pipelined request.
#[derive(Debug)]
pub struct RequestParser {
    max_header_size: usize,
    max_body_size: usize,
    request: Request,
    framing: Framing,
    /// Trailer bytes seen so far; bounded like the header block.
    trailer_bytes: usize,
}

impl RequestParser {
    pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
        Self {
            max_header_size,
            max_body_size,
            request: Request::default(),
            framing: Framing::None,
            trailer_bytes: 0,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Hand over the finished (or rejected) request and start afresh.
    pub fn take(&mut self) -> Request {
        self.framing = Framing::None;
        self.trailer_bytes = 0;
        std::mem::take(&mut self.request)
    }

    /// Parse only the request line and header block. Stops at `HeaderComplete`
    /// even when no body follows; `advance` carries on from there.
    pub fn advance_head(&mut self, buf: &mut Vec<u8>) -> RequestStatus {
        if self.request.status == RequestStatus::Incomplete {
            self.parse_head(buf);
        }
        self.request.status
    }

    /// Drive the state machine as far as `buf` allows.
    pub fn advance(&mut self, buf: &mut Vec<u8>) -> RequestStatus {
        loop {
            let before = (self.request.status, buf.len());
            match self.request.status {
                RequestStatus::Incomplete => self.parse_head(buf),
                RequestStatus::HeaderComplete => self.parse_body(buf),
                RequestStatus::Complete | RequestStatus::Bad => break,
            }
            if (self.request.status, buf.len()) == before {
                break;
            }
        }
        self.request.status
    }

    fn reject(&mut self, reason: RejectReason, what: &'static str) {
        debug!(?reason, what, "request rejected");
        self.request.status = RequestStatus::Bad;
        self.request.reject = Some(reason);
    }

    fn parse_head(&mut self, buf: &mut Vec<u8>) {
        // Stray CRLFs between pipelined requests are tolerated
        let leading = buf.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
        if leading > 0 {
            buf.drain(..leading);
        }

        let Some(end) = memmem::find(buf, b"\r\n\r\n") else {
            if buf.len() >= self.max_header_size {
                self.reject(RejectReason::HeaderTooLarge, "header block too large");
            }
            return;
        };
        if end + 4 > self.max_header_size {
            self.reject(RejectReason::HeaderTooLarge, "header block too large");
            return;
        }

        let head: Vec<u8> = buf.drain(..end + 4).collect();
        if let Err(what) = self.parse_head_block(&head[..end]) {
            self.reject(RejectReason::Malformed, what);
        }
    }

    fn parse_head_block(&mut self, head: &[u8]) -> Result<(), &'static str> {
        let head = std::str::from_utf8(head).map_err(|_| "header is not UTF-8")?;
        let mut lines = head.split("\r\n");

        let line = lines.next().ok_or("missing request line")?;
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err("malformed request line");
        };
        let method = Method::from_bytes(method.as_bytes()).ok_or("unknown method")?;
        if target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
            return Err("malformed request target");
        }
        if version != "HTTP/1.1" {
            return Err("unsupported protocol version");
        }

        let req = &mut self.request;
        req.method = method;
        req.target = target.to_owned();
        req.version = version.to_owned();

        for line in lines {
            let (name, value) = line.split_once(':').ok_or("header line without colon")?;
            if name.is_empty() || !name.bytes().all(is_token_char) {
                return Err("invalid header name");
            }
            let value = value.trim_matches([' ', '\t']);
            if value.bytes().any(|b| b.is_ascii_control() && b != b'\t') {
                return Err("invalid header value");
            }
            req.headers.insert(name, value);
        }

        let host = req.headers.get("host").ok_or("missing Host header")?;
        req.url = Url::from_request(&req.target, host).map_err(|_| "invalid request target")?;

        let chunked = req.is_chunked();
        if let Some(te) = req.headers.get("transfer-encoding") {
            if !chunked {
                return Err("unsupported transfer encoding");
            }
            if !te.trim().to_ascii_lowercase().ends_with("chunked") {
                return Err("chunked must be the final transfer encoding");
            }
        }
        if chunked && method == Method::Get {
            return Err("chunked body on GET");
        }

        self.framing = if chunked {
            req.content_length = None;
            Framing::Chunked(ChunkState::Size)
        } else if let Some(raw) = req.headers.get("content-length") {
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err("invalid Content-Length");
            }
            let len: usize = raw.parse().map_err(|_| "Content-Length overflows")?;
            req.content_length = Some(len);
            if len > self.max_body_size {
                self.reject(RejectReason::BodyTooLarge, "declared body too large");
                return Ok(());
            }
            if len == 0 { Framing::None } else { Framing::Length(len) }
        } else {
            Framing::None
        };

        self.request.status = RequestStatus::HeaderComplete;
        Ok(())
    }

    fn parse_body(&mut self, buf: &mut Vec<u8>) {
        match self.framing {
            Framing::None => self.request.status = RequestStatus::Complete,
            Framing::Length(total) => {
                let missing = total - self.request.body.len();
                let n = missing.min(buf.len());
                self.request.body.extend(buf.drain(..n));
                if self.request.body.len() == total {
                    self.request.status = RequestStatus::Complete;
                }
            }
            Framing::Chunked(state) => self.parse_chunk(state, buf),
        }
    }

    fn parse_chunk(&mut self, state: ChunkState, buf: &mut Vec<u8>) {
        match state {
            ChunkState::Size => {
                let Some(eol) = memmem::find(buf, b"\r\n") else {
                    if buf.len() > MAX_CHUNK_LINE {
                        self.reject(RejectReason::Malformed, "chunk size line too long");
                    }
                    return;
                };
                let size = match parse_chunk_size(&buf[..eol]) {
                    Some(size) => size,
                    None => {
                        self.reject(RejectReason::Malformed, "invalid chunk size");
                        return;
                    }
                };
                buf.drain(..eol + 2);
                if size == 0 {
                    self.framing = Framing::Chunked(ChunkState::Trailer);
                } else if self.request.body.len().saturating_add(size) > self.max_body_size {
                    self.reject(RejectReason::BodyTooLarge, "chunked body too large");
                } else {
                    self.framing = Framing::Chunked(ChunkState::Data(size));
                }
            }
            ChunkState::Data(remaining) => {
                let n = remaining.min(buf.len());
                self.request.body.extend(buf.drain(..n));
                self.framing = Framing::Chunked(if n == remaining {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data(remaining - n)
                });
            }
            ChunkState::DataEnd => {
                if buf.len() < 2 {
                    return;
                }
                if &buf[..2] != b"\r\n" {
                    self.reject(RejectReason::Malformed, "chunk data not followed by CRLF");
                    return;
                }
                buf.drain(..2);
                self.framing = Framing::Chunked(ChunkState::Size);
            }
            ChunkState::Trailer => {
                let Some(eol) = memmem::find(buf, b"\r\n") else {
                    if buf.len() > MAX_CHUNK_LINE {
                        self.reject(RejectReason::Malformed, "trailer line too long");
                    }
                    return;
                };
                self.trailer_bytes += eol + 2;
                if self.trailer_bytes > self.max_header_size {
                    self.reject(RejectReason::HeaderTooLarge, "trailer section too large");
                    return;
                }
                buf.drain(..eol + 2);
                // Trailer fields are discarded; the empty line ends the message
                if eol == 0 {
                    self.request.status = RequestStatus::Complete;
                }
            }
        }
    }
}

/// Hex chunk size with any `;extension` stripped.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim_matches([' ', '\t']);
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}

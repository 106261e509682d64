// src/request.rs
use crate::http::{Headers, Method};
use crate::url::Url;

/// Parse progress of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatus {
    #[default]
    Incomplete,
    HeaderComplete,
    Complete,
    Bad,
}

/// Why a request was rejected. Picks the status code of the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    HeaderTooLarge,
    BodyTooLarge,
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Method,
    /// The raw request target as it appeared on the request line.
    pub target: String,
    pub url: Url,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Declared `Content-Length`; `None` for chunked or bodiless requests.
    pub content_length: Option<usize>,
    pub status: RequestStatus,
    pub reject: Option<RejectReason>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    /// The client asked for the connection to end after this exchange.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("connection", "close")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn is_bad(&self) -> bool {
        self.status == RequestStatus::Bad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_close_is_detected() {
        let mut req = Request::default();
        assert!(!req.wants_close());
        req.headers.insert("Connection", "close");
        assert!(req.wants_close());
    }

    #[test]
    fn chunked_detection_is_case_insensitive() {
        let mut req = Request::default();
        req.headers.insert("Transfer-Encoding", "gzip, Chunked");
        assert!(req.is_chunked());
    }
}

// src/multipart.rs
use crate::error::{Error, Result};
use crate::http::Headers;
use memchr::memmem;

/// One part of a `multipart/form-data` body. The payload borrows from the request body.
#[derive(Debug)]
pub struct Part<'a> {
    pub headers: Headers,
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: &'a [u8],
}

/// Iterator over the parts of a multipart body.
pub struct Multipart<'a> {
    body: &'a [u8],
    /// `--boundary`
    delimiter: Vec<u8>,
    /// `\r\n--boundary`
    separator: Vec<u8>,
    done: bool,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        let mut separator = Vec::with_capacity(delimiter.len() + 2);
        separator.extend_from_slice(b"\r\n");
        separator.extend_from_slice(&delimiter);
        Self {
            body,
            delimiter,
            separator,
            done: false,
        }
    }

    fn fail(&mut self, what: &'static str) -> Option<Result<Part<'a>>> {
        self.done = true;
        Some(Err(Error::Protocol(what)))
    }
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let body = self.body;
        let Some(pos) = memmem::find(body, &self.delimiter) else {
            return self.fail("missing multipart delimiter");
        };
        let mut start = pos + self.delimiter.len();

        if body[start..].starts_with(b"--") {
            self.done = true;
            return None;
        }
        // Transport padding after the delimiter is allowed
        while matches!(body.get(start), Some(b' ' | b'\t')) {
            start += 1;
        }
        if !body[start..].starts_with(b"\r\n") {
            return self.fail("malformed multipart delimiter line");
        }
        start += 2;

        let rest = &body[start..];
        let (header_block, data_start) = if rest.starts_with(b"\r\n") {
            (&rest[..0], 2)
        } else {
            match memmem::find(rest, b"\r\n\r\n") {
                Some(end) => (&rest[..end], end + 4),
                None => return self.fail("unterminated part headers"),
            }
        };

        let payload = &rest[data_start..];
        let Some(data_end) = memmem::find(payload, &self.separator) else {
            return self.fail("missing closing multipart delimiter");
        };
        let data = &payload[..data_end];
        // Leave the CRLF so the next call finds `--boundary` at the start of a line
        self.body = &payload[data_end + 2..];

        let Ok(header_block) = std::str::from_utf8(header_block) else {
            return self.fail("part headers are not UTF-8");
        };
        let mut headers = Headers::new();
        for line in header_block.split("\r\n").filter(|l| !l.is_empty()) {
            match line.split_once(':') {
                Some((name, value)) => headers.insert(name.trim(), value.trim()),
                None => return self.fail("malformed part header"),
            }
        }

        let (name, filename) = headers
            .get("content-disposition")
            .map(|cd| (header_param(cd, "name"), header_param(cd, "filename")))
            .unwrap_or((None, None));
        let content_type = headers.get("content-type").map(str::to_owned);

        Some(Ok(Part {
            headers,
            name,
            filename,
            content_type,
            data,
        }))
    }
}

/// Value of `key` in a `;`-separated header parameter list, with quotes removed.
fn header_param(value: &str, key: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(v);
        Some(v.to_owned())
    })
}

/// Extract the boundary from a `multipart/form-data; boundary=...` content type.
pub fn boundary_of(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    header_param(content_type, "boundary").filter(|b| !b.is_empty() && b.len() <= 70)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
        Content-Disposition: form-data; name=\"note\"\r\n\r\n\
        hello\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        line one\r\nline two\r\n\
        --XyZ--\r\n";

    #[test]
    fn iterates_parts() {
        let parts: Vec<_> = Multipart::new(BODY, "XyZ")
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name.as_deref(), Some("note"));
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].data, b"hello");

        assert_eq!(parts[1].name.as_deref(), Some("file"));
        assert_eq!(parts[1].filename.as_deref(), Some("a.txt"));
        assert_eq!(parts[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(parts[1].data, b"line one\r\nline two");
    }

    #[test]
    fn filename_does_not_shadow_name() {
        let body = b"--b\r\nContent-Disposition: form-data; filename=\"x.bin\"; name=\"up\"\r\n\r\n1\r\n--b--";
        let part = Multipart::new(body, "b").next().unwrap().unwrap();
        assert_eq!(part.name.as_deref(), Some("up"));
        assert_eq!(part.filename.as_deref(), Some("x.bin"));
    }

    #[test]
    fn missing_closing_delimiter_is_an_error() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end";
        let mut parts = Multipart::new(body, "b");
        assert!(matches!(parts.next(), Some(Err(Error::Protocol(_)))));
        assert!(parts.next().is_none());
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_of("multipart/form-data; boundary=----abc").as_deref(),
            Some("----abc")
        );
        assert_eq!(
            boundary_of("Multipart/Form-Data; charset=utf-8; boundary=\"q u\"").as_deref(),
            Some("q u")
        );
        assert_eq!(boundary_of("application/json"), None);
        assert_eq!(boundary_of("multipart/form-data"), None);
    }
}

// src/url.rs
use crate::error::{Error, Result};
use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};

/// Decomposed request URL. Components that were absent are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl Url {
    /// Build the URL of a request from its target and `Host` header.
    ///
    /// Origin-form targets (`/path?q`) take their authority from `host`;
    /// absolute-form targets (`http://h:p/path`) keep their own.
    pub fn from_request(target: &str, host: &str) -> Result<Self> {
        if target.starts_with('/') {
            let mut url = Url::parse_authority(host)?;
            url.split_path(target);
            return Ok(url);
        }
        if target == "*" {
            let mut url = Url::parse_authority(host)?;
            url.path = "*".into();
            return Ok(url);
        }
        Url::parse(target)
    }

    /// Parse `[scheme://][user[:password]@]host[:port][/path][?query][#fragment]`.
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = match input.split_once("://") {
            Some((s, r)) if s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https") => {
                (s.to_ascii_lowercase(), r)
            }
            Some(_) => return Err(Error::Protocol("unsupported URL scheme")),
            None => (String::new(), input),
        };

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let mut url = Url::parse_authority(authority)?;
        url.scheme = scheme;
        url.split_path(tail);
        Ok(url)
    }

    fn parse_authority(authority: &str) -> Result<Self> {
        let mut url = Url::default();
        let hostport = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                match userinfo.split_once(':') {
                    Some((user, password)) => {
                        url.user = user.into();
                        url.password = password.into();
                    }
                    None => url.user = userinfo.into(),
                }
                hostport
            }
            None => authority,
        };

        let (host, port) = match hostport.rsplit_once(':') {
            // Bracketed IPv6 literal without a port
            Some((h, _)) if h.starts_with('[') && !h.ends_with(']') => (hostport, ""),
            Some((h, p)) => (h, p),
            None => (hostport, ""),
        };
        if host.is_empty() {
            return Err(Error::Protocol("empty host"));
        }
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol("invalid port"));
        }
        url.host = host.into();
        url.port = port.into();
        Ok(url)
    }

    fn split_path(&mut self, tail: &str) {
        let (rest, fragment) = match tail.split_once('#') {
            Some((r, f)) => (r, f),
            None => (tail, ""),
        };
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, q),
            None => (rest, ""),
        };
        self.path = if path.is_empty() { "/".into() } else { path.into() };
        self.query = query.into();
        self.fragment = fragment.into();
    }

    /// The path with percent-escapes decoded. Invalid UTF-8 is a protocol error.
    pub fn decoded_path(&self) -> Result<String> {
        percent_decode_str(&self.path)
            .decode_utf8()
            .map(|p| p.into_owned())
            .map_err(|_| Error::Protocol("path is not valid UTF-8"))
    }
}

/// Collapse `.` and `..` segments and duplicate slashes. The result always starts
/// with `/`. Returns `None` if a `..` would climb above the root.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len());
    for seg in &segments {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() || (path.ends_with('/') && !segments.is_empty()) {
        out.push('/');
    }
    Some(out)
}

/// Map a decoded request path onto the filesystem below `root`.
///
/// `prefix` is the matched location path; it is stripped before joining.
/// Any attempt to leave `root` (via `..` or a NUL byte) yields `Error::Traversal`.
pub fn resolve_path(root: &Path, prefix: &str, path: &str) -> Result<PathBuf> {
    if path.contains('\0') {
        return Err(Error::Traversal(path.into()));
    }
    let normalized = normalize_path(path).ok_or_else(|| Error::Traversal(path.into()))?;
    let prefix = prefix.trim_end_matches('/');
    let relative = normalized
        .strip_prefix(prefix)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(&normalized);

    let mut resolved = root.to_path_buf();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(Error::Traversal(path.into())),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_takes_authority_from_host() {
        let url = Url::from_request("/static/image.jpg?size=2#top", "example.com:8080").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, "8080");
        assert_eq!(url.path, "/static/image.jpg");
        assert_eq!(url.query, "size=2");
        assert_eq!(url.fragment, "top");
        assert_eq!(url.scheme, "");
    }

    #[test]
    fn absolute_form_keeps_its_own_authority() {
        let url = Url::from_request("http://alice:pw@other.org:81/a/b", "ignored").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.user, "alice");
        assert_eq!(url.password, "pw");
        assert_eq!(url.host, "other.org");
        assert_eq!(url.port, "81");
        assert_eq!(url.path, "/a/b");
    }

    #[test]
    fn empty_path_becomes_root() {
        let url = Url::parse("localhost").unwrap();
        assert_eq!(url.path, "/");
        assert!(Url::parse("ftp://x/").is_err());
        assert!(Url::parse("host:80x").is_err());
    }

    #[test]
    fn percent_escapes_are_decoded() {
        let url = Url::from_request("/my%20file.txt", "h").unwrap();
        assert_eq!(url.decoded_path().unwrap(), "/my file.txt");
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize_path("/a/./b//c/../d").as_deref(), Some("/a/b/d"));
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path("/dir/").as_deref(), Some("/dir/"));
        assert_eq!(normalize_path("/../x"), None);
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let root = Path::new("/srv/www");
        let err = resolve_path(root, "/", "/../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::Traversal(_)));
        assert!(resolve_path(root, "/", "/a/../../b").is_err());
        assert!(resolve_path(root, "/", "/a\0b").is_err());
    }

    #[test]
    fn location_prefix_is_stripped() {
        let root = Path::new("/srv/img");
        assert_eq!(
            resolve_path(root, "/static", "/static/logo.png").unwrap(),
            PathBuf::from("/srv/img/logo.png")
        );
        assert_eq!(
            resolve_path(root, "/static/", "/static").unwrap(),
            PathBuf::from("/srv/img")
        );
        // Prefix that does not end on a segment boundary is not stripped
        assert_eq!(
            resolve_path(root, "/static", "/staticky/x").unwrap(),
            PathBuf::from("/srv/img/staticky/x")
        );
    }
}

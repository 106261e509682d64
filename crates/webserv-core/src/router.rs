// src/router.rs
use crate::cgi::{CgiLaunch, CgiWorker};
use crate::config::{Location, ServerConfig};
use crate::error::{Error, Result};
use crate::http::{Method, StatusCode};
use crate::multipart::{Multipart, boundary_of};
use crate::request::{RejectReason, Request};
use crate::response::Response;
use crate::url::{normalize_path, resolve_path};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, warn};

/// Characters escaped in autoindex links.
const HREF: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`');

/// What the router produced for one request.
#[derive(Debug)]
pub struct Routed {
    pub response: Response,
    /// Set when the response is fed by a freshly spawned CGI script.
    pub worker: Option<CgiWorker>,
}

impl From<Response> for Routed {
    fn from(response: Response) -> Self {
        Self {
            response,
            worker: None,
        }
    }
}

/// Maps requests onto the locations of the virtual servers.
#[derive(Debug, Clone)]
pub struct Router {
    servers: Vec<ServerConfig>,
    /// Port each server is actually bound to (differs from the config for port 0).
    ports: Vec<u16>,
}

impl Router {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        let ports = servers.iter().map(|s| s.port).collect();
        Self { servers, ports }
    }

    pub fn set_bound_port(&mut self, server_index: usize, port: u16) {
        if let Some(slot) = self.ports.get_mut(server_index) {
            *slot = port;
        }
    }

    pub fn server(&self, server_index: usize) -> Option<&ServerConfig> {
        self.servers.get(server_index)
    }

    /// Body limit of the server behind a listener.
    pub fn max_body_size(&self, server_index: usize) -> usize {
        self.server(server_index)
            .map(|s| s.client_max_body_size)
            .unwrap_or(0)
    }

    /// Produce the response for a finished or rejected request.
    pub fn dispatch(&self, server_index: usize, request: &Request, peer: Option<IpAddr>) -> Routed {
        let routed = match request.reject {
            Some(RejectReason::BodyTooLarge) => {
                self.error_response(server_index, StatusCode::CONTENT_TOO_LARGE).into()
            }
            Some(_) => self.error_response(server_index, StatusCode::BAD_REQUEST).into(),
            None => match guarded(|| self.route(server_index, request, peer)) {
                Ok(routed) => routed,
                Err(e) => {
                    let status = status_for(&e);
                    if status == StatusCode::INTERNAL_SERVER_ERROR {
                        error!(error = %e, path = %request.url.path, "request failed");
                    } else {
                        debug!(error = %e, "request refused");
                    }
                    self.error_response(server_index, status).into()
                }
            },
        };
        debug!(
            method = %request.method,
            path = %request.url.path,
            status = routed.response.status.as_u16(),
            "routed"
        );
        routed
    }

    /// Configured error page for `status`, or the generated one.
    pub fn error_response(&self, server_index: usize, status: StatusCode) -> Response {
        let page = self
            .server(server_index)
            .and_then(|s| s.error_pages.get(&status.as_u16()));
        if let Some(page) = page {
            match File::open(page).and_then(|f| Ok((f.metadata()?.len(), f))) {
                Ok((len, file)) => {
                    let mut resp = Response::file(file, len, "text/html; charset=utf-8");
                    resp.status = status;
                    return resp;
                }
                Err(e) => warn!(page = %page.display(), error = %e, "error page unavailable"),
            }
        }
        Response::error(status)
    }

    fn route(&self, server_index: usize, request: &Request, peer: Option<IpAddr>) -> Result<Routed> {
        let server = self
            .server(server_index)
            .ok_or_else(|| Error::Handler(format!("no server #{server_index}")))?;
        let decoded = request.url.decoded_path()?;
        let path = normalize_path(&decoded).ok_or(Error::Traversal(decoded))?;
        let Some(loc) = server.location_for(&path) else {
            return Ok(self.error_response(server_index, StatusCode::NOT_FOUND).into());
        };
        if !loc.allows(request.method) {
            let resp = self
                .error_response(server_index, StatusCode::METHOD_NOT_ALLOWED)
                .header("Allow", &loc.allow_header());
            return Ok(resp.into());
        }
        if let Some(target) = &loc.redirect {
            return Ok(Response::redirect(StatusCode::MOVED_PERMANENTLY, target).into());
        }

        let fs_path = resolve_path(&loc.root, &loc.path, &path)?;

        if let Some(script) = find_script(loc, &fs_path) {
            let port = self.ports.get(server_index).copied().unwrap_or(server.port);
            let server_name = if server.server_name.is_empty() {
                request.url.host.as_str()
            } else {
                server.server_name.as_str()
            };
            let launch = CgiLaunch {
                interpreter: script.interpreter.as_deref(),
                script: &script.path,
                script_name: &script.script_name,
                path_info: &script.path_info,
                server_name,
                server_port: port,
                remote_addr: peer,
            };
            let worker = CgiWorker::spawn(request, &launch)?;
            return Ok(Routed {
                response: Response::cgi(),
                worker: Some(worker),
            });
        }

        let response = match request.method {
            Method::Get | Method::Head => serve_static(loc, &fs_path, &path)?,
            Method::Post => upload(loc, &fs_path, request)?,
            Method::Delete => delete(&fs_path)?,
            _ => self.error_response(server_index, StatusCode::NOT_IMPLEMENTED),
        };
        Ok(response.into())
    }
}

/// Run a handler, turning a panic into `Error::Handler`.
fn guarded<F>(handler: F) -> Result<Routed>
where
    F: FnOnce() -> Result<Routed>,
{
    #[cfg(feature = "catch-panic")]
    {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)) {
            Ok(result) => result,
            Err(_) => Err(Error::Handler("handler panicked".into())),
        }
    }
    #[cfg(not(feature = "catch-panic"))]
    {
        handler()
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Forbidden(_) | Error::Traversal(_) => StatusCode::FORBIDDEN,
        Error::Protocol(_) => StatusCode::BAD_REQUEST,
        Error::LimitExceeded(_) => StatusCode::CONTENT_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fs_error(err: io::Error, path: &Path) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
            Error::NotFound(path.to_path_buf())
        }
        io::ErrorKind::PermissionDenied => Error::Forbidden(path.to_path_buf()),
        _ => Error::Io(err),
    }
}

fn serve_static(loc: &Location, fs_path: &Path, url_path: &str) -> Result<Response> {
    let meta = fs::metadata(fs_path).map_err(|e| fs_error(e, fs_path))?;
    if !meta.is_dir() {
        return serve_file(fs_path);
    }
    if !url_path.ends_with('/') {
        return Ok(Response::redirect(
            StatusCode::MOVED_PERMANENTLY,
            &format!("{url_path}/"),
        ));
    }
    for index in &loc.index {
        let candidate = fs_path.join(index);
        if candidate.is_file() {
            return serve_file(&candidate);
        }
    }
    if loc.autoindex {
        return autoindex(fs_path, url_path);
    }
    Err(Error::Forbidden(fs_path.to_path_buf()))
}

fn serve_file(path: &Path) -> Result<Response> {
    let file = File::open(path).map_err(|e| fs_error(e, path))?;
    let len = file.metadata()?.len();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(Response::file(file, len, mime.essence_str()))
}

struct Script {
    path: PathBuf,
    interpreter: Option<PathBuf>,
    script_name: String,
    path_info: String,
}

/// Walk the resolved path from the location root and stop at the first
/// existing file whose extension is mapped to an interpreter.
fn find_script(loc: &Location, fs_path: &Path) -> Option<Script> {
    if loc.cgi.is_empty() {
        return None;
    }
    let relative = fs_path.strip_prefix(&loc.root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    let mut candidate = loc.root.clone();
    let mut script_name = loc.path.trim_end_matches('/').to_owned();
    for (i, part) in parts.iter().enumerate() {
        candidate.push(part);
        script_name.push('/');
        script_name.push_str(part);

        let Some(ext) = candidate.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let Some(interpreter) = loc.cgi_interpreter(ext) else {
            continue;
        };
        if !candidate.is_file() {
            return None;
        }
        let path_info = parts[i + 1..]
            .iter()
            .fold(String::new(), |acc, p| acc + "/" + p);
        return Some(Script {
            path: candidate,
            interpreter: (!interpreter.is_empty()).then(|| PathBuf::from(interpreter)),
            script_name,
            path_info,
        });
    }
    None
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn autoindex(dir: &Path, url_path: &str) -> Result<Response> {
    let mut entries: Vec<(String, bool, u64)> = fs::read_dir(dir)
        .map_err(|e| fs_error(e, dir))?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let meta = entry.metadata().ok()?;
            let name = entry.file_name().into_string().ok()?;
            Some((name, meta.is_dir(), meta.len()))
        })
        .collect();
    // Directories first, then by name
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let title = escape_html(url_path);
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {title}</title></head>\
         <body><h1>Index of {title}</h1><hr><pre>\n"
    );
    if url_path != "/" {
        html.push_str("<a href=\"../\">../</a>\n");
    }
    for (name, is_dir, size) in &entries {
        let slash = if *is_dir { "/" } else { "" };
        let href = utf8_percent_encode(name, HREF);
        let _ = if *is_dir {
            writeln!(html, "<a href=\"{href}/\">{}{slash}</a>", escape_html(name))
        } else {
            writeln!(
                html,
                "<a href=\"{href}\">{}</a> {size}",
                escape_html(name)
            )
        };
    }
    html.push_str("</pre><hr></body></html>\n");
    Ok(Response::html(StatusCode::OK, html))
}

/// Last path component of a client-supplied file name, or `None` if nothing safe is left.
fn safe_file_name(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next()?;
    match base {
        "" | "." | ".." => None,
        b if b.contains('\0') => None,
        b => Some(b),
    }
}

fn upload(loc: &Location, fs_path: &Path, request: &Request) -> Result<Response> {
    if let Some(boundary) = request.content_type().and_then(boundary_of) {
        let dir = match &loc.upload_dir {
            Some(dir) => dir.clone(),
            None if fs_path.is_dir() => fs_path.to_path_buf(),
            None => return Err(Error::NotFound(fs_path.to_path_buf())),
        };
        let mut saved = Vec::new();
        for part in Multipart::new(&request.body, &boundary) {
            let part = part?;
            let Some(name) = part.filename.as_deref().and_then(safe_file_name) else {
                continue;
            };
            let target = dir.join(name);
            fs::write(&target, part.data).map_err(|e| fs_error(e, &target))?;
            debug!(path = %target.display(), bytes = part.data.len(), "upload stored");
            saved.push(name.to_owned());
        }
        if saved.is_empty() {
            return Err(Error::Protocol("multipart body without files"));
        }
        let mut html = String::from("<!DOCTYPE html>\n<html><body><h1>Uploaded</h1><ul>\n");
        for name in &saved {
            let _ = writeln!(html, "<li>{}</li>", escape_html(name));
        }
        html.push_str("</ul></body></html>\n");
        return Ok(Response::html(StatusCode::CREATED, html));
    }

    let target = match &loc.upload_dir {
        Some(dir) => {
            let name = fs_path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Forbidden(fs_path.to_path_buf()))?;
            dir.join(name)
        }
        None => fs_path.to_path_buf(),
    };
    if target.is_dir() {
        return Ok(Response::error(StatusCode::CONFLICT));
    }
    fs::write(&target, &request.body).map_err(|e| fs_error(e, &target))?;
    debug!(path = %target.display(), bytes = request.body.len(), "body stored");
    Ok(Response::html(
        StatusCode::CREATED,
        "<!DOCTYPE html>\n<html><body><h1>Created</h1></body></html>\n",
    )
    .header("Location", &request.url.path))
}

fn delete(fs_path: &Path) -> Result<Response> {
    let meta = fs::symlink_metadata(fs_path).map_err(|e| fs_error(e, fs_path))?;
    if meta.is_dir() {
        return Ok(Response::error(StatusCode::CONFLICT));
    }
    fs::remove_file(fs_path).map_err(|e| fs_error(e, fs_path))?;
    debug!(path = %fs_path.display(), "deleted");
    Ok(Response::html(
        StatusCode::OK,
        "<!DOCTYPE html>\n<html><body><h1>Deleted</h1></body></html>\n",
    ))
}

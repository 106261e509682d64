// src/error.rs
use std::io;
use std::path::PathBuf;

/// Central error type for the webserv engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O error from the OS, a socket, a pipe or a file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration is structurally valid TOML but semantically wrong.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file is not valid TOML for the expected schema.
    #[error("configuration syntax: {0}")]
    Toml(#[from] toml::de::Error),

    /// Registering a descriptor with the poller failed. Always a programming error.
    #[error("registry error on fd {fd}: {source}")]
    Registry { fd: i32, source: io::Error },

    /// The readiness poll itself failed (other than EINTR).
    #[error("poll failed: {0}")]
    Poll(io::Error),

    /// Malformed request line, header or chunk framing.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// A configured size limit was exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    /// A request path resolved outside of its location root.
    #[error("path escapes its root: {0}")]
    Traversal(String),

    /// The resolved resource does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The resolved resource exists but may not be served.
    #[error("forbidden: {}", .0.display())]
    Forbidden(PathBuf),

    /// A request handler failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Launching a CGI subprocess failed (pipe, fork or exec).
    #[error("cannot launch CGI process: {0}")]
    Process(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

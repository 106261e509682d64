// src/lib.rs
pub mod cgi;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod multipart;
pub mod parser;
pub mod registry;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod syscalls;
pub mod url;

// Re-exports for users
pub use config::{Config, Limits, Location, ServerConfig};
pub use error::{Error, Result};
pub use http::{Headers, Method, StatusCode};
pub use request::Request;
pub use response::Response;
pub use router::Router;
pub use server::{Server, ShutdownToken};

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;
use webserv_core::{Config, Limits, Location, Server, ServerConfig, ShutdownToken};

/// A server running on its own thread, stopped on drop.
pub struct Running {
    pub addr: SocketAddr,
    token: ShutdownToken,
    handle: Option<JoinHandle<webserv_core::Result<()>>>,
}

impl Running {
    pub fn start(locations: Vec<Location>) -> Self {
        Self::start_with(locations, Limits::default(), |_| {})
    }

    pub fn start_with(
        locations: Vec<Location>,
        limits: Limits,
        tweak: impl FnOnce(&mut ServerConfig),
    ) -> Self {
        webserv_core::logging::try_init_for_tests();
        let mut server = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            locations,
            ..ServerConfig::default()
        };
        tweak(&mut server);
        let config = Config {
            limits,
            servers: vec![server],
        };
        let mut server = Server::bind(config).expect("bind");
        let addr = server.local_addrs()[0];
        let token = server.shutdown_token();
        let handle = std::thread::spawn(move || server.run());
        Self {
            addr,
            token,
            handle: Some(handle),
        }
    }

    pub fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            stream,
        }
    }

    pub fn stop(mut self) -> webserv_core::Result<()> {
        self.token.trigger();
        self.handle.take().unwrap().join().expect("server thread panicked")
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.token.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).unwrap();
    }

    pub fn get(&mut self, path: &str) -> Reply {
        self.send(format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes());
        self.reply()
    }

    /// Read one response. Bodies are framed by Content-Length or chunked encoding.
    pub fn reply(&mut self) -> Reply {
        self.read_reply(false)
    }

    /// Read a response to HEAD: headers only.
    pub fn head_reply(&mut self) -> Reply {
        self.read_reply(true)
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    fn read_reply(&mut self, head_only: bool) -> Reply {
        let status_line = self.line();
        let status = status_line
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("bad status line {status_line:?}"));
        let mut headers = Vec::new();
        loop {
            let line = self.line();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.to_owned(), value.trim().to_owned()));
        }
        let mut reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };
        if head_only {
            return reply;
        }
        if reply
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            loop {
                let size = usize::from_str_radix(&self.line(), 16).unwrap();
                if size == 0 {
                    assert_eq!(self.line(), "");
                    break;
                }
                let mut chunk = vec![0; size];
                self.reader.read_exact(&mut chunk).unwrap();
                reply.body.extend_from_slice(&chunk);
                assert_eq!(self.line(), "");
            }
        } else if let Some(len) = reply.header("content-length") {
            let mut body = vec![0; len.parse().unwrap()];
            self.reader.read_exact(&mut body).unwrap();
            reply.body = body;
        }
        reply
    }

    /// True once the server has closed its side.
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.reader.read(&mut byte), Ok(0) | Err(_))
    }
}

pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

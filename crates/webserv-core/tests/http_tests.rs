mod common;

use common::{Running, write};
use std::fs;
use webserv_core::{Limits, Location};

fn site() -> (tempfile::TempDir, Running) {
    let dir = tempfile::tempdir().unwrap();
    let www = dir.path().join("www");
    write(&www.join("index.html"), "<h1>home</h1>");
    write(&www.join("style.css"), "body{}");
    write(&www.join("files/a.txt"), "alpha");
    write(&www.join("files/b.txt"), "beta");
    fs::create_dir_all(www.join("drop")).unwrap();

    let mut root = Location::new("/", &www);
    root.methods = vec!["GET".into(), "HEAD".into(), "POST".into(), "DELETE".into()];
    let mut files = Location::new("/files", www.join("files"));
    files.autoindex = true;
    let running = Running::start(vec![root, files]);
    (dir, running)
}

// ═══ Static files ═══

#[test]
fn test_serves_index_and_files() {
    let (_dir, server) = site();
    let mut client = server.connect();

    let reply = client.get("/");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "<h1>home</h1>");
    assert!(reply.header("content-type").unwrap().starts_with("text/html"));
    assert!(reply.header("date").is_some());
    assert!(reply.header("server").unwrap().starts_with("webserv/"));

    let reply = client.get("/style.css");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("text/css"));
    assert_eq!(reply.body, b"body{}");
}

#[test]
fn test_head_has_length_but_no_body() {
    let (_dir, server) = site();
    let mut client = server.connect();
    client.send(b"HEAD /files/a.txt HTTP/1.1\r\nHost: t\r\n\r\n");
    let reply = client.head_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-length"), Some("5"));

    // The next response starts right after the header block
    let reply = client.get("/files/b.txt");
    assert_eq!(reply.text(), "beta");
}

#[test]
fn test_missing_file_is_404_and_keeps_connection() {
    let (_dir, server) = site();
    let mut client = server.connect();
    let reply = client.get("/nope.html");
    assert_eq!(reply.status, 404);
    assert_eq!(reply.header("connection"), Some("keep-alive"));
    assert_eq!(client.get("/files/a.txt").status, 200);
}

#[test]
fn test_autoindex_lists_directory() {
    let (_dir, server) = site();
    let mut client = server.connect();
    let reply = client.get("/files/");
    assert_eq!(reply.status, 200);
    let html = reply.text();
    assert!(html.contains("a.txt"));
    assert!(html.contains("b.txt"));
}

#[test]
fn test_directory_without_slash_redirects() {
    let (_dir, server) = site();
    let mut client = server.connect();
    let reply = client.get("/files");
    assert_eq!(reply.status, 301);
    assert_eq!(reply.header("location"), Some("/files/"));
}

#[test]
fn test_traversal_is_forbidden() {
    let (_dir, server) = site();
    let mut client = server.connect();
    assert_eq!(client.get("/../../etc/passwd").status, 403);
    assert_eq!(client.get("/%2e%2e/%2e%2e/etc/passwd").status, 403);
}

// ═══ Methods ═══

#[test]
fn test_method_not_allowed_lists_allowed() {
    let (_dir, server) = site();
    let mut client = server.connect();
    client.send(b"DELETE /files/a.txt HTTP/1.1\r\nHost: t\r\n\r\n");
    let reply = client.reply();
    assert_eq!(reply.status, 405);
    assert_eq!(reply.header("allow"), Some("GET, HEAD"));
}

#[test]
fn test_post_then_get_then_delete() {
    let (dir, server) = site();
    let mut client = server.connect();

    client.send(b"POST /drop/note.txt HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nhello");
    let reply = client.reply();
    assert_eq!(reply.status, 201);
    assert_eq!(reply.header("location"), Some("/drop/note.txt"));
    assert_eq!(fs::read(dir.path().join("www/drop/note.txt")).unwrap(), b"hello");

    assert_eq!(client.get("/drop/note.txt").text(), "hello");

    client.send(b"DELETE /drop/note.txt HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(client.reply().status, 200);
    assert!(!dir.path().join("www/drop/note.txt").exists());
    assert_eq!(client.get("/drop/note.txt").status, 404);
}

#[test]
fn test_chunked_upload_is_reassembled() {
    let (dir, server) = site();
    let mut client = server.connect();
    client.send(b"POST /drop/c.txt HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\n");
    client.send(b"5\r\nHello\r\n");
    client.send(b"6\r\n World\r\n0\r\n\r\n");
    assert_eq!(client.reply().status, 201);
    assert_eq!(
        fs::read_to_string(dir.path().join("www/drop/c.txt")).unwrap(),
        "Hello World"
    );
}

#[test]
fn test_multipart_upload_stores_file() {
    let (dir, server) = site();
    let mut client = server.connect();
    let body = "--XyZ\r\n\
                Content-Disposition: form-data; name=\"f\"; filename=\"up.txt\"\r\n\
                Content-Type: text/plain\r\n\r\n\
                uploaded\r\n\
                --XyZ--\r\n";
    client.send(
        format!(
            "POST /drop/ HTTP/1.1\r\nHost: t\r\n\
             Content-Type: multipart/form-data; boundary=XyZ\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .as_bytes(),
    );
    assert_eq!(client.reply().status, 201);
    assert_eq!(
        fs::read_to_string(dir.path().join("www/drop/up.txt")).unwrap(),
        "uploaded"
    );
}

// ═══ Connection handling ═══

#[test]
fn test_pipelined_requests_answer_in_order() {
    let (_dir, server) = site();
    let mut client = server.connect();
    client.send(
        b"GET /files/a.txt HTTP/1.1\r\nHost: t\r\n\r\n\
          GET /missing HTTP/1.1\r\nHost: t\r\n\r\n\
          GET /files/b.txt HTTP/1.1\r\nHost: t\r\n\r\n",
    );
    assert_eq!(client.reply().text(), "alpha");
    assert_eq!(client.reply().status, 404);
    assert_eq!(client.reply().text(), "beta");
}

#[test]
fn test_deep_pipeline_is_fully_answered() {
    let (_dir, server) = site();
    let mut client = server.connect();
    let mut burst = Vec::new();
    for i in 0..40 {
        let path = if i % 2 == 0 { "/files/a.txt" } else { "/files/b.txt" };
        burst.extend_from_slice(format!("GET {path} HTTP/1.1\r\nHost: t\r\n\r\n").as_bytes());
    }
    client.send(&burst);
    for i in 0..40 {
        let expected = if i % 2 == 0 { "alpha" } else { "beta" };
        assert_eq!(client.reply().text(), expected, "response {i}");
    }
}

#[test]
fn test_connection_close_is_honoured() {
    let (_dir, server) = site();
    let mut client = server.connect();
    client.send(b"GET /files/a.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n");
    let reply = client.reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(client.is_closed());
}

#[test]
fn test_malformed_request_gets_400_and_close() {
    let (_dir, server) = site();
    let mut client = server.connect();
    client.send(b"NOT A REQUEST AT ALL\r\n\r\n");
    let reply = client.reply();
    assert_eq!(reply.status, 400);
    assert!(client.is_closed());
}

#[test]
fn test_missing_host_is_400() {
    let (_dir, server) = site();
    let mut client = server.connect();
    client.send(b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(client.reply().status, 400);
}

#[test]
fn test_oversized_body_gets_413() {
    let dir = tempfile::tempdir().unwrap();
    let mut root = Location::new("/", dir.path());
    root.methods = vec!["POST".into()];
    let server = Running::start_with(vec![root], Limits::default(), |s| {
        s.client_max_body_size = 8;
    });
    let mut client = server.connect();
    client.send(b"POST /x HTTP/1.1\r\nHost: t\r\nContent-Length: 100\r\n\r\n");
    let reply = client.reply();
    assert_eq!(reply.status, 413);
    assert!(client.is_closed());
    assert!(!dir.path().join("x").exists());
}

#[test]
fn test_custom_error_page() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("404.html"), "<p>lost</p>");
    let page = dir.path().join("404.html");
    let server = Running::start_with(
        vec![Location::new("/", dir.path())],
        Limits::default(),
        |s| {
            s.error_pages.insert(404, page);
        },
    );
    let mut client = server.connect();
    let reply = client.get("/absent");
    assert_eq!(reply.status, 404);
    assert_eq!(reply.text(), "<p>lost</p>");
}

#[test]
fn test_large_file_streams_completely() {
    let dir = tempfile::tempdir().unwrap();
    let big: String = (0..200_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    write(&dir.path().join("big.txt"), &big);
    let server = Running::start(vec![Location::new("/", dir.path())]);
    let mut client = server.connect();
    let reply = client.get("/big.txt");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body.len(), big.len());
    assert_eq!(reply.text(), big);
}

#[test]
fn test_shutdown_returns_ok() {
    let (_dir, server) = site();
    let mut client = server.connect();
    assert_eq!(client.get("/").status, 200);
    server.stop().unwrap();
}

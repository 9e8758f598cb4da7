use ember_core::{EmberResult, Server, ServerConfig, ServerContext, ShutdownHandle};
use std::fs::{self, Permissions};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const INDEX: &str = "<html><body>ember index</body></html>";
const WELCOME: &str = "<html>welcome</html>";
const ERROR: &str = "<html>error</html>";
const NOT_FOUND: &str = "<html>404 page</html>";

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<EmberResult<()>>>,
    dir: TempDir,
}

impl TestServer {
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            t.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(dir: &Path, name: &str, contents: &[u8]) {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn spawn_server(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    publish(dir.path(), "index.html", INDEX.as_bytes());
    publish(dir.path(), "welcome.html", WELCOME.as_bytes());
    publish(dir.path(), "error.html", ERROR.as_bytes());
    publish(dir.path(), "404.html", NOT_FOUND.as_bytes());

    let mut config = ServerConfig {
        host: "127.0.0.1".parse().unwrap(),
        port: free_port(),
        trigger_mode: 3,
        timeout_ms: 60_000,
        linger: false,
        worker_threads: 4,
        max_connections: 1024,
        resource_dir: dir.path().to_path_buf(),
    };
    configure(&mut config);

    let server = Server::bind(&config).unwrap();
    let addr = server.local_addr();
    let ctx = server.context();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.start());

    TestServer {
        addr,
        ctx,
        handle,
        thread: Some(thread),
        dir,
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Read exactly one response: the header block, then `Content-Length` bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(
            n,
            1,
            "connection closed inside headers: {:?}",
            String::from_utf8_lossy(&raw)
        );
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .expect("Content-Length header")
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn get(path: &str, keep_alive: bool) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: {}\r\n\r\n",
        path,
        if keep_alive { "keep-alive" } else { "close" }
    )
}

fn post_form(path: &str, body: &str) -> String {
    format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    )
}

fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected trailing bytes: {:?}", rest);
}

#[test]
fn test_get_serves_file_in_every_trigger_mode() {
    for mode in 0..=3 {
        let server = spawn_server(|c| c.trigger_mode = mode);
        let mut stream = server.connect();
        stream.write_all(get("/", false).as_bytes()).unwrap();

        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "mode {}: {}", mode, head);
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(body, INDEX.as_bytes());
        assert_closed(&mut stream);
    }
}

#[test]
fn test_keep_alive_reuses_connection() {
    let server = spawn_server(|_| {});
    let mut stream = server.connect();

    for path in ["/index", "/index.html", "/welcome"] {
        stream.write_all(get(path, true).as_bytes()).unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Keep-Alive: max=6, timeout=120\r\n"));
        assert!(!body.is_empty());
    }
    assert_eq!(server.ctx.stats.live(), 1);
    assert_eq!(server.ctx.stats.snapshot().req_count, 3);
}

#[test]
fn test_request_split_across_writes() {
    let server = spawn_server(|c| c.trigger_mode = 0);
    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();
    let req = get("/index.html", false);
    let (first, second) = req.split_at(10);

    stream.write_all(first.as_bytes()).unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(second.as_bytes()).unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, INDEX.as_bytes());
}

#[test]
fn test_malformed_request_gets_400_then_close() {
    let server = spawn_server(|_| {});
    let mut stream = server.connect();
    stream.write_all(b"GET /nosuch\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("Bad Request"));
    assert_closed(&mut stream);
}

#[test]
fn test_missing_file_serves_404_page() {
    let server = spawn_server(|_| {});
    let mut stream = server.connect();
    stream.write_all(get("/nosuch", false).as_bytes()).unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body, NOT_FOUND.as_bytes());
}

#[test]
fn test_unreadable_file_is_forbidden() {
    let server = spawn_server(|_| {});
    let secret = server.dir.path().join("secret.txt");
    fs::write(&secret, "hidden").unwrap();
    fs::set_permissions(&secret, Permissions::from_mode(0o600)).unwrap();

    let mut stream = server.connect();
    stream.write_all(get("/secret.txt", false).as_bytes()).unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("File NotFound!"));
}

#[test]
fn test_register_then_login_form() {
    let server = spawn_server(|_| {});
    let exchange = |req: String| {
        let mut stream = server.connect();
        stream.write_all(req.as_bytes()).unwrap();
        read_response(&mut stream).1
    };

    assert_eq!(exchange(post_form("/login", "username=ann&password=pw")), ERROR.as_bytes());
    assert_eq!(exchange(post_form("/register", "username=ann&password=pw")), WELCOME.as_bytes());
    assert_eq!(exchange(post_form("/register", "username=ann&password=pw")), ERROR.as_bytes());
    assert_eq!(exchange(post_form("/login.html", "username=ann&password=pw")), WELCOME.as_bytes());
    assert_eq!(exchange(post_form("/login", "username=ann&password=nope")), ERROR.as_bytes());
}

#[test]
fn test_form_body_sent_after_headers() {
    for mode in [0, 3] {
        let server = spawn_server(|c| c.trigger_mode = mode);
        let mut stream = server.connect();
        stream.set_nodelay(true).unwrap();
        let body = "username=ivy&password=pw";
        let head = format!(
            "POST /register HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );

        stream.write_all(head.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(100));
        stream.write_all(body.as_bytes()).unwrap();

        let (status, page) = read_response(&mut stream);
        assert!(status.starts_with("HTTP/1.1 200 OK\r\n"), "mode {}: {}", mode, status);
        assert_eq!(page, WELCOME.as_bytes());
    }
}

#[test]
fn test_oversized_body_is_rejected() {
    let server = spawn_server(|_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"POST /register HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\nusername=x")
        .unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_closed(&mut stream);
}

#[test]
fn test_large_file_survives_partial_writes() {
    for mode in [0, 3] {
        let server = spawn_server(|c| c.trigger_mode = mode);
        let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i % 241) as u8).collect();
        publish(server.dir.path(), "blob.tar", &payload);

        let mut stream = server.connect();
        stream.write_all(get("/blob.tar", false).as_bytes()).unwrap();
        // Let the kernel buffers fill so the server has to resume.
        thread::sleep(Duration::from_millis(50));

        let (head, body) = read_response(&mut stream);
        assert!(head.contains(&format!("Content-Length: {}\r\n", payload.len())));
        assert!(head.contains("Content-Type: application/x-tar\r\n"));
        assert!(body == payload, "mode {}: body differs", mode);
        assert_closed(&mut stream);
    }
}

#[test]
fn test_rejects_clients_beyond_capacity() {
    let server = spawn_server(|c| c.max_connections = 1);
    let _held = server.connect();
    wait_for("first client", || server.ctx.stats.live() == 1);

    let mut rejected = server.connect();
    let mut reply = String::new();
    rejected.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "Server busy!");
    assert_eq!(server.ctx.stats.live(), 1);
}

#[test]
fn test_idle_connections_are_evicted() {
    let server = spawn_server(|c| c.timeout_ms = 150);
    let mut idle = server.connect();
    wait_for("client registered", || server.ctx.stats.live() == 1);

    let started = Instant::now();
    let mut buf = [0u8; 16];
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
    assert!(started.elapsed() < Duration::from_secs(3));
    wait_for("eviction", || server.ctx.stats.live() == 0);
}

#[test]
fn test_concurrent_clients_never_overlap_on_a_connection() {
    for mode in [0, 3] {
        let server = spawn_server(|c| {
            c.trigger_mode = mode;
            c.worker_threads = 8;
        });
        let clients: Vec<_> = (0..16)
            .map(|_| {
                let mut stream = server.connect();
                thread::spawn(move || {
                    for i in 0..20 {
                        let path = if i % 2 == 0 { "/index.html" } else { "/nosuch" };
                        stream.write_all(get(path, true).as_bytes()).unwrap();
                        let (head, _) = read_response(&mut stream);
                        assert!(head.starts_with("HTTP/1.1 "));
                    }
                })
            })
            .collect();
        for c in clients {
            c.join().unwrap();
        }

        let stats = server.ctx.stats.snapshot();
        assert_eq!(stats.overlapping_tasks, 0, "mode {}", mode);
        assert_eq!(stats.req_count, 16 * 20);
    }
}

#[test]
fn test_shutdown_closes_live_connections() {
    let mut server = spawn_server(|_| {});
    let mut stream = server.connect();
    stream.write_all(get("/", true).as_bytes()).unwrap();
    read_response(&mut stream);

    server.stop();
    assert_eq!(server.ctx.stats.live(), 0);
    assert_closed(&mut stream);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = ServerConfig {
        port: 80,
        ..ServerConfig::default()
    };
    assert!(Server::bind(&config).is_err());
}

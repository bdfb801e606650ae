//! Shared fixture for the integration tests: a real `RqShare` wired to
//! temp-directory local/work trees and a hand-rolled in-process HTTP
//! stub standing in for the remote endpoint (DESIGN.md: no new mocking
//! dependency beyond what the pack already favors).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use rq_share::{Config, RqShare};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
struct StoredEntry {
    body: Vec<u8>,
    last_modified: i64,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Serialize)]
struct RemoteEntryJson<'a> {
    name: &'a str,
    is_directory: bool,
    size: u64,
    #[serde(rename = "lastModified")]
    last_modified: i64,
}

/// A minimal single-process HTTP stand-in for the remote content
/// endpoint: stores bodies keyed by virtual path, understands
/// HEAD/GET/PUT/POST/DELETE plus the WebDAV-flavored `MOVE` encoding
/// `RemoteTree::move_resource` sends (decision recorded in DESIGN.md).
pub struct RemoteStub {
    pub addr: std::net::SocketAddr,
    state: Arc<std::sync::Mutex<HashMap<String, StoredEntry>>>,
    requests: Arc<AsyncMutex<Vec<RecordedRequest>>>,
    write_delay_ms: Arc<AtomicU64>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl RemoteStub {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub listener");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let write_delay_ms = Arc::new(AtomicU64::new(0));
        let fail_writes = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let stub = Self { addr, state, requests, write_delay_ms, fail_writes };
        stub.run(listener);
        stub
    }

    /// Seed the remote with a file, as if it had existed there all along.
    pub fn seed(&self, path: &str, body: &[u8], last_modified: i64) {
        self.state.lock().unwrap().insert(
            path.to_string(),
            StoredEntry { body: body.to_vec(), last_modified },
        );
    }

    pub fn body_of(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().get(path).map(|e| e.body.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().contains_key(path)
    }

    /// Delete a path directly in the stub's store, as if some other client
    /// had removed it upstream.
    pub fn remove(&self, path: &str) {
        self.state.lock().unwrap().remove(path);
    }

    /// Delay every PUT/POST response by `delay`, to widen the window a
    /// test has to supersede an in-flight upload before it completes.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every subsequent PUT/POST/DELETE fail with 500, for retry/purge
    /// scenarios.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    fn run(&self, listener: TcpListener) {
        let state = self.state.clone();
        let requests = self.requests.clone();
        let write_delay_ms = self.write_delay_ms.clone();
        let fail_writes = self.fail_writes.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let state = state.clone();
                let requests = requests.clone();
                let write_delay_ms = write_delay_ms.clone();
                let fail_writes = fail_writes.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state, requests, write_delay_ms, fail_writes)
                        .await;
                });
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<std::sync::Mutex<HashMap<String, StoredEntry>>>,
    requests: Arc<AsyncMutex<Vec<RecordedRequest>>>,
    write_delay_ms: Arc<AtomicU64>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let raw_path = parts.next().unwrap_or("/").to_string();

    let content_length: usize =
        headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    let path = percent_decode(&raw_path);

    requests.lock().await.push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        body: body.clone(),
    });

    let response = match method.as_str() {
        "HEAD" => head_response(&state, &path),
        "GET" if path.ends_with('/') => list_response(&state, &path),
        "GET" => get_response(&state, &path),
        "PUT" | "POST" => {
            if headers.get("x-rq-method").map(|v| v.as_str()) == Some("MOVE") {
                move_response(&state, &path, headers.get("destination"))
            } else {
                let delay = write_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if fail_writes.load(Ordering::SeqCst) {
                    error_response(500, "injected failure")
                } else {
                    write_response(&state, &path, body)
                }
            }
        }
        "DELETE" => {
            if fail_writes.load(Ordering::SeqCst) {
                error_response(500, "injected failure")
            } else {
                delete_response(&state, &path)
            }
        }
        "MKCOL" => ok_response(201, b""),
        _ => error_response(405, "unsupported method"),
    };

    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn percent_decode(raw: &str) -> String {
    let path_only = raw.split('?').next().unwrap_or(raw);
    let mut out = String::new();
    let mut chars = path_only.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                    out.push(byte as char);
                    continue;
                }
            }
            out.push('%');
        } else {
            out.push(c);
        }
    }
    out
}

fn http_date(ms: i64) -> String {
    let secs = (ms.max(0) as u64) / 1000;
    let t = std::time::UNIX_EPOCH + Duration::from_secs(secs);
    httpdate::fmt_http_date(t)
}

fn head_response(state: &std::sync::Mutex<HashMap<String, StoredEntry>>, path: &str) -> Vec<u8> {
    let guard = state.lock().unwrap();
    match guard.get(path) {
        Some(entry) => {
            let headers = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nLast-Modified: {}\r\n\r\n",
                entry.body.len(),
                http_date(entry.last_modified)
            );
            headers.into_bytes()
        }
        None => error_response(404, "not found"),
    }
}

fn get_response(state: &std::sync::Mutex<HashMap<String, StoredEntry>>, path: &str) -> Vec<u8> {
    let guard = state.lock().unwrap();
    match guard.get(path) {
        Some(entry) => {
            let mut out = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nLast-Modified: {}\r\n\r\n",
                entry.body.len(),
                http_date(entry.last_modified)
            )
            .into_bytes();
            out.extend_from_slice(&entry.body);
            out
        }
        None => error_response(404, "not found"),
    }
}

fn list_response(state: &std::sync::Mutex<HashMap<String, StoredEntry>>, dir: &str) -> Vec<u8> {
    let guard = state.lock().unwrap();
    let entries: Vec<RemoteEntryJson> = guard
        .iter()
        .filter_map(|(key, entry)| {
            let rest = key.strip_prefix(dir)?;
            if rest.is_empty() || rest.contains('/') {
                return None;
            }
            Some(RemoteEntryJson {
                name: rest,
                is_directory: false,
                size: entry.body.len() as u64,
                last_modified: entry.last_modified,
            })
        })
        .collect();
    let json = serde_json::to_vec(&entries).unwrap_or_default();
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        json.len()
    )
    .into_bytes();
    out.extend_from_slice(&json);
    out
}

fn write_response(
    state: &std::sync::Mutex<HashMap<String, StoredEntry>>,
    path: &str,
    body: Vec<u8>,
) -> Vec<u8> {
    let mut guard = state.lock().unwrap();
    guard.insert(path.to_string(), StoredEntry { body, last_modified: now_ms() });
    ok_response(201, b"")
}

fn move_response(
    state: &std::sync::Mutex<HashMap<String, StoredEntry>>,
    old_path: &str,
    destination_header: Option<&String>,
) -> Vec<u8> {
    let Some(dest) = destination_header else {
        return error_response(400, "missing destination");
    };
    let dest_path = dest.split_once("://").map(|(_, rest)| rest).and_then(|r| r.split_once('/')).map(|(_, p)| format!("/{p}")).unwrap_or_else(|| dest.clone());
    let mut guard = state.lock().unwrap();
    if let Some(entry) = guard.remove(old_path) {
        guard.insert(dest_path, entry);
        ok_response(200, b"")
    } else {
        error_response(404, "not found")
    }
}

fn delete_response(state: &std::sync::Mutex<HashMap<String, StoredEntry>>, path: &str) -> Vec<u8> {
    let mut guard = state.lock().unwrap();
    if guard.remove(path).is_some() {
        ok_response(200, b"")
    } else {
        error_response(404, "not found")
    }
}

fn ok_response(status: u16, body: &[u8]) -> Vec<u8> {
    let reason = if status == 201 { "Created" } else { "OK" };
    let mut out =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\n\r\n", body.len())
            .into_bytes();
    out.extend_from_slice(body);
    out
}

fn error_response(status: u16, message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} Error\r\nContent-Length: {}\r\n\r\n{}",
        message.len(),
        message
    )
    .into_bytes()
}

/// A full fixture: temp local/work roots, a running `RemoteStub`, and the
/// `RqShare` wired to all three.
pub struct Fixture {
    pub local_dir: TempDir,
    pub work_dir: TempDir,
    pub remote: RemoteStub,
    pub share: RqShare,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let local_dir = TempDir::new().expect("local tempdir");
        let work_dir = TempDir::new().expect("work tempdir");
        let remote = RemoteStub::spawn().await;

        let mut config = Config {
            local_path: local_dir.path().to_string_lossy().into_owned(),
            work_path: work_dir.path().to_string_lossy().into_owned(),
            remote_prefix: format!("http://{}", remote.addr),
            modified_threshold_ms: 500,
            expiration_ms: 0,
            max_retries: 3,
            retry_delay_ms: 0,
            frequency_ms: 20,
            no_processor: true,
            temp_patterns: rq_share::path::DEFAULT_TEMP_PATTERNS.iter().map(|s| s.to_string()).collect(),
        };
        tweak(&mut config);

        let share = RqShare::new(config).expect("build RqShare");
        Self { local_dir, work_dir, remote, share }
    }

    pub fn tree(&self) -> rq_share::RqTree {
        self.share.tree()
    }
}

pub async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

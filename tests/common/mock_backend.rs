//! Threaded mock of the Azure OpenAI backend.
//!
//! Serves each connection on its own thread so the gateway's bounded
//! fan-out really overlaps, records every request, and tracks the
//! high-water mark of simultaneously handled calls.

use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::pick_free_port;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Full request target including the query string, so tests can assert
    /// on the deployment segment and `api-version`.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub data: Vec<u8>,
    pub delay: Option<Duration>,
}

impl StreamChunk {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub enum MockBody {
    Static(Vec<u8>),
    Stream { chunks: Vec<StreamChunk> },
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: MockBody,
    /// Hold the call open before responding; stretches the window in which
    /// concurrent calls overlap.
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn json(status: u16, value: Value) -> Self {
        let body = serde_json::to_vec(&value).expect("failed to serialize mock response");
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: MockBody::Static(body),
            delay: None,
        }
    }

    pub fn stream(status: u16, chunks: Vec<StreamChunk>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/event-stream".into())],
            body: MockBody::Stream { chunks },
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub struct MockBackend {
    port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    max_in_flight: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MockBackend {
    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::default()
    }

    /// Plain-HTTP endpoint string to hand the gateway as
    /// `AZURE_OPENAI_ENDPOINT`.
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn received_requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of calls this backend handled at the same instant.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn start(routes: HashMap<String, MockResponse>) -> Self {
        let port = pick_free_port();
        let listener =
            TcpListener::bind(("127.0.0.1", port)).expect("failed to bind mock backend port");
        listener
            .set_nonblocking(true)
            .expect("failed to configure listener");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let routes = Arc::new(routes);

        let requests_clone = Arc::clone(&requests);
        let max_clone = Arc::clone(&max_in_flight);
        let shutdown_clone = Arc::clone(&shutdown);

        let thread = thread::spawn(move || {
            accept_loop(listener, routes, requests_clone, max_clone, shutdown_clone)
        });

        Self {
            port,
            requests,
            max_in_flight,
            shutdown,
            thread: Some(thread),
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
pub struct MockBackendBuilder {
    routes: HashMap<String, MockResponse>,
}

impl MockBackendBuilder {
    /// Register a response for a path; the query string of incoming
    /// requests is ignored when matching.
    pub fn route(mut self, path: &str, response: MockResponse) -> Self {
        self.routes.insert(path.to_string(), response);
        self
    }

    pub fn build(self) -> MockBackend {
        MockBackend::start(self.routes)
    }
}

fn accept_loop(
    listener: TcpListener,
    routes: Arc<HashMap<String, MockResponse>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    max_in_flight: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let routes = Arc::clone(&routes);
                let requests = Arc::clone(&requests);
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                workers.push(thread::spawn(move || {
                    serve_connection(stream, routes, requests, in_flight, max_in_flight)
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => {
                eprintln!("mock backend accept error: {}", err);
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
}

fn serve_connection(
    mut stream: TcpStream,
    routes: Arc<HashMap<String, MockResponse>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
) {
    stream
        .set_nonblocking(false)
        .expect("failed to configure mock backend stream");

    let request = match read_request(&mut stream) {
        Some(request) => request,
        None => return,
    };

    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    max_in_flight.fetch_max(now, Ordering::SeqCst);

    requests.lock().unwrap().push(request.clone());

    let response = resolve_response(&request, &routes);
    match response {
        Some(response) => {
            if let Some(delay) = response.delay {
                thread::sleep(delay);
            }
            let _ = send_response(&mut stream, response);
        }
        None => {
            let not_found = MockResponse::json(
                404,
                serde_json::json!({"error": {"message": "mock route not registered"}}),
            );
            let _ = send_response(&mut stream, not_found);
        }
    }

    in_flight.fetch_sub(1, Ordering::SeqCst);
}

fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut temp = [0u8; 1024];
    let mut header_len = None;
    let mut expected_len = None;

    loop {
        match stream.read(&mut temp) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&temp[..n]);
                if header_len.is_none() {
                    if let Some(pos) = find_header_end(&buffer) {
                        header_len = Some(pos + 4);
                        if let Some(len) = parse_content_length(&buffer[..pos]) {
                            expected_len = Some(pos + 4 + len);
                        } else {
                            break;
                        }
                    }
                }
                if let Some(len) = expected_len {
                    if buffer.len() >= len {
                        break;
                    }
                }
            }
            Err(_) => return None,
        }
    }

    parse_recorded_request(&buffer)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let header_str = String::from_utf8_lossy(headers);
    for line in header_str.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn parse_recorded_request(buffer: &[u8]) -> Option<RecordedRequest> {
    let header_end = find_header_end(buffer)?;
    let header_bytes = &buffer[..header_end];
    let body = buffer[header_end + 4..].to_vec();
    let header_str = String::from_utf8_lossy(header_bytes);
    let mut lines = header_str.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn resolve_response(
    request: &RecordedRequest,
    routes: &HashMap<String, MockResponse>,
) -> Option<MockResponse> {
    if let Some(response) = routes.get(&request.path) {
        return Some(response.clone());
    }
    if let Some((path, _query)) = request.path.split_once('?') {
        if let Some(response) = routes.get(path) {
            return Some(response.clone());
        }
    }
    None
}

fn send_response(stream: &mut TcpStream, response: MockResponse) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("Connection: close\r\n");

    match response.body {
        MockBody::Static(body) => {
            head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            stream.write_all(head.as_bytes())?;
            stream.write_all(&body)?;
            stream.flush()?;
        }
        MockBody::Stream { chunks } => {
            head.push_str("Cache-Control: no-cache\r\n\r\n");
            stream.write_all(head.as_bytes())?;
            stream.flush()?;

            for chunk in &chunks {
                if let Some(delay) = chunk.delay {
                    thread::sleep(delay);
                }
                stream.write_all(&chunk.data)?;
                stream.flush()?;
            }
        }
    }
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "BAD REQUEST",
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "NOT FOUND",
        429 => "TOO MANY REQUESTS",
        500 => "INTERNAL SERVER ERROR",
        502 => "BAD GATEWAY",
        _ => "OK",
    }
}

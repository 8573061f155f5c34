//! Outbound calls against the Azure OpenAI backend.
//!
//! One request per call, hand-rolled HTTP/1.1 over TCP with TLS when the
//! endpoint requires it. This layer never transforms payloads; re-shaping is
//! the job of the re-framer and the aggregator.

use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::metrics::BackendCallGuard;
use crate::reframe;
use async_tls::client::TlsStream;
use async_tls::TlsConnector;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const READ_BUFFER_SIZE: usize = 4096;

/// Fully buffered backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl BackendResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get("content-type")
            .map(String::as_str)
            .unwrap_or("application/json")
    }
}

/// A backend call whose headers have been read but whose body is still
/// arriving on the connection. `initial` holds body bytes that were read
/// together with the headers.
pub struct StreamingCall {
    status: u16,
    headers: HashMap<String, String>,
    initial: Vec<u8>,
    connection: Connection,
}

enum Connection {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Connection {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.write_all(bytes).await,
            Connection::Tls(stream) => stream.write_all(bytes).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush().await,
            Connection::Tls(stream) => stream.flush().await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.read(buf).await,
            Connection::Tls(stream) => stream.read(buf).await,
        }
    }
}

impl StreamingCall {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drive the rest of the body through the re-framer into `sink`.
    pub async fn reframe_into<W>(
        mut self,
        sink: &mut W,
        delimiter: &str,
        pacing: Duration,
    ) -> GatewayResult<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        match &mut self.connection {
            Connection::Plain(upstream) => {
                reframe::reframe_with_initial(&self.initial, upstream, sink, delimiter, pacing)
                    .await
            }
            Connection::Tls(upstream) => {
                reframe::reframe_with_initial(&self.initial, upstream, sink, delimiter, pacing)
                    .await
            }
        }
    }

    /// Read the remaining body to completion and buffer the whole response.
    pub async fn into_response(mut self) -> GatewayResult<BackendResponse> {
        let mut body = std::mem::take(&mut self.initial);
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = self.connection.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buffer[..n]);
        }
        Ok(BackendResponse {
            status: self.status,
            headers: self.headers,
            body,
        })
    }
}

/// One buffered backend call: connect, send, read the full response.
pub async fn call_backend(
    config: &GatewayConfig,
    verb: &str,
    payload: &[u8],
    deployment: &str,
    resource: &str,
    credential: Option<&str>,
) -> GatewayResult<BackendResponse> {
    let _inflight = BackendCallGuard::new();
    let call = open_backend_call(config, verb, payload, deployment, resource, credential).await?;
    call.into_response().await
}

/// Open a backend call and return once the response headers are parsed,
/// leaving the body on the connection for streaming consumption.
///
/// Fails with an authorization error before any network I/O when no
/// credential is present.
pub async fn open_backend_call(
    config: &GatewayConfig,
    verb: &str,
    payload: &[u8],
    deployment: &str,
    resource: &str,
    credential: Option<&str>,
) -> GatewayResult<StreamingCall> {
    let credential = credential
        .filter(|token| !token.is_empty())
        .ok_or_else(|| GatewayError::Auth("no API credential resolvable".to_string()))?;

    let target = config.backend_url(deployment, resource);
    let parsed_url = Url::parse(&target).map_err(|e| GatewayError::Url(e.to_string()))?;
    let host = parsed_url
        .host_str()
        .ok_or_else(|| GatewayError::Url("Invalid URL: missing host".to_string()))?;
    let port = parsed_url
        .port_or_known_default()
        .unwrap_or(if parsed_url.scheme() == "https" {
            443
        } else {
            80
        });
    let path_and_query = path_with_query(&parsed_url);

    debug!(
        "Forwarding {} {} to {}:{}",
        verb, path_and_query, host, port
    );

    let headers = backend_headers(credential);
    let request_bytes = build_request_bytes(verb, &path_and_query, host, &headers, Some(payload));

    let tcp_stream = TcpStream::connect((host, port)).await?;
    let mut connection = if parsed_url.scheme() == "https" {
        let tls_connector = TlsConnector::new();
        let tls_stream = tls_connector
            .connect(host, tcp_stream)
            .await
            .map_err(|e| GatewayError::Tls(e.to_string()))?;
        Connection::Tls(tls_stream)
    } else {
        Connection::Plain(tcp_stream)
    };

    connection.write_all(&request_bytes).await?;
    connection.flush().await?;

    read_response_head(connection).await
}

fn backend_headers(credential: &str) -> HashMap<String, String> {
    let mut headers = HashMap::with_capacity(2);
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("api-key".to_string(), credential.to_string());
    headers
}

fn build_request_bytes(
    method: &str,
    path: &str,
    host: &str,
    headers: &HashMap<String, String>,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut request = Vec::new();
    request.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, path).as_bytes());
    request.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
    request.extend_from_slice(b"Connection: close\r\n");

    for (key, value) in headers {
        request.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }

    if let Some(body_bytes) = body {
        request.extend_from_slice(format!("Content-Length: {}\r\n", body_bytes.len()).as_bytes());
        request.extend_from_slice(b"\r\n");
        request.extend_from_slice(body_bytes);
    } else {
        request.extend_from_slice(b"\r\n");
    }

    request
}

fn path_with_query(url: &Url) -> String {
    let mut combined = url.path().to_string();
    if let Some(query) = url.query() {
        combined.push('?');
        combined.push_str(query);
    }
    if combined.is_empty() {
        combined.push('/');
    }
    combined
}

async fn read_response_head(mut connection: Connection) -> GatewayResult<StreamingCall> {
    let mut collected = Vec::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        if let Some(pos) = find_header_end(&collected) {
            let (status, headers) = parse_response_head(&collected[..pos])?;
            let initial = collected[pos + 4..].to_vec();
            return Ok(StreamingCall {
                status,
                headers,
                initial,
                connection,
            });
        }
        let n = connection.read(&mut buffer).await?;
        if n == 0 {
            return Err(GatewayError::Upstream(
                "backend closed before sending response headers".to_string(),
            ));
        }
        collected.extend_from_slice(&buffer[..n]);
    }
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_response_head(head: &[u8]) -> GatewayResult<(u16, HashMap<String, String>)> {
    let head_str = std::str::from_utf8(head)
        .map_err(|_| GatewayError::Upstream("backend response headers not valid UTF-8".to_string()))?;

    let mut lines = head_str.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| GatewayError::Upstream("backend response missing status line".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            GatewayError::Upstream(format!("malformed backend status line: {}", status_line))
        })?;

    let mut headers = HashMap::with_capacity(16);
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok((status, headers))
}

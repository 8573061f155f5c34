use crate::errors::{GatewayError, GatewayResult};
use smol::io::AsyncWriteExt;
use smol::net::TcpStream;
use std::io::Write as IoWrite;

pub(super) fn reason_phrase(status: u16) -> &'static str {
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

pub(super) fn error_status(err: &GatewayError) -> u16 {
    match err {
        GatewayError::Auth(_) => 403,
        GatewayError::BadRequest(_) | GatewayError::Json(_) => 400,
        GatewayError::Url(_) | GatewayError::Tls(_) | GatewayError::Upstream(_) => 502,
        GatewayError::Io(_) | GatewayError::Config(_) => 500,
    }
}

pub(super) fn build_error_response(status_code: u16, reason: &str, message: &str) -> Vec<u8> {
    let body = serde_json::to_vec(&serde_json::json!({
        "error": {
            "message": message,
        }
    }))
    .expect("JSON serialization should not fail");

    let mut response = Vec::with_capacity(128 + body.len());
    write!(
        &mut response,
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        status_code,
        reason,
        body.len()
    )
    .expect("writing to Vec<u8> cannot fail");
    response.extend_from_slice(&body);
    response
}

pub(super) fn map_error_to_response(err: &GatewayError) -> Vec<u8> {
    let status = error_status(err);
    build_error_response(status, reason_phrase(status), &err.to_string())
}

/// Permissive CORS preflight: any origin, method, header; no body.
pub(super) fn build_preflight_response() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\n\
      Access-Control-Allow-Origin: *\r\n\
      Access-Control-Allow-Methods: *\r\n\
      Access-Control-Allow-Headers: *\r\n\
      Content-Length: 0\r\n\r\n"
        .to_vec()
}

pub(super) async fn write_success(
    stream: &mut TcpStream,
    content_type: &str,
    payload: &[u8],
) -> GatewayResult<()> {
    write_passthrough(stream, 200, content_type, payload).await
}

/// Relay a response body with an arbitrary status, e.g. a backend error
/// forwarded verbatim.
pub(super) async fn write_passthrough(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    payload: &[u8],
) -> GatewayResult<()> {
    let mut response = Vec::with_capacity(128 + payload.len());
    write!(
        &mut response,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        reason_phrase(status),
        content_type,
        payload.len()
    )
    .expect("writing to Vec<u8> cannot fail");
    response.extend_from_slice(payload);
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

/// Response head for a re-framed event stream; the body follows as the
/// re-framer emits records.
pub(super) async fn write_sse_preamble(stream: &mut TcpStream) -> GatewayResult<()> {
    let response_headers = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\nX-Accel-Buffering: no\r\n\r\n";
    stream.write_all(response_headers.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

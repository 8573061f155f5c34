use crate::config::GatewayConfig;
use crate::error_tracking::{capture_error_with_context, track_backend_failure};
use crate::errors::GatewayError;
use crate::metrics::{
    gather_metrics, observe_request_latency, record_request, record_upstream_error,
    ConnectionGuard,
};
use crate::models::model_catalog;
use crate::tracing_util::{elapsed_ms, generate_request_id, redact_endpoint};
use serde_json::json;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::parser::{extract_content_length, parse_http_request, resolve_credential};
use super::response::{build_preflight_response, error_status, map_error_to_response, write_success};
use super::routes::handle_route;

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, config: Arc<GatewayConfig>) {
    let request_id = generate_request_id();
    let client_ip = addr.ip().to_string();

    // the guard form of entering a span would pin this future to one
    // thread; instrument instead, so the task stays Send
    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        client_ip = %client_ip,
        method = tracing::field::Empty,
        route = tracing::field::Empty,
        status_code = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    serve_request(stream, addr, config, request_id)
        .instrument(span)
        .await;
}

async fn serve_request(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: Arc<GatewayConfig>,
    request_id: String,
) {
    let span = tracing::Span::current();
    let request_start = Instant::now();

    let _connection_guard = ConnectionGuard::new();
    debug!("New connection from {}", addr);

    let mut request_bytes = Vec::new();
    let mut buffer = [0u8; 4096];

    for _ in 0..1000 {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                request_bytes.extend_from_slice(&buffer[..n]);
                if let Some(pos) = request_bytes
                    .windows(4)
                    .position(|window| window == b"\r\n\r\n")
                {
                    let header_end = pos + 4;
                    if let Ok(headers_str) = std::str::from_utf8(&request_bytes[..pos]) {
                        if let Some(content_length) = extract_content_length(headers_str) {
                            if request_bytes.len() >= header_end + content_length {
                                break;
                            }
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read from {}: {}", addr, e);
                return;
            }
        }
    }

    if request_bytes.is_empty() {
        return;
    }

    let parsed_request = match parse_http_request(&request_bytes) {
        Ok(req) => req,
        Err(err) => {
            span.record("status_code", 400);
            span.record("latency_ms", elapsed_ms(request_start));
            let response = map_error_to_response(&err);
            let _ = stream.write_all(&response).await;
            let _ = stream.flush().await;
            observe_request_latency("/unknown", request_start.elapsed().as_secs_f64());
            record_request("/unknown", "UNKNOWN", 400);
            return;
        }
    };

    let route_path = parsed_request.route_path().to_string();
    span.record("method", parsed_request.method());
    span.record("route", route_path.as_str());

    if parsed_request.method() == "OPTIONS" {
        let _ = stream.write_all(&build_preflight_response()).await;
        let _ = stream.flush().await;
        span.record("status_code", 200);
        span.record("latency_ms", elapsed_ms(request_start));
        observe_request_latency(&route_path, request_start.elapsed().as_secs_f64());
        record_request(&route_path, "OPTIONS", 200);
        return;
    }

    match (parsed_request.method(), route_path.as_str()) {
        ("GET", "/health") => {
            let payload = json!({
                "status": "ok",
                "message": "Azure OpenAI Gateway running",
                "backend": redact_endpoint(&config.endpoint),
            });
            if let Ok(body) = serde_json::to_vec(&payload) {
                let _ = write_success(&mut stream, "application/json", &body).await;
            }
            span.record("status_code", 200);
            span.record("latency_ms", elapsed_ms(request_start));
            info!("Health check completed");
            observe_request_latency("/health", request_start.elapsed().as_secs_f64());
            record_request("/health", "GET", 200);
        }
        ("GET", "/metrics") => {
            match gather_metrics() {
                Ok(metrics_output) => {
                    let _ = write_success(
                        &mut stream,
                        "text/plain; version=0.0.4",
                        metrics_output.as_bytes(),
                    )
                    .await;
                    observe_request_latency("/metrics", request_start.elapsed().as_secs_f64());
                    record_request("/metrics", "GET", 200);
                }
                Err(e) => {
                    warn!("Failed to gather metrics: {}", e);
                    let response = b"HTTP/1.1 500 INTERNAL SERVER ERROR\r\nContent-Length: 21\r\n\r\nFailed to get metrics";
                    let _ = stream.write_all(response).await;
                    let _ = stream.flush().await;
                    observe_request_latency("/metrics", request_start.elapsed().as_secs_f64());
                    record_request("/metrics", "GET", 500);
                }
            }
        }
        ("GET", "/v1/models") => {
            match serde_json::to_vec_pretty(&model_catalog()) {
                Ok(body) => {
                    let _ = write_success(&mut stream, "application/json", &body).await;
                }
                Err(e) => warn!("Failed to serialize model catalog: {}", e),
            }
            span.record("status_code", 200);
            span.record("latency_ms", elapsed_ms(request_start));
            info!("Models list retrieved");
            observe_request_latency("/v1/models", request_start.elapsed().as_secs_f64());
            record_request("/v1/models", "GET", 200);
        }
        ("POST", "/v1/chat/completions")
        | ("POST", "/v1/completions")
        | ("POST", "/v1/embeddings") => {
            let result = handle_route(&route_path, &parsed_request, &mut stream, &config).await;

            match result {
                Ok(()) => {
                    span.record("status_code", 200);
                    span.record("latency_ms", elapsed_ms(request_start));
                    info!(
                        backend = %redact_endpoint(&config.endpoint),
                        "Request completed successfully"
                    );
                    record_request(&route_path, "POST", 200);
                }
                Err(err) => {
                    let status = error_status(&err);
                    span.record("status_code", status);
                    span.record("latency_ms", elapsed_ms(request_start));

                    let client_key = resolve_credential(&config, parsed_request.headers())
                        .unwrap_or_default();
                    capture_error_with_context(&err, &request_id, &client_key, &route_path);
                    if matches!(
                        err,
                        GatewayError::Upstream(_) | GatewayError::Tls(_) | GatewayError::Url(_)
                    ) {
                        record_upstream_error(err.kind());
                        track_backend_failure(&redact_endpoint(&config.endpoint), &err);
                    }

                    let response = map_error_to_response(&err);
                    let _ = stream.write_all(&response).await;
                    let _ = stream.flush().await;
                    record_request(&route_path, "POST", status);
                }
            }
            observe_request_latency(&route_path, request_start.elapsed().as_secs_f64());
        }
        _ => {
            span.record("status_code", 404);
            span.record("latency_ms", elapsed_ms(request_start));
            warn!("Route not found");
            let response = b"HTTP/1.1 404 NOT FOUND\r\nContent-Length: 9\r\n\r\nNot Found";
            let _ = stream.write_all(response).await;
            let _ = stream.flush().await;
            observe_request_latency(&route_path, request_start.elapsed().as_secs_f64());
            record_request(&route_path, parsed_request.method(), 404);
        }
    }
}

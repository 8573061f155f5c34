use crate::aggregate::{aggregate, EMBEDDING_CONCURRENCY};
use crate::backend::{self, BackendResponse};
use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::{
    ChatCompletionRequest, CompletionRequest, EmbeddingInput, EmbeddingRequest, EmbeddingSubResult,
    MergedEmbeddings,
};
use crate::reframe::{RECORD_DELIMITER, RECORD_PACING};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use smol::net::TcpStream;
use std::sync::Arc;

use super::parser::{resolve_credential, ParsedRequest};
use super::response;

pub(super) async fn handle_route(
    route_path: &str,
    request: &ParsedRequest,
    stream: &mut TcpStream,
    config: &Arc<GatewayConfig>,
) -> GatewayResult<()> {
    match route_path {
        "/v1/chat/completions" => {
            forward_direct::<ChatCompletionRequest>(
                request,
                stream,
                config,
                "chat/completions",
                chat_model,
                chat_should_stream,
            )
            .await
        }
        "/v1/completions" => {
            forward_direct::<CompletionRequest>(
                request,
                stream,
                config,
                "completions",
                completion_model,
                completion_should_stream,
            )
            .await
        }
        "/v1/embeddings" => handle_embeddings(request, stream, config).await,
        _ => Err(GatewayError::BadRequest("Unsupported route".to_string())),
    }
}

/// Single pass-through call. The client's body is forwarded byte-for-byte;
/// the model→deployment mapping only shapes the backend URL. Streamed
/// responses go through the re-framer, buffered ones are relayed with the
/// backend's status and content type.
async fn forward_direct<T>(
    request: &ParsedRequest,
    stream: &mut TcpStream,
    config: &Arc<GatewayConfig>,
    resource: &str,
    model_of: fn(&T) -> Option<&str>,
    should_stream: fn(&T) -> bool,
) -> GatewayResult<()>
where
    T: DeserializeOwned,
{
    if !request.has_body() {
        return Err(GatewayError::BadRequest("Empty request body".to_string()));
    }

    let payload: T = serde_json::from_slice(request.body())?;
    let credential = resolve_credential(config, request.headers());
    let deployment = model_of(&payload)
        .map(|model| config.deployment_for(model))
        .unwrap_or_default();

    if should_stream(&payload) {
        let call = backend::open_backend_call(
            config,
            request.method(),
            request.body(),
            &deployment,
            resource,
            credential.as_deref(),
        )
        .await?;

        if !call.is_success() {
            // relay the backend error verbatim instead of opening a stream
            let backend_response = call.into_response().await?;
            return response::write_passthrough(
                stream,
                backend_response.status,
                backend_response.content_type(),
                &backend_response.body,
            )
            .await;
        }

        response::write_sse_preamble(stream).await?;
        call.reframe_into(stream, RECORD_DELIMITER, RECORD_PACING).await
    } else {
        let backend_response = invoke_backend(
            config,
            request.method(),
            request.body(),
            &deployment,
            resource,
            credential.as_deref(),
        )
        .await?;
        response::write_passthrough(
            stream,
            backend_response.status,
            backend_response.content_type(),
            &backend_response.body,
        )
        .await
    }
}

async fn handle_embeddings(
    request: &ParsedRequest,
    stream: &mut TcpStream,
    config: &Arc<GatewayConfig>,
) -> GatewayResult<()> {
    if !request.has_body() {
        return Err(GatewayError::BadRequest("Empty request body".to_string()));
    }

    let payload: EmbeddingRequest = serde_json::from_slice(request.body())?;
    let deployment = payload
        .model
        .as_deref()
        .map(|model| config.deployment_for(model))
        .unwrap_or_default();

    match payload.input {
        EmbeddingInput::Single(_) => {
            let credential = resolve_credential(config, request.headers());
            let backend_response = invoke_backend(
                config,
                request.method(),
                request.body(),
                &deployment,
                "embeddings",
                credential.as_deref(),
            )
            .await?;
            response::write_passthrough(
                stream,
                backend_response.status,
                backend_response.content_type(),
                &backend_response.body,
            )
            .await
        }
        EmbeddingInput::Batch(items) => {
            // resolved before the fan-out starts: no credential, no calls
            let credential = resolve_credential(config, request.headers())
                .ok_or_else(|| GatewayError::Auth("no API credential resolvable".to_string()))?;
            let template: Map<String, Value> = serde_json::from_slice(request.body())?;

            let mut merged = run_embeddings_fanout(
                Arc::clone(config),
                template,
                items,
                deployment,
                credential,
                request.method().to_string(),
            )
            .await?;
            merged.model = payload.model;

            let body = serde_json::to_vec_pretty(&merged)?;
            response::write_success(stream, "application/json", &body).await
        }
    }
}

/// Fan one embeddings batch out to the backend, one call per item, rebuilt
/// from the client's body with `input` swapped for the single item.
async fn run_embeddings_fanout(
    config: Arc<GatewayConfig>,
    template: Map<String, Value>,
    items: Vec<Value>,
    deployment: String,
    credential: String,
    verb: String,
) -> GatewayResult<MergedEmbeddings> {
    let template = Arc::new(template);
    let deployment = Arc::new(deployment);
    let credential = Arc::new(credential);
    let verb = Arc::new(verb);

    let call = move |_index: usize, item: Value| {
        let config = Arc::clone(&config);
        let template = Arc::clone(&template);
        let deployment = Arc::clone(&deployment);
        let credential = Arc::clone(&credential);
        let verb = Arc::clone(&verb);
        async move {
            let mut body = (*template).clone();
            body.insert("input".to_string(), item);
            let payload = serde_json::to_vec(&Value::Object(body))?;

            let backend_response = invoke_backend(
                &config,
                &verb,
                &payload,
                &deployment,
                "embeddings",
                Some(&credential),
            )
            .await?;
            if !backend_response.is_success() {
                return Err(GatewayError::Upstream(format!(
                    "backend returned status {} for embeddings sub-call",
                    backend_response.status
                )));
            }
            serde_json::from_slice::<EmbeddingSubResult>(&backend_response.body).map_err(|e| {
                GatewayError::Upstream(format!("invalid backend embeddings payload: {}", e))
            })
        }
    };

    aggregate(items, EMBEDDING_CONCURRENCY, call).await
}

fn chat_model(payload: &ChatCompletionRequest) -> Option<&str> {
    payload.model.as_deref()
}

fn chat_should_stream(payload: &ChatCompletionRequest) -> bool {
    payload.stream.unwrap_or(false)
}

fn completion_model(payload: &CompletionRequest) -> Option<&str> {
    payload.model.as_deref()
}

fn completion_should_stream(payload: &CompletionRequest) -> bool {
    payload.stream.unwrap_or(false)
}

async fn invoke_backend(
    config: &GatewayConfig,
    verb: &str,
    payload: &[u8],
    deployment: &str,
    resource: &str,
    credential: Option<&str>,
) -> GatewayResult<BackendResponse> {
    #[cfg(test)]
    {
        if let Some(lock) = BACKEND_OVERRIDE.get() {
            if let Some(ref handler) = *lock.read().unwrap() {
                // the real caller fails before any network I/O; mirror that
                let credential = credential
                    .filter(|token| !token.is_empty())
                    .ok_or_else(|| {
                        GatewayError::Auth("no API credential resolvable".to_string())
                    })?;
                return (handler)(verb, payload, deployment, resource, credential);
            }
        }
    }

    backend::call_backend(config, verb, payload, deployment, resource, credential).await
}

#[cfg(test)]
type MockBackendHandler = Box<
    dyn Fn(&str, &[u8], &str, &str, &str) -> GatewayResult<BackendResponse> + Send + Sync,
>;

#[cfg(test)]
use std::panic;
#[cfg(test)]
use std::sync::{OnceLock, RwLock};

#[cfg(test)]
static BACKEND_OVERRIDE: OnceLock<RwLock<Option<MockBackendHandler>>> = OnceLock::new();

#[cfg(test)]
pub(super) fn with_mock_backend<F, R>(mock: MockBackendHandler, f: F) -> R
where
    F: FnOnce() -> R,
{
    let cell = BACKEND_OVERRIDE.get_or_init(|| RwLock::new(None));
    {
        let mut guard = cell.write().unwrap();
        *guard = Some(mock);
    }
    let result = panic::catch_unwind(panic::AssertUnwindSafe(f));
    {
        let mut guard = cell.write().unwrap();
        *guard = None;
    }
    match result {
        Ok(value) => value,
        Err(err) => panic::resume_unwind(err),
    }
}

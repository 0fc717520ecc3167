//! Reverse proxy
//!
//! Accepts any method on any path. JSON bodies whose messages array ends
//! with a user turn are rewritten with retrieved context before being
//! forwarded; everything else passes through verbatim. The upstream
//! response is mirrored back through the stream interceptor, and completed
//! exchanges are persisted into the vector store afterwards.

use crate::app::AppContext;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::interceptor::{writer, StreamInterceptor};
use crate::packer;
use crate::request::system_prompt;
use crate::retrieval;
use crate::shutdown::ShutdownNotifier;
use crate::tokenize::sha512_hex;
use crate::vector_db::models::{Attachment, FileMeta, ROLE_ASSISTANT, ROLE_FILE, ROLE_USER};
use crate::vector_db::VectorDb;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared state for the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub app: Arc<AppContext>,
    pub db: Arc<VectorDb>,
    pub embedder: Arc<EmbeddingClient>,
    pub http: reqwest::Client,
}

/// Context carried from request processing to response persistence
struct ProcessedRequest {
    body: String,
    rewritten: bool,
    clean_user_content: Option<String>,
    attachments: Vec<Attachment>,
    prompt_vector: Option<Vec<f32>>,
    query_hash: Option<String>,
}

impl ProcessedRequest {
    fn passthrough(body: String) -> Self {
        Self {
            body,
            rewritten: false,
            clean_user_content: None,
            attachments: Vec::new(),
            prompt_vector: None,
            query_hash: None,
        }
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Run the inbound server until shutdown is signalled: new connections are
/// refused immediately and in-flight requests get a bounded grace period.
pub async fn serve(state: ProxyState, notifier: ShutdownNotifier) -> Result<()> {
    let listen = state.app.config.server.listen.clone();
    let grace = Duration::from_secs(state.app.config.server.shutdown_grace_secs);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "inbound is listening");

    let shutdown = notifier.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.wait().await;
                info!("shutting down inbound");
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| crate::error::ProxyError::Internal(e.to_string()))??;
            info!("inbound exited");
            return Ok(());
        }
        _ = notifier.wait() => {}
    }

    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => {
            result.map_err(|e| crate::error::ProxyError::Internal(e.to_string()))??;
        }
        Err(_) => {
            warn!("grace period elapsed, aborting in-flight requests");
            server.abort();
        }
    }
    info!("inbound exited");
    Ok(())
}

async fn handle(
    State(state): State<ProxyState>,
    request: axum::http::Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "error reading request body");
            Bytes::new()
        }
    };

    let inbound = String::from_utf8_lossy(&body_bytes).into_owned();
    let processed = process_inbound(&state, inbound).await;

    if state.app.config.logging.verbose {
        info!(
            method = %parts.method,
            uri = %parts.uri,
            body = %crate::logging::truncate_json_strings(&processed.body),
            "received request"
        );
    } else {
        info!(method = %parts.method, uri = %parts.uri, "received request");
    }

    let upstream_response = match forward(&state, &parts.method, &parts.uri, &parts.headers, &processed).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "error forwarding request upstream");
            return (StatusCode::BAD_GATEWAY, "upstream request failed").into_response();
        }
    };

    let status = upstream_response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        response_headers.insert(name.clone(), value.clone());
    }

    let capacity = state.app.config.stream.channel_capacity;
    let (packet_tx, packet_rx) = mpsc::channel(capacity);
    let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(capacity);
    let writer_done = writer::spawn(packet_rx, body_tx);

    let interceptor = StreamInterceptor::new(state.app.clone(), packet_tx);
    let persist_state = state.clone();
    tokio::spawn(async move {
        let mut stream = upstream_response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => interceptor.write(&bytes).await,
                Err(e) => {
                    warn!(error = %e, "upstream stream error");
                    break;
                }
            }
        }
        let outcome = interceptor.finish().await;
        drop(interceptor); // closes the packet channel; the writer drains and exits
        let _ = writer_done.await;

        if outcome.complete && !outcome.assistant_text.is_empty() {
            if let (Some(clean_user), Some(vector), Some(hash)) = (
                processed.clean_user_content,
                processed.prompt_vector,
                processed.query_hash,
            ) {
                process_outbound(
                    &persist_state,
                    &outcome.assistant_text,
                    &clean_user,
                    &processed.attachments,
                    &vector,
                    &hash,
                )
                .await;
            }
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response_headers);
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Forward the (possibly rewritten) request to the upstream server.
async fn forward(
    state: &ProxyState,
    method: &axum::http::Method,
    uri: &Uri,
    headers: &HeaderMap,
    processed: &ProcessedRequest,
) -> std::result::Result<reqwest::Response, reqwest::Error> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.app.config.upstream.base_url, path_and_query);

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);
    let mut request = state.http.request(method, &url);

    for (name, value) in headers {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        if processed.rewritten && name == header::CONTENT_TYPE {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request = request.header(name.as_str(), v);
        }
    }
    if processed.rewritten {
        request = request.header(header::CONTENT_TYPE, "application/json");
    }
    if let Some(key) = &state.app.config.upstream.api_key {
        use secrecy::ExposeSecret;
        request = request.bearer_auth(key.expose_secret());
    }

    request.body(processed.body.clone()).send().await
}

/// Parse and rewrite the inbound body. Any failure falls back to
/// forwarding the original body unmodified.
async fn process_inbound(state: &ProxyState, data: String) -> ProcessedRequest {
    let Ok(mut req) = serde_json::from_str::<Map<String, Value>>(&data) else {
        debug!("skipping processing: body is not a JSON object");
        return ProcessedRequest::passthrough(data);
    };

    let (clean_user_content, attachments) =
        match crate::request::process_messages(&state.app.config, &state.app.rules, &req) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(reason = %e, "skipping processing");
                return ProcessedRequest::passthrough(data);
            }
        };

    let (prompt_vector, query_hash) =
        match feed_prompt(state, &clean_user_content, &mut req).await {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, "error augmenting prompt, forwarding unmodified");
                return ProcessedRequest::passthrough(data);
            }
        };

    req.insert(
        "temperature".to_string(),
        serde_json::json!(state.app.config.upstream.temperature),
    );

    let modified = match serde_json::to_string(&req) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "error serializing modified request");
            return ProcessedRequest::passthrough(data);
        }
    };

    info!(
        original_bytes = data.len(),
        modified_bytes = modified.len(),
        "request rewritten"
    );

    ProcessedRequest {
        body: modified,
        rewritten: true,
        clean_user_content: Some(clean_user_content),
        attachments,
        prompt_vector: Some(prompt_vector),
        query_hash: Some(query_hash),
    }
}

/// Budget the window, patch the system message, retrieve, pack.
async fn feed_prompt(
    state: &ProxyState,
    clean_user_content: &str,
    req: &mut Map<String, Value>,
) -> Result<(Vec<f32>, String)> {
    let app = &state.app;
    let sizes = packer::calc_sizes(app, req)?;
    let mut feed_size = sizes.feed_size;
    let mut history_size = sizes.history_size;

    let mut system_msg = sizes.system_msg;
    if let Some(system) = &mut system_msg {
        match system.get("content").and_then(|c| c.as_str()) {
            Some(content) => {
                let patched = system_prompt::patch(&app.config.system_message, content);
                system_prompt::dump(&app.config.system_message, content, &patched);
                debug!(len = patched.len(), "patched system message");
                system["content"] = Value::String(patched);
            }
            None => system_msg = None, // discard a system message without text content
        }
    }

    let prompt_vector = state.embedder.embed(clean_user_content).await?;
    debug!(len = prompt_vector.len(), "prompt vector generated");

    let query_hash = sha512_hex(clean_user_content);

    let relevant = retrieval::search_with_rerank(
        app,
        &state.db,
        &prompt_vector,
        clean_user_content,
        &query_hash,
    )
    .await?;

    let feeds = packer::prepare_feeds(&mut feed_size, &mut history_size, &relevant, req);
    let history = packer::prepare_history(app, &mut history_size, system_msg.is_some(), req)?;
    packer::assemble(req, system_msg, feeds, history, sizes.user_prompt);

    info!(
        messages = req.get("messages").and_then(|m| m.as_array()).map(|m| m.len()).unwrap_or(0),
        "final messages assembled"
    );
    Ok((prompt_vector, query_hash))
}

/// Token size of an attachment formatted the way it is fed to the model,
/// including the stored-message JSON wrapper.
fn calc_file_size(app: &AppContext, attachment: &Attachment) -> i64 {
    let payload = crate::vector_db::models::Payload {
        body: attachment.body.clone(),
        file_meta: FileMeta {
            id: attachment.id.clone(),
            path: attachment.path.clone(),
        },
        ..Default::default()
    };
    let content = packer::format_file_feed(&payload);
    app.tokens.count_with_reserve(&format!(
        "{}{}{}",
        packer::ATTACHMENT_LEFT,
        content,
        packer::ATTACHMENT_RIGHT
    ))
}

/// Persist the completed exchange: the user turn first, then the assistant
/// turn, then the attachments.
async fn process_outbound(
    state: &ProxyState,
    assistant_text: &str,
    clean_user_content: &str,
    attachments: &[Attachment],
    prompt_vector: &[f32],
    query_hash: &str,
) {
    let app = &state.app;
    let packet_id = Uuid::new_v4().to_string();
    debug!(packet_id = %packet_id, "persisting exchange");

    let response_vector = match state.embedder.embed(assistant_text).await {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "error embedding assistant content");
            return;
        }
    };

    let prompt_size = app.tokens.count_with_reserve(&format!(
        "{}{}{}",
        packer::USER_MESSAGE_LEFT,
        clean_user_content,
        packer::USER_MESSAGE_RIGHT
    ));
    let assistant_size = app.tokens.count_with_reserve(&format!(
        "{}{}{}",
        packer::ASSISTANT_MESSAGE_LEFT,
        assistant_text,
        packer::ASSISTANT_MESSAGE_RIGHT
    ));
    let assistant_hash = sha512_hex(assistant_text);

    if let Err(e) = upsert_document(
        state,
        clean_user_content,
        prompt_vector,
        ROLE_USER,
        prompt_size,
        query_hash,
        &packet_id,
        None,
        &Uuid::new_v4().to_string(),
    )
    .await
    {
        error!(error = %e, "error storing user message");
        return;
    }

    if let Err(e) = upsert_document(
        state,
        assistant_text,
        &response_vector,
        ROLE_ASSISTANT,
        assistant_size,
        &assistant_hash,
        &packet_id,
        None,
        &Uuid::new_v4().to_string(),
    )
    .await
    {
        error!(error = %e, "error storing assistant message");
        return;
    }

    if let Err(e) = store_attachments(state, attachments, &packet_id).await {
        error!(error = %e, "error storing attachments");
    }
}

/// Add a document to the IDF statistics and upsert its point. The IDF
/// update precedes the upsert so a reader never scores a stored point
/// against statistics that do not include it.
#[allow(clippy::too_many_arguments)]
async fn upsert_document(
    state: &ProxyState,
    body: &str,
    vector: &[f32],
    role: &str,
    token_count: i64,
    hash: &str,
    packet_id: &str,
    file_meta: Option<&FileMeta>,
    point_id: &str,
) -> Result<()> {
    state
        .app
        .idf
        .add_document(&state.app.tokens, body, token_count, hash);
    state
        .db
        .upsert_point(
            body, vector, role, token_count, hash, packet_id, file_meta, point_id,
        )
        .await
}

/// Reconcile attachments with the store: replacements first, inserts after.
async fn store_attachments(
    state: &ProxyState,
    attachments: &[Attachment],
    packet_id: &str,
) -> Result<()> {
    let (to_insert, to_replace) = state.db.plan_attachment_sync(attachments).await?;

    for planned in to_replace.iter().chain(to_insert.iter()) {
        let attachment = &planned.attachment;

        let vector = state.embedder.embed(&attachment.body).await?;
        let token_count = calc_file_size(&state.app, attachment);

        let point_id = match &planned.old_point_id {
            Some(old_point_id) => {
                let old_body = state.db.get_point_body(old_point_id).await?;
                state.app.idf.remove_document(
                    &state.app.tokens,
                    &old_body,
                    planned.old_token_count,
                    &planned.old_hash,
                );
                info!(
                    id = %attachment.id,
                    point_id = %old_point_id,
                    "replacing attachment in place"
                );
                old_point_id.clone()
            }
            None => {
                let fresh = Uuid::new_v4().to_string();
                info!(id = %attachment.id, point_id = %fresh, "inserting new attachment");
                fresh
            }
        };

        upsert_document(
            state,
            &attachment.body,
            &vector,
            ROLE_FILE,
            token_count,
            &attachment.hash,
            packet_id,
            Some(&FileMeta {
                id: attachment.id.clone(),
                path: attachment.path.clone(),
            }),
            &point_id,
        )
        .await?;
    }

    Ok(())
}

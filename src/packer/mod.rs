//! Context-window packing
//!
//! Budgets the downstream model's token window between the request
//! metadata, the system message, the user prompt, retrieved feeds and
//! conversation history, then rebuilds the messages array. Failure to fit
//! the mandatory parts is an error; the caller then forwards the request
//! unmodified.

use crate::app::AppContext;
use crate::error::{PackError, Result};
use crate::tokenize::TokenService;
use crate::vector_db::models::{Payload, ROLE_FILE};
use serde_json::{Map, Value};
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

/// JSON wrapper around a stored user turn, used when sizing it
pub const USER_MESSAGE_LEFT: &str = "{\"content\":\"";
pub const USER_MESSAGE_RIGHT: &str = "\",\"role\":\"rag-user\"},";
/// JSON wrapper around a stored assistant turn
pub const ASSISTANT_MESSAGE_LEFT: &str = "{\"content\":\"";
pub const ASSISTANT_MESSAGE_RIGHT: &str = "\",\"role\":\"rag-assistant\"},";
/// JSON wrapper around a stored attachment
pub const ATTACHMENT_LEFT: &str = "{\"content\":\"";
pub const ATTACHMENT_RIGHT: &str = "\",\"role\":\"rag-file\"},";

/// Tag wrapping file feeds injected into the message list
pub const FILE_TAG: &str = "attachment";

/// Token cost of the messages-array brackets and trailing comma,
/// precomputed once at startup.
pub fn messages_wrapper_size(tokens: &TokenService) -> i64 {
    tokens.count("\"messages\":[") + tokens.count("],")
}

/// Sizing result for one request
#[derive(Debug)]
pub struct Sizes {
    pub feed_size: i64,
    pub history_size: i64,
    pub system_msg: Option<Value>,
    pub user_prompt: Value,
}

fn messages<'a>(req: &'a Map<String, Value>) -> Result<&'a Vec<Value>> {
    req.get("messages")
        .and_then(|m| m.as_array())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| PackError::InvalidMessage.into())
}

/// Token size of the request JSON excluding the messages array.
fn calc_meta_size(app: &AppContext, req: &Map<String, Value>) -> Result<i64> {
    let meta: Map<String, Value> = req
        .iter()
        .filter(|(k, _)| k.as_str() != "messages")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let meta_str = serde_json::to_string(&Value::Object(meta))?;
    Ok(app.tokens.count_with_reserve(&meta_str))
}

/// Size of the system message, if the first message is one. The trailing
/// comma is included when other messages follow.
fn calc_system_msg_size(
    app: &AppContext,
    req: &Map<String, Value>,
) -> Result<(i64, Option<Value>)> {
    let msgs = messages(req)?;
    let first = &msgs[0];
    if first.get("role").and_then(|r| r.as_str()) != Some("system") {
        return Ok((0, None));
    }
    let mut serialized = serde_json::to_string(first)?;
    if msgs.len() > 1 {
        serialized.push(',');
    }
    Ok((app.tokens.count_with_reserve(&serialized), Some(first.clone())))
}

/// Size of the trailing user message; the last message must be user-role.
fn calc_user_prompt_size(app: &AppContext, req: &Map<String, Value>) -> Result<(i64, Value)> {
    let msgs = messages(req)?;
    let last = msgs.last().ok_or(PackError::InvalidMessage)?;
    if last.get("role").and_then(|r| r.as_str()) != Some("user") {
        return Err(PackError::NoUserPrompt.into());
    }
    let serialized = serde_json::to_string(last)?;
    Ok((app.tokens.count_with_reserve(&serialized), last.clone()))
}

/// Split the window between feeds and history after subtracting the
/// mandatory parts.
pub fn calc_sizes(app: &AppContext, req: &Map<String, Value>) -> Result<Sizes> {
    let mut window = app.config.window.model_window_size;

    window -= calc_meta_size(app, req)?;

    let (system_size, system_msg) = calc_system_msg_size(app, req)?;
    window -= system_size;

    let (user_size, user_prompt) = calc_user_prompt_size(app, req)?;
    window -= user_size;

    window -= app.messages_wrapper_size;
    if window < 0 {
        return Err(PackError::WindowExhausted.into());
    }

    let feed_size = window * app.config.window.feed_percent / 100;
    let history_size = window - feed_size;

    debug!(
        window = app.config.window.model_window_size,
        system = system_size,
        user = user_size,
        feed = feed_size,
        history = history_size,
        "calculated window split"
    );

    Ok(Sizes {
        feed_size,
        history_size,
        system_msg,
        user_prompt,
    })
}

/// NFC-normalize, lowercase, and keep only letters, digits and punctuation.
pub fn normalize_text(s: &str) -> String {
    const PUNCT: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_{|}~";
    s.nfc()
        .flat_map(char::to_lowercase)
        .filter(|r| r.is_alphanumeric() || PUNCT.contains(*r))
        .collect()
}

/// Whether a normalized form of `content` already appears as any message's
/// content in the request.
pub fn message_exists(req: &Map<String, Value>, content: &str) -> bool {
    let norm_content = normalize_text(content);
    let Some(msgs) = req.get("messages").and_then(|m| m.as_array()) else {
        return false;
    };
    for msg in msgs {
        if let Some(c) = msg.get("content").and_then(|c| c.as_str()) {
            if normalize_text(c) == norm_content {
                return true;
            }
        }
        if let Some(s) = msg.as_str() {
            if normalize_text(s) == norm_content {
                return true;
            }
        }
    }
    false
}

/// Wrap a file payload in its tag markers with the path embedded.
pub fn format_file_feed(payload: &Payload) -> String {
    format!(
        "<{tag} id=\"{id}\" isSummarized=\"true\">\n// filepath: {path}\n{body}\n</{tag}>\n",
        tag = FILE_TAG,
        id = payload.file_meta.id,
        path = payload.file_meta.path,
        body = payload.body,
    )
}

/// Select ranked payloads into the feed budget. Oversized and duplicate
/// payloads are skipped; leftover budget rolls over to history.
pub fn prepare_feeds(
    feed_size: &mut i64,
    history_size: &mut i64,
    ranked: &[Payload],
    req: &Map<String, Value>,
) -> Vec<Value> {
    let mut feeds = Vec::new();

    for payload in ranked {
        if *feed_size < payload.token_count {
            continue; // try to fit a later, smaller payload
        }

        let preview: String = payload.body.chars().take(64).collect();
        if message_exists(req, &payload.body) {
            debug!(preview = %preview, "skipping feed already present in request");
            continue;
        }
        debug!(preview = %preview, "adding feed message to request");

        let content = if payload.role == ROLE_FILE {
            format_file_feed(payload)
        } else {
            payload.body.clone()
        };

        feeds.push(serde_json::json!({
            "role": payload.role,
            "content": content,
        }));
        *feed_size -= payload.token_count;
    }

    *history_size += *feed_size;
    info!(
        feeds = feeds.len(),
        history_budget = *history_size,
        "feeds prepared"
    );
    feeds
}

/// Walk the original messages backwards from the second-to-last, stopping
/// before the system message, and keep each message that still fits.
/// Returned newest-first; assembly reverses it.
pub fn prepare_history(
    app: &AppContext,
    history_size: &mut i64,
    has_system: bool,
    req: &Map<String, Value>,
) -> Result<Vec<Value>> {
    let msgs = messages(req)?;
    let end_idx: i64 = if has_system { 1 } else { 0 };
    let mut start_idx = msgs.len() as i64 - 2;
    if start_idx < end_idx - 1 {
        start_idx = end_idx - 1;
    }

    let mut history = Vec::new();
    let mut i = start_idx;
    while i >= end_idx {
        let msg = &msgs[i as usize];
        if !msg.is_object() {
            return Err(PackError::InvalidMessage.into());
        }
        let serialized = serde_json::to_string(msg)?;
        let size = app.tokens.count_with_reserve(&serialized);
        if *history_size < size {
            break;
        }
        history.push(msg.clone());
        *history_size -= size;
        i -= 1;
    }

    debug!(kept = history.len(), remaining = *history_size, "history prepared");
    Ok(history)
}

/// Rebuild the messages array: system first, feeds lowest-rank-first so the
/// best-ranked one lands closest to the user prompt, history oldest-first,
/// user prompt last.
pub fn assemble(
    req: &mut Map<String, Value>,
    system_msg: Option<Value>,
    feeds: Vec<Value>,
    history: Vec<Value>,
    user_prompt: Value,
) {
    let mut result = Vec::with_capacity(feeds.len() + history.len() + 2);
    if let Some(system) = system_msg {
        result.push(system);
    }
    result.extend(feeds.into_iter().rev());
    result.extend(history.into_iter().rev());
    result.push(user_prompt);
    req.insert("messages".to_string(), Value::Array(result));
}

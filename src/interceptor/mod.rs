//! Stream interceptor
//!
//! Mediates the byte stream from the upstream model to the client. Frames
//! are buffered only as far as the configured trigger lookahead requires;
//! when a trigger substring shows up in the accumulated text, frames are
//! withheld until the stream finishes, the substitution rules run over the
//! reassembled text, and a fresh frame sequence is synthesized from the
//! cached template packets. With no trigger in sight frames pass through
//! byte-identical, in order.

use crate::app::AppContext;
use crate::config::ReplaceRecord;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod packet;
pub mod writer;

pub use packet::{PacketKind, ResponsePacket};

/// What the handler needs after the stream ends
#[derive(Debug, Clone)]
pub struct InterceptOutcome {
    /// A terminator frame was seen; only complete exchanges are persisted
    pub complete: bool,

    /// The reassembled assistant text as written downstream
    pub assistant_text: String,
}

#[derive(Default)]
struct CollectorState {
    /// Frames accepted but not yet forwarded
    incoming: Vec<ResponsePacket>,
    /// Concatenated text deltas of the current batch
    current_text: String,
    /// Total reassembled assistant text for the session
    global_text: String,
    /// Trigger matched; withhold frames until finalization
    collecting: bool,
    /// A FinishStream frame has been seen
    complete: bool,
    template_stream: Option<ResponsePacket>,
    template_finish: Option<ResponsePacket>,
}

pub struct StreamInterceptor {
    app: Arc<AppContext>,
    state: Mutex<CollectorState>,
    tx: mpsc::Sender<ResponsePacket>,
}

/// Run every record's rules over the text in deterministic order; within a
/// record, match/replace is global. Returns the result and whether any rule
/// fired.
pub fn apply_rules(text: &str, records: &[ReplaceRecord]) -> (String, bool) {
    let mut out = text.to_string();
    for record in records {
        for rule in &record.rules {
            out = rule.find.replace_all(&out, rule.replace.as_str()).into_owned();
        }
    }
    let changed = out != text;
    (out, changed)
}

impl StreamInterceptor {
    /// Create an interceptor feeding the given packet channel; pair it with
    /// a `writer::spawn` on the receiving side.
    pub fn new(app: Arc<AppContext>, tx: mpsc::Sender<ResponsePacket>) -> Self {
        Self {
            app,
            state: Mutex::new(CollectorState::default()),
            tx,
        }
    }

    /// Accept one upstream chunk. Blocks when the outgoing channel is full,
    /// which throttles the upstream read.
    pub async fn write(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let packet = packet::classify(
            &self.app.rules,
            &self.app.config.messages.body_paths,
            &text,
        );
        let to_emit = {
            let mut state = self.state.lock();
            self.process(&mut state, packet)
        };
        self.emit(to_emit).await;
    }

    /// Upstream ended. Flush whatever is retained and report the outcome.
    pub async fn finish(&self) -> InterceptOutcome {
        let (to_emit, outcome) = {
            let mut state = self.state.lock();
            let to_emit = if state.collecting || self.trigger_present(&state.current_text) {
                self.finalize_substitution(&mut state)
            } else {
                self.flush(&mut state)
            };
            (
                to_emit,
                InterceptOutcome {
                    complete: state.complete,
                    assistant_text: state.global_text.clone(),
                },
            )
        };
        self.emit(to_emit).await;
        outcome
    }

    async fn emit(&self, packets: Vec<ResponsePacket>) {
        for p in packets {
            if self.tx.send(p).await.is_err() {
                // writer gone, downstream disconnected
                return;
            }
        }
    }

    fn process(
        &self,
        state: &mut CollectorState,
        packet: ResponsePacket,
    ) -> Vec<ResponsePacket> {
        match packet.kind {
            PacketKind::Other => self.forward_in_order(state, packet),
            PacketKind::Direct => {
                let packet = self.rewrite_direct(packet);
                self.forward_in_order(state, packet)
            }
            PacketKind::Stream => self.process_stream(state, packet),
            PacketKind::FinishStream => self.process_finish(state, packet),
        }
    }

    /// Pass a packet through without breaking frame order: while anything
    /// is retained it queues behind the retained frames.
    fn forward_in_order(
        &self,
        state: &mut CollectorState,
        packet: ResponsePacket,
    ) -> Vec<ResponsePacket> {
        if state.collecting || !state.incoming.is_empty() {
            state.incoming.push(packet);
            Vec::new()
        } else {
            vec![packet]
        }
    }

    fn process_stream(
        &self,
        state: &mut CollectorState,
        packet: ResponsePacket,
    ) -> Vec<ResponsePacket> {
        if state.template_stream.is_none() {
            state.template_stream = Some(packet.clone());
        }
        if let Some(delta) = packet::packet_text(&packet) {
            state.current_text.push_str(&delta);
        }
        state.incoming.push(packet);

        if !state.collecting
            && state.current_text.chars().count() >= self.app.rules.max_trigger_len
        {
            if self.trigger_present(&state.current_text) {
                debug!("trigger matched, withholding frames until finalization");
                state.collecting = true;
            } else {
                return self.flush(state);
            }
        }
        Vec::new()
    }

    fn process_finish(
        &self,
        state: &mut CollectorState,
        packet: ResponsePacket,
    ) -> Vec<ResponsePacket> {
        state.template_finish = Some(packet.clone());
        state.complete = true;
        // a trigger may sit in a batch that never reached the lookahead
        // threshold; it still has to fire before the stream ends
        if state.collecting || self.trigger_present(&state.current_text) {
            self.finalize_substitution(state)
        } else {
            state.incoming.push(packet);
            self.flush(state)
        }
    }

    fn trigger_present(&self, text: &str) -> bool {
        self.app
            .rules
            .replace_records
            .iter()
            .any(|r| text.contains(&r.trigger))
    }

    /// Forward every retained frame in order and absorb the current batch
    /// into the session text.
    fn flush(&self, state: &mut CollectorState) -> Vec<ResponsePacket> {
        let out = std::mem::take(&mut state.incoming);
        state.global_text.push_str(&state.current_text);
        state.current_text.clear();
        out
    }

    /// The trigger fired earlier: run the rules over the whole batch. If
    /// nothing changed the retained frames go out untouched; otherwise a
    /// fresh frame per token is synthesized from the cached templates.
    fn finalize_substitution(&self, state: &mut CollectorState) -> Vec<ResponsePacket> {
        let (replaced, changed) = apply_rules(&state.current_text, &self.app.rules.replace_records);

        state.collecting = false;
        if !changed {
            if let Some(finish) = state.template_finish.clone() {
                state.incoming.push(finish);
            }
            return self.flush(state);
        }

        debug!(
            before = state.current_text.chars().count(),
            after = replaced.chars().count(),
            "substitution fired, re-synthesizing frames"
        );

        let mut out = Vec::new();
        if let Some(template) = &state.template_stream {
            let base = Utc::now();
            let tokens = self.app.tokens.token_strings(&replaced);
            for (i, token) in tokens.iter().enumerate() {
                match resynthesize(template, token, base, i as i64) {
                    Some(packet) => out.push(packet),
                    None => warn!("stream template has no usable message path, dropping token"),
                }
            }
        } else {
            warn!("no stream template cached, substituted text cannot be re-emitted");
        }
        if let Some(finish) = state.template_finish.clone() {
            out.push(finish);
        }

        state.incoming.clear();
        state.global_text.push_str(&replaced);
        state.current_text.clear();
        out
    }

    /// Rewrite a Direct packet in place: substitution at the message path
    /// and, when text changed, a usage recount.
    fn rewrite_direct(&self, packet: ResponsePacket) -> ResponsePacket {
        let Some(path) = packet.message_path.clone() else {
            return packet;
        };
        let Ok(mut value) = serde_json::from_str::<Value>(&packet.raw) else {
            return packet;
        };
        let Some(Value::String(text)) = packet::json_path_get(&value, &path).cloned() else {
            return packet;
        };

        let (replaced, changed) = apply_rules(&text, &self.app.rules.replace_records);
        if !changed {
            return packet;
        }

        packet::json_path_set(&mut value, &path, Value::String(replaced.clone()));

        if let Some(usage) = value.get_mut("usage").and_then(|u| u.as_object_mut()) {
            let completion = self.app.tokens.count(&replaced);
            let prompt = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            if usage.contains_key("completion_tokens") {
                usage.insert("completion_tokens".to_string(), Value::from(completion));
            }
            if usage.contains_key("total_tokens") {
                usage.insert("total_tokens".to_string(), Value::from(prompt + completion));
            }
        }

        let mut packet = packet;
        if let Ok(raw) = serde_json::to_string(&value) {
            let trailer = line_trailer(&packet).to_string();
            packet.raw = raw + &trailer;
        }
        packet
    }
}

/// Trailing line terminator of a non-SSE frame; re-serialization must keep
/// it or newline-delimited framing breaks downstream.
fn line_trailer(packet: &ResponsePacket) -> &str {
    if packet.is_sse {
        return "";
    }
    let trimmed = packet.raw.trim_end_matches(['\r', '\n']);
    &packet.raw[trimmed.len()..]
}

/// Clone the template frame with its text path set to one token's string
/// form and any creation timestamp refreshed monotonically.
fn resynthesize(
    template: &ResponsePacket,
    token: &str,
    base: chrono::DateTime<Utc>,
    counter: i64,
) -> Option<ResponsePacket> {
    let path = template.message_path.as_deref()?;
    let mut value: Value = serde_json::from_str(&template.raw).ok()?;
    if !packet::json_path_set(&mut value, path, Value::String(token.to_string())) {
        return None;
    }

    let stamp = base + chrono::Duration::milliseconds(counter);
    if let Some(obj) = value.as_object_mut() {
        if obj.contains_key("created_at") {
            obj.insert(
                "created_at".to_string(),
                Value::String(stamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            );
        }
        if obj.contains_key("created") {
            obj.insert("created".to_string(), Value::from(stamp.timestamp()));
        }
    }

    let raw = serde_json::to_string(&value).ok()? + line_trailer(template);
    Some(ResponsePacket {
        kind: PacketKind::Stream,
        is_sse: template.is_sse,
        prefix: template.prefix.clone(),
        message_path: template.message_path.clone(),
        raw,
    })
}

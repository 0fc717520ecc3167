//! Packet classification and JSON body-path access
//!
//! Each inbound chunk is classified into exactly one packet kind using the
//! three compiled matchers from the configuration. A chunk starting with
//! `<prefix>:` where the prefix matches the SSE matcher is treated as an
//! SSE frame; the remainder is its payload and the original framing is
//! re-applied on the way out.

use crate::config::CompiledRules;
use serde_json::Value;

/// Packet taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Unrecognized; forwarded untouched
    Other,
    /// A full non-streaming response body
    Direct,
    /// One SSE-style frame carrying an incremental text token
    Stream,
    /// The terminator frame
    FinishStream,
}

/// One logical frame of the upstream response
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    pub kind: PacketKind,
    pub is_sse: bool,
    pub prefix: String,
    /// First configured JSON path that resolves to a string in this packet
    pub message_path: Option<String>,
    /// Payload without SSE framing; the whole chunk for non-SSE packets
    pub raw: String,
}

/// Read a value at a dot-separated path; numeric segments index arrays.
pub fn json_path_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dot-separated path. Returns false when the path does
/// not exist; nothing is created.
pub fn json_path_set(value: &mut Value, path: &str, new_value: Value) -> bool {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match current {
            Value::Object(map) => {
                if !map.contains_key(*segment) {
                    return false;
                }
                if last {
                    map.insert(segment.to_string(), new_value);
                    return true;
                }
                current = map.get_mut(*segment).unwrap();
            }
            Value::Array(items) => {
                let Ok(idx) = segment.parse::<usize>() else {
                    return false;
                };
                if idx >= items.len() {
                    return false;
                }
                if last {
                    items[idx] = new_value;
                    return true;
                }
                current = &mut items[idx];
            }
            _ => return false,
        }
    }
    false
}

/// First configured path that resolves to a string in this JSON value.
pub fn find_message_path(value: &Value, paths: &[String]) -> Option<String> {
    paths
        .iter()
        .find(|p| matches!(json_path_get(value, p), Some(Value::String(_))))
        .cloned()
}

/// Classify one inbound chunk.
pub fn classify(rules: &CompiledRules, body_paths: &[String], chunk: &str) -> ResponsePacket {
    let mut is_sse = false;
    let mut prefix = String::new();
    let mut payload = chunk;

    if let Some(colon) = chunk.find(':') {
        let candidate = &chunk[..colon];
        if rules.sse_prefix.is_match(candidate) {
            is_sse = true;
            prefix = candidate.to_string();
            payload = chunk[colon + 1..]
                .strip_prefix(' ')
                .unwrap_or(&chunk[colon + 1..]);
            payload = payload.trim_end_matches(['\r', '\n']);
        }
    }

    let kind = if rules.stream_stop.is_match(payload) {
        PacketKind::FinishStream
    } else if rules.stream_flag.is_match(payload) {
        PacketKind::Stream
    } else if rules.direct_flag.is_match(payload) {
        PacketKind::Direct
    } else {
        PacketKind::Other
    };

    let raw = if is_sse {
        payload.to_string()
    } else {
        chunk.to_string()
    };

    let message_path = match kind {
        PacketKind::Stream | PacketKind::Direct => serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|v| find_message_path(&v, body_paths)),
        _ => None,
    };

    ResponsePacket {
        kind,
        is_sse,
        prefix,
        message_path,
        raw,
    }
}

/// The text carried at this packet's message path, if any.
pub fn packet_text(packet: &ResponsePacket) -> Option<String> {
    let path = packet.message_path.as_deref()?;
    let value: Value = serde_json::from_str(&packet.raw).ok()?;
    match json_path_get(&value, path) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Serialize a packet back into wire bytes, restoring the SSE framing iff
/// the original had it.
pub fn render(packet: &ResponsePacket) -> Vec<u8> {
    if packet.is_sse {
        format!("{}: {}\n\n", packet.prefix, packet.raw).into_bytes()
    } else {
        packet.raw.clone().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validation::compile_rules;
    use crate::config::Config;

    fn rules() -> (CompiledRules, Vec<String>) {
        let toml = r#"
            [server]
            listen = "127.0.0.1:8080"
            [upstream]
            base_url = "http://localhost:11434"
            main_model = "llama3"
            temperature = 0.6
            [embedding]
            endpoint = "/api/embeddings"
            model = "nomic-embed-text"
            [vector_db]
            host = "localhost"
            port = 6334
            collection = "ragproxy"
            metric = "Cosine"
            vector_size = 8
            [tokenizer]
            [idf]
            file = "/tmp/idf.json"
            [retrieval]
            sources = ["rag-user"]
            [rerank]
            min_score = 0.2
            weights = [0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1]
            [rerank.role_weights]
            "rag-user" = 0.6
            "rag-assistant" = 0.8
            "rag-file" = 1.0
            [window]
            model_window_size = 8192
            feed_percent = 40
            [files]
            [messages]
            user_tags = ["userRequest"]
            ask_attachment_tags = ["attachment"]
            agent_attachment_tags = ["editorContext"]
            body_paths = ["choices.0.delta.content", "message.content", "response"]
            [stream]
            sse_prefix_regex = "^data$"
            stream_flag_regex = "\"delta\""
            stream_stop_regex = "\\[DONE\\]"
            direct_flag_regex = "\"message\""
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let paths = config.messages.body_paths.clone();
        (compile_rules(&config).unwrap(), paths)
    }

    #[test]
    fn test_classify_stream_frame() {
        let (rules, paths) = rules();
        let chunk = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n";
        let packet = classify(&rules, &paths, chunk);
        assert_eq!(packet.kind, PacketKind::Stream);
        assert!(packet.is_sse);
        assert_eq!(packet.prefix, "data");
        assert_eq!(packet.message_path.as_deref(), Some("choices.0.delta.content"));
        assert_eq!(packet_text(&packet).as_deref(), Some("Hi"));
    }

    #[test]
    fn test_classify_finish_frame() {
        let (rules, paths) = rules();
        let packet = classify(&rules, &paths, "data: [DONE]\n\n");
        assert_eq!(packet.kind, PacketKind::FinishStream);
        assert!(packet.is_sse);
    }

    #[test]
    fn test_classify_direct_body() {
        let (rules, paths) = rules();
        let chunk = "{\"message\":{\"content\":\"full answer\"}}";
        let packet = classify(&rules, &paths, chunk);
        assert_eq!(packet.kind, PacketKind::Direct);
        assert!(!packet.is_sse);
        assert_eq!(packet.message_path.as_deref(), Some("message.content"));
    }

    #[test]
    fn test_classify_other_passthrough() {
        let (rules, paths) = rules();
        let packet = classify(&rules, &paths, "junk bytes");
        assert_eq!(packet.kind, PacketKind::Other);
        assert_eq!(String::from_utf8(render(&packet)).unwrap(), "junk bytes");
    }

    #[test]
    fn test_render_restores_sse_framing() {
        let (rules, paths) = rules();
        let chunk = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n";
        let packet = classify(&rules, &paths, chunk);
        assert_eq!(String::from_utf8(render(&packet)).unwrap(), chunk);
    }

    #[test]
    fn test_json_path_get_set() {
        let mut v: Value =
            serde_json::from_str("{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}").unwrap();
        assert_eq!(
            json_path_get(&v, "choices.0.delta.content"),
            Some(&Value::String("x".to_string()))
        );
        assert!(json_path_set(
            &mut v,
            "choices.0.delta.content",
            Value::String("y".to_string())
        ));
        assert_eq!(v["choices"][0]["delta"]["content"], "y");
        assert!(!json_path_set(&mut v, "missing.path", Value::Null));
    }
}

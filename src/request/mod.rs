//! Inbound message parsing
//!
//! Extracts the clean user question from configured tag blocks and parses
//! file attachments out of the trailing user message: inline tag blocks
//! carrying a filepath marker, and editor-context references resolved by
//! reading the file from disk.

use crate::config::{CompiledRules, Config};
use crate::error::{ProxyError, Result};
use crate::tokenize::sha512_hex;
use crate::vector_db::models::Attachment;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::{debug, warn};

pub mod system_prompt;

static FILEPATH_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[ \t]*//[ \t]*filepath:[ \t]*(.+)$").unwrap());
static FILEPATH_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bfilepath\s*=\s*"([^"]+)""#).unwrap());
static USER_FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*user(?:'s)?[ \t]+active[ \t]+file(?:[ \t]+for[ \t]+additional[ \t]+context)?:[ \t]*$")
        .unwrap()
});
static ACTIVE_SELECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)users?\s*'?s?\s*active\s*selection").unwrap());
static EDITOR_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)current file is[:\s]+(.+?)(?:\r?\n|<|$)").unwrap());

/// Trim whitespace, quotes and trailing separators from a candidate path.
pub fn normalize_path(p: &str) -> String {
    p.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim_end_matches(|c: char| ".;, \t\r\n".contains(c))
        .to_string()
}

fn is_duplicate(attachments: &[Attachment], path: &str) -> bool {
    let norm = normalize_path(path);
    attachments.iter().any(|a| normalize_path(&a.path) == norm)
}

fn is_file_allowed(rules: &CompiledRules, path: &str) -> bool {
    if rules.file_patterns.is_empty() {
        return true;
    }
    if rules.file_patterns.iter().any(|r| r.is_match(path)) {
        return true;
    }
    debug!(path = %path, "file disallowed by patterns");
    false
}

fn basename(path: &str) -> Option<String> {
    let id = std::path::Path::new(path)
        .file_name()?
        .to_string_lossy()
        .to_string();
    if id.is_empty() || id == "." || id == "/" {
        return None;
    }
    Some(id)
}

/// Tag-block pattern over plain or JSON-escaped angle brackets.
fn escaped_tag_pattern(tag: &str) -> String {
    let tag = regex::escape(tag);
    format!(
        r"(?is)(?:<|\\u003c){tag}\b(?:\s+[^>]*?)?(?:>|\\u003e)(.*?)(?:<|\\u003c)(?:/|\\u002f){tag}(?:>|\\u003e)"
    )
}

/// Extract the bodies of all configured tag blocks from the content.
pub fn extract_by_tags(content: &str, tags: &[String]) -> Vec<String> {
    let mut results = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let Ok(re) = Regex::new(&escaped_tag_pattern(tag)) else {
            continue;
        };
        for m in re.captures_iter(content) {
            if let Some(body) = m.get(1) {
                results.push(body.as_str().trim().to_string());
            }
        }
    }
    results
}

/// Scan content for attachment tag blocks and extract the files they carry.
pub fn parse_attachments(
    config: &Config,
    rules: &CompiledRules,
    content: &str,
    tags: &[String],
) -> Vec<Attachment> {
    let mut attachments = Vec::new();

    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let pattern = format!(r"(?is)<{0}\b([^>]*)>(.*?)</{0}>", regex::escape(tag));
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };

        for caps in re.captures_iter(content) {
            let attr_str = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let body_raw = caps.get(2).map(|m| m.as_str()).unwrap_or("");

            if ACTIVE_SELECTION.is_match(body_raw) {
                continue;
            }

            // Path from a leading `// filepath:` line, checking a handful
            // of lines at most.
            let mut file_path = String::new();
            let mut matched_line = String::new();
            for line in body_raw.splitn(7, '\n').take(6) {
                if let Some(m) = FILEPATH_LINE.captures(line) {
                    file_path = m[1].trim().to_string();
                    matched_line = m[0].to_string();
                    break;
                }
            }

            if file_path.is_empty() {
                if let Some(m) = FILEPATH_ATTR.captures(attr_str) {
                    let candidate = m[1].trim();
                    if !candidate.is_empty() && !candidate.contains("%s") {
                        file_path = candidate.to_string();
                    }
                }
            }
            if file_path.is_empty() {
                continue;
            }

            let file_path = normalize_path(&file_path);
            let Some(id) = basename(&file_path) else {
                continue;
            };
            if is_duplicate(&attachments, &file_path) {
                continue;
            }

            let mut body = body_raw.to_string();
            if !matched_line.is_empty() {
                body = body.replacen(&matched_line, "", 1);
            }
            body = USER_FILE_LINE.replace_all(&body, "").to_string();
            let body = body.trim_matches(['\r', '\n']).to_string();

            if body.is_empty() {
                continue;
            }
            if config.files.max_file_size > 0 && body.len() as i64 > config.files.max_file_size {
                continue;
            }
            if !is_file_allowed(rules, &file_path) {
                continue;
            }

            let hash = sha512_hex(&body);
            attachments.push(Attachment {
                id,
                path: file_path,
                body,
                hash,
            });
        }
    }

    attachments
}

/// Scan editor-context blocks for `current file is: <path>` references and
/// resolve them from disk under the same bounds as inline attachments.
pub fn read_editor_attachments(
    config: &Config,
    rules: &CompiledRules,
    mut existing: Vec<Attachment>,
    content: &str,
    tags: &[String],
) -> Vec<Attachment> {
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let pattern = format!(r"(?is)<{0}\b([^>]*)>(.*?)</{0}>", regex::escape(tag));
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };

        for caps in re.captures_iter(content) {
            let body_raw = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let Some(m) = EDITOR_PATH.captures(body_raw) else {
                continue;
            };
            let file_path = normalize_path(m[1].trim().trim_matches(|c| c == '"' || c == '\''));
            if file_path.is_empty() {
                continue;
            }
            let Some(id) = basename(&file_path) else {
                continue;
            };
            if is_duplicate(&existing, &file_path) {
                continue;
            }

            let Ok(data) = std::fs::read_to_string(&file_path) else {
                continue;
            };
            let body = data.trim_matches(['\r', '\n']).to_string();
            if body.is_empty() {
                continue;
            }
            if config.files.max_file_size > 0 && body.len() as i64 > config.files.max_file_size {
                continue;
            }
            if !is_file_allowed(rules, &file_path) {
                continue;
            }

            let hash = sha512_hex(&body);
            existing.push(Attachment {
                id,
                path: file_path,
                body,
                hash,
            });
        }
    }

    existing
}

/// Extract the clean user question and the attachments from the request's
/// trailing user message.
pub fn process_messages(
    config: &Config,
    rules: &CompiledRules,
    req: &Map<String, Value>,
) -> Result<(String, Vec<Attachment>)> {
    let msgs = req
        .get("messages")
        .and_then(|m| m.as_array())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::Internal("messages field invalid type or empty".to_string()))?;

    let last = msgs
        .last()
        .and_then(|m| m.as_object())
        .ok_or_else(|| ProxyError::Internal("last message invalid format".to_string()))?;

    let mut clean_user_content = String::new();
    let mut attachments = Vec::new();

    if last.get("role").and_then(|r| r.as_str()) == Some("user") {
        if let Some(content) = last.get("content").and_then(|c| c.as_str()) {
            let parts = extract_by_tags(content, &config.messages.user_tags);
            clean_user_content = parts.join(" ");
            attachments = parse_attachments(
                config,
                rules,
                content,
                &config.messages.ask_attachment_tags,
            );
            attachments = read_editor_attachments(
                config,
                rules,
                attachments,
                content,
                &config.messages.agent_attachment_tags,
            );
            debug!(count = attachments.len(), "extracted attachments from user message");
        }
    }

    if clean_user_content.trim().is_empty() {
        warn!("no user message found to extract content");
        return Err(ProxyError::Internal(
            "no user message found to extract content".to_string(),
        ));
    }

    Ok((clean_user_content, attachments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validation::compile_rules;
    use crate::config::Config;

    fn test_config(patterns: &[&str]) -> (Config, CompiledRules) {
        let pattern_list = patterns
            .iter()
            .map(|p| format!("'{}'", p))
            .collect::<Vec<_>>()
            .join(", ");
        let toml = format!(
            r#"
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
            max_file_size = 4096
            patterns = [{pattern_list}]
            [messages]
            user_tags = ["userRequest", "prompt"]
            ask_attachment_tags = ["attachment"]
            agent_attachment_tags = ["editorContext"]
            body_paths = ["message.content"]
            [stream]
            sse_prefix_regex = "^data$"
            stream_flag_regex = "\"delta\""
            stream_stop_regex = "\\[DONE\\]"
            direct_flag_regex = "\"message\""
            "#
        );
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(&toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let rules = compile_rules(&config).unwrap();
        (config, rules)
    }

    #[test]
    fn test_extract_by_tags() {
        let content = "<userRequest>What is BM25?</userRequest> noise <prompt>rank it</prompt>";
        let tags = vec!["userRequest".to_string(), "prompt".to_string()];
        let parts = extract_by_tags(content, &tags);
        assert_eq!(parts, vec!["What is BM25?", "rank it"]);
    }

    #[test]
    fn test_extract_escaped_tags() {
        let content = r"<userRequest>hidden question</userRequest>";
        let tags = vec!["userRequest".to_string()];
        assert_eq!(extract_by_tags(content, &tags), vec!["hidden question"]);
    }

    #[test]
    fn test_parse_attachment_with_filepath_line() {
        let (config, rules) = test_config(&[]);
        let content = "<attachment>\n// filepath: src/lib.rs\nfn f() {}\n</attachment>";
        let tags = vec!["attachment".to_string()];
        let atts = parse_attachments(&config, &rules, content, &tags);
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].id, "lib.rs");
        assert_eq!(atts[0].path, "src/lib.rs");
        assert_eq!(atts[0].body, "fn f() {}");
        assert_eq!(atts[0].hash, sha512_hex("fn f() {}"));
    }

    #[test]
    fn test_parse_attachment_with_attr_path() {
        let (config, rules) = test_config(&[]);
        let content = r#"<attachment filepath="docs/readme.md">file body here</attachment>"#;
        let tags = vec!["attachment".to_string()];
        let atts = parse_attachments(&config, &rules, content, &tags);
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].id, "readme.md");
        assert_eq!(atts[0].body, "file body here");
    }

    #[test]
    fn test_parse_attachment_skips_duplicates_and_missing_path() {
        let (config, rules) = test_config(&[]);
        let content = "\
            <attachment>\n// filepath: a.txt\nfirst\n</attachment>\
            <attachment>\n// filepath: a.txt\nsecond copy\n</attachment>\
            <attachment>\nno path at all\n</attachment>";
        let tags = vec!["attachment".to_string()];
        let atts = parse_attachments(&config, &rules, content, &tags);
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].body, "first");
    }

    #[test]
    fn test_parse_attachment_respects_patterns() {
        let (config, rules) = test_config(&[r"\.rs$"]);
        let content = "\
            <attachment>\n// filepath: keep.rs\nbody\n</attachment>\
            <attachment>\n// filepath: drop.py\nbody\n</attachment>";
        let tags = vec!["attachment".to_string()];
        let atts = parse_attachments(&config, &rules, content, &tags);
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].id, "keep.rs");
    }

    #[test]
    fn test_parse_attachment_respects_max_size() {
        let (config, rules) = test_config(&[]);
        let big = "x".repeat(5000);
        let content = format!("<attachment>\n// filepath: big.txt\n{}\n</attachment>", big);
        let tags = vec!["attachment".to_string()];
        assert!(parse_attachments(&config, &rules, &content, &tags).is_empty());
    }

    #[test]
    fn test_read_editor_attachment_from_disk() {
        let (config, rules) = test_config(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open_file.rs");
        std::fs::write(&path, "pub fn open() {}\n").unwrap();

        let content = format!(
            "<editorContext>current file is: {}\n</editorContext>",
            path.display()
        );
        let tags = vec!["editorContext".to_string()];
        let atts = read_editor_attachments(&config, &rules, Vec::new(), &content, &tags);
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].id, "open_file.rs");
        assert_eq!(atts[0].body, "pub fn open() {}");
    }

    #[test]
    fn test_process_messages_requires_user_content() {
        let (config, rules) = test_config(&[]);
        let req: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "no tags here"}]
        }))
        .unwrap();
        assert!(process_messages(&config, &rules, &req).is_err());

        let req: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "<userRequest>the question</userRequest>"}]
        }))
        .unwrap();
        let (clean, atts) = process_messages(&config, &rules, &req).unwrap();
        assert_eq!(clean, "the question");
        assert!(atts.is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("  \"src/x.rs\"; "), "src/x.rs");
        assert_eq!(normalize_path("'a.txt',"), "a.txt");
    }
}

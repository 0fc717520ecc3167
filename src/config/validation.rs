//! Configuration validation and rule compilation
//!
//! Every regex the runtime needs is compiled here, once, at startup.
//! Any invalid value is a fatal startup error.

use super::{
    Config, ALLOWED_AGENT_ATTACHMENT_TAGS, ALLOWED_ASK_ATTACHMENT_TAGS, ALLOWED_SOURCES,
    ALLOWED_USER_TAGS,
};
use crate::error::{ProxyError, Result};
use regex::Regex;

/// Regex and replacement artifacts compiled from the configuration.
#[derive(Debug)]
pub struct CompiledRules {
    /// Attachment path allow-list; empty allows everything
    pub file_patterns: Vec<Regex>,

    /// Matches the SSE field name before the colon
    pub sse_prefix: Regex,

    /// Detects an incremental stream frame
    pub stream_flag: Regex,

    /// Detects the stream terminator frame
    pub stream_stop: Regex,

    /// Detects a full non-streaming response body
    pub direct_flag: Regex,

    /// Substitution records in deterministic (trigger-sorted) order
    pub replace_records: Vec<ReplaceRecord>,

    /// Lookahead buffer size in runes derived from the longest trigger
    pub max_trigger_len: usize,
}

/// One trigger with its find/replace rules
#[derive(Debug)]
pub struct ReplaceRecord {
    pub trigger: String,
    pub rules: Vec<ReplaceRule>,
}

/// One regex substitution; an empty replacement deletes matches
#[derive(Debug)]
pub struct ReplaceRule {
    pub find: Regex,
    pub replace: String,
}

fn config_err(msg: impl Into<String>) -> ProxyError {
    ProxyError::Config(msg.into())
}

/// Validate each value in a list against allowed options; empty lists are invalid.
fn validate_enum_list(values: &[String], allowed: &[&str]) -> std::result::Result<(), String> {
    if values.is_empty() {
        return Err("list is empty".to_string());
    }
    for v in values {
        if !allowed.contains(&v.as_str()) {
            return Err(format!("invalid value: '{}'", v));
        }
    }
    Ok(())
}

/// Validate that group references in a replacement template ($1 or ${1})
/// exactly match the groups defined by the find regex: every defined group
/// must be referenced, and no reference may exceed the defined count.
fn validate_replace_groups(find_groups: usize, replace_tpl: &str) -> std::result::Result<(), String> {
    let re = Regex::new(r"\$(\d+)|\$\{(\d+)\}").expect("group reference regex");
    let refs: Vec<usize> = re
        .captures_iter(replace_tpl)
        .filter_map(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .and_then(|m| m.as_str().parse().ok())
        })
        .collect();

    if refs.is_empty() {
        if find_groups == 0 {
            return Ok(());
        }
        return Err(format!(
            "replace references no groups but find defines {}",
            find_groups
        ));
    }

    if find_groups == 0 {
        return Err("replace references groups but find has none".to_string());
    }

    let mut seen = std::collections::BTreeSet::new();
    let mut max_ref = 0;
    for idx in refs {
        if idx < 1 {
            return Err(format!(
                "invalid group reference {}: groups are 1..{}",
                idx, find_groups
            ));
        }
        max_ref = max_ref.max(idx);
        seen.insert(idx);
    }

    if max_ref > find_groups {
        return Err(format!(
            "replace references group {} but find has only {} groups",
            max_ref, find_groups
        ));
    }
    if seen.len() != find_groups {
        return Err(format!(
            "replace references {} groups but find defines {}",
            seen.len(),
            find_groups
        ));
    }
    Ok(())
}

fn compile_regex(name: &str, pattern: &str) -> Result<Regex> {
    if pattern.trim().is_empty() {
        return Err(config_err(format!("`{}` is empty", name)));
    }
    Regex::new(pattern).map_err(|e| config_err(format!("`{}` is invalid: {}", name, e)))
}

/// Compile the response-replacer rule set. Triggers are trimmed; find and
/// replace are not (whitespace may be significant in either).
fn compile_replace_records(config: &Config) -> Result<(Vec<ReplaceRecord>, usize)> {
    let mut records = Vec::with_capacity(config.stream.replacer.len());
    let mut max_trigger_runes = 0usize;

    for (raw_trigger, rules_map) in &config.stream.replacer {
        let trigger = raw_trigger.trim().to_string();
        if trigger.is_empty() {
            return Err(config_err("`stream.replacer` contains empty trigger key"));
        }
        if rules_map.is_empty() {
            tracing::debug!(trigger = %trigger, "replacer trigger has no rules, skipping");
            continue;
        }

        let mut rules = Vec::with_capacity(rules_map.len());
        for (find, replace) in rules_map {
            if find.trim().is_empty() {
                return Err(config_err(format!(
                    "`stream.replacer[{}]` contains empty find regex",
                    trigger
                )));
            }
            let find_reg = Regex::new(find).map_err(|e| {
                config_err(format!(
                    "`stream.replacer[{}]` invalid find regex '{}': {}",
                    trigger, find, e
                ))
            })?;
            if !replace.is_empty() {
                validate_replace_groups(find_reg.captures_len() - 1, replace).map_err(|e| {
                    config_err(format!(
                        "`stream.replacer[{}]` invalid replace '{}': {}",
                        trigger, replace, e
                    ))
                })?;
            }
            rules.push(ReplaceRule {
                find: find_reg,
                replace: replace.clone(),
            });
        }

        max_trigger_runes = max_trigger_runes.max(trigger.chars().count());
        records.push(ReplaceRecord { trigger, rules });
    }

    let max_trigger_len = max_trigger_runes * config.stream.trigger_len_multiplier
        + config.stream.trigger_len_additional;
    Ok((records, max_trigger_len))
}

/// Compile every regex artifact the runtime needs.
pub fn compile_rules(config: &Config) -> Result<CompiledRules> {
    let mut file_patterns = Vec::with_capacity(config.files.patterns.len());
    for (i, p) in config.files.patterns.iter().enumerate() {
        let p = p.trim();
        if p.is_empty() {
            continue;
        }
        let r = Regex::new(p)
            .map_err(|e| config_err(format!("invalid `files.patterns[{}]`: {}", i, e)))?;
        file_patterns.push(r);
    }

    let (replace_records, max_trigger_len) = compile_replace_records(config)?;

    Ok(CompiledRules {
        file_patterns,
        sse_prefix: compile_regex("stream.sse_prefix_regex", &config.stream.sse_prefix_regex)?,
        stream_flag: compile_regex("stream.stream_flag_regex", &config.stream.stream_flag_regex)?,
        stream_stop: compile_regex("stream.stream_stop_regex", &config.stream.stream_stop_regex)?,
        direct_flag: compile_regex("stream.direct_flag_regex", &config.stream.direct_flag_regex)?,
        replace_records,
        max_trigger_len,
    })
}

/// Check the configuration for correctness. Compilation of the regex
/// artifacts is exercised as part of validation so that a bad pattern is
/// caught at startup even if the caller never asks for `CompiledRules`.
pub fn validate_config(config: &Config) -> Result<()> {
    // server
    let listen_re = Regex::new(r"^(\d{1,3}\.){3}\d{1,3}:\d+$|^:\d+$").expect("listen regex");
    if !listen_re.is_match(&config.server.listen) {
        return Err(config_err(format!(
            "`server.listen` address is invalid: {}",
            config.server.listen
        )));
    }

    // upstream
    let base_re = Regex::new(r"^https?://[\w.\-]+(:\d+)?$").expect("base url regex");
    if !base_re.is_match(&config.upstream.base_url) {
        return Err(config_err(format!(
            "`upstream.base_url` is invalid: {}",
            config.upstream.base_url
        )));
    }
    let keep_alive_re = Regex::new(r"^\d+[smhd]$").expect("keep alive regex");
    if !keep_alive_re.is_match(&config.upstream.keep_alive) {
        return Err(config_err(format!(
            "`upstream.keep_alive` is invalid: {}",
            config.upstream.keep_alive
        )));
    }
    let model_re = Regex::new(r"^[a-zA-Z0-9:._\-/]+$").expect("model name regex");
    if !model_re.is_match(&config.upstream.main_model) {
        return Err(config_err(format!(
            "`upstream.main_model` is invalid: {}",
            config.upstream.main_model
        )));
    }
    if !(0.0..=1.0).contains(&config.upstream.temperature) {
        return Err(config_err(format!(
            "`upstream.temperature` is invalid: {}",
            config.upstream.temperature
        )));
    }

    // embedding
    if !model_re.is_match(&config.embedding.model) {
        return Err(config_err(format!(
            "`embedding.model` is invalid: {}",
            config.embedding.model
        )));
    }
    if !config.embedding.endpoint.starts_with('/') {
        return Err(config_err(format!(
            "`embedding.endpoint` must start with '/': {}",
            config.embedding.endpoint
        )));
    }

    // vector_db
    let host_re =
        Regex::new(r"^(localhost|(\d{1,3}\.){3}\d{1,3}|[a-zA-Z0-9\-.]+)$").expect("host regex");
    if !host_re.is_match(&config.vector_db.host) {
        return Err(config_err(format!(
            "`vector_db.host` is invalid: {}",
            config.vector_db.host
        )));
    }
    if config.vector_db.port == 0 {
        return Err(config_err("`vector_db.port` is invalid: 0"));
    }
    let collection_re = Regex::new(r"^[a-zA-Z0-9_]+$").expect("collection regex");
    if !collection_re.is_match(&config.vector_db.collection) {
        return Err(config_err(format!(
            "`vector_db.collection` is invalid: {}",
            config.vector_db.collection
        )));
    }
    if config.vector_db.vector_size == 0 || config.vector_db.vector_size > 32768 {
        return Err(config_err(format!(
            "`vector_db.vector_size` must be between 1 and 32768: {}",
            config.vector_db.vector_size
        )));
    }

    // tokenizer
    if config.tokenizer.cache_size == 0 {
        return Err(config_err("`tokenizer.cache_size` is invalid: 0"));
    }
    if config.tokenizer.reserve_percent < 0.0 {
        return Err(config_err(format!(
            "`tokenizer.reserve_percent` is invalid: {}",
            config.tokenizer.reserve_percent
        )));
    }

    // idf
    if config.idf.file.trim().is_empty() {
        return Err(config_err("`idf.file` path is invalid"));
    }

    // retrieval
    validate_enum_list(&config.retrieval.sources, ALLOWED_SOURCES)
        .map_err(|e| config_err(format!("`retrieval.sources` is invalid: {}", e)))?;
    if config.retrieval.max_age_days < -1 || config.retrieval.max_age_days == 0 {
        return Err(config_err(format!(
            "`retrieval.max_age_days` is invalid: {}",
            config.retrieval.max_age_days
        )));
    }
    if config.retrieval.top_k < -1 || config.retrieval.top_k == 0 {
        return Err(config_err(format!(
            "`retrieval.top_k` is invalid: {}",
            config.retrieval.top_k
        )));
    }
    if !(0.0..=1.0).contains(&config.retrieval.cosine_min_score) {
        return Err(config_err(format!(
            "`retrieval.cosine_min_score` is invalid: {}",
            config.retrieval.cosine_min_score
        )));
    }
    if config.retrieval.euclid_max_distance < 0.0 {
        return Err(config_err(format!(
            "`retrieval.euclid_max_distance` is invalid: {}",
            config.retrieval.euclid_max_distance
        )));
    }

    // rerank
    if config.rerank.top_n < -1 || config.rerank.top_n == 0 {
        return Err(config_err(format!(
            "`rerank.top_n` is invalid: {}",
            config.rerank.top_n
        )));
    }
    if config.retrieval.top_k != -1
        && config.rerank.top_n != -1
        && config.rerank.top_n > config.retrieval.top_k
    {
        return Err(config_err(format!(
            "`rerank.top_n` ({}) cannot be greater than `retrieval.top_k` ({})",
            config.rerank.top_n, config.retrieval.top_k
        )));
    }
    if !(0.0..=1.0).contains(&config.rerank.min_score) {
        return Err(config_err(format!(
            "`rerank.min_score` is invalid: {}",
            config.rerank.min_score
        )));
    }
    if config.rerank.max_query_tokens == 0 {
        return Err(config_err("`rerank.max_query_tokens` is invalid: 0"));
    }
    if config.rerank.weights.len() != 10 {
        return Err(config_err(format!(
            "`rerank.weights` must have exactly 10 elements, got {}",
            config.rerank.weights.len()
        )));
    }
    for (i, w) in config.rerank.weights.iter().enumerate() {
        if *w < 0.0 {
            return Err(config_err(format!("`rerank.weights[{}]` is invalid: {}", i, w)));
        }
    }
    for (role, weight) in &config.rerank.role_weights {
        if role.trim().is_empty() {
            return Err(config_err("`rerank.role_weights` contains empty role name"));
        }
        if *weight < 0.0 {
            return Err(config_err(format!(
                "`rerank.role_weights[{}]` is invalid: {}",
                role, weight
            )));
        }
        if !ALLOWED_SOURCES.contains(&role.as_str()) {
            return Err(config_err(format!(
                "`rerank.role_weights[{}]` is not an allowed source role",
                role
            )));
        }
    }
    for allowed in ALLOWED_SOURCES {
        if !config.rerank.role_weights.contains_key(*allowed) {
            return Err(config_err(format!(
                "`rerank.role_weights` missing required role: {}",
                allowed
            )));
        }
    }
    if config.rerank.tau_days <= 0.0 {
        return Err(config_err(format!(
            "`rerank.tau_days` is invalid: {}",
            config.rerank.tau_days
        )));
    }
    if config.rerank.min_tokens_normalization <= 0 {
        return Err(config_err(format!(
            "`rerank.min_tokens_normalization` is invalid: {}",
            config.rerank.min_tokens_normalization
        )));
    }
    if config.rerank.max_tokens_normalization <= 0 {
        return Err(config_err(format!(
            "`rerank.max_tokens_normalization` is invalid: {}",
            config.rerank.max_tokens_normalization
        )));
    }

    // window
    if config.window.model_window_size <= 0 {
        return Err(config_err(format!(
            "`window.model_window_size` is invalid: {}",
            config.window.model_window_size
        )));
    }
    if !(1..=100).contains(&config.window.feed_percent) {
        return Err(config_err(format!(
            "`window.feed_percent` is invalid: {}",
            config.window.feed_percent
        )));
    }

    // files
    if config.files.max_file_size < -1 || config.files.max_file_size == 0 {
        return Err(config_err(format!(
            "`files.max_file_size` is invalid: {}",
            config.files.max_file_size
        )));
    }

    // messages
    validate_enum_list(&config.messages.user_tags, ALLOWED_USER_TAGS)
        .map_err(|e| config_err(format!("`messages.user_tags` is invalid: {}", e)))?;
    validate_enum_list(&config.messages.ask_attachment_tags, ALLOWED_ASK_ATTACHMENT_TAGS)
        .map_err(|e| config_err(format!("`messages.ask_attachment_tags` is invalid: {}", e)))?;
    validate_enum_list(
        &config.messages.agent_attachment_tags,
        ALLOWED_AGENT_ATTACHMENT_TAGS,
    )
    .map_err(|e| config_err(format!("`messages.agent_attachment_tags` is invalid: {}", e)))?;
    if config.messages.body_paths.is_empty() {
        return Err(config_err("`messages.body_paths` is empty"));
    }
    for (i, path) in config.messages.body_paths.iter().enumerate() {
        if path.trim().is_empty() {
            return Err(config_err(format!("`messages.body_paths[{}]` is empty", i)));
        }
    }

    // stream
    if config.stream.trigger_len_multiplier < 1 {
        return Err(config_err(format!(
            "`stream.trigger_len_multiplier` is invalid: {}",
            config.stream.trigger_len_multiplier
        )));
    }
    if config.stream.channel_capacity == 0 {
        return Err(config_err("`stream.channel_capacity` is invalid: 0"));
    }

    // system message patch
    for (key, value) in &config.system_message.patch.replace {
        if key.trim().is_empty() {
            return Err(config_err("`system_message.patch.replace`: empty key is not allowed"));
        }
        if value.trim().is_empty() {
            return Err(config_err(format!(
                "`system_message.patch.replace`: empty value for key '{}' is not allowed",
                key
            )));
        }
    }
    for rule in &config.system_message.patch.add_after {
        if rule.find.trim().is_empty() {
            return Err(config_err(
                "`system_message.patch.add_after`: empty search key is not allowed",
            ));
        }
        // rule.insert may be empty, meaning no insertion
    }

    // logging
    if config.logging.dir.trim().is_empty() {
        return Err(config_err("`logging.dir` is empty"));
    }

    // stream regexes and the replacer rule set
    compile_rules(config)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let toml = r#"
            [server]
            listen = "127.0.0.1:8080"

            [upstream]
            base_url = "http://localhost:11434"
            main_model = "llama3:8b"
            temperature = 0.6

            [embedding]
            endpoint = "/api/embeddings"
            model = "nomic-embed-text"

            [vector_db]
            host = "localhost"
            port = 6334
            collection = "ragproxy"
            metric = "Cosine"
            vector_size = 768

            [tokenizer]

            [idf]
            file = "/tmp/idf.json"

            [retrieval]
            sources = ["rag-user", "rag-assistant", "rag-file"]

            [rerank]
            min_score = 0.2
            weights = [0.3, 0.05, 0.05, 0.05, 0.05, 0.15, 0.1, 0.1, 0.1, 0.05]

            [rerank.role_weights]
            "rag-user" = 0.6
            "rag-assistant" = 0.8
            "rag-file" = 1.0

            [window]
            model_window_size = 8192
            feed_percent = 40

            [files]

            [messages]
            user_tags = ["userRequest", "prompt"]
            ask_attachment_tags = ["attachment"]
            agent_attachment_tags = ["editorContext"]
            body_paths = ["message.content", "choices.0.delta.content", "response"]

            [stream]
            sse_prefix_regex = "^data$"
            stream_flag_regex = "\"delta\"|\"done\"\\s*:\\s*false"
            stream_stop_regex = "\\[DONE\\]|\"done\"\\s*:\\s*true"
            direct_flag_regex = "\"choices\"|\"message\""
        "#;
        toml_config(toml)
    }

    fn toml_config(body: &str) -> Config {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(body, config::FileFormat::Toml))
            .build()
            .unwrap();
        builder.try_deserialize().unwrap()
    }

    #[test]
    fn test_valid_config_passes() {
        let config = test_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_wrong_weight_count_rejected() {
        let mut config = test_config();
        config.rerank.weights.pop();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("exactly 10"));
    }

    #[test]
    fn test_missing_role_weight_rejected() {
        let mut config = test_config();
        config.rerank.role_weights.remove("rag-file");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("missing required role"));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let mut config = test_config();
        config.retrieval.sources.push("rag-unknown".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_stream_regex_rejected() {
        let mut config = test_config();
        config.stream.stream_flag_regex = "([".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_listen_rejected() {
        let mut config = test_config();
        config.server.listen = "not-an-address".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_replace_group_validation() {
        assert!(validate_replace_groups(0, "plain text").is_ok());
        assert!(validate_replace_groups(1, "$1 and more").is_ok());
        assert!(validate_replace_groups(1, "${1}!").is_ok());
        assert!(validate_replace_groups(0, "$1").is_err());
        assert!(validate_replace_groups(2, "$1").is_err());
        assert!(validate_replace_groups(1, "$2").is_err());
    }

    #[test]
    fn test_trigger_buffer_sizing() {
        let mut config = test_config();
        config.stream.trigger_len_multiplier = 3;
        config.stream.trigger_len_additional = 7;
        config
            .stream
            .replacer
            .entry("forbidden".to_string())
            .or_default()
            .insert("forbidden phrase".to_string(), "***".to_string());
        let rules = compile_rules(&config).unwrap();
        assert_eq!(rules.max_trigger_len, "forbidden".chars().count() * 3 + 7);
        assert_eq!(rules.replace_records.len(), 1);
    }

    #[test]
    fn test_empty_find_regex_rejected() {
        let mut config = test_config();
        config
            .stream
            .replacer
            .entry("bad".to_string())
            .or_default()
            .insert("  ".to_string(), "x".to_string());
        assert!(validate_config(&config).is_err());
    }
}

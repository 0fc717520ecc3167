//! Shared test fixtures

use rag_proxy::{AppContext, Config};
use std::sync::Arc;

/// A complete configuration for tests; no external service is contacted.
pub fn test_config() -> Config {
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
        collection = "ragproxy_test"
        metric = "Cosine"
        vector_size = 8

        [tokenizer]
        cache_size = 256
        cache_ttl_secs = 0
        reserve_percent = 10.0

        [idf]
        file = "/tmp/ragproxy-test-idf.json"
        autosave_interval_secs = 0

        [retrieval]
        sources = ["rag-user", "rag-assistant", "rag-file"]
        top_k = 50
        cosine_min_score = 0.1

        [rerank]
        top_n = 10
        min_score = 0.2
        max_query_tokens = 64
        weights = [0.3, 0.05, 0.05, 0.05, 0.05, 0.15, 0.1, 0.1, 0.1, 0.05]
        tau_days = 30.0

        [rerank.role_weights]
        "rag-user" = 0.6
        "rag-assistant" = 0.8
        "rag-file" = 1.0

        [window]
        model_window_size = 8192
        feed_percent = 40

        [files]
        max_file_size = 65536

        [messages]
        user_tags = ["userRequest", "prompt"]
        ask_attachment_tags = ["attachment"]
        agent_attachment_tags = ["editorContext"]
        body_paths = ["choices.0.delta.content", "message.content", "response"]

        [stream]
        sse_prefix_regex = "^data$"
        stream_flag_regex = "\"delta\""
        stream_stop_regex = "\\[DONE\\]"
        direct_flag_regex = "\"message\"|\"choices\""

        [stream.replacer.forbidden]
        "forbidden phrase" = "***"
    "#;
    config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap()
}

pub fn test_app() -> Arc<AppContext> {
    let config = test_config();
    config.validate().unwrap();
    Arc::new(AppContext::new(config).unwrap())
}

pub fn test_app_with(f: impl FnOnce(&mut Config)) -> Arc<AppContext> {
    let mut config = test_config();
    f(&mut config);
    config.validate().unwrap();
    Arc::new(AppContext::new(config).unwrap())
}

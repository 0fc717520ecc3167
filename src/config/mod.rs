//! Configuration for the retrieval-augmented proxy

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub mod loader;
pub mod validation;

pub use validation::{CompiledRules, ReplaceRecord, ReplaceRule};

/// Roles a stored turn may carry; retrieval sources and role weights are
/// validated against this set.
pub const ALLOWED_SOURCES: &[&str] = &["rag-user", "rag-assistant", "rag-file"];

/// Tags whose bodies form the clean user question.
pub const ALLOWED_USER_TAGS: &[&str] = &["userRequest", "prompt"];

/// Tags carrying inline file attachments.
pub const ALLOWED_ASK_ATTACHMENT_TAGS: &[&str] = &["attachment"];

/// Tags carrying editor-context file references resolved from disk.
pub const ALLOWED_AGENT_ATTACHMENT_TAGS: &[&str] = &["editorContext"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub embedding: EmbeddingConfig,
    pub vector_db: VectorDbConfig,
    pub tokenizer: TokenizerConfig,
    pub idf: IdfConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub window: WindowConfig,
    pub files: FilesConfig,
    pub messages: MessagesConfig,
    pub stream: StreamConfig,
    #[serde(default)]
    pub system_message: SystemMessageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, `IP:port` or `:port`
    pub listen: String,

    /// Grace period for in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// System user that must exist before the daemon starts (skipped when unset)
    #[serde(default)]
    pub service_user: Option<String>,
}

/// Upstream chat completion server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the model server, e.g. `http://localhost:11434`
    pub base_url: String,

    /// Keep-alive hint forwarded on embedding calls, e.g. `30m`
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,

    /// Name of the main chat model (unloaded on low-VRAM embedding retries)
    pub main_model: String,

    /// Unload the main model and retry once when an embedding call fails
    #[serde(default)]
    pub unload_on_low_vram: bool,

    /// Temperature written into every rewritten request
    pub temperature: f64,

    /// Optional bearer token for the upstream (secured)
    #[serde(
        default,
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub api_key: Option<Secret<String>>,
}

/// Embeddings endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Path of the embeddings endpoint on the upstream base URL, e.g. `/api/embeddings`
    pub endpoint: String,

    /// Embedding model name
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Enable response caching
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    /// Cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Cache maximum size
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Optional bearer token for the embeddings endpoint (secured)
    #[serde(
        default,
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub api_key: Option<Secret<String>>,
}

/// Qdrant vector database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDbConfig {
    pub host: String,

    pub port: u16,

    /// gRPC keep-alive; 0 disables the idle ping
    #[serde(default)]
    pub keep_alive_secs: u64,

    /// Collection name, letters/digits/underscore
    pub collection: String,

    /// Distance metric the collection was created with
    pub metric: Metric,

    /// Vector dimension
    pub vector_size: usize,
}

/// Distance metrics supported
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Cosine,
    Euclid,
    Dot,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "Cosine",
            Metric::Euclid => "Euclid",
            Metric::Dot => "Dot",
        }
    }
}

/// Tokenizer and token cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Maximum cached tokenizations, keyed by content hash
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Token cache entry TTL in seconds; 0 means no expiry
    #[serde(default = "default_token_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Reserve percentage added to every token count
    #[serde(default = "default_reserve_percent")]
    pub reserve_percent: f64,
}

/// IDF store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdfConfig {
    /// Snapshot file path
    pub file: String,

    /// Autosave interval in seconds; 0 disables the background saver
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    /// Use the BM25-style IDF formula instead of the legacy one
    #[serde(default)]
    pub use_bm25_idf: bool,
}

/// First-stage vector search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Roles eligible for retrieval
    pub sources: Vec<String>,

    /// Maximum payload age in days; -1 disables the time filter
    #[serde(default = "default_neg_one")]
    pub max_age_days: i64,

    /// First-stage result limit; -1 means a high internal default
    #[serde(default = "default_neg_one")]
    pub top_k: i64,

    /// Minimum similarity for Cosine/Dot metrics
    #[serde(default)]
    pub cosine_min_score: f32,

    /// Maximum distance for the Euclid metric
    #[serde(default = "default_euclid_max")]
    pub euclid_max_distance: f32,

    /// Request stored vectors back from the search (may be expensive)
    #[serde(default)]
    pub return_vectors: bool,
}

/// Second-stage rerank configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Results kept after rerank; -1 keeps all that pass the score cutoff
    #[serde(default = "default_neg_one")]
    pub top_n: i64,

    /// Minimum final score a candidate must reach
    pub min_score: f64,

    /// Unique query token budget for the expensive features
    #[serde(default = "default_max_query_tokens")]
    pub max_query_tokens: usize,

    /// Weights for the ten-feature linear combination, in feature order
    pub weights: Vec<f64>,

    /// Per-role score table; must cover every allowed source role
    pub role_weights: BTreeMap<String, f64>,

    /// Recency decay constant in days
    #[serde(default = "default_tau_days")]
    pub tau_days: f64,

    /// Lower bound for adaptive body-length normalization
    #[serde(default = "default_min_tokens_norm")]
    pub min_tokens_normalization: i64,

    /// Upper bound for adaptive body-length normalization
    #[serde(default = "default_max_tokens_norm")]
    pub max_tokens_normalization: i64,

    #[serde(default)]
    pub bm25: Bm25Config,
}

/// BM25 parameters and normalization mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Config {
    #[serde(default = "default_bm25_k1")]
    pub k1: f64,

    #[serde(default = "default_bm25_b")]
    pub b: f64,

    /// Use `log1p(score)/log1p(scale)` instead of the logistic curve
    #[serde(default)]
    pub use_log_norm: bool,

    #[serde(default = "default_bm25_log_scale")]
    pub log_norm_scale: f64,

    #[serde(default = "default_bm25_midpoint")]
    pub norm_midpoint: f64,

    #[serde(default = "default_bm25_slope")]
    pub norm_slope: f64,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: default_bm25_k1(),
            b: default_bm25_b(),
            use_log_norm: false,
            log_norm_scale: default_bm25_log_scale(),
            norm_midpoint: default_bm25_midpoint(),
            norm_slope: default_bm25_slope(),
        }
    }
}

/// Window-sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Token window of the downstream model
    pub model_window_size: i64,

    /// Share of the free window given to retrieved feeds, 1–100
    pub feed_percent: i64,
}

/// Attachment bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Maximum attachment body size in bytes; -1 disables the bound
    #[serde(default = "default_neg_one")]
    pub max_file_size: i64,

    /// Allow-list of path regexes; empty allows everything
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Message parsing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesConfig {
    /// Tags whose bodies form the clean user question
    pub user_tags: Vec<String>,

    /// Tags carrying inline attachments
    pub ask_attachment_tags: Vec<String>,

    /// Tags carrying editor-context file references
    pub agent_attachment_tags: Vec<String>,

    /// JSON paths probed for the text delta inside response packets
    pub body_paths: Vec<String>,
}

/// Stream interception configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Regex matching the SSE field name before the colon, e.g. `^data$`
    pub sse_prefix_regex: String,

    /// Regex detecting an incremental stream frame
    pub stream_flag_regex: String,

    /// Regex detecting the stream terminator frame
    pub stream_stop_regex: String,

    /// Regex detecting a full non-streaming response body
    pub direct_flag_regex: String,

    /// Longest trigger length is multiplied by this to size the lookahead buffer
    #[serde(default = "default_trigger_multiplier")]
    pub trigger_len_multiplier: usize,

    /// Constant added to the lookahead buffer size
    #[serde(default = "default_trigger_additional")]
    pub trigger_len_additional: usize,

    /// Outgoing packet channel capacity; writers block when full
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// trigger -> { find regex -> replacement template }
    #[serde(default)]
    pub replacer: BTreeMap<String, BTreeMap<String, String>>,
}

/// System-message patching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMessageConfig {
    /// File the original and patched system messages are dumped to; unset disables the dump
    #[serde(default)]
    pub dump_file: Option<String>,

    #[serde(default)]
    pub patch: SystemMessagePatch,
}

/// Ordered edit operations applied to the system message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMessagePatch {
    #[serde(default)]
    pub replace: BTreeMap<String, String>,

    #[serde(default)]
    pub add_to_begin: Vec<String>,

    #[serde(default)]
    pub add_to_end: Vec<String>,

    #[serde(default)]
    pub add_after: Vec<PatchRule>,

    #[serde(default)]
    pub remove: Vec<String>,
}

/// Insert `insert` after every occurrence of `find`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRule {
    pub find: String,
    #[serde(default)]
    pub insert: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for the stdout sink
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory holding access.log, error.log and debug.log
    #[serde(default = "default_log_dir")]
    pub dir: String,

    /// Log request/response bodies and enable the debug sink
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            verbose: false,
        }
    }
}

// Default value functions
fn default_shutdown_grace() -> u64 {
    5
}
fn default_keep_alive() -> String {
    "30m".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_cache_enabled() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_cache_size() -> usize {
    1000
}
fn default_token_cache_ttl() -> u64 {
    86400
}
fn default_reserve_percent() -> f64 {
    10.0
}
fn default_autosave_interval() -> u64 {
    60
}
fn default_neg_one() -> i64 {
    -1
}
fn default_euclid_max() -> f32 {
    f32::MAX
}
fn default_max_query_tokens() -> usize {
    64
}
fn default_tau_days() -> f64 {
    30.0
}
fn default_min_tokens_norm() -> i64 {
    64
}
fn default_max_tokens_norm() -> i64 {
    4096
}
fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_bm25_log_scale() -> f64 {
    10.0
}
fn default_bm25_midpoint() -> f64 {
    4.0
}
fn default_bm25_slope() -> f64 {
    1.0
}
fn default_trigger_multiplier() -> usize {
    2
}
fn default_trigger_additional() -> usize {
    16
}
fn default_channel_capacity() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "/var/log/ragproxy".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let config = loader::load_config(path)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let config = loader::load_config_with_env(path)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Validate this configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validation::validate_config(self)
    }
}

/// Custom serializer for Option<Secret<String>>
fn serialize_optional_secret<S>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// Custom deserializer for Option<Secret<String>>
fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.map(Secret::new))
}

//! Error types for the proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Main error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector database error: {0}")]
    VectorDb(#[from] VectorDbError),

    #[error("Tokenizer error: {0}")]
    Tokenize(#[from] TokenizeError),

    #[error("Packing error: {0}")]
    Pack(#[from] PackError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from the embeddings endpoint
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid embedding format in response")]
    InvalidFormat,

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors from vector store operations
#[derive(Error, Debug)]
pub enum VectorDbError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Collection schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Search error: {0}")]
    SearchError(String),

    #[error("Scroll error: {0}")]
    ScrollError(String),

    #[error("Upsert error: {0}")]
    UpsertError(String),

    #[error("Delete error: {0}")]
    DeleteError(String),

    #[error("Point not found: {0}")]
    PointNotFound(String),

    #[error("Index creation failed: {0}")]
    IndexError(String),
}

/// Errors from the tokenizer
#[derive(Error, Debug)]
pub enum TokenizeError {
    #[error("Tokenizer initialization failed: {0}")]
    InitError(String),
}

/// Errors from context-window packing
#[derive(Error, Debug)]
pub enum PackError {
    #[error("Last message is not user role")]
    NoUserPrompt,

    #[error("Invalid message format in request")]
    InvalidMessage,

    #[error("Not enough window size after accounting for meta, system, and user prompt sizes")]
    WindowExhausted,
}

impl From<config::ConfigError> for ProxyError {
    fn from(err: config::ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

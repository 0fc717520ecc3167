//! rag-proxy - retrieval-augmented reverse proxy for chat completion APIs
//!
//! Interposes on a chat completion endpoint: for each inbound request it
//! extracts the user's question and attachments, retrieves semantically
//! related prior turns and files from a vector store, reranks them with a
//! lexical scoring ensemble, packs as many as the model window permits and
//! forwards the rewritten request. The streaming response is mirrored back
//! through a rule-based substitution pass, and both sides of the exchange
//! are persisted for future retrieval.
//!
//! ## Pipeline
//!
//! - **Tokenizer + cache**: deterministic text → token ids with a
//!   hash-keyed LRU ([`tokenize`])
//! - **IDF store**: per-token and per-bigram corpus statistics with atomic
//!   snapshots ([`idf`])
//! - **Feature extraction**: ten-feature scoring vector ([`features`])
//! - **Retrieve and rerank**: vector search plus weighted lexical rerank
//!   ([`retrieval`])
//! - **Context packing**: window budgeting and message assembly
//!   ([`packer`])
//! - **Stream interception**: bounded-lookahead substitution over the
//!   response stream ([`interceptor`])

pub mod app;
pub mod config;
pub mod embedding;
pub mod error;
pub mod features;
pub mod idf;
pub mod interceptor;
pub mod logging;
pub mod packer;
pub mod proxy;
pub mod request;
pub mod retrieval;
pub mod shutdown;
pub mod tokenize;
pub mod vector_db;

pub use app::AppContext;
pub use config::Config;
pub use error::{ProxyError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::AppContext;
    pub use crate::config::Config;
    pub use crate::embedding::EmbeddingClient;
    pub use crate::error::{ProxyError, Result};
    pub use crate::interceptor::StreamInterceptor;
    pub use crate::shutdown::{ShutdownCoordinator, ShutdownNotifier};
    pub use crate::vector_db::{Attachment, Candidate, Payload, VectorDb};
}

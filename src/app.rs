//! Process-wide application context
//!
//! The IDF store and the token cache are the only mutable state shared
//! across requests. Both live here, each behind its own synchronization,
//! and the context is threaded explicitly through the components.

use crate::config::{CompiledRules, Config};
use crate::error::Result;
use crate::idf::IdfStore;
use crate::packer;
use crate::tokenize::TokenService;
use std::sync::Arc;

pub struct AppContext {
    pub config: Config,

    /// Regex artifacts compiled from the configuration at startup
    pub rules: CompiledRules,

    /// Tokenizer with its hash-keyed cache
    pub tokens: TokenService,

    /// Corpus statistics behind a reader-writer lock; shared with the
    /// autosave task
    pub idf: Arc<IdfStore>,

    /// Token cost of the messages-array brackets, measured at startup
    pub messages_wrapper_size: i64,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let rules = crate::config::validation::compile_rules(&config)?;
        let tokens = TokenService::new(&config.tokenizer)?;
        let idf = Arc::new(IdfStore::new(config.idf.use_bm25_idf));
        let messages_wrapper_size = packer::messages_wrapper_size(&tokens);
        Ok(Self {
            config,
            rules,
            tokens,
            idf,
            messages_wrapper_size,
        })
    }
}

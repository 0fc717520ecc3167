//! Tokenizer and token cache
//!
//! Tokenization is deterministic and external: a fixed tiktoken encoding
//! maps text to integer token ids. Results are cached in a count-bounded
//! LRU keyed by the SHA-512 hex of the text, with a TTL checked on read.

use crate::config::TokenizerConfig;
use crate::error::{Result, TokenizeError};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// SHA-512 hex digest of the given text
pub fn sha512_hex(text: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

struct CachedEntry {
    ids: Arc<Vec<u32>>,
    created: Instant,
}

/// Tokenizer with a hash-keyed LRU cache and reserve-percent counting
pub struct TokenService {
    bpe: CoreBPE,
    cache: Mutex<LruCache<String, CachedEntry>>,
    ttl: Duration,
    reserve_percent: f64,
}

impl TokenService {
    pub fn new(config: &TokenizerConfig) -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| TokenizeError::InitError(e.to_string()))?;
        let capacity = NonZeroUsize::new(config.cache_size)
            .ok_or_else(|| TokenizeError::InitError("cache size must be non-zero".to_string()))?;
        Ok(Self {
            bpe,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            reserve_percent: config.reserve_percent,
        })
    }

    /// Identity of the encoding; stored in IDF snapshots so statistics from
    /// another tokenizer are never mixed in.
    pub fn encoding_name(&self) -> &'static str {
        "cl100k_base"
    }

    /// Token ids for the given text, uncached.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_with_special_tokens(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    /// Token ids for a document body, cached under its content hash.
    /// An empty hash bypasses the cache entirely.
    pub fn cached_ids(&self, hash: &str, body: &str) -> Arc<Vec<u32>> {
        if !hash.is_empty() {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(hash) {
                if self.ttl.is_zero() || entry.created.elapsed() < self.ttl {
                    return entry.ids.clone();
                }
                debug!(hash = %&hash[..hash.len().min(16)], "token cache entry expired");
                cache.pop(hash);
            }
        }

        let ids = Arc::new(self.encode(body));
        if !hash.is_empty() {
            self.cache.lock().put(
                hash.to_string(),
                CachedEntry {
                    ids: ids.clone(),
                    created: Instant::now(),
                },
            );
        }
        ids
    }

    /// Drop the cache entry for a removed document so a later re-tokenization
    /// reflects any tokenizer change.
    pub fn evict(&self, hash: &str) {
        if !hash.is_empty() {
            self.cache.lock().pop(hash);
        }
    }

    /// Raw token count of the text.
    pub fn count(&self, text: &str) -> i64 {
        self.bpe.encode_with_special_tokens(text).len() as i64
    }

    /// `ceil(count · (1 + reserve))` for a pre-tokenized sequence.
    pub fn count_with_reserve_ids(&self, ids: &[u32]) -> i64 {
        self.apply_reserve(ids.len() as i64)
    }

    /// `ceil(count · (1 + reserve))` for the text.
    pub fn count_with_reserve(&self, text: &str) -> i64 {
        self.apply_reserve(self.count(text))
    }

    fn apply_reserve(&self, raw: i64) -> i64 {
        (raw as f64 * (1.0 + self.reserve_percent / 100.0)).ceil() as i64
    }

    /// Split text into per-token strings whose concatenation equals the
    /// input. Tokens whose bytes end inside a UTF-8 sequence are merged with
    /// the following token until the group decodes cleanly.
    pub fn token_strings(&self, text: &str) -> Vec<String> {
        let ids = self.bpe.encode_with_special_tokens(text);
        let mut out = Vec::with_capacity(ids.len());
        let mut pending: Vec<usize> = Vec::new();
        for id in ids {
            pending.push(id);
            if let Ok(s) = self.bpe.decode(pending.clone()) {
                out.push(s);
                pending.clear();
            }
        }
        if !pending.is_empty() {
            if let Ok(s) = self.bpe.decode(pending) {
                out.push(s);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(ttl_secs: u64) -> TokenService {
        TokenService::new(&TokenizerConfig {
            cache_size: 8,
            cache_ttl_secs: ttl_secs,
            reserve_percent: 10.0,
        })
        .unwrap()
    }

    #[test]
    fn test_sha512_stable() {
        let a = sha512_hex("hello world");
        let b = sha512_hex("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        assert_ne!(a, sha512_hex("hello worlds"));
    }

    #[test]
    fn test_encode_deterministic() {
        let svc = service(0);
        assert_eq!(svc.encode("language models"), svc.encode("language models"));
        assert!(!svc.encode("language models").is_empty());
    }

    #[test]
    fn test_cache_round_trip() {
        let svc = service(0);
        let hash = sha512_hex("some body");
        let first = svc.cached_ids(&hash, "some body");
        let second = svc.cached_ids(&hash, "some body");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_empty_hash_bypasses_cache() {
        let svc = service(0);
        let first = svc.cached_ids("", "some body");
        let second = svc.cached_ids("", "some body");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_evict_forces_retokenize() {
        let svc = service(0);
        let hash = sha512_hex("evicted");
        let first = svc.cached_ids(&hash, "evicted");
        svc.evict(&hash);
        let second = svc.cached_ids(&hash, "evicted");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_reserve_rounds_up() {
        let svc = service(0);
        let raw = svc.count("one two three four five");
        let reserved = svc.count_with_reserve("one two three four five");
        assert_eq!(reserved, (raw as f64 * 1.1).ceil() as i64);
        assert!(reserved >= raw);
    }

    #[test]
    fn test_token_strings_concatenate() {
        let svc = service(0);
        let text = "This is a *** phrase.";
        let parts = svc.token_strings(text);
        assert!(parts.len() > 1);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_token_strings_multibyte() {
        let svc = service(0);
        let text = "языковые модели";
        assert_eq!(svc.token_strings(text).concat(), text);
    }
}

//! Append/remove-only corpus statistics
//!
//! Tracks per-token and per-bigram document frequencies together with the
//! document count and total token count, and keeps derived IDF weights in
//! step. Weights are recomputed lazily: a mutation only touches the keys of
//! the document being added or removed, everything else keeps its previous
//! value. All counters clamp at zero; underflow is logged, never fatal.

use crate::features::bigram_hashes;
use crate::tokenize::TokenService;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use tracing::error;

pub mod snapshot;

pub use snapshot::IdfSnapshot;

/// In-memory statistics guarded by the store's RwLock
#[derive(Debug, Default, Clone)]
pub struct IdfState {
    /// Per-token document frequency
    pub df: HashMap<u32, u64>,

    /// Cached per-token IDF weights
    pub idf: HashMap<u32, f64>,

    /// Per-bigram document frequency
    pub ngram_df: HashMap<u64, u64>,

    /// Cached per-bigram IDF weights
    pub ngram_idf: HashMap<u64, f64>,

    /// Total number of documents
    pub n: u64,

    /// Total token count across documents
    pub total_tokens: i64,

    /// Set on every mutation; cleared by a successful snapshot
    pub dirty: bool,
}

/// The IDF store: shared statistics behind a single writer lock
pub struct IdfStore {
    state: RwLock<IdfState>,
    use_bm25_idf: bool,
}

/// IDF weight for a key with document frequency `df` in a corpus of `n`
/// documents. Zero when the corpus is empty.
pub fn idf_weight(use_bm25_idf: bool, n: u64, df: u64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    let df = df as f64;
    if use_bm25_idf {
        ((n - df + 0.5) / (df + 0.5)).ln_1p()
    } else {
        (n / (1.0 + df)).ln_1p()
    }
}

impl IdfStore {
    pub fn new(use_bm25_idf: bool) -> Self {
        Self {
            state: RwLock::new(IdfState::default()),
            use_bm25_idf,
        }
    }

    pub fn use_bm25_idf(&self) -> bool {
        self.use_bm25_idf
    }

    /// Shared read access for feature computation.
    pub fn read(&self) -> RwLockReadGuard<'_, IdfState> {
        self.state.read()
    }

    /// Exclusive access for snapshot persistence; held across the disk
    /// write so the dirty flag stays consistent with what was written.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, IdfState> {
        self.state.write()
    }

    /// Add a document's tokens and bigrams to the statistics.
    pub fn add_document(&self, tokens: &TokenService, body: &str, token_count: i64, hash: &str) {
        let ids = tokens.cached_ids(hash, body);
        self.update_document(&ids, token_count, 1);
    }

    /// Remove a document's tokens and bigrams from the statistics and drop
    /// its token cache entry.
    pub fn remove_document(&self, tokens: &TokenService, body: &str, token_count: i64, hash: &str) {
        let ids = tokens.cached_ids(hash, body);
        self.update_document(&ids, token_count, -1);
        tokens.evict(hash);
    }

    /// Update DF/IDF for the tokens and bigrams of one document.
    /// `mode` is +1 for adding a document, -1 for removing one.
    fn update_document(&self, ids: &[u32], token_count: i64, mode: i32) {
        let mut state = self.state.write();

        if mode > 0 {
            state.n += 1;
            state.total_tokens += token_count;
        } else if mode < 0 {
            if state.n > 0 {
                state.n -= 1;
                if state.total_tokens >= token_count {
                    state.total_tokens -= token_count;
                } else {
                    state.total_tokens = 0;
                }
            } else {
                error!("attempted to remove document from IDF when N is 0");
            }
        }

        let n = state.n;
        let use_bm25 = self.use_bm25_idf;

        let mut seen_tokens = HashSet::with_capacity(ids.len());
        for &id in ids {
            if !seen_tokens.insert(id) {
                continue;
            }

            if mode > 0 {
                *state.df.entry(id).or_insert(0) += 1;
            } else if mode < 0 {
                match state.df.get_mut(&id) {
                    Some(df) if *df > 0 => *df -= 1,
                    _ => error!("attempted to remove non-existent token from IDF"),
                }
            }

            let df = state.df.get(&id).copied().unwrap_or(0);
            if df == 0 {
                state.df.remove(&id);
                state.idf.remove(&id);
                continue;
            }
            state.idf.insert(id, idf_weight(use_bm25, n, df));
        }

        let hashes = bigram_hashes(ids);
        let mut seen_ngrams = HashSet::with_capacity(hashes.len());
        for h in hashes {
            if !seen_ngrams.insert(h) {
                continue;
            }

            if mode > 0 {
                *state.ngram_df.entry(h).or_insert(0) += 1;
            } else if mode < 0 {
                match state.ngram_df.get_mut(&h) {
                    Some(df) if *df > 0 => *df -= 1,
                    _ => error!("attempted to remove non-existent ngram from IDF"),
                }
            }

            let df = state.ngram_df.get(&h).copied().unwrap_or(0);
            if df == 0 {
                state.ngram_df.remove(&h);
                state.ngram_idf.remove(&h);
                continue;
            }
            state.ngram_idf.insert(h, idf_weight(use_bm25, n, df));
        }

        state.dirty = true;
    }

    /// Replace the whole state (snapshot load).
    pub fn replace(&self, new_state: IdfState) {
        *self.state.write() = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;

    fn token_service() -> TokenService {
        TokenService::new(&TokenizerConfig {
            cache_size: 64,
            cache_ttl_secs: 0,
            reserve_percent: 0.0,
        })
        .unwrap()
    }

    fn doc(tokens: &TokenService, store: &IdfStore, body: &str, mode: i32) {
        let hash = crate::tokenize::sha512_hex(body);
        let count = tokens.count_with_reserve(body);
        if mode > 0 {
            store.add_document(tokens, body, count, &hash);
        } else {
            store.remove_document(tokens, body, count, &hash);
        }
    }

    #[test]
    fn test_add_then_remove_restores_state() {
        let tokens = token_service();
        let store = IdfStore::new(false);

        doc(&tokens, &store, "Языковые модели используются в NLP", 1);
        let before = store.read().clone();

        doc(&tokens, &store, "дополнительный документ о кроликах", 1);
        doc(&tokens, &store, "дополнительный документ о кроликах", -1);

        let after = store.read();
        assert_eq!(after.n, before.n);
        assert_eq!(after.total_tokens, before.total_tokens);
        assert_eq!(after.df, before.df);
        assert_eq!(after.ngram_df, before.ngram_df);
    }

    #[test]
    fn test_idf_matches_formula_after_updates() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        doc(&tokens, &store, "alpha beta gamma", 1);
        doc(&tokens, &store, "alpha delta epsilon", 1);
        doc(&tokens, &store, "beta zeta", 1);

        let state = store.read();
        for (id, df) in &state.df {
            assert!(*df <= state.n, "DF[{}] exceeds N", id);
            let expected = idf_weight(false, state.n, *df);
            let actual = state.idf.get(id).copied().unwrap();
            assert!((actual - expected).abs() < 1e-12);
        }
        for (h, df) in &state.ngram_df {
            let expected = idf_weight(false, state.n, *df);
            let actual = state.ngram_idf.get(h).copied().unwrap();
            assert!((actual - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_counts_are_pruned() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        doc(&tokens, &store, "solitary document", 1);
        doc(&tokens, &store, "solitary document", -1);

        let state = store.read();
        assert!(state.df.is_empty());
        assert!(state.idf.is_empty());
        assert!(state.ngram_df.is_empty());
        assert!(state.ngram_idf.is_empty());
        assert_eq!(state.n, 0);
        assert_eq!(state.total_tokens, 0);
    }

    #[test]
    fn test_remove_from_empty_store_clamps() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        doc(&tokens, &store, "never added", -1);

        let state = store.read();
        assert_eq!(state.n, 0);
        assert_eq!(state.total_tokens, 0);
        assert!(state.df.is_empty());
    }

    #[test]
    fn test_empty_corpus_has_zero_idf() {
        assert_eq!(idf_weight(false, 0, 0), 0.0);
        assert_eq!(idf_weight(true, 0, 0), 0.0);
    }

    #[test]
    fn test_bm25_idf_formula() {
        let w = idf_weight(true, 10, 2);
        assert!((w - ((10.0 - 2.0 + 0.5) / 2.5f64).ln_1p()).abs() < 1e-12);
        let legacy = idf_weight(false, 10, 2);
        assert!((legacy - (10.0 / 3.0f64).ln_1p()).abs() < 1e-12);
    }

    #[test]
    fn test_mutation_sets_dirty() {
        let tokens = token_service();
        let store = IdfStore::new(false);
        assert!(!store.read().dirty);
        doc(&tokens, &store, "dirty marker", 1);
        assert!(store.read().dirty);
    }
}

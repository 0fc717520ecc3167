//! Feature extraction for retrieval candidates
//!
//! Ten scalar features, each clamped to [0,1]. Cheap features are filled at
//! retrieval time from the search hit alone; expensive features need token
//! ids and the IDF statistics and are filled during rerank.

use crate::config::RerankConfig;
use crate::idf::{idf_weight, IdfState};
use crate::tokenize::TokenService;
use crate::vector_db::models::{Candidate, Payload};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use twox_hash::XxHash64;

pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Adaptive normalization bound: 0.75 of the token count, clamped to the
/// configured [min, max] range.
pub fn adaptive_max_tokens_normalization(token_count: i64, config: &RerankConfig) -> f64 {
    let mut norm = ((token_count as f64) * 0.75) as i64;
    if norm < config.min_tokens_normalization {
        norm = config.min_tokens_normalization;
    }
    if norm > config.max_tokens_normalization {
        norm = config.max_tokens_normalization;
    }
    norm as f64
}

/// `log(1+n) / log(1+N_adaptive)`
pub fn body_len_norm(token_count: i64, config: &RerankConfig) -> f64 {
    let v = (1.0 + token_count as f64).ln();
    clamp01(v / (1.0 + adaptive_max_tokens_normalization(token_count, config)).ln())
}

/// Zero for a blank body, otherwise the body-length feature.
pub fn payload_quality(payload: &Payload, config: &RerankConfig) -> f64 {
    if payload.body.trim().is_empty() {
        return 0.0;
    }
    body_len_norm(payload.token_count, config)
}

/// `exp(-age_days / tau)`; the timestamp is UnixNano as floating point and
/// future dates clamp to age zero.
pub fn time_decay(timestamp: f64, tau_days: f64) -> f64 {
    let now_nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX) as f64;
    let age_days = ((now_nanos - timestamp) / 1e9 / 86_400.0).max(0.0);
    clamp01((-age_days / tau_days).exp())
}

/// Unique token ids in first-seen order.
pub fn unique_ids(ids: &[u32]) -> Vec<u32> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Per-token term frequencies over the full (non-unique) sequence.
pub fn term_freq(ids: &[u32]) -> HashMap<u32, i64> {
    let mut tf = HashMap::with_capacity(ids.len());
    for &id in ids {
        *tf.entry(id).or_insert(0) += 1;
    }
    tf
}

/// Truncate the unique query ids to the configured budget. When cutting to
/// the budget would drop fewer than half of them, cut to half instead.
pub fn truncate_query_ids(mut unique: Vec<u32>, max_query_tokens: usize) -> Vec<u32> {
    let n = unique.len();
    if n <= max_query_tokens {
        return unique;
    }
    let mut keep = max_query_tokens;
    if n - max_query_tokens < n / 2 {
        keep = n / 2;
    }
    unique.truncate(keep);
    unique
}

/// 64-bit fingerprint of one token pair: XXH64 over the little-endian
/// u32 bytes of both ids. The family must stay fixed across process
/// lifetimes or persisted bigram statistics become invalid.
pub fn bigram_hash(a: u32, b: u32) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(&a.to_le_bytes());
    h.write(&b.to_le_bytes());
    h.finish()
}

/// Fingerprints for every adjacent pair in the ordered token sequence.
pub fn bigram_hashes(ids: &[u32]) -> Vec<u64> {
    if ids.len() < 2 {
        return Vec::new();
    }
    ids.windows(2).map(|w| bigram_hash(w[0], w[1])).collect()
}

/// `|unique_q ∩ unique_d| / |unique_q|`
pub fn keyword_overlap(q_unique: &[u32], doc_unique: &[u32]) -> f64 {
    if q_unique.is_empty() {
        return 0.0;
    }
    let doc_set: HashSet<u32> = doc_unique.iter().copied().collect();
    let hits = q_unique.iter().filter(|id| doc_set.contains(id)).count();
    clamp01(hits as f64 / q_unique.len() as f64)
}

/// IDF-weighted overlap; unknown tokens fall back to `fallback_weight`.
pub fn weighted_keyword_overlap(
    q_unique: &[u32],
    doc_unique: &[u32],
    idf: &HashMap<u32, f64>,
    fallback_weight: f64,
) -> f64 {
    let doc_set: HashSet<u32> = doc_unique.iter().copied().collect();
    let mut sum_found = 0.0;
    let mut sum_total = 0.0;
    for id in q_unique {
        let w = idf.get(id).copied().unwrap_or(fallback_weight);
        sum_total += w;
        if doc_set.contains(id) {
            sum_found += w;
        }
    }
    if sum_total == 0.0 {
        return 0.0;
    }
    clamp01(sum_found / sum_total)
}

/// Unique-bigram intersection over the deduplicated query bigrams.
pub fn ngram_overlap(q_hashes: &[u64], d_hashes: &[u64]) -> f64 {
    if q_hashes.is_empty() {
        return 0.0;
    }
    let d_set: HashSet<u64> = d_hashes.iter().copied().collect();
    let mut seen = HashSet::with_capacity(q_hashes.len());
    let mut hits = 0usize;
    let mut total = 0usize;
    for h in q_hashes {
        if !seen.insert(*h) {
            continue;
        }
        total += 1;
        if d_set.contains(h) {
            hits += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    clamp01(hits as f64 / total as f64)
}

/// IDF-weighted bigram overlap with a fallback weight for unseen bigrams.
pub fn weighted_ngram_overlap(
    q_hashes: &[u64],
    d_hashes: &[u64],
    ngram_idf: &HashMap<u64, f64>,
    fallback: f64,
) -> f64 {
    if q_hashes.is_empty() {
        return 0.0;
    }
    let d_set: HashSet<u64> = d_hashes.iter().copied().collect();
    let mut seen = HashSet::with_capacity(q_hashes.len());
    let mut sum_found = 0.0;
    let mut sum_total = 0.0;
    for h in q_hashes {
        if !seen.insert(*h) {
            continue;
        }
        let w = ngram_idf.get(h).copied().unwrap_or(fallback);
        sum_total += w;
        if d_set.contains(h) {
            sum_found += w;
        }
    }
    if sum_total == 0.0 {
        return 0.0;
    }
    clamp01(sum_found / sum_total)
}

/// Okapi BM25 over the query terms and one document's term frequencies.
/// Stored IDF weights are preferred; a missing weight is recomputed from
/// the current DF with the configured formula.
pub fn bm25_score(
    q_unique: &[u32],
    doc_tf: &HashMap<u32, i64>,
    doc_len: i64,
    idf_state: &IdfState,
    use_bm25_idf: bool,
    config: &RerankConfig,
    avgdl: f64,
) -> f64 {
    if q_unique.is_empty() || doc_tf.is_empty() {
        return 0.0;
    }
    let k1 = config.bm25.k1;
    let b = config.bm25.b;
    let avgdl = if avgdl <= 0.0 { 1.0 } else { avgdl };

    let mut score = 0.0;
    for q in q_unique {
        let f = doc_tf.get(q).copied().unwrap_or(0) as f64;
        if f == 0.0 {
            continue;
        }

        let mut idf = idf_state.idf.get(q).copied().unwrap_or(0.0);
        if idf == 0.0 {
            let df = idf_state.df.get(q).copied().unwrap_or(0);
            idf = idf_weight(use_bm25_idf, idf_state.n, df);
        }

        let denom = f + k1 * (1.0 - b + b * (doc_len as f64 / avgdl));
        score += idf * (f * (k1 + 1.0)) / denom;
    }
    score
}

/// Map a raw BM25 score into [0,1] with the configured normalization.
pub fn normalize_bm25(score: f64, config: &RerankConfig) -> f64 {
    if config.bm25.use_log_norm {
        return clamp01(score.ln_1p() / config.bm25.log_norm_scale.ln_1p());
    }
    clamp01(1.0 / (1.0 + (-config.bm25.norm_slope * (score - config.bm25.norm_midpoint)).exp()))
}

/// Fill the expensive features of one candidate.
///
/// `q_unique` is the unique, possibly truncated query id sequence; `q_full`
/// is the raw query sequence (bigrams keep order); `doc_full` is the full
/// document sequence including repeats, required for BM25 term frequencies.
/// Empty inputs leave the features at their defaults.
pub fn update_candidate_features(
    q_unique: &[u32],
    q_full: &[u32],
    doc_full: &[u32],
    candidate: &mut Candidate,
    idf_state: &IdfState,
    use_bm25_idf: bool,
    config: &RerankConfig,
    tokens: &TokenService,
) {
    if q_unique.is_empty() || q_full.is_empty() || doc_full.is_empty() {
        return;
    }
    let doc_unique = unique_ids(doc_full);
    let doc_tf = term_freq(doc_full);

    candidate.features.keyword_overlap = keyword_overlap(q_unique, &doc_unique);
    candidate.features.weighted_overlap =
        weighted_keyword_overlap(q_unique, &doc_unique, &idf_state.idf, 1.0);

    // Document length: prefer the stored token count, fall back to the
    // reserve-adjusted length of the actual sequence.
    let mut doc_len = candidate.payload.token_count;
    if doc_len == 0 {
        doc_len = tokens.count_with_reserve_ids(doc_full);
    }

    let avgdl = if idf_state.n > 0 {
        idf_state.total_tokens as f64 / idf_state.n as f64
    } else {
        1.0
    };

    let raw_bm25 = bm25_score(
        q_unique,
        &doc_tf,
        doc_len,
        idf_state,
        use_bm25_idf,
        config,
        avgdl,
    );
    candidate.features.bm25 = normalize_bm25(raw_bm25, config);

    let q_bigrams = bigram_hashes(q_full);
    let d_bigrams = bigram_hashes(doc_full);
    candidate.features.ngram_overlap = ngram_overlap(&q_bigrams, &d_bigrams);
    candidate.features.weighted_ngram =
        weighted_ngram_overlap(&q_bigrams, &d_bigrams, &idf_state.ngram_idf, 1.0);
}

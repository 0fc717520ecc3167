//! Two-stage retrieval: vector search then feature rerank
//!
//! Stage A queries the vector store and fills the cheap features from the
//! hit alone. Stage B tokenizes, computes the expensive lexical features,
//! scores every candidate with the configured weight vector, applies the
//! score cutoff and keeps the top N.

use crate::app::AppContext;
use crate::error::Result;
use crate::features;
use crate::vector_db::models::{Candidate, Features, Payload};
use crate::vector_db::VectorDb;
use tracing::debug;

/// Final score: weighted sum over the fixed-order feature vector.
pub fn score_candidate(features: &Features, weights: &[f64]) -> f64 {
    debug_assert_eq!(weights.len(), 10);
    features
        .as_vector()
        .iter()
        .zip(weights)
        .map(|(f, w)| f * w)
        .sum()
}

/// Whether a raw similarity passes the metric-specific cutoff.
fn passes_cutoff(app: &AppContext, score: f32) -> bool {
    match app.config.vector_db.metric {
        crate::config::Metric::Cosine | crate::config::Metric::Dot => {
            score >= app.config.retrieval.cosine_min_score
        }
        crate::config::Metric::Euclid => score <= app.config.retrieval.euclid_max_distance,
    }
}

/// Stage A: similarity query plus cheap features.
pub async fn search_candidates(
    app: &AppContext,
    db: &VectorDb,
    query_vector: &[f32],
) -> Result<Vec<Candidate>> {
    let retrieval = &app.config.retrieval;
    debug!(
        roles = ?retrieval.sources,
        max_age_days = retrieval.max_age_days,
        top_k = retrieval.top_k,
        "searching relevant content"
    );

    let hits = db
        .search(
            query_vector,
            &retrieval.sources,
            retrieval.max_age_days,
            retrieval.top_k,
            retrieval.return_vectors,
        )
        .await?;

    let mut candidates = Vec::with_capacity(hits.len());
    for hit in hits {
        if !passes_cutoff(app, hit.score) {
            debug!(score = hit.score, "skipping hit below similarity cutoff");
            continue;
        }
        candidates.push(make_candidate(app, hit.score, hit.payload, hit.vector));
    }
    debug!(candidates = candidates.len(), "hits passed the similarity cutoff");
    Ok(candidates)
}

fn make_candidate(
    app: &AppContext,
    score: f32,
    payload: Payload,
    vector: Option<Vec<f64>>,
) -> Candidate {
    let rerank = &app.config.rerank;
    let mut candidate = Candidate {
        payload,
        embedding: vector,
        features: Features::default(),
        score: 0.0,
    };

    candidate.features.emb_sim = match app.config.vector_db.metric {
        // Euclid reports a distance; map it into a similarity
        crate::config::Metric::Euclid => 1.0 / (1.0 + f64::from(score).max(0.0)),
        _ => features::clamp01(f64::from(score)),
    };
    candidate.features.recency = features::time_decay(candidate.payload.timestamp, rerank.tau_days);
    candidate.features.role_score = features::clamp01(
        rerank
            .role_weights
            .get(&candidate.payload.role)
            .copied()
            .unwrap_or(0.0),
    );

    let mut token_count = candidate.payload.token_count;
    if token_count == 0 {
        token_count = app.tokens.count_with_reserve(&candidate.payload.body);
    }
    candidate.features.body_len = features::body_len_norm(token_count, rerank);
    candidate.features.payload_quality = features::payload_quality(&candidate.payload, rerank);

    candidate
}

/// Stage B: expensive features, weighted scoring, cutoff, ordering.
pub fn rerank(
    app: &AppContext,
    mut candidates: Vec<Candidate>,
    query_text: &str,
    query_hash: &str,
) -> Vec<Payload> {
    let rerank_cfg = &app.config.rerank;

    let q_full = app.tokens.cached_ids(query_hash, query_text);
    let q_unique = features::truncate_query_ids(
        features::unique_ids(&q_full),
        rerank_cfg.max_query_tokens,
    );

    {
        let idf_state = app.idf.read();
        for candidate in &mut candidates {
            let doc_full = app
                .tokens
                .cached_ids(&candidate.payload.hash, &candidate.payload.body);
            features::update_candidate_features(
                &q_unique,
                &q_full,
                &doc_full,
                candidate,
                &idf_state,
                app.idf.use_bm25_idf(),
                rerank_cfg,
                &app.tokens,
            );
        }
    }

    for candidate in &mut candidates {
        candidate.score = score_candidate(&candidate.features, &rerank_cfg.weights);
    }

    let mut filtered: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.score >= rerank_cfg.min_score)
        .collect();
    debug!(
        passed = filtered.len(),
        min_score = rerank_cfg.min_score,
        "candidates passed the rank cutoff"
    );

    filtered.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    if rerank_cfg.top_n > 0 && filtered.len() > rerank_cfg.top_n as usize {
        filtered.truncate(rerank_cfg.top_n as usize);
    }

    filtered.into_iter().map(|c| c.payload).collect()
}

/// The full retrieve-and-rerank pipeline.
pub async fn search_with_rerank(
    app: &AppContext,
    db: &VectorDb,
    query_vector: &[f32],
    query_text: &str,
    query_hash: &str,
) -> Result<Vec<Payload>> {
    let candidates = search_candidates(app, db, query_vector).await?;
    debug!(candidates = candidates.len(), "candidates before reranking");
    Ok(rerank(app, candidates, query_text, query_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_candidate_weighted_sum() {
        let features = Features {
            emb_sim: 1.0,
            recency: 0.5,
            ..Default::default()
        };
        let mut weights = vec![0.0; 10];
        weights[0] = 0.4;
        weights[1] = 0.2;
        let score = score_candidate(&features, &weights);
        assert!((score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_score_zero_features_is_zero() {
        let score = score_candidate(&Features::default(), &vec![1.0; 10]);
        assert_eq!(score, 0.0);
    }
}

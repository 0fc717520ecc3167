//! Data models shared by retrieval, packing and persistence

use serde::{Deserialize, Serialize};

/// Role carried by a stored user turn
pub const ROLE_USER: &str = "rag-user";
/// Role carried by a stored assistant turn
pub const ROLE_ASSISTANT: &str = "rag-assistant";
/// Role carried by a stored file attachment
pub const ROLE_FILE: &str = "rag-file";

/// File identity attached to a stored payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileMeta {
    /// Stable id derived from the path basename
    pub id: String,

    /// Full path as supplied by the client
    pub path: String,
}

/// The unit stored in the vector DB and returned by retrieval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    /// Grouping id linking a user turn to its assistant turn
    pub packet_id: String,

    /// Creation time, UnixNano as floating point
    pub timestamp: f64,

    /// One of the `ROLE_*` values
    pub role: String,

    /// Raw text
    pub body: String,

    /// Token count with the reserve percentage applied
    pub token_count: i64,

    /// SHA-512 hex of the body
    pub hash: String,

    /// File identity; empty for conversation turns
    #[serde(default)]
    pub file_meta: FileMeta,
}

/// Feature vector for candidate scoring; every value lies in [0,1].
/// Field order matches the configured weight vector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Features {
    // Cheap features, filled at retrieval time
    pub emb_sim: f64,
    pub recency: f64,
    pub role_score: f64,
    pub body_len: f64,
    pub payload_quality: f64,
    // Expensive features, filled at rerank time
    pub keyword_overlap: f64,
    pub weighted_overlap: f64,
    pub bm25: f64,
    pub ngram_overlap: f64,
    pub weighted_ngram: f64,
}

impl Features {
    /// The features as a fixed-order vector for the linear combination.
    pub fn as_vector(&self) -> [f64; 10] {
        [
            self.emb_sim,
            self.recency,
            self.role_score,
            self.body_len,
            self.payload_quality,
            self.keyword_overlap,
            self.weighted_overlap,
            self.bm25,
            self.ngram_overlap,
            self.weighted_ngram,
        ]
    }
}

/// A retrieval hit enriched with its feature vector and final score
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub payload: Payload,
    pub embedding: Option<Vec<f64>>,
    pub features: Features,
    pub score: f64,
}

/// A file attachment extracted from the inbound request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    /// Basename of the path; identifies the attachment across runs
    pub id: String,

    pub path: String,

    pub body: String,

    /// SHA-512 hex of the body
    pub hash: String,
}

/// One planned attachment insert or replacement
#[derive(Debug, Clone)]
pub struct AttachmentReplacement {
    pub attachment: Attachment,

    /// Point id being replaced; `None` for fresh inserts
    pub old_point_id: Option<String>,

    /// Hash of the stored body being replaced
    pub old_hash: String,

    /// Stored token count of the body being replaced
    pub old_token_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_vector_order() {
        let features = Features {
            emb_sim: 0.1,
            recency: 0.2,
            role_score: 0.3,
            body_len: 0.4,
            payload_quality: 0.5,
            keyword_overlap: 0.6,
            weighted_overlap: 0.7,
            bm25: 0.8,
            ngram_overlap: 0.9,
            weighted_ngram: 1.0,
        };
        let v = features.as_vector();
        assert_eq!(v[0], 0.1);
        assert_eq!(v[4], 0.5);
        assert_eq!(v[9], 1.0);
    }
}

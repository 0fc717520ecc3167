//! Vector store integration
//!
//! The store is an external collaborator reached over its wire API. Every
//! operation opens a fresh connection which is closed on all exit paths.

pub mod client;
pub mod models;

pub use client::{flush_collection, VectorDb};
pub use models::{
    Attachment, AttachmentReplacement, Candidate, Features, FileMeta, Payload, ROLE_ASSISTANT,
    ROLE_FILE, ROLE_USER,
};

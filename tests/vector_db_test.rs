//! Vector store integration tests
//!
//! These tests require a running Qdrant instance:
//! `docker run -p 6333:6333 -p 6334:6334 qdrant/qdrant`
//! Run with: `cargo test --test vector_db_test -- --ignored`

mod common;

use rag_proxy::tokenize::sha512_hex;
use rag_proxy::vector_db::models::{Attachment, FileMeta};
use rag_proxy::vector_db::{flush_collection, VectorDb};
use uuid::Uuid;

fn test_db(collection: &str, vector_size: usize) -> VectorDb {
    let mut config = common::test_config().vector_db;
    config.collection = collection.to_string();
    config.vector_size = vector_size;
    VectorDb::new(config)
}

fn attachment(id: &str, body: &str) -> Attachment {
    Attachment {
        id: id.to_string(),
        path: format!("/tmp/{id}"),
        body: body.to_string(),
        hash: sha512_hex(body),
    }
}

#[tokio::test]
#[ignore] // requires Qdrant
async fn attachment_replacement_reuses_the_old_point() {
    let collection = "ragproxy_test_attachments";
    let db = test_db(collection, 4);
    let _ = flush_collection("localhost", 6334, collection).await;
    db.ensure_collection().await.unwrap();

    // first request: the attachment is unknown, so it plans as an insert
    let first = attachment("readme.md", "original body");
    let (to_insert, to_replace) = db.plan_attachment_sync(&[first.clone()]).await.unwrap();
    assert_eq!(to_insert.len(), 1);
    assert!(to_replace.is_empty());

    let point_id = Uuid::new_v4().to_string();
    db.upsert_point(
        &first.body,
        &[0.1, 0.2, 0.3, 0.4],
        "rag-file",
        10,
        &first.hash,
        "packet-1",
        Some(&FileMeta {
            id: first.id.clone(),
            path: first.path.clone(),
        }),
        &point_id,
    )
    .await
    .unwrap();

    // second request: same id, different body, plans as a replacement of
    // exactly the stored point
    let second = attachment("readme.md", "changed body");
    let (to_insert, to_replace) = db.plan_attachment_sync(&[second.clone()]).await.unwrap();
    assert!(to_insert.is_empty());
    assert_eq!(to_replace.len(), 1);
    assert_eq!(to_replace[0].old_point_id.as_deref(), Some(point_id.as_str()));
    assert_eq!(to_replace[0].old_hash, first.hash);

    let old_body = db.get_point_body(&point_id).await.unwrap();
    assert_eq!(old_body, "original body");

    // unchanged content never triggers replacement
    let (to_insert, to_replace) = db.plan_attachment_sync(&[first]).await.unwrap();
    assert!(to_insert.is_empty());
    assert!(to_replace.is_empty());

    let _ = flush_collection("localhost", 6334, collection).await;
}

#[tokio::test]
#[ignore] // requires Qdrant
async fn collection_schema_mismatch_is_fatal() {
    let collection = "ragproxy_test_mismatch";
    let _ = flush_collection("localhost", 6334, collection).await;

    let creator = test_db(collection, 768);
    creator.ensure_collection().await.unwrap();

    // the config now claims a different dimension
    let checker = test_db(collection, 1024);
    let err = checker.ensure_collection().await.unwrap_err();
    assert!(err.to_string().contains("mismatch"));

    // the collection itself was not mutated
    creator.ensure_collection().await.unwrap();
    let _ = flush_collection("localhost", 6334, collection).await;
}

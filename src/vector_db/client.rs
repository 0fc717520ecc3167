//! Qdrant client
//!
//! Every public operation builds a fresh client, runs, and drops the
//! connection on all exit paths. The collection schema (dimension and
//! metric) is verified at startup; a mismatch is fatal and the log names
//! the exact flush command the operator must run.

use super::models::{Attachment, AttachmentReplacement, FileMeta, Payload};
use crate::config::{Metric, VectorDbConfig};
use crate::error::{Result, VectorDbError};
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfigKind;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, FieldType, Filter,
    GetPointsBuilder, PointId, PointStruct, Range, ScrollPointsBuilder, SearchPoints, Struct,
    Value, VectorParamsBuilder, VectorsConfig, WithPayloadSelector, WithVectorsSelector,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, error, info};

/// First-stage result limit when `retrieval.top_k` is unset
const UNBOUNDED_TOP_K: u64 = 100_000;

/// One raw search hit before feature extraction
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub payload: Payload,
    pub vector: Option<Vec<f64>>,
}

/// Existing point located during attachment reconciliation
#[derive(Debug, Clone)]
struct ExistingAttachment {
    point_id: String,
    hash: String,
    token_count: i64,
}

/// Vector store handle; holds configuration only, never a live connection
pub struct VectorDb {
    config: VectorDbConfig,
}

impl VectorDb {
    pub fn new(config: VectorDbConfig) -> Self {
        Self { config }
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    fn connect(&self) -> Result<Qdrant> {
        let url = format!("http://{}:{}", self.config.host, self.config.port);
        let mut builder = Qdrant::from_url(&url);
        if self.config.keep_alive_secs > 0 {
            builder = builder.keep_alive_while_idle();
        }
        builder
            .build()
            .map_err(|e| VectorDbError::ConnectionError(e.to_string()).into())
    }

    fn distance(&self) -> qdrant_client::qdrant::Distance {
        match self.config.metric {
            Metric::Cosine => qdrant_client::qdrant::Distance::Cosine,
            Metric::Euclid => qdrant_client::qdrant::Distance::Euclid,
            Metric::Dot => qdrant_client::qdrant::Distance::Dot,
        }
    }

    /// Verify or create the collection, then make sure the `hash` keyword
    /// index exists. The index call is idempotent and re-issued on every
    /// startup so a crash between collection and index creation heals.
    pub async fn ensure_collection(&self) -> Result<()> {
        let client = self.connect()?;
        let collection = self.config.collection.clone();
        let distance = self.distance();

        let exists = client
            .collection_exists(&collection)
            .await
            .map_err(|e| VectorDbError::ConnectionError(e.to_string()))?;

        if exists {
            let info = client
                .collection_info(&collection)
                .await
                .map_err(|e| VectorDbError::ConnectionError(e.to_string()))?;

            let params = info
                .result
                .and_then(|r| r.config)
                .and_then(|c| c.params)
                .and_then(|p| p.vectors_config)
                .and_then(|v| v.config)
                .and_then(|c| match c {
                    VectorsConfigKind::Params(params) => Some(params),
                    _ => None,
                })
                .ok_or_else(|| {
                    VectorDbError::SchemaMismatch(format!(
                        "collection '{}' has no vector params",
                        collection
                    ))
                })?;

            if params.size != self.config.vector_size as u64 || params.distance() != distance {
                error!(
                    "collection '{}' config mismatch: expected size={}, distance={}; got size={}, distance={:?}. \
                     Run: ragproxy --flush-db --qhost {} --qport {} --qcollection {} to WIPE ALL DATA in the collection, \
                     then restart the service to initialize it with the configured metric and vector size, \
                     or change the config to match the existing collection",
                    collection,
                    self.config.vector_size,
                    self.config.metric.as_str(),
                    params.size,
                    params.distance(),
                    self.config.host,
                    self.config.port,
                    collection,
                );
                return Err(VectorDbError::SchemaMismatch(format!(
                    "collection '{}': expected size={} distance={}, got size={} distance={:?}",
                    collection,
                    self.config.vector_size,
                    self.config.metric.as_str(),
                    params.size,
                    params.distance(),
                ))
                .into());
            }

            info!(
                "using existing collection '{}' with {}-dim vectors, {} distance",
                collection,
                self.config.vector_size,
                self.config.metric.as_str()
            );
        } else {
            let vector_params =
                VectorParamsBuilder::new(self.config.vector_size as u64, distance).build();
            client
                .create_collection(
                    CreateCollectionBuilder::new(&collection).vectors_config(VectorsConfig {
                        config: Some(VectorsConfigKind::Params(vector_params)),
                    }),
                )
                .await
                .map_err(|e| VectorDbError::ConnectionError(e.to_string()))?;
            info!(
                "created collection '{}' with {}-dim vectors, {} distance",
                collection,
                self.config.vector_size,
                self.config.metric.as_str()
            );
        }

        client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(&collection, "hash", FieldType::Keyword)
                    .wait(true),
            )
            .await
            .map_err(|e| VectorDbError::IndexError(e.to_string()))?;
        debug!("index on 'hash' field ensured");

        Ok(())
    }

    /// Vector similarity query with the role and age filter applied.
    pub async fn search(
        &self,
        query_vector: &[f32],
        roles: &[String],
        max_age_days: i64,
        top_k: i64,
        with_vectors: bool,
    ) -> Result<Vec<SearchHit>> {
        let client = self.connect()?;

        let mut conditions = vec![Condition::matches("role", roles.to_vec())];
        if max_age_days > 0 {
            let min_ts = (chrono::Utc::now()
                - chrono::Duration::days(max_age_days))
            .timestamp_nanos_opt()
            .unwrap_or(0) as f64;
            conditions.push(Condition::range(
                "timestamp",
                Range {
                    gte: Some(min_ts),
                    ..Default::default()
                },
            ));
        }

        let limit = if top_k > 0 { top_k as u64 } else { UNBOUNDED_TOP_K };

        let response = client
            .search_points(SearchPoints {
                collection_name: self.config.collection.clone(),
                vector: query_vector.to_vec(),
                limit,
                filter: Some(Filter {
                    must: conditions,
                    ..Default::default()
                }),
                with_payload: Some(WithPayloadSelector::from(true)),
                with_vectors: Some(WithVectorsSelector::from(with_vectors)),
                ..Default::default()
            })
            .await
            .map_err(|e| VectorDbError::SearchError(e.to_string()))?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let payload = parse_payload(&point.payload);
            let vector = if with_vectors {
                point.vectors.and_then(|v| match v.vectors_options {
                    Some(qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(vec)) => {
                        Some(vec.data.iter().map(|x| *x as f64).collect())
                    }
                    _ => None,
                })
            } else {
                None
            };
            hits.push(SearchHit {
                score: point.score,
                payload,
                vector,
            });
        }
        debug!(hits = hits.len(), "vector search returned");
        Ok(hits)
    }

    /// Fetch the stored body of a point.
    pub async fn get_point_body(&self, point_id: &str) -> Result<String> {
        let client = self.connect()?;
        let response = client
            .get_points(
                GetPointsBuilder::new(
                    &self.config.collection,
                    vec![PointId::from(point_id.to_string())],
                )
                .with_payload(true)
                .with_vectors(false),
            )
            .await
            .map_err(|e| VectorDbError::SearchError(e.to_string()))?;

        let point = response
            .result
            .first()
            .ok_or_else(|| VectorDbError::PointNotFound(point_id.to_string()))?;
        Ok(get_string(&point.payload, "body").unwrap_or_default())
    }

    /// Plan which attachments to insert fresh and which to replace in
    /// place. Attachments are identified by `file_meta.id`; a changed hash
    /// means replacement.
    pub async fn plan_attachment_sync(
        &self,
        attachments: &[Attachment],
    ) -> Result<(Vec<AttachmentReplacement>, Vec<AttachmentReplacement>)> {
        let client = self.connect()?;

        let mut order: Vec<&str> = Vec::with_capacity(attachments.len());
        let mut latest: HashMap<&str, &Attachment> = HashMap::with_capacity(attachments.len());
        for att in attachments {
            if att.id.is_empty() {
                continue;
            }
            if !latest.contains_key(att.id.as_str()) {
                order.push(&att.id);
            }
            latest.insert(&att.id, att);
        }
        if order.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut existing: HashMap<String, ExistingAttachment> = HashMap::with_capacity(order.len());
        for chunk in order.chunks(256) {
            let ids: Vec<String> = chunk.iter().map(|s| s.to_string()).collect();
            let filter = Filter {
                must: vec![Condition::matches("file_meta.id", ids)],
                ..Default::default()
            };

            let response = client
                .scroll(
                    ScrollPointsBuilder::new(&self.config.collection)
                        .filter(filter)
                        .limit(chunk.len() as u32)
                        .with_payload(true)
                        .with_vectors(false),
                )
                .await
                .map_err(|e| VectorDbError::ScrollError(e.to_string()))?;

            for point in response.result {
                let id = get_struct_field(&point.payload, "file_meta", "id").unwrap_or_default();
                if id.is_empty() {
                    continue;
                }
                let point_id = match point.id.and_then(|p| p.point_id_options) {
                    Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(uuid)) => uuid,
                    Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(num)) => {
                        num.to_string()
                    }
                    None => continue,
                };
                existing.insert(
                    id,
                    ExistingAttachment {
                        point_id,
                        hash: get_string(&point.payload, "hash").unwrap_or_default(),
                        token_count: get_integer(&point.payload, "token_count").unwrap_or(0),
                    },
                );
            }
        }

        let mut to_insert = Vec::new();
        let mut to_replace = Vec::new();
        for id in order {
            let att = latest[id];
            match existing.get(id) {
                None => to_insert.push(AttachmentReplacement {
                    attachment: att.clone(),
                    old_point_id: None,
                    old_hash: String::new(),
                    old_token_count: 0,
                }),
                Some(info) if info.hash != att.hash => to_replace.push(AttachmentReplacement {
                    attachment: att.clone(),
                    old_point_id: Some(info.point_id.clone()),
                    old_hash: info.hash.clone(),
                    old_token_count: info.token_count,
                }),
                Some(_) => {} // unchanged content never triggers replacement
            }
        }

        Ok((to_insert, to_replace))
    }

    /// Upsert one point with the fixed payload schema.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_point(
        &self,
        body: &str,
        vector: &[f32],
        role: &str,
        token_count: i64,
        hash: &str,
        packet_id: &str,
        file_meta: Option<&FileMeta>,
        point_id: &str,
    ) -> Result<()> {
        let client = self.connect()?;
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as f64;

        let meta = file_meta.cloned().unwrap_or_default();
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), Value::from(meta.id));
        fields.insert("path".to_string(), Value::from(meta.path));

        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("packet_id".to_string(), Value::from(packet_id.to_string()));
        payload.insert("timestamp".to_string(), Value::from(timestamp));
        payload.insert("role".to_string(), Value::from(role.to_string()));
        payload.insert("body".to_string(), Value::from(body.to_string()));
        payload.insert("token_count".to_string(), Value::from(token_count));
        payload.insert("hash".to_string(), Value::from(hash.to_string()));
        payload.insert(
            "file_meta".to_string(),
            Value {
                kind: Some(Kind::StructValue(Struct { fields })),
            },
        );

        debug!(
            point_id = %point_id,
            packet_id = %packet_id,
            role = %role,
            token_count,
            vector_len = vector.len(),
            "upserting point"
        );

        client
            .upsert_points(qdrant_client::qdrant::UpsertPointsBuilder::new(
                &self.config.collection,
                vec![PointStruct::new(
                    point_id.to_string(),
                    vector.to_vec(),
                    payload,
                )],
            ))
            .await
            .map_err(|e| VectorDbError::UpsertError(e.to_string()))?;
        Ok(())
    }
}

/// Delete a collection; used by the one-shot `--flush-db` command.
pub async fn flush_collection(host: &str, port: u16, collection: &str) -> Result<()> {
    let client = Qdrant::from_url(&format!("http://{}:{}", host, port))
        .build()
        .map_err(|e| VectorDbError::ConnectionError(e.to_string()))?;
    client
        .delete_collection(collection)
        .await
        .map_err(|e| VectorDbError::DeleteError(e.to_string()))?;
    Ok(())
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    })
}

fn get_double(payload: &HashMap<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(Kind::DoubleValue(d)) => Some(*d),
        Some(Kind::IntegerValue(i)) => Some(*i as f64),
        _ => None,
    })
}

fn get_integer(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(Kind::IntegerValue(i)) => Some(*i),
        Some(Kind::DoubleValue(d)) => Some(*d as i64),
        _ => None,
    })
}

fn get_struct_field(payload: &HashMap<String, Value>, key: &str, field: &str) -> Option<String> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(Kind::StructValue(s)) => s.fields.get(field).and_then(|f| match &f.kind {
            Some(Kind::StringValue(v)) => Some(v.clone()),
            _ => None,
        }),
        _ => None,
    })
}

/// Populate a Payload from a point's payload map; absent fields keep their
/// defaults.
fn parse_payload(payload: &HashMap<String, Value>) -> Payload {
    Payload {
        packet_id: get_string(payload, "packet_id").unwrap_or_default(),
        timestamp: get_double(payload, "timestamp").unwrap_or(0.0),
        role: get_string(payload, "role").unwrap_or_default(),
        body: get_string(payload, "body").unwrap_or_default(),
        token_count: get_integer(payload, "token_count").unwrap_or(0),
        hash: get_string(payload, "hash").unwrap_or_default(),
        file_meta: FileMeta {
            id: get_struct_field(payload, "file_meta", "id").unwrap_or_default(),
            path: get_struct_field(payload, "file_meta", "path").unwrap_or_default(),
        },
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
    Distance, FieldType, Filter, HnswConfigDiff, PointStruct, Query, QueryPointsBuilder,
    ScrollPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use uuid::Uuid;

use crate::config::Settings;
use crate::embedding::EmbeddingClient;
use crate::error::{IndexError, Result};
use crate::types::{Document, DocumentMeta};
use crate::vector_store::{collection_name, VectorStore};

const SCROLL_PAGE: u32 = 100;

/// Native vector DB adapter. Qdrant points carry only id, vector and
/// payload, so the segment content travels inside the payload meta.
pub struct QdrantStore {
    client: Qdrant,
    embedding_model: String,
    embedder: Arc<dyn EmbeddingClient>,
    collection_name: Option<String>,
}

impl QdrantStore {
    pub fn connect(settings: &Settings, embedder: Arc<dyn EmbeddingClient>) -> Result<Self> {
        let qdrant = settings
            .vector
            .qdrant
            .as_ref()
            .ok_or_else(|| IndexError::Config("vector.qdrant is missing".into()))?;
        let client = Qdrant::from_url(&qdrant.url).build()?;
        Ok(Self {
            client,
            embedding_model: settings.vector.embedding_model.clone(),
            embedder,
            collection_name: None,
        })
    }

    fn collection(&self) -> Result<&str> {
        self.collection_name
            .as_deref()
            .ok_or_else(|| IndexError::VectorStore("store is not initialized".into()))
    }

    fn repo_filter(repo_id: Uuid, file_ids: Option<&[Uuid]>) -> Filter {
        let mut conditions = vec![Condition::matches("repo_id", repo_id.to_string())];
        if let Some(file_ids) = file_ids {
            let ids: Vec<String> = file_ids.iter().map(Uuid::to_string).collect();
            conditions.push(Condition::matches("file_id", ids));
        }
        Filter::must(conditions)
    }

    fn point_of(doc: &Document) -> Result<PointStruct> {
        // Content is transported through the payload; score never persists.
        let mut meta = doc.meta.clone();
        meta.score = None;
        meta.content = doc.content.clone();
        let value =
            serde_json::to_value(&meta).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        let payload =
            Payload::try_from(value).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        Ok(PointStruct::new(
            doc.meta.segment_id.to_string(),
            doc.vector.clone(),
            payload,
        ))
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn init(&mut self) -> Result<()> {
        let dimension = self.embedder.dimension().await?;
        let name = collection_name(&self.embedding_model, dimension);

        if !self.client.collection_exists(&name).await? {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(name.clone())
                        .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine))
                        .hnsw_config(HnswConfigDiff {
                            m: Some(0),
                            payload_m: Some(16),
                            ef_construct: Some(100),
                            full_scan_threshold: Some(10_000),
                            max_indexing_threads: Some(0),
                            on_disk: Some(false),
                            ..Default::default()
                        }),
                )
                .await?;
            for field in ["repo_id", "file_id"] {
                self.client
                    .create_field_index(CreateFieldIndexCollectionBuilder::new(
                        name.clone(),
                        field,
                        FieldType::Keyword,
                    ))
                    .await?;
            }
        }

        self.collection_name = Some(name);
        Ok(())
    }

    async fn create(&self, documents: &[Document]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let collection = self.collection()?;
        let points: Vec<PointStruct> = documents
            .iter()
            .map(Self::point_of)
            .collect::<Result<_>>()?;
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points))
            .await?;
        Ok(())
    }

    async fn upsert(&self, documents: &[Document]) -> Result<()> {
        let Some(first) = documents.first() else {
            return Ok(());
        };
        let repo_id = first.meta.repo_id;
        let file_ids: Vec<Uuid> = documents
            .iter()
            .map(|d| d.meta.file_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        // No transaction on this engine: sequential delete + insert, safe to
        // re-run because both steps are idempotent by file_id.
        self.delete(repo_id, &file_ids).await?;
        self.create(documents).await
    }

    async fn all_meta(&self, repo_id: Uuid) -> Result<Vec<DocumentMeta>> {
        let collection = self.collection()?;
        let filter = Self::repo_filter(repo_id, None);

        let mut metas = Vec::new();
        let mut offset = None;
        loop {
            let mut scroll = ScrollPointsBuilder::new(collection)
                .filter(filter.clone())
                .limit(SCROLL_PAGE)
                .with_payload(true);
            if let Some(offset_id) = offset {
                scroll = scroll.offset(offset_id);
            }
            let response = self.client.scroll(scroll).await?;
            for point in response.result {
                metas.push(meta_from_payload(point.payload)?);
            }
            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(metas)
    }

    async fn drop_repo(&self, repo_id: Uuid) -> Result<()> {
        let collection = self.collection()?;
        if !self.client.collection_exists(collection).await? {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection).points(Self::repo_filter(repo_id, None)),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, repo_id: Uuid, file_ids: &[Uuid]) -> Result<()> {
        let collection = self.collection()?;
        if !self.client.collection_exists(collection).await? {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(Self::repo_filter(repo_id, Some(file_ids))),
            )
            .await?;
        Ok(())
    }

    async fn search_by_vector(
        &self,
        repo_id: Uuid,
        file_ids: Option<&[Uuid]>,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<Document>> {
        let collection = self.collection()?;
        let response = self
            .client
            .query(
                QueryPointsBuilder::new(collection)
                    .query(Query::new_nearest(query_vector.to_vec()))
                    .filter(Self::repo_filter(repo_id, file_ids))
                    .limit(top_k as u64)
                    .with_payload(true)
                    .score_threshold(score_threshold),
            )
            .await?;

        let mut documents = Vec::with_capacity(response.result.len());
        for point in response.result {
            let mut meta = meta_from_payload(point.payload)?;
            meta.score = Some(point.score);
            documents.push(Document {
                vector: Vec::new(),
                content: meta.content.clone(),
                meta,
            });
        }
        Ok(documents)
    }
}

fn meta_from_payload(
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> Result<DocumentMeta> {
    let mut map = serde_json::Map::with_capacity(payload.len());
    for (key, value) in payload {
        map.insert(key, qdrant_value_to_json(value));
    }
    serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| IndexError::VectorStore(e.to_string()))
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> serde_json::Value {
    use qdrant_client::qdrant::value::Kind;
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(
            list.values.into_iter().map(qdrant_value_to_json).collect(),
        ),
        Some(Kind::StructValue(fields)) => serde_json::Value::Object(
            fields
                .fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect(),
        ),
    }
}

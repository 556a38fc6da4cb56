use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::Settings;
use crate::embedding::EmbeddingClient;
use crate::error::{IndexError, Result};
use crate::types::{Document, DocumentMeta};
use crate::vector_store::{collection_name, normalize_l2, VectorStore};

/// pgvector columns top out at 2000 dimensions; wider embeddings are
/// truncated and L2-normalized, and query vectors get the same transform.
const MAX_PG_DIMENSION: usize = 2000;

fn sql_create_table(table: &str, dimension: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   id UUID PRIMARY KEY,\n\
         \x20   repo_id UUID NOT NULL,\n\
         \x20   file_id UUID NOT NULL,\n\
         \x20   content TEXT NOT NULL,\n\
         \x20   meta JSONB NOT NULL,\n\
         \x20   embedding vector({dimension}) NOT NULL\n\
         ) USING heap"
    )
}

fn sql_create_indices(table: &str) -> [String; 3] {
    [
        format!("CREATE INDEX IF NOT EXISTS {table}_repo_file_idx ON {table} (repo_id, file_id)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_file_idx ON {table} (file_id)"),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_embedding_cosine_idx ON {table} \
             USING hnsw (embedding vector_cosine_ops) WITH (m = 16, ef_construction = 64)"
        ),
    ]
}

/// Relational adapter: one table per embedding model with a pgvector column.
pub struct PgStore {
    pool: PgPool,
    embedding_model: String,
    embedder: Arc<dyn EmbeddingClient>,
    table_name: Option<String>,
    normalized: bool,
}

impl PgStore {
    pub async fn connect(settings: &Settings, embedder: Arc<dyn EmbeddingClient>) -> Result<Self> {
        let pg = settings
            .vector
            .pgvector
            .as_ref()
            .ok_or_else(|| IndexError::Config("vector.pgvector is missing".into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&pg.url())
            .await?;
        Ok(Self {
            pool,
            embedding_model: settings.vector.embedding_model.clone(),
            embedder,
            table_name: None,
            normalized: false,
        })
    }

    fn table(&self) -> Result<&str> {
        self.table_name
            .as_deref()
            .ok_or_else(|| IndexError::VectorStore("store is not initialized".into()))
    }

    fn store_vector(&self, vector: &[f32]) -> String {
        let v = if self.normalized {
            normalize_l2(&vector[..vector.len().min(MAX_PG_DIMENSION)])
        } else {
            vector.to_vec()
        };
        vector_literal(&v)
    }

    async fn insert_documents<'t>(
        &self,
        tx: &mut sqlx::Transaction<'t, sqlx::Postgres>,
        repo_id: Uuid,
        documents: &[Document],
    ) -> Result<()> {
        let table = self.table()?;
        let sql = format!(
            "INSERT INTO {table} (id, repo_id, file_id, content, meta, embedding) \
             VALUES ($1, $2, $3, $4, $5, $6::vector) \
             ON CONFLICT (id) DO UPDATE SET \
                 repo_id = EXCLUDED.repo_id, \
                 file_id = EXCLUDED.file_id, \
                 content = EXCLUDED.content, \
                 meta = EXCLUDED.meta, \
                 embedding = EXCLUDED.embedding"
        );
        for doc in documents {
            let meta = serde_json::to_value(doc.meta.stored())
                .map_err(|e| IndexError::VectorStore(e.to_string()))?;
            sqlx::query(&sql)
                .bind(doc.meta.segment_id)
                .bind(repo_id)
                .bind(doc.meta.file_id)
                .bind(doc.content.clone().unwrap_or_default())
                .bind(meta)
                .bind(self.store_vector(&doc.vector))
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgStore {
    async fn init(&mut self) -> Result<()> {
        let mut dimension = self.embedder.dimension().await?;
        if dimension > MAX_PG_DIMENSION {
            dimension = MAX_PG_DIMENSION;
            self.normalized = true;
        }
        let table = collection_name(&self.embedding_model, dimension);

        let mut tx = self.pool.begin().await?;
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&sql_create_table(&table, dimension))
            .execute(&mut *tx)
            .await?;
        for sql in sql_create_indices(&table) {
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.table_name = Some(table);
        Ok(())
    }

    async fn create(&self, documents: &[Document]) -> Result<()> {
        let Some(first) = documents.first() else {
            return Ok(());
        };
        let mut tx = self.pool.begin().await?;
        self.insert_documents(&mut tx, first.meta.repo_id, documents).await?;
        tx.commit().await?;
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

        // Delete-then-insert under one transaction keeps the per-file
        // replacement atomic.
        let table = self.table()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE repo_id = $1 AND file_id = ANY($2)"
        ))
        .bind(repo_id)
        .bind(&file_ids)
        .execute(&mut *tx)
        .await?;
        self.insert_documents(&mut tx, repo_id, documents).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn all_meta(&self, repo_id: Uuid) -> Result<Vec<DocumentMeta>> {
        let table = self.table()?;
        let rows = sqlx::query(&format!("SELECT meta FROM {table} WHERE repo_id = $1"))
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let meta: serde_json::Value = row.try_get("meta")?;
                serde_json::from_value(meta).map_err(|e| IndexError::VectorStore(e.to_string()))
            })
            .collect()
    }

    async fn drop_repo(&self, repo_id: Uuid) -> Result<()> {
        let table = self.table()?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE repo_id = $1"))
            .bind(repo_id)
            .execute(&self.pool)
            .await;
        swallow_missing_table(result.map(|_| ()))
    }

    async fn delete(&self, repo_id: Uuid, file_ids: &[Uuid]) -> Result<()> {
        let table = self.table()?;
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE repo_id = $1 AND file_id = ANY($2)"
        ))
        .bind(repo_id)
        .bind(file_ids)
        .execute(&self.pool)
        .await;
        swallow_missing_table(result.map(|_| ()))
    }

    async fn search_by_vector(
        &self,
        repo_id: Uuid,
        file_ids: Option<&[Uuid]>,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<Document>> {
        let table = self.table()?;
        let query_vector = self.store_vector(query_vector);

        let mut sql = format!(
            "SELECT content, meta, embedding <=> $1::vector AS distance \
             FROM {table} WHERE repo_id = $2"
        );
        if file_ids.is_some() {
            sql.push_str(" AND file_id = ANY($4)");
        }
        sql.push_str(" ORDER BY distance LIMIT $3");

        let mut query = sqlx::query(&sql)
            .bind(&query_vector)
            .bind(repo_id)
            .bind(top_k as i64);
        if let Some(file_ids) = file_ids {
            query = query.bind(file_ids);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row.try_get("content")?;
            let meta_value: serde_json::Value = row.try_get("meta")?;
            let distance: f64 = row.try_get("distance")?;
            let score = 1.0 - distance as f32;
            if score >= score_threshold {
                let mut meta: DocumentMeta = serde_json::from_value(meta_value)
                    .map_err(|e| IndexError::VectorStore(e.to_string()))?;
                meta.score = Some(score);
                meta.content = Some(content.clone());
                documents.push(Document {
                    vector: Vec::new(),
                    content: Some(content),
                    meta,
                });
            }
        }
        Ok(documents)
    }
}

fn vector_literal(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 10 + 2);
    out.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// `delete`/`drop` on a collection that no longer exists is a no-op.
fn swallow_missing_table(result: std::result::Result<(), sqlx::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P01") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_shape() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn create_table_sql_names_the_dimension() {
        let sql = sql_create_table("we0_index_m_2000", 2000);
        assert!(sql.contains("embedding vector(2000) NOT NULL"));
        assert!(sql.contains("meta JSONB NOT NULL"));
    }

    #[test]
    fn index_sql_covers_the_filter_algebra() {
        let [repo_file, file, hnsw] = sql_create_indices("t");
        assert!(repo_file.contains("(repo_id, file_id)"));
        assert!(file.contains("(file_id)"));
        assert!(hnsw.contains("hnsw (embedding vector_cosine_ops)"));
        assert!(hnsw.contains("m = 16, ef_construction = 64"));
    }
}

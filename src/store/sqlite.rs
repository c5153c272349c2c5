//! SQLite store backend.
//!
//! Chunk and graph rows persist in one SQLite database via `sqlx`.
//! Embeddings are little-endian `f32` BLOBs scanned in-process for
//! cosine search; the lexical side is a BM25 postings index rebuilt from
//! rows when a corpus is first searched and maintained on write.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::chunker::Chunk;
use crate::config::SparseSearchConfig;
use crate::{RagError, Result};

use super::bm25::Bm25Index;
use super::{
    ChunkCandidate, ChunkStore, ChunkStoreStats, Community, Entity, EntityKind, GraphStore,
    GraphStoreStats, RelKind, Relationship, cosine_similarity,
};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    sparse_config: SparseSearchConfig,
    bm25: RwLock<HashMap<String, Bm25Index>>,
}

impl SqliteStore {
    #[inline]
    pub async fn open(path: &Path, sparse_config: SparseSearchConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let store = Self {
            pool,
            sparse_config,
            bm25: RwLock::new(HashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        info!("Running store migrations");
        sqlx::query(include_str!("migrations/001_initial_schema.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to run initial schema migration")?;
        debug!("Store migrations completed");
        Ok(())
    }

    #[inline]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Build (or rebuild) the BM25 index for a corpus from its rows.
    async fn ensure_bm25(&self, corpus_id: &str) -> Result<()> {
        {
            let indexes = self.bm25.read().await;
            if indexes.contains_key(corpus_id) {
                return Ok(());
            }
        }

        let rows = sqlx::query("SELECT chunk_id, content FROM chunks WHERE corpus_id = ?")
            .bind(corpus_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load chunk text for lexical index")?;

        let mut index = Bm25Index::new(&self.sparse_config);
        for row in &rows {
            let chunk_id: String = row.try_get("chunk_id").map_err(db_err)?;
            let content: String = row.try_get("content").map_err(db_err)?;
            index.insert(&chunk_id, &content);
        }
        debug!(
            "Built lexical index for corpus {} over {} chunks",
            corpus_id,
            index.len()
        );
        self.bm25
            .write()
            .await
            .insert(corpus_id.to_string(), index);
        Ok(())
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
        let embedding: Option<Vec<u8>> = row.try_get("embedding").map_err(db_err)?;
        Ok(Chunk {
            chunk_id: row.try_get("chunk_id").map_err(db_err)?,
            corpus_id: row.try_get("corpus_id").map_err(db_err)?,
            file_path: row.try_get("file_path").map_err(db_err)?,
            start_line: row.try_get::<i64, _>("start_line").map_err(db_err)? as usize,
            end_line: row.try_get::<i64, _>("end_line").map_err(db_err)? as usize,
            language: row.try_get("language").map_err(db_err)?,
            content: row.try_get("content").map_err(db_err)?,
            token_count: row.try_get::<i64, _>("token_count").map_err(db_err)? as usize,
            content_hash: row.try_get("content_hash").map_err(db_err)?,
            embedding: embedding.map(|b| decode_vector(&b)),
            summary: row.try_get("summary").map_err(db_err)?,
            truncated: row.try_get::<i64, _>("truncated").map_err(db_err)? != 0,
        })
    }

    fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Result<Entity> {
        let kind: String = row.try_get("kind").map_err(db_err)?;
        let properties: String = row.try_get("properties").map_err(db_err)?;
        let embedding: Option<Vec<u8>> = row.try_get("embedding").map_err(db_err)?;
        Ok(Entity {
            entity_id: row.try_get("entity_id").map_err(db_err)?,
            corpus_id: row.try_get("corpus_id").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            qualified_name: row.try_get("qualified_name").map_err(db_err)?,
            kind: EntityKind::parse(&kind)
                .ok_or_else(|| RagError::Store(format!("unknown entity kind '{kind}'")))?,
            file_path: row.try_get("file_path").map_err(db_err)?,
            start_line: row
                .try_get::<Option<i64>, _>("start_line")
                .map_err(db_err)?
                .map(|v| v as usize),
            description: row.try_get("description").map_err(db_err)?,
            embedding: embedding.map(|b| decode_vector(&b)),
            properties: serde_json::from_str(&properties).unwrap_or_default(),
        })
    }

    fn row_to_relationship(row: &sqlx::sqlite::SqliteRow) -> Result<Relationship> {
        let kind: String = row.try_get("kind").map_err(db_err)?;
        let properties: String = row.try_get("properties").map_err(db_err)?;
        Ok(Relationship {
            source_entity_id: row.try_get("source_entity_id").map_err(db_err)?,
            target_entity_id: row.try_get("target_entity_id").map_err(db_err)?,
            kind: RelKind::parse(&kind)
                .ok_or_else(|| RagError::Store(format!("unknown relationship kind '{kind}'")))?,
            weight: row.try_get("weight").map_err(db_err)?,
            properties: serde_json::from_str(&properties).unwrap_or_default(),
        })
    }
}

fn db_err(e: sqlx::Error) -> RagError {
    RagError::Store(e.to_string())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn upsert_chunks(&self, corpus_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (corpus_id, chunk_id, file_path, start_line, end_line, language,
                     content, token_count, content_hash, embedding, summary, truncated)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (corpus_id, chunk_id) DO UPDATE SET
                    file_path = excluded.file_path,
                    start_line = excluded.start_line,
                    end_line = excluded.end_line,
                    language = excluded.language,
                    content = excluded.content,
                    token_count = excluded.token_count,
                    content_hash = excluded.content_hash,
                    embedding = excluded.embedding,
                    summary = excluded.summary,
                    truncated = excluded.truncated
                "#,
            )
            .bind(corpus_id)
            .bind(&chunk.chunk_id)
            .bind(&chunk.file_path)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(&chunk.language)
            .bind(&chunk.content)
            .bind(chunk.token_count as i64)
            .bind(&chunk.content_hash)
            .bind(chunk.embedding.as_ref().map(|v| encode_vector(v)))
            .bind(&chunk.summary)
            .bind(i64::from(chunk.truncated))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        let mut indexes = self.bm25.write().await;
        if let Some(index) = indexes.get_mut(corpus_id) {
            for chunk in chunks {
                index.insert(&chunk.chunk_id, &chunk.content);
            }
        }
        Ok(())
    }

    async fn delete_file_chunks(&self, corpus_id: &str, file_path: &str) -> Result<()> {
        let rows =
            sqlx::query("SELECT chunk_id FROM chunks WHERE corpus_id = ? AND file_path = ?")
                .bind(corpus_id)
                .bind(file_path)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        sqlx::query("DELETE FROM chunks WHERE corpus_id = ? AND file_path = ?")
            .bind(corpus_id)
            .bind(file_path)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let mut indexes = self.bm25.write().await;
        if let Some(index) = indexes.get_mut(corpus_id) {
            for row in &rows {
                let chunk_id: String = row.try_get("chunk_id").map_err(db_err)?;
                index.remove(&chunk_id);
            }
        }
        Ok(())
    }

    async fn delete_corpus(&self, corpus_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.bm25.write().await.remove(corpus_id);
        Ok(())
    }

    async fn get_chunk(&self, corpus_id: &str, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE corpus_id = ? AND chunk_id = ?")
            .bind(corpus_id)
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_chunk).transpose()
    }

    async fn get_chunks(&self, corpus_id: &str, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(chunk_ids.len());
        for chunk_id in chunk_ids {
            if let Some(chunk) = self.get_chunk(corpus_id, chunk_id).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    async fn chunks_for_file(&self, corpus_id: &str, file_path: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE corpus_id = ? AND file_path = ? ORDER BY start_line",
        )
        .bind(corpus_id)
        .bind(file_path)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn vector_search(
        &self,
        corpus_id: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            "SELECT chunk_id, embedding FROM chunks WHERE corpus_id = ? AND embedding IS NOT NULL",
        )
        .bind(corpus_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk_id: String = row.try_get("chunk_id").map_err(db_err)?;
            let bytes: Vec<u8> = row.try_get("embedding").map_err(db_err)?;
            let embedding = decode_vector(&bytes);
            scored.push(ChunkCandidate {
                chunk_id,
                score: cosine_similarity(query, &embedding),
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn fts_search(
        &self,
        corpus_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        self.ensure_bm25(corpus_id).await?;
        let indexes = self.bm25.read().await;
        let Some(index) = indexes.get(corpus_id) else {
            return Ok(Vec::new());
        };
        Ok(index
            .search(query, top_k)
            .into_iter()
            .map(|(chunk_id, score)| ChunkCandidate { chunk_id, score })
            .collect())
    }

    async fn stats(&self, corpus_id: &str) -> Result<ChunkStoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS chunk_count,
                COUNT(embedding) AS embedded_count,
                COUNT(DISTINCT file_path) AS file_count
            FROM chunks WHERE corpus_id = ?
            "#,
        )
        .bind(corpus_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ChunkStoreStats {
            chunk_count: row.try_get::<i64, _>("chunk_count").map_err(db_err)? as usize,
            embedded_count: row.try_get::<i64, _>("embedded_count").map_err(db_err)? as usize,
            file_count: row.try_get::<i64, _>("file_count").map_err(db_err)? as usize,
        })
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn upsert_entities(&self, corpus_id: &str, entities: &[Entity]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for entity in entities {
            let properties = serde_json::to_string(&entity.properties)
                .map_err(|e| RagError::Store(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO entities
                    (corpus_id, entity_id, name, qualified_name, kind, file_path,
                     start_line, description, embedding, properties)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (corpus_id, entity_id) DO UPDATE SET
                    name = excluded.name,
                    qualified_name = excluded.qualified_name,
                    kind = excluded.kind,
                    file_path = excluded.file_path,
                    start_line = excluded.start_line,
                    description = excluded.description,
                    embedding = excluded.embedding,
                    properties = excluded.properties
                "#,
            )
            .bind(corpus_id)
            .bind(&entity.entity_id)
            .bind(&entity.name)
            .bind(&entity.qualified_name)
            .bind(entity.kind.as_str())
            .bind(&entity.file_path)
            .bind(entity.start_line.map(|v| v as i64))
            .bind(&entity.description)
            .bind(entity.embedding.as_ref().map(|v| encode_vector(v)))
            .bind(properties)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        corpus_id: &str,
        relationships: &[Relationship],
    ) -> Result<usize> {
        let mut written = 0;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for rel in relationships {
            let endpoints = sqlx::query(
                "SELECT COUNT(*) AS present FROM entities WHERE corpus_id = ? AND entity_id IN (?, ?)",
            )
            .bind(corpus_id)
            .bind(&rel.source_entity_id)
            .bind(&rel.target_entity_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let present: i64 = endpoints.try_get("present").map_err(db_err)?;
            let expected = if rel.source_entity_id == rel.target_entity_id { 1 } else { 2 };
            if present < expected {
                continue;
            }

            let properties = serde_json::to_string(&rel.properties)
                .map_err(|e| RagError::Store(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO relationships
                    (corpus_id, source_entity_id, target_entity_id, kind, weight, properties)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (corpus_id, source_entity_id, target_entity_id, kind)
                DO UPDATE SET weight = excluded.weight, properties = excluded.properties
                "#,
            )
            .bind(corpus_id)
            .bind(&rel.source_entity_id)
            .bind(&rel.target_entity_id)
            .bind(rel.kind.as_str())
            .bind(rel.weight)
            .bind(properties)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            written += 1;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }

    async fn delete_corpus(&self, corpus_id: &str) -> Result<()> {
        for table in ["entities", "relationships", "communities"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE corpus_id = ?"))
                .bind(corpus_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn delete_file_entities(&self, corpus_id: &str, file_path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            DELETE FROM relationships
            WHERE corpus_id = ?1 AND (
                source_entity_id IN
                    (SELECT entity_id FROM entities WHERE corpus_id = ?1 AND file_path = ?2)
                OR target_entity_id IN
                    (SELECT entity_id FROM entities WHERE corpus_id = ?1 AND file_path = ?2)
            )
            "#,
        )
        .bind(corpus_id)
        .bind(file_path)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM entities WHERE corpus_id = ? AND file_path = ?")
            .bind(corpus_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_entity(&self, corpus_id: &str, entity_id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE corpus_id = ? AND entity_id = ?")
            .bind(corpus_id)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_entity).transpose()
    }

    async fn find_entities_by_terms(
        &self,
        corpus_id: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let mut matches: Vec<Entity> = Vec::new();
        for term in terms {
            let pattern = format!("%{}%", term.to_lowercase());
            let rows = sqlx::query(
                r#"
                SELECT * FROM entities
                WHERE corpus_id = ?
                  AND (LOWER(name) LIKE ? OR LOWER(COALESCE(description, '')) LIKE ?)
                ORDER BY entity_id
                LIMIT ?
                "#,
            )
            .bind(corpus_id)
            .bind(&pattern)
            .bind(&pattern)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            for row in &rows {
                let entity = Self::row_to_entity(row)?;
                if !matches.iter().any(|e: &Entity| e.entity_id == entity.entity_id) {
                    matches.push(entity);
                }
            }
        }
        matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn find_entities_by_embedding(
        &self,
        corpus_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>> {
        let rows =
            sqlx::query("SELECT * FROM entities WHERE corpus_id = ? AND embedding IS NOT NULL")
                .bind(corpus_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let entity = Self::row_to_entity(row)?;
            let Some(embedding) = entity.embedding.as_ref() else {
                continue;
            };
            let score = cosine_similarity(query, embedding);
            scored.push((entity, score));
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.entity_id.cmp(&b.0.entity_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn neighbors(
        &self,
        corpus_id: &str,
        entity_id: &str,
    ) -> Result<Vec<(Relationship, Entity)>> {
        let rows = sqlx::query(
            r#"
            SELECT r.source_entity_id, r.target_entity_id, r.kind, r.weight, r.properties,
                   e.corpus_id, e.entity_id, e.name, e.qualified_name, e.kind AS entity_kind,
                   e.file_path, e.start_line, e.description,
                   e.embedding AS entity_embedding, e.properties AS entity_properties
            FROM relationships r
            JOIN entities e ON e.corpus_id = r.corpus_id
                AND e.entity_id = CASE
                    WHEN r.source_entity_id = ?2 THEN r.target_entity_id
                    ELSE r.source_entity_id
                END
            WHERE r.corpus_id = ?1 AND (r.source_entity_id = ?2 OR r.target_entity_id = ?2)
            "#,
        )
        .bind(corpus_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let rel_kind: String = row.try_get("kind").map_err(db_err)?;
            let rel_properties: String = row.try_get("properties").map_err(db_err)?;
            let relationship = Relationship {
                source_entity_id: row.try_get("source_entity_id").map_err(db_err)?,
                target_entity_id: row.try_get("target_entity_id").map_err(db_err)?,
                kind: RelKind::parse(&rel_kind)
                    .ok_or_else(|| RagError::Store(format!("unknown relationship kind '{rel_kind}'")))?,
                weight: row.try_get("weight").map_err(db_err)?,
                properties: serde_json::from_str(&rel_properties).unwrap_or_default(),
            };

            let entity_kind: String = row.try_get("entity_kind").map_err(db_err)?;
            let entity_properties: String = row.try_get("entity_properties").map_err(db_err)?;
            let entity_embedding: Option<Vec<u8>> =
                row.try_get("entity_embedding").map_err(db_err)?;
            let entity = Entity {
                entity_id: row.try_get("entity_id").map_err(db_err)?,
                corpus_id: row.try_get("corpus_id").map_err(db_err)?,
                name: row.try_get("name").map_err(db_err)?,
                qualified_name: row.try_get("qualified_name").map_err(db_err)?,
                kind: EntityKind::parse(&entity_kind)
                    .ok_or_else(|| RagError::Store(format!("unknown entity kind '{entity_kind}'")))?,
                file_path: row.try_get("file_path").map_err(db_err)?,
                start_line: row
                    .try_get::<Option<i64>, _>("start_line")
                    .map_err(db_err)?
                    .map(|v| v as usize),
                description: row.try_get("description").map_err(db_err)?,
                embedding: entity_embedding.map(|b| decode_vector(&b)),
                properties: serde_json::from_str(&entity_properties).unwrap_or_default(),
            };
            out.push((relationship, entity));
        }
        Ok(out)
    }

    async fn all_entities(&self, corpus_id: &str) -> Result<Vec<Entity>> {
        let rows = sqlx::query("SELECT * FROM entities WHERE corpus_id = ? ORDER BY entity_id")
            .bind(corpus_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_entity).collect()
    }

    async fn all_relationships(&self, corpus_id: &str) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM relationships WHERE corpus_id = ?
            ORDER BY source_entity_id, target_entity_id, kind
            "#,
        )
        .bind(corpus_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_relationship).collect()
    }

    async fn replace_communities(&self, corpus_id: &str, communities: &[Community]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM communities WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for community in communities {
            let member_ids = serde_json::to_string(&community.member_ids)
                .map_err(|e| RagError::Store(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO communities (corpus_id, community_id, level, member_ids, summary)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(corpus_id)
            .bind(&community.community_id)
            .bind(i64::from(community.level))
            .bind(member_ids)
            .bind(&community.summary)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn communities(&self, corpus_id: &str) -> Result<Vec<Community>> {
        let rows =
            sqlx::query("SELECT * FROM communities WHERE corpus_id = ? ORDER BY community_id")
                .bind(corpus_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let mut communities = Vec::with_capacity(rows.len());
        for row in &rows {
            let member_ids: String = row.try_get("member_ids").map_err(db_err)?;
            communities.push(Community {
                community_id: row.try_get("community_id").map_err(db_err)?,
                corpus_id: row.try_get("corpus_id").map_err(db_err)?,
                level: row.try_get::<i64, _>("level").map_err(db_err)? as u32,
                member_ids: serde_json::from_str(&member_ids).unwrap_or_default(),
                summary: row.try_get("summary").map_err(db_err)?,
            });
        }
        Ok(communities)
    }

    async fn stats(&self, corpus_id: &str) -> Result<GraphStoreStats> {
        let entities =
            sqlx::query("SELECT COUNT(*) AS n FROM entities WHERE corpus_id = ?")
                .bind(corpus_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let relationships =
            sqlx::query("SELECT COUNT(*) AS n FROM relationships WHERE corpus_id = ?")
                .bind(corpus_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let communities =
            sqlx::query("SELECT COUNT(*) AS n FROM communities WHERE corpus_id = ?")
                .bind(corpus_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(GraphStoreStats {
            entity_count: entities.try_get::<i64, _>("n").map_err(db_err)? as usize,
            relationship_count: relationships.try_get::<i64, _>("n").map_err(db_err)? as usize,
            community_count: communities.try_get::<i64, _>("n").map_err(db_err)? as usize,
        })
    }
}

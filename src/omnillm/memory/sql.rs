//! SQL-backed memory over a DSN/executor abstraction.
//!
//! Database drivers are external collaborators: the crate ships the store
//! logic against the [`SqlExecutor`] seam and callers plug in their
//! driver.  The expected table shape is
//! `(id, user_id, conversation_id, role, content, metadata, created_at)`
//! with a composite index on `(user_id, conversation_id)`.
//!
//! [`SqlVectorMemory`] layers the vector contract on top for engines with
//! vector columns (pgvector, MySQL 9 VECTOR), generating dialect-specific
//! SQL.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::vector::{
    filter_matches, record_to_entry, Embedder, SearchHit, SpaceType, VectorMemory, VectorRecord,
};
use crate::omnillm::memory::{Memory, MemoryConfig, MemoryEntry, TenantScope};
use crate::omnillm::message::Role;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Minimal contract a SQL driver must satisfy.
///
/// `params` bind positionally to `?` placeholders.  Implementations
/// translate placeholders where their engine differs (e.g. `$1` on
/// Postgres).
#[async_trait::async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a statement; returns the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, AiError>;

    /// Run a query; returns rows as column-name → value maps.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Map<String, Value>>, AiError>;
}

const DEFAULT_TABLE: &str = "ai_memory";

/// Relational memory in the standard table shape.
pub struct SqlMemory {
    executor: Arc<dyn SqlExecutor>,
    table: String,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl SqlMemory {
    /// Build from factory config; requires `config.executor`.
    pub fn from_config(config: &MemoryConfig) -> Result<Self, AiError> {
        let executor = config.executor.clone().ok_or_else(|| {
            AiError::ConfigMissing("jdbc memory requires config.executor".into())
        })?;
        Ok(SqlMemory {
            executor,
            table: config.table.clone().unwrap_or_else(|| DEFAULT_TABLE.into()),
            scope: config.scope.clone(),
            metadata: RwLock::new(Map::new()),
        })
    }

    fn tenant_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(user_id) = &self.scope.user_id {
            clauses.push("user_id = ?".to_string());
            params.push(Value::String(user_id.clone()));
        }
        if let Some(conversation_id) = &self.scope.conversation_id {
            clauses.push("conversation_id = ?".to_string());
            params.push(Value::String(conversation_id.clone()));
        }
        if clauses.is_empty() {
            ("1 = 1".to_string(), params)
        } else {
            (clauses.join(" AND "), params)
        }
    }
}

#[async_trait::async_trait]
impl Memory for SqlMemory {
    fn kind(&self) -> &str {
        "jdbc"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        let sql = format!(
            "INSERT INTO {} (id, user_id, conversation_id, role, content, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.table
        );
        let params = vec![
            Value::String(uuid::Uuid::new_v4().to_string()),
            Value::String(self.scope.user_id.clone().unwrap_or_default()),
            Value::String(self.scope.conversation_id.clone().unwrap_or_default()),
            Value::String(entry.role.as_str().to_string()),
            Value::String(entry.content),
            Value::String(serde_json::to_string(&entry.metadata).unwrap_or_default()),
            Value::String(entry.timestamp.to_rfc3339()),
        ];
        self.executor.execute(&sql, &params).await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let (clause, params) = self.tenant_clause();
        let sql = format!(
            "SELECT role, content, metadata, created_at FROM {} WHERE {} ORDER BY created_at",
            self.table, clause
        );
        let rows = self.executor.query(&sql, &params).await?;
        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        let (clause, params) = self.tenant_clause();
        let sql = format!("DELETE FROM {} WHERE {}", self.table, clause);
        self.executor.execute(&sql, &params).await?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }
}

fn row_to_entry(row: Map<String, Value>) -> MemoryEntry {
    let role = row
        .get("role")
        .and_then(|r| r.as_str())
        .and_then(|r| Role::from_name(r).ok())
        .unwrap_or(Role::User);
    let content = row
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let metadata = row
        .get("metadata")
        .and_then(|m| m.as_str())
        .and_then(|m| serde_json::from_str(m).ok())
        .unwrap_or_default();
    let timestamp = row
        .get("created_at")
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    MemoryEntry {
        role,
        content,
        timestamp,
        metadata,
    }
}

/// SQL dialect for vector search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// pgvector: `embedding <=> ?::vector`.
    Postgres,
    /// MySQL 9 VECTOR with `DISTANCE(embedding, ?, 'COSINE')`.
    MySql,
}

const DEFAULT_VECTOR_TABLE: &str = "ai_vectors";

/// Vector memory over a SQL engine with a vector column.
///
/// Expected table shape:
/// `(id, collection, text, metadata, embedding, created_at)`.
pub struct SqlVectorMemory {
    executor: Arc<dyn SqlExecutor>,
    dialect: SqlDialect,
    table: String,
    collection: String,
    embedder: Arc<Embedder>,
    space: SpaceType,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl SqlVectorMemory {
    /// Build from factory config; requires `config.executor`.
    pub fn from_config(config: &MemoryConfig, dialect: SqlDialect) -> Result<Self, AiError> {
        let executor = config.executor.clone().ok_or_else(|| {
            AiError::ConfigMissing(format!(
                "{} memory requires config.executor",
                if dialect == SqlDialect::Postgres {
                    "postgres"
                } else {
                    "mysql"
                }
            ))
        })?;
        Ok(SqlVectorMemory {
            executor,
            dialect,
            table: config
                .table
                .clone()
                .unwrap_or_else(|| DEFAULT_VECTOR_TABLE.into()),
            collection: config.collection_name(),
            embedder: config.build_embedder()?,
            space: config.space_type,
            scope: config.scope.clone(),
            metadata: RwLock::new(Map::new()),
        })
    }

    fn vector_literal(embedding: &[f32]) -> String {
        let joined = embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("[{}]", joined)
    }

    /// Dialect-specific ORDER BY expression; both engines sort ascending
    /// by distance.
    fn distance_expr(&self) -> &'static str {
        match (self.dialect, self.space) {
            (SqlDialect::Postgres, SpaceType::Cosine) => "embedding <=> ?::vector",
            (SqlDialect::Postgres, SpaceType::L2) => "embedding <-> ?::vector",
            (SqlDialect::Postgres, SpaceType::InnerProduct) => "embedding <#> ?::vector",
            (SqlDialect::MySql, SpaceType::Cosine) => "DISTANCE(embedding, ?, 'COSINE')",
            (SqlDialect::MySql, SpaceType::L2) => "DISTANCE(embedding, ?, 'EUCLIDEAN')",
            (SqlDialect::MySql, SpaceType::InnerProduct) => "DISTANCE(embedding, ?, 'DOT')",
        }
    }

    fn row_to_record(row: Map<String, Value>) -> VectorRecord {
        let embedding = row
            .get("embedding")
            .and_then(|e| e.as_str())
            .map(|text| {
                text.trim_matches(['[', ']'])
                    .split(',')
                    .filter_map(|f| f.trim().parse::<f32>().ok())
                    .collect()
            })
            .unwrap_or_default();
        VectorRecord {
            id: row
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            text: row
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: row
                .get("metadata")
                .and_then(|m| m.as_str())
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default(),
            embedding,
            created_at: row
                .get("created_at")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait::async_trait]
impl Memory for SqlVectorMemory {
    fn kind(&self) -> &str {
        match self.dialect {
            SqlDialect::Postgres => "postgres",
            SqlDialect::MySql => "mysql",
        }
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        entry
            .metadata
            .insert("role".into(), Value::String(entry.role.as_str().to_string()));
        let id = uuid::Uuid::new_v4().to_string();
        self.store(&id, &entry.content.clone(), entry.metadata, None)
            .await
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let sql = format!(
            "SELECT id, text, metadata, embedding, created_at FROM {} \
             WHERE collection = ? ORDER BY created_at",
            self.table
        );
        let rows = self
            .executor
            .query(&sql, &[Value::String(self.collection.clone())])
            .await?;
        Ok(rows
            .into_iter()
            .map(Self::row_to_record)
            .filter(|r| self.scope.matches(&r.metadata))
            .map(record_to_entry)
            .collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        let mut filter = Map::new();
        self.scope.stamp(&mut filter);
        self.delete_by_filter(&filter).await?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }

    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, AiError> {
        let hits = self.search(query, limit, None, None).await?;
        Ok(hits.into_iter().map(|h| record_to_entry(h.record)).collect())
    }
}

#[async_trait::async_trait]
impl VectorMemory for SqlVectorMemory {
    async fn store(
        &self,
        id: &str,
        text: &str,
        mut metadata: Map<String, Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), AiError> {
        self.scope.stamp(&mut metadata);
        let embedding = match embedding {
            Some(embedding) => embedding,
            None => self.embedder.embed_one(text).await?,
        };
        // Upsert semantics: replace any existing row for the ID.
        self.executor
            .execute(
                &format!("DELETE FROM {} WHERE id = ? AND collection = ?", self.table),
                &[
                    Value::String(id.to_string()),
                    Value::String(self.collection.clone()),
                ],
            )
            .await?;
        let sql = format!(
            "INSERT INTO {} (id, collection, text, metadata, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        );
        self.executor
            .execute(
                &sql,
                &[
                    Value::String(id.to_string()),
                    Value::String(self.collection.clone()),
                    Value::String(text.to_string()),
                    Value::String(serde_json::to_string(&metadata).unwrap_or_default()),
                    Value::String(Self::vector_literal(&embedding)),
                    Value::String(Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AiError> {
        self.executor
            .execute(
                &format!("DELETE FROM {} WHERE id = ? AND collection = ?", self.table),
                &[
                    Value::String(id.to_string()),
                    Value::String(self.collection.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &Map<String, Value>) -> Result<u64, AiError> {
        // Metadata is JSON text; filtering happens client-side, deletes by ID.
        let sql = format!(
            "SELECT id, text, metadata, embedding, created_at FROM {} WHERE collection = ?",
            self.table
        );
        let rows = self
            .executor
            .query(&sql, &[Value::String(self.collection.clone())])
            .await?;
        let mut combined = filter.clone();
        self.scope.stamp(&mut combined);
        let mut removed = 0u64;
        for record in rows.into_iter().map(Self::row_to_record) {
            if filter_matches(&combined, &record.metadata) {
                self.delete(&record.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&Map<String, Value>>,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchHit>, AiError> {
        let embedding = self.embedder.embed_one(query).await?;
        let mut hits = self.search_by_vector(&embedding, top_k, filter).await?;
        if let Some(min_score) = min_score {
            hits.retain(|h| h.score >= min_score);
        }
        Ok(hits)
    }

    async fn search_by_vector(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&Map<String, Value>>,
    ) -> Result<Vec<SearchHit>, AiError> {
        let sql = format!(
            "SELECT id, text, metadata, embedding, created_at FROM {} \
             WHERE collection = ? ORDER BY {} LIMIT {}",
            self.table,
            self.distance_expr(),
            // Over-fetch so client-side tenant filtering still fills top_k.
            top_k.saturating_mul(4).max(top_k)
        );
        let rows = self
            .executor
            .query(
                &sql,
                &[
                    Value::String(self.collection.clone()),
                    Value::String(Self::vector_literal(embedding)),
                ],
            )
            .await?;
        let mut combined = filter.cloned().unwrap_or_default();
        self.scope.stamp(&mut combined);
        let hits: Vec<SearchHit> = rows
            .into_iter()
            .map(Self::row_to_record)
            .filter(|r| filter_matches(&combined, &r.metadata))
            .map(|record| SearchHit {
                score: self.space.score(embedding, &record.embedding),
                record,
            })
            .take(top_k)
            .collect();
        Ok(hits)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AiError> {
        let sql = format!(
            "SELECT id, text, metadata, embedding, created_at FROM {} \
             WHERE id = ? AND collection = ?",
            self.table
        );
        let rows = self
            .executor
            .query(
                &sql,
                &[
                    Value::String(id.to_string()),
                    Value::String(self.collection.clone()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().map(Self::row_to_record))
    }

    async fn create_collection(&self, _name: &str) -> Result<(), AiError> {
        // Collections are rows tagged by name; nothing to create eagerly.
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        let sql = format!(
            "SELECT id FROM {} WHERE collection = ? LIMIT 1",
            self.table
        );
        let rows = self
            .executor
            .query(&sql, &[Value::String(name.to_string())])
            .await?;
        Ok(!rows.is_empty())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        self.executor
            .execute(
                &format!("DELETE FROM {} WHERE collection = ?", self.table),
                &[Value::String(name.to_string())],
            )
            .await?;
        Ok(())
    }
}

//! Conversation memory: ordered message stores with multi-tenant
//! isolation, optionally vector-indexed for semantic retrieval.
//!
//! Every variant implements [`Memory`].  A memory constructed with a
//! [`TenantScope`] treats entries from other `(user_id, conversation_id)`
//! pairs as invisible in every operation, so two scoped memories can share
//! one backend without leaking across tenants.
//!
//! The [`memory`] factory builds a variant by kind name:
//! `windowed | summary | session | cache | file | jdbc | chroma | postgres |
//! pinecone | qdrant | weaviate | milvus | opensearch | mysql | typesense |
//! boxvector | hybrid`.
//!
//! # Example
//!
//! ```rust
//! use omnillm::omnillm::memory::{memory, MemoryConfig, MemoryEntry, TenantScope};
//! use omnillm::Role;
//!
//! # async fn run() -> Result<(), omnillm::AiError> {
//! let config = MemoryConfig {
//!     scope: TenantScope::new("user-1", "conv-1"),
//!     window_size: 20,
//!     ..Default::default()
//! };
//! let mem = memory("windowed", config)?;
//! mem.add(MemoryEntry::new(Role::User, "hello")).await?;
//! assert_eq!(mem.get_all().await?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod cache;
pub mod file;
pub mod hybrid;
pub mod session;
pub mod sql;
pub mod summary;
pub mod vector;
pub mod windowed;

use crate::omnillm::error::AiError;
use crate::omnillm::message::Role;
use crate::omnillm::request::RequestOptions;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Multi-tenant isolation keys.
///
/// An empty scope sees every entry; a scoped memory stamps its keys onto
/// added entries and filters reads to matching entries only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantScope {
    /// Owning user.
    pub user_id: Option<String>,
    /// Conversation within the user's scope.
    pub conversation_id: Option<String>,
}

impl TenantScope {
    /// A scope for the given tenant keys.
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        TenantScope {
            user_id: Some(user_id.into()),
            conversation_id: Some(conversation_id.into()),
        }
    }

    /// True when no isolation is requested.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.conversation_id.is_none()
    }

    /// True when an entry's metadata belongs to this scope.  Each set key
    /// must match exactly; unset keys do not filter.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        if let Some(user_id) = &self.user_id {
            if metadata.get("userId").and_then(|v| v.as_str()) != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(conversation_id) = &self.conversation_id {
            if metadata.get("conversationId").and_then(|v| v.as_str())
                != Some(conversation_id.as_str())
            {
                return false;
            }
        }
        true
    }

    /// Stamp this scope's keys onto entry metadata.
    pub fn stamp(&self, metadata: &mut Map<String, Value>) {
        if let Some(user_id) = &self.user_id {
            metadata.insert("userId".into(), Value::String(user_id.clone()));
        }
        if let Some(conversation_id) = &self.conversation_id {
            metadata.insert(
                "conversationId".into(),
                Value::String(conversation_id.clone()),
            );
        }
    }

    /// Build a scope from request options (for agents plumbing tenancy).
    pub fn from_options(options: &RequestOptions) -> Self {
        TenantScope {
            user_id: options.user_id.clone(),
            conversation_id: options.conversation_id.clone(),
        }
    }
}

/// One stored conversation message.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemoryEntry {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata; carries `userId`/`conversationId` when
    /// multi-tenant isolation is requested.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryEntry {
    /// An entry stamped with the current time and empty metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        MemoryEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Ordered store of conversation messages.
///
/// `add` is atomic; appends within one conversation are totally ordered.
/// Memories are shared between an agent and its caller as
/// `Arc<dyn Memory>` with interior synchronization.
#[async_trait::async_trait]
pub trait Memory: Send + Sync {
    /// Variant name (`"windowed"`, `"boxvector"`, ...).
    fn kind(&self) -> &str;

    /// The tenant scope this memory was created with.
    fn scope(&self) -> &TenantScope;

    /// Append an entry.  Scoped memories stamp their tenant keys first.
    async fn add(&self, entry: MemoryEntry) -> Result<(), AiError>;

    /// Every visible entry, in insertion order.
    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError>;

    /// Remove every visible entry.
    async fn clear(&self) -> Result<(), AiError>;

    /// Read a memory-level metadata value.
    async fn get_metadata(&self, key: &str) -> Option<Value>;

    /// Set a memory-level metadata value.
    async fn set_metadata(&self, key: &str, value: Value);

    /// Dump the visible entries for round-tripping through
    /// [`import`](Memory::import).
    async fn export(&self) -> Result<Value, AiError> {
        let entries = self.get_all().await?;
        serde_json::to_value(entries)
            .map_err(|e| AiError::Protocol(format!("memory export failed: {}", e)))
    }

    /// Load a dump produced by [`export`](Memory::export).
    async fn import(&self, dump: Value) -> Result<(), AiError> {
        let entries: Vec<MemoryEntry> = serde_json::from_value(dump)
            .map_err(|e| AiError::InvalidArgument(format!("malformed memory dump: {}", e)))?;
        for entry in entries {
            self.add(entry).await?;
        }
        Ok(())
    }

    /// Messages relevant to `query`, used by the agent Prepare step.
    ///
    /// The default returns the `limit` most recent entries; vector and
    /// hybrid memories override with semantic retrieval.
    async fn retrieve(&self, _query: &str, limit: usize) -> Result<Vec<MemoryEntry>, AiError> {
        let all = self.get_all().await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

/// Configuration consumed by the [`memory`] factory.
///
/// Only the fields relevant to the selected kind are read; the rest are
/// ignored.
#[derive(Clone, Default)]
pub struct MemoryConfig {
    /// Tenant isolation keys.
    pub scope: TenantScope,
    /// Retained message count for windowed-style variants (0 = default 20).
    pub window_size: usize,
    /// Entry count that triggers summarization (summary kind).
    pub summary_threshold: usize,
    /// Web session key (session kind).
    pub session_key: Option<String>,
    /// File path (file kind).
    pub path: Option<String>,
    /// SQL executor (jdbc/postgres/mysql kinds); drivers are external.
    pub executor: Option<Arc<dyn sql::SqlExecutor>>,
    /// Table name for SQL-backed kinds (default `ai_memory`).
    pub table: Option<String>,
    /// Key-value store (cache kind); defaults to an in-process map.
    pub kv_store: Option<Arc<dyn cache::KeyValueStore>>,
    /// Base URL of an HTTP vector backend.
    pub base_url: Option<String>,
    /// API key for an HTTP vector backend.
    pub api_key: Option<String>,
    /// Collection/index/class name for vector kinds (default `omnillm`).
    pub collection: Option<String>,
    /// Embedding provider (default from module config).
    pub embedding_provider: Option<String>,
    /// Embedding model override.
    pub embedding_model: Option<String>,
    /// Options forwarded to the embedding calls.
    pub embedding_options: Option<RequestOptions>,
    /// Pre-built embedder (overrides provider/model; used by tests).
    pub embedder: Option<Arc<vector::Embedder>>,
    /// Distance metric for vector kinds.
    pub space_type: vector::SpaceType,
    /// Summarizer model service for the summary kind (defaults to the
    /// module default provider).
    pub summarizer: Option<Arc<dyn crate::omnillm::service::Service>>,
    /// Summarizer model name.
    pub summarizer_model: Option<String>,
    /// Recent-message count for the hybrid kind.
    pub recent_limit: usize,
    /// Semantic-hit count for the hybrid kind.
    pub semantic_limit: usize,
    /// Backing stores for the hybrid kind (recent + vector).
    pub hybrid_recent: Option<Arc<dyn Memory>>,
    /// Vector half of the hybrid kind.
    pub hybrid_vector: Option<Arc<dyn vector::VectorMemory>>,
}

impl MemoryConfig {
    pub(crate) fn window(&self) -> usize {
        if self.window_size == 0 {
            20
        } else {
            self.window_size
        }
    }

    pub(crate) fn collection_name(&self) -> String {
        self.collection.clone().unwrap_or_else(|| "omnillm".into())
    }

    pub(crate) fn build_embedder(&self) -> Result<Arc<vector::Embedder>, AiError> {
        if let Some(embedder) = &self.embedder {
            return Ok(embedder.clone());
        }
        let provider = self
            .embedding_provider
            .clone()
            .unwrap_or_else(|| crate::omnillm::config::global_config().provider);
        vector::Embedder::for_provider(
            &provider,
            self.embedding_model.clone(),
            self.embedding_options.clone().unwrap_or_default(),
        )
        .map(Arc::new)
    }
}

/// Build a memory variant by kind name.
pub fn memory(kind: &str, config: MemoryConfig) -> Result<Arc<dyn Memory>, AiError> {
    match kind {
        "windowed" => Ok(Arc::new(windowed::WindowedMemory::new(
            config.window(),
            config.scope.clone(),
        ))),
        "summary" => Ok(Arc::new(summary::SummaryMemory::from_config(&config)?)),
        "session" => Ok(session::session_memory(&config)),
        "cache" => Ok(Arc::new(cache::CacheMemory::from_config(&config))),
        "file" => {
            let path = config.path.clone().ok_or_else(|| {
                AiError::ConfigMissing("file memory requires config.path".into())
            })?;
            Ok(Arc::new(file::FileMemory::open(path, config.scope.clone())?))
        }
        "jdbc" => Ok(Arc::new(sql::SqlMemory::from_config(&config)?)),
        "boxvector" => Ok(Arc::new(vector::BoxVectorMemory::from_config(&config)?)),
        "chroma" | "qdrant" | "pinecone" | "weaviate" | "milvus" | "opensearch" | "typesense" => {
            Ok(Arc::new(backends::http_vector_memory(kind, &config)?))
        }
        "postgres" | "mysql" => {
            let dialect = if kind == "postgres" {
                sql::SqlDialect::Postgres
            } else {
                sql::SqlDialect::MySql
            };
            Ok(Arc::new(sql::SqlVectorMemory::from_config(&config, dialect)?))
        }
        "hybrid" => Ok(Arc::new(hybrid::HybridMemory::from_config(&config)?)),
        other => Err(AiError::InvalidArgument(format!(
            "unknown memory kind '{}'",
            other
        ))),
    }
}

/// Build a vector memory variant by kind name.
///
/// Accepts the vector-capable subset of the factory kinds.
pub fn vector_memory(
    kind: &str,
    config: MemoryConfig,
) -> Result<Arc<dyn vector::VectorMemory>, AiError> {
    match kind {
        "boxvector" => Ok(Arc::new(vector::BoxVectorMemory::from_config(&config)?)),
        "chroma" | "qdrant" | "pinecone" | "weaviate" | "milvus" | "opensearch" | "typesense" => {
            Ok(Arc::new(backends::http_vector_memory(kind, &config)?))
        }
        "postgres" | "mysql" => {
            let dialect = if kind == "postgres" {
                sql::SqlDialect::Postgres
            } else {
                sql::SqlDialect::MySql
            };
            Ok(Arc::new(sql::SqlVectorMemory::from_config(&config, dialect)?))
        }
        other => Err(AiError::InvalidArgument(format!(
            "'{}' is not a vector memory kind",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matching_filters_by_both_keys() {
        let scope = TenantScope::new("a", "c");
        let mut same = Map::new();
        scope.stamp(&mut same);
        assert!(scope.matches(&same));

        let mut other_user = Map::new();
        TenantScope::new("b", "c").stamp(&mut other_user);
        assert!(!scope.matches(&other_user));

        let mut other_conversation = Map::new();
        TenantScope::new("a", "d").stamp(&mut other_conversation);
        assert!(!scope.matches(&other_conversation));
    }

    #[test]
    fn empty_scope_sees_everything() {
        let scope = TenantScope::default();
        let mut stamped = Map::new();
        TenantScope::new("a", "c").stamp(&mut stamped);
        assert!(scope.matches(&stamped));
        assert!(scope.matches(&Map::new()));
    }

    #[test]
    fn unknown_kind_is_invalid_argument() {
        let result = memory("etched-stone", MemoryConfig::default());
        assert!(matches!(result, Err(AiError::InvalidArgument(_))));
    }
}

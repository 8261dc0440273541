//! Summary memory: windowed storage with model-driven compaction.
//!
//! When the entry count crosses `summary_threshold`, the oldest half of
//! the conversation is sent to a summarizer model and replaced by a single
//! synthetic `assistant` summary message.  The summarizer is invoked
//! exactly once per threshold crossing.

use crate::omnillm::config::global_config;
use crate::omnillm::error::AiError;
use crate::omnillm::memory::{Memory, MemoryConfig, MemoryEntry, TenantScope};
use crate::omnillm::message::{MessageEntry, Role};
use crate::omnillm::request::ChatRequest;
use crate::omnillm::service::{service, Service};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

const DEFAULT_THRESHOLD: usize = 20;

/// Windowed memory that compacts its oldest half through a summarizer
/// model when the threshold is crossed.
pub struct SummaryMemory {
    entries: RwLock<Vec<MemoryEntry>>,
    threshold: usize,
    summarizer: Arc<dyn Service>,
    summarizer_model: Option<String>,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl SummaryMemory {
    /// Build from factory config, defaulting the summarizer to the module
    /// default provider.
    pub fn from_config(config: &MemoryConfig) -> Result<Self, AiError> {
        let summarizer = match &config.summarizer {
            Some(summarizer) => summarizer.clone(),
            None => {
                let module = global_config();
                service(&module.provider, &module.provider_config(&module.provider))?
            }
        };
        Ok(SummaryMemory {
            entries: RwLock::new(Vec::new()),
            threshold: if config.summary_threshold == 0 {
                DEFAULT_THRESHOLD
            } else {
                config.summary_threshold
            },
            summarizer,
            summarizer_model: config.summarizer_model.clone(),
            scope: config.scope.clone(),
            metadata: RwLock::new(Map::new()),
        })
    }

    /// Build with an explicit summarizer service.
    pub fn new(
        threshold: usize,
        summarizer: Arc<dyn Service>,
        summarizer_model: Option<String>,
        scope: TenantScope,
    ) -> Self {
        SummaryMemory {
            entries: RwLock::new(Vec::new()),
            threshold: if threshold == 0 { DEFAULT_THRESHOLD } else { threshold },
            summarizer,
            summarizer_model,
            scope,
            metadata: RwLock::new(Map::new()),
        }
    }

    async fn summarize(&self, oldest: &[MemoryEntry]) -> Result<String, AiError> {
        let transcript: String = oldest
            .iter()
            .map(|e| format!("{}: {}\n", e.role.as_str(), e.content))
            .collect();
        let request = ChatRequest {
            messages: vec![
                MessageEntry::new(
                    Role::System,
                    "Summarize the conversation excerpt into a short paragraph preserving facts, \
                     decisions, and open questions.",
                ),
                MessageEntry::new(Role::User, transcript),
            ],
            model: self.summarizer_model.clone(),
            ..Default::default()
        };
        let response = self.summarizer.invoke(&request).await?;
        Ok(response.first_text().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl Memory for SummaryMemory {
    fn kind(&self) -> &str {
        "summary"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);

        let crossed = {
            let mut entries = self.entries.write().await;
            entries.push(entry);
            entries.len() > self.threshold
        };
        if !crossed {
            return Ok(());
        }

        // Snapshot the oldest half outside the lock: the summarizer call
        // suspends, and add() must stay usable meanwhile.
        let oldest: Vec<MemoryEntry> = {
            let entries = self.entries.read().await;
            entries[..entries.len() / 2].to_vec()
        };
        let summary = self.summarize(&oldest).await?;

        let mut entries = self.entries.write().await;
        let drain_to = oldest.len().min(entries.len());
        entries.drain(..drain_to);
        let mut summary_entry = MemoryEntry::new(Role::Assistant, summary)
            .with_metadata("summary", Value::Bool(true));
        self.scope.stamp(&mut summary_entry.metadata);
        entries.insert(0, summary_entry);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| self.scope.matches(&e.metadata))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::message::MessageContent;
    use crate::omnillm::request::EmbeddingRequest;
    use crate::omnillm::service::{ChatResponse, ChunkCallback, EmbeddingResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Service for CountingSummarizer {
        fn name(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                raw: serde_json::json!({}),
                provider: "stub".into(),
                model: None,
                messages: vec![MessageEntry {
                    role: Role::Assistant,
                    content: MessageContent::Text("the summary".into()),
                    tool_call_id: None,
                    tool_calls: vec![],
                }],
                usage: None,
            })
        }

        async fn invoke_stream(
            &self,
            _request: &ChatRequest,
            _on_chunk: ChunkCallback<'_>,
        ) -> Result<(), AiError> {
            Ok(())
        }

        async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
            Err(AiError::Unsupported {
                provider: "stub".into(),
                operation: "embed".into(),
            })
        }
    }

    #[tokio::test]
    async fn summarizer_invoked_once_per_threshold_crossing() {
        let summarizer = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });
        let mem = SummaryMemory::new(4, summarizer.clone(), None, TenantScope::default());

        for i in 0..4 {
            mem.add(MemoryEntry::new(Role::User, format!("m{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);

        // Fifth entry crosses the threshold: exactly one summarizer call,
        // and the oldest half collapses into one assistant summary.
        mem.add(MemoryEntry::new(Role::User, "m4")).await.unwrap();
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

        let all = mem.get_all().await.unwrap();
        assert_eq!(all[0].content, "the summary");
        assert_eq!(all[0].role, Role::Assistant);
        assert!(all.len() < 5);
    }
}

use async_trait::async_trait;
use omnillm::omnillm::documents::{documents, DocumentLoader, IngestOptions};
use omnillm::omnillm::memory::vector::Embedder;
use omnillm::omnillm::memory::{vector_memory, MemoryConfig};
use omnillm::omnillm::request::EmbeddingRequest;
use omnillm::omnillm::service::{ChatResponse, ChunkCallback, EmbeddingResponse, Service};
use omnillm::{AiError, ChatRequest};
use serde_json::json;
use std::sync::Arc;

struct StubEmbeddings;

#[async_trait]
impl Service for StubEmbeddings {
    fn name(&self) -> &str {
        "stub-embeddings"
    }

    async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
        Err(AiError::Unsupported {
            provider: "stub-embeddings".into(),
            operation: "chat".into(),
        })
    }

    async fn invoke_stream(
        &self,
        _request: &ChatRequest,
        _on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        Err(AiError::Unsupported {
            provider: "stub-embeddings".into(),
            operation: "chatStream".into(),
        })
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        let vectors = request
            .input
            .texts()
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 4];
                for (i, byte) in text.bytes().enumerate() {
                    vector[i % 4] += byte as f32;
                }
                vector
            })
            .collect();
        Ok(EmbeddingResponse {
            raw: json!({}),
            vectors,
            usage: None,
        })
    }
}

fn test_memory() -> Arc<dyn omnillm::omnillm::memory::vector::VectorMemory> {
    let _ = env_logger::builder().is_test(true).try_init();
    vector_memory(
        "boxvector",
        MemoryConfig {
            embedder: Some(Arc::new(Embedder::from_service(
                Arc::new(StubEmbeddings),
                None,
            ))),
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn file_to_memory_ingestion_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("handbook.txt");
    let body = "Team handbook.\n\n".to_string() + &"Policies and procedures. ".repeat(200);
    tokio::fs::write(&path, &body).await.unwrap();

    let memory = test_memory();
    let report = documents(&path)
        .to_memory(
            memory.clone(),
            IngestOptions {
                chunk_size: 100,
                overlap: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.documents_in, 1);
    assert!(report.chunks_out > 1);
    assert_eq!(report.stored + report.skipped + report.deduped, report.chunks_out);
    assert!(report.errors.is_empty());
    assert!(report.token_count > 0);

    // Stored chunks are searchable.
    let hits = memory
        .search("Policies and procedures.", 3, None, None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].record.metadata["source"], json!(path.display().to_string()));
}

#[tokio::test]
async fn identical_documents_dedupe_to_at_least_count_minus_one() {
    struct Same(usize);

    #[async_trait]
    impl DocumentLoader for Same {
        fn loader_type(&self) -> &str {
            "stub"
        }

        async fn load(
            &self,
        ) -> Result<Vec<omnillm::omnillm::documents::Document>, AiError> {
            Ok((0..self.0)
                .map(|_| omnillm::omnillm::documents::Document::new("identical content"))
                .collect())
        }
    }

    let report = Same(4)
        .load_to(test_memory(), IngestOptions::default())
        .await
        .unwrap();
    assert!(report.deduped >= 3);
    assert_eq!(report.stored, 1);
}

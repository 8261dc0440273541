// src/lib.rs

// Import the top-level `omnillm` module.
pub mod omnillm;

// Re-exporting key items for easier external access.
pub use omnillm::agent::{Agent, AgentResponse};
pub use omnillm::api::{chat, chat_async, chat_stream, embed};
pub use omnillm::config::OmniLlmConfig;
pub use omnillm::error::AiError;
pub use omnillm::mcp::client::McpClient;
pub use omnillm::mcp::server::McpServer;
pub use omnillm::memory::{Memory, MemoryEntry, TenantScope};
pub use omnillm::message::{ChatMessage, Role};
pub use omnillm::request::{ChatRequest, EmbeddingRequest, RequestOptions, ReturnFormat};
pub use omnillm::runnable::{Runnable, Sequence};
pub use omnillm::service::{ChatResponse, Service, TokenUsage};
pub use omnillm::structured::{populate, StructSchema};
pub use omnillm::tool::{Tool, ToolRegistry};

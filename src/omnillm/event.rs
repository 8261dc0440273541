//! Lifecycle event system.
//!
//! Provides a callback-based observability layer covering every AI
//! operation in the runtime.  Implement [`EventHandler`] to receive
//! real-time notifications about:
//!
//! - **Chat round-trips**: request dispatch and response arrival per provider
//! - **Embeddings**: request and completion with vector counts
//! - **Agent lifecycle**: run start/end, iteration-limit warnings
//! - **Tool operations**: execution start and outcome
//! - **Failures**: rate-limit hits and raised errors
//!
//! Handlers are registered either on the process-wide [`EventBus`] (module
//! configuration style) or directly on individual agents.  Both methods
//! deliver the same [`AiEvent`] values.  A handler that misbehaves cannot
//! break the request path: emission failures are logged and swallowed.
//!
//! # Example
//!
//! ```rust,no_run
//! use omnillm::omnillm::event::{AiEvent, EventBus, EventHandler};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: &AiEvent) {
//!         if let AiEvent::ChatCompleted { provider, duration_ms, .. } = event {
//!             println!("{} answered in {}ms", provider, duration_ms);
//!         }
//!     }
//! }
//!
//! EventBus::global().register(Arc::new(Printer));
//! ```

use crate::omnillm::service::TokenUsage;
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::sync::RwLock;

/// Tenant metadata plumbed through every downstream event.
///
/// Agents and memories operate per `(user_id, conversation_id)`; events
/// carry the same keys so handlers can attribute activity without
/// external state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantContext {
    /// Owning user, when multi-tenant isolation is in play.
    pub user_id: Option<String>,
    /// Conversation within the user's scope.
    pub conversation_id: Option<String>,
    /// Free-form tenant identifier from request options.
    pub tenant_id: Option<String>,
}

impl TenantContext {
    /// True when no tenant keys are set.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.conversation_id.is_none() && self.tenant_id.is_none()
    }
}

/// Events emitted during the lifetime of AI operations.
///
/// `*Started` variants fire strictly before their `*Completed` counterpart
/// for the same operation.
#[derive(Debug, Clone)]
pub enum AiEvent {
    // ── Chat lifecycle ────────────────────────────────────────────────────
    /// Fired before a chat request is dispatched to a provider.
    ChatRequested {
        /// Provider the request is routed to.
        provider: String,
        /// Model identifier, when one was selected.
        model: Option<String>,
        /// Number of messages in the outgoing request.
        message_count: usize,
        /// Tenant metadata from the request options.
        tenant: TenantContext,
    },
    /// Fired when a chat response has been normalized.
    ChatCompleted {
        /// Provider that answered.
        provider: String,
        /// Model identifier, when one was selected.
        model: Option<String>,
        /// Token accounting reported by the provider, if any.
        usage: Option<TokenUsage>,
        /// Wall-clock round-trip duration.
        duration_ms: u64,
        /// Tenant metadata from the request options.
        tenant: TenantContext,
    },

    // ── Embedding lifecycle ───────────────────────────────────────────────
    /// Fired before an embedding request is dispatched.
    EmbedRequested {
        /// Provider the request is routed to.
        provider: String,
        /// Number of input strings in the batch.
        input_count: usize,
    },
    /// Fired when an embedding response arrives.
    EmbedCompleted {
        /// Provider that answered.
        provider: String,
        /// Number of vectors returned.
        vector_count: usize,
        /// Wall-clock round-trip duration.
        duration_ms: u64,
    },

    // ── Agent lifecycle ───────────────────────────────────────────────────
    /// Fired at the top of an agent run, before memory retrieval.
    AgentRunStarted {
        /// Agent name.
        agent: String,
        /// First ~120 characters of the user input.
        input_preview: String,
        /// Tenant scope the run executes under.
        tenant: TenantContext,
    },
    /// Fired when the agent loop finalizes.
    AgentRunCompleted {
        /// Agent name.
        agent: String,
        /// Number of model invocations performed.
        iterations: usize,
        /// Cumulative token usage across every invocation, if reported.
        usage: Option<TokenUsage>,
        /// Tenant scope the run executed under.
        tenant: TenantContext,
    },
    /// The agent loop hit its `max_iterations` bound and finalized with the
    /// last assistant message it had.
    AgentIterationLimit {
        /// Agent name.
        agent: String,
        /// The bound that was hit.
        limit: usize,
    },

    // ── Tool lifecycle ────────────────────────────────────────────────────
    /// Fired before a tool callable runs.
    ToolExecutionStarted {
        /// Agent performing the dispatch, when there is one.
        agent: Option<String>,
        /// Tool name as requested by the model.
        tool: String,
        /// Raw JSON arguments supplied by the model.
        arguments: serde_json::Value,
    },
    /// Fired after a tool callable returns (success or failure).
    ToolExecutionCompleted {
        /// Agent performing the dispatch, when there is one.
        agent: Option<String>,
        /// Tool name.
        tool: String,
        /// `true` when the callable ran without error.
        success: bool,
        /// Error text when the callable failed or was not found.
        error: Option<String>,
        /// Execution time of the callable.
        duration_ms: u64,
    },

    // ── Failures ──────────────────────────────────────────────────────────
    /// The provider answered HTTP 429.  Retry is the caller's decision.
    RateLimitHit {
        /// Provider that rejected the request.
        provider: String,
        /// HTTP status (always 429 today; carried for symmetry with logs).
        status_code: u16,
        /// Parsed `Retry-After` seconds, when present.
        retry_after: Option<u64>,
    },
    /// A request-path error was raised to the caller.
    ErrorRaised {
        /// Operation that failed (`"chat"`, `"embed"`, `"agent.run"`, ...).
        operation: String,
        /// Display form of the error.
        message: String,
    },
}

/// Trait implemented by observers of [`AiEvent`]s.
///
/// The single method has a default no-op body so handlers only override
/// what they care about.  Handlers run on the emitting task; long-running
/// work should be handed off internally.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once per emitted event.
    async fn on_event(&self, _event: &AiEvent) {}
}

/// Process-wide registry of event handlers.
///
/// The global bus receives every event emitted anywhere in the runtime;
/// components with locally attached handlers (agents) additionally deliver
/// to those.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

lazy_static! {
    static ref GLOBAL_BUS: EventBus = EventBus {
        handlers: RwLock::new(Vec::new()),
    };
}

impl EventBus {
    /// Borrow the process-wide bus.
    pub fn global() -> &'static EventBus {
        &GLOBAL_BUS
    }

    /// Register a handler.  Handlers receive every event emitted after
    /// registration, in registration order.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut guard) = self.handlers.write() {
            guard.push(handler);
        }
    }

    /// Drop all registered handlers.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.handlers.write() {
            guard.clear();
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Deliver an event to every registered handler.
    ///
    /// Handler misbehavior never reaches the emitter: a poisoned registry
    /// lock is logged and skipped.
    pub async fn emit(&self, event: &AiEvent) {
        let snapshot: Vec<Arc<dyn EventHandler>> = match self.handlers.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                log::error!("event bus lock poisoned; dropping event {:?}", event);
                return;
            }
        };
        for handler in snapshot {
            handler.on_event(event).await;
        }
    }
}

/// Emit an event on the global bus.
///
/// Convenience used throughout the crate so emission sites stay one line.
pub async fn emit(event: AiEvent) {
    EventBus::global().emit(&event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn on_event(&self, _event: &AiEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn bus_delivers_to_all_handlers() {
        let bus = EventBus {
            handlers: RwLock::new(Vec::new()),
        };
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        bus.register(a.clone());
        bus.register(b.clone());

        bus.emit(&AiEvent::EmbedRequested {
            provider: "openai".into(),
            input_count: 1,
        })
        .await;

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tenant_context_emptiness() {
        assert!(TenantContext::default().is_empty());
        let scoped = TenantContext {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert!(!scoped.is_empty());
    }
}

//! Configuration for OmniLLM.
//!
//! Users construct these structs manually; no file parsing dependencies
//! are introduced.  The module-wide [`OmniLlmConfig`] seeds defaults into
//! every request (provider, credentials, params, timeout, logging) and
//! carries predefined per-provider blocks plus audit settings.
//!
//! # Example
//!
//! ```rust
//! use omnillm::OmniLlmConfig;
//! use omnillm::omnillm::config::{configure, ProviderConfig};
//! use omnillm::omnillm::request::Credentials;
//!
//! let mut config = OmniLlmConfig::default();
//! config.provider = "claude".into();
//! config.providers.insert(
//!     "claude".into(),
//!     ProviderConfig {
//!         credentials: Some(Credentials::Key("sk-ant-...".into())),
//!         ..Default::default()
//!     },
//! );
//! configure(config);
//! ```

use crate::omnillm::request::{Credentials, ReturnFormat};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;

/// Predefined configuration block for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Credentials used when the request options carry none.
    pub credentials: Option<Credentials>,
    /// Override of the provider's default base URL (proxies, self-hosted).
    pub base_url: Option<String>,
    /// Model used when the request names none.
    pub default_model: Option<String>,
    /// Params layered under every request's params.
    pub default_params: serde_json::Map<String, serde_json::Value>,
    /// Headers layered under every request's headers.
    pub default_headers: HashMap<String, String>,
}

/// Where audit entries are persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AuditStoreKind {
    /// In-process ring buffer.
    #[default]
    Memory,
    /// NDJSON append file at the given path.
    File(String),
    /// SQL table reached through the caller-supplied executor.
    Sql,
}

/// Audit subsystem settings.
#[derive(Debug, Clone)]
pub struct AuditSettings {
    /// Explicit on/off.  `None` defers to the
    /// `BOXLANG_MODULES_BXAI_AUDIT_ENABLED` environment variable, then to
    /// off.
    pub enabled: Option<bool>,
    /// Persistence backend.
    pub store: AuditStoreKind,
    /// Capture span inputs.
    pub capture_input: bool,
    /// Capture span outputs.
    pub capture_output: bool,
    /// Capture full message arrays on model spans.
    pub capture_messages: bool,
    /// Capture tool arguments on tool spans.
    pub capture_tool_args: bool,
    /// Key patterns whose values are redacted before persisting.
    pub sanitize_patterns: Vec<String>,
    /// Replacement for redacted values.
    pub redact_value: String,
    /// Truncation bound for span inputs, in bytes.
    pub max_input_size: usize,
    /// Truncation bound for span outputs, in bytes.
    pub max_output_size: usize,
    /// Entries older than this are eligible for pruning.
    pub retention_days: u32,
    /// Hand writes to a background task instead of blocking the span.
    pub async_write: bool,
    /// Batch size for the async writer.
    pub batch_size: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        AuditSettings {
            enabled: None,
            store: AuditStoreKind::Memory,
            capture_input: true,
            capture_output: true,
            capture_messages: false,
            capture_tool_args: true,
            sanitize_patterns: vec![
                "password".into(),
                "apiKey".into(),
                "token".into(),
                "secret".into(),
            ],
            redact_value: "[REDACTED]".into(),
            max_input_size: 10_000,
            max_output_size: 10_000,
            retention_days: 30,
            async_write: false,
            batch_size: 100,
        }
    }
}

/// Environment variable toggling audit capture at runtime.
pub const AUDIT_ENV_VAR: &str = "BOXLANG_MODULES_BXAI_AUDIT_ENABLED";

impl AuditSettings {
    /// Effective on/off, by precedence: explicit setting, then the
    /// [`AUDIT_ENV_VAR`] environment variable, then off.
    pub fn effective_enabled(&self) -> bool {
        if let Some(enabled) = self.enabled {
            return enabled;
        }
        match std::env::var(AUDIT_ENV_VAR) {
            Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            Err(_) => false,
        }
    }
}

/// Module-wide configuration seeded into every request.
#[derive(Debug, Clone)]
pub struct OmniLlmConfig {
    /// Default provider name.
    pub provider: String,
    /// Module-default credentials, used after request options, provider
    /// blocks, and convention environment variables all come up empty.
    pub credentials: Option<Credentials>,
    /// Params seeded into every chat request.
    pub default_params: serde_json::Map<String, serde_json::Value>,
    /// Default request deadline in seconds.
    pub timeout_secs: u64,
    /// Default return format for top-level calls.
    pub return_format: ReturnFormat,
    /// Log outgoing requests via the `log` facade.
    pub log_request: bool,
    /// Echo outgoing requests to stdout.
    pub log_request_to_console: bool,
    /// Log raw responses via the `log` facade.
    pub log_response: bool,
    /// Echo raw responses to stdout.
    pub log_response_to_console: bool,
    /// Predefined provider blocks, keyed by provider name.
    pub providers: HashMap<String, ProviderConfig>,
    /// Audit subsystem settings.
    pub audit: AuditSettings,
}

impl Default for OmniLlmConfig {
    fn default() -> Self {
        OmniLlmConfig {
            provider: "openai".into(),
            credentials: None,
            default_params: serde_json::Map::new(),
            timeout_secs: crate::omnillm::request::DEFAULT_TIMEOUT_SECS,
            return_format: ReturnFormat::Single,
            log_request: false,
            log_request_to_console: false,
            log_response: false,
            log_response_to_console: false,
            providers: HashMap::new(),
            audit: AuditSettings::default(),
        }
    }
}

impl OmniLlmConfig {
    /// The configured block for a provider, or an empty default.
    pub fn provider_config(&self, provider: &str) -> ProviderConfig {
        let mut block = self.providers.get(provider).cloned().unwrap_or_default();
        if block.credentials.is_none() {
            block.credentials = self.credentials.clone();
        }
        block
    }
}

lazy_static! {
    static ref GLOBAL_CONFIG: RwLock<OmniLlmConfig> = RwLock::new(OmniLlmConfig::default());
}

/// Replace the module-wide configuration.
pub fn configure(config: OmniLlmConfig) {
    if let Ok(mut guard) = GLOBAL_CONFIG.write() {
        *guard = config;
    }
}

/// Snapshot the module-wide configuration.
pub fn global_config() -> OmniLlmConfig {
    GLOBAL_CONFIG
        .read()
        .map(|guard| guard.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_falls_back_to_module_credentials() {
        let mut config = OmniLlmConfig::default();
        config.credentials = Some(Credentials::Key("module-key".into()));
        config
            .providers
            .insert("mistral".into(), ProviderConfig::default());

        let block = config.provider_config("mistral");
        assert_eq!(
            block.credentials,
            Some(Credentials::Key("module-key".into()))
        );
        // Unknown providers still inherit.
        let other = config.provider_config("unknown");
        assert!(other.credentials.is_some());
    }

    #[test]
    fn audit_explicit_setting_beats_env() {
        let settings = AuditSettings {
            enabled: Some(true),
            ..Default::default()
        };
        assert!(settings.effective_enabled());
        let off = AuditSettings {
            enabled: Some(false),
            ..Default::default()
        };
        assert!(!off.effective_enabled());
    }
}

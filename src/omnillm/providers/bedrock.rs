//! AWS Bedrock adapter using the Converse API with SigV4 request signing.
//!
//! Bedrock substitutes an AWS credential struct for an API key; every
//! request is signed with SigV4 (derived signing key over sha256/hmac, no
//! AWS SDK).  The streaming endpoint returns binary event-stream frames:
//! the adapter parses the framing, unwraps each payload (base64 `bytes`
//! envelopes included), and converts it into an OpenAI-compatible chunk
//! before invoking the callback.
//!
//! Embeddings route to the Titan embedding model via `/model/{id}/invoke`.

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::message::{MessageContent, MessageEntry, Role, ToolCall};
use crate::omnillm::providers::{
    log_request_payload, log_response_payload, parse_retry_after, schema_directive,
};
use crate::omnillm::request::{ChatRequest, Credentials, EmbeddingRequest, ReturnFormat};
use crate::omnillm::service::{
    error_chunk, get_shared_http_client, provider_error, resolve_aws_credentials, transport_error,
    ChatResponse, ChunkCallback, EmbeddingResponse, Service, TokenUsage,
};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

const DEFAULT_MODEL: &str = "anthropic.claude-sonnet-4-20250514-v1:0";
const DEFAULT_EMBED_MODEL: &str = "amazon.titan-embed-text-v2:0";
const SERVICE: &str = "bedrock";

/// Service implementation for AWS Bedrock.
pub struct BedrockService {
    config: ProviderConfig,
}

struct AwsCreds {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    region: String,
}

impl BedrockService {
    /// Build the adapter.  Credentials resolve per-request so env-var
    /// changes and per-call overrides are honored.
    pub fn new(config: &ProviderConfig) -> Self {
        BedrockService {
            config: config.clone(),
        }
    }

    fn creds_for(&self, request_credentials: Option<&Credentials>) -> Result<AwsCreds, AiError> {
        match resolve_aws_credentials(request_credentials, &self.config)? {
            Credentials::Aws {
                access_key_id,
                secret_access_key,
                session_token,
                region,
            } => Ok(AwsCreds {
                access_key_id,
                secret_access_key,
                session_token,
                region,
            }),
            Credentials::Key(_) => Err(AiError::ConfigMissing(
                "bedrock requires AWS credentials, not a plain API key".into(),
            )),
        }
    }

    fn model_for(&self, request_model: &Option<String>) -> String {
        request_model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    fn converse_body(&self, request: &ChatRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for entry in &request.messages {
            match entry.role {
                Role::System | Role::Developer => system_parts.push(entry.content.as_text()),
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": [{"text": entry.content.as_text()}],
                })),
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = entry.content.as_text();
                    if !text.is_empty() {
                        blocks.push(json!({"text": text}));
                    }
                    for call in &entry.tool_calls {
                        blocks.push(json!({"toolUse": {
                            "toolUseId": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }}));
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => messages.push(json!({
                    "role": "user",
                    "content": [{"toolResult": {
                        "toolUseId": entry.tool_call_id.clone().unwrap_or_default(),
                        "content": [{"text": entry.content.as_text()}],
                    }}],
                })),
            }
        }

        let mut body = Map::new();
        body.insert("messages".into(), Value::Array(messages));

        let mut params = self.config.default_params.clone();
        for (key, value) in &request.params {
            params.insert(key.clone(), value.clone());
        }
        if let Some(tools) = params.remove("tools") {
            let specs: Vec<Value> = tools
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|tool| {
                            let function = tool.get("function")?;
                            Some(json!({"toolSpec": {
                                "name": function.get("name")?.as_str()?,
                                "description": function.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                                "inputSchema": {"json": function.get("parameters").cloned()
                                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}))},
                            }}))
                        })
                        .collect()
                })
                .unwrap_or_default();
            body.insert("toolConfig".into(), json!({"tools": specs}));
        }

        let mut inference = Map::new();
        if let Some(max_tokens) = params.remove("max_tokens") {
            inference.insert("maxTokens".into(), max_tokens);
        }
        if let Some(temperature) = params.remove("temperature") {
            inference.insert("temperature".into(), temperature);
        }
        if let Some(top_p) = params.remove("top_p") {
            inference.insert("topP".into(), top_p);
        }
        if !inference.is_empty() {
            body.insert("inferenceConfig".into(), Value::Object(inference));
        }

        if let Some(ReturnFormat::Schema(schema)) = &request.options.return_format {
            system_parts.push(schema_directive(schema));
        }
        if !system_parts.is_empty() {
            let system: Vec<Value> = system_parts.iter().map(|s| json!({"text": s})).collect();
            body.insert("system".into(), Value::Array(system));
        }
        Value::Object(body)
    }

    async fn signed_post(
        &self,
        creds: &AwsCreds,
        path: &str,
        body: &Value,
        timeout_secs: u64,
    ) -> Result<reqwest::Response, AiError> {
        let host = format!("bedrock-runtime.{}.amazonaws.com", creds.region);
        let url = format!("https://{}{}", host, path);
        let payload = serde_json::to_vec(body)
            .map_err(|e| AiError::Protocol(format!("request encode failed: {}", e)))?;

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(&payload));

        // Canonical request: sorted, lowercase headers; path segments
        // percent-encoded (model IDs contain ':' and '.').
        let canonical_uri = canonical_path(path);
        let mut header_pairs = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &creds.session_token {
            header_pairs.push(("x-amz-security-token".to_string(), token.clone()));
        }
        header_pairs.sort();
        let canonical_headers: String = header_pairs
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = header_pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "POST\n{}\n\n{}\n{}\n{}",
            canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/{}/aws4_request", datestamp, creds.region, SERVICE);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", creds.secret_access_key).as_bytes(),
            datestamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, creds.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = get_shared_http_client()
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json")
            .header("X-Amz-Date", amz_date)
            .header("Authorization", authorization);
        if let Some(token) = &creds.session_token {
            builder = builder.header("X-Amz-Security-Token", token.clone());
        }
        builder
            .body(payload)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_secs))
    }
}

#[async_trait::async_trait]
impl Service for BedrockService {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let creds = self.creds_for(request.options.credentials.as_ref())?;
        let model = self.model_for(&request.model);
        let body = self.converse_body(request);
        log_request_payload("bedrock", request, &body);

        let path = format!("/model/{}/converse", urlencoding::encode(&model));
        let timeout = request.options.timeout();
        let response = self.signed_post(&creds, &path, &body, timeout).await?;

        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        log_response_payload("bedrock", request, &text);

        if !status.is_success() {
            return Err(provider_error("bedrock", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        Ok(parse_converse_response(model, raw))
    }

    async fn invoke_stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        let creds = self.creds_for(request.options.credentials.as_ref())?;
        let model = self.model_for(&request.model);
        let body = self.converse_body(request);
        log_request_payload("bedrock", request, &body);

        let path = format!("/model/{}/converse-stream", urlencoding::encode(&model));
        let timeout = request.options.timeout();
        let mut response = self.signed_post(&creds, &path, &body, timeout).await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let text = response
                .text()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            return Err(provider_error("bedrock", status.as_u16(), &text, retry_after).await);
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut delivered = false;
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some((payload, consumed)) = next_event_frame(&buffer)? {
                        buffer.drain(..consumed);
                        if let Some(chunk) = unwrap_event_payload(&payload) {
                            delivered = true;
                            on_chunk(chunk);
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    let err = transport_error(e, timeout);
                    if delivered {
                        on_chunk(error_chunk(&err.to_string()));
                        return Ok(());
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        let creds = self.creds_for(request.options.credentials.as_ref())?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string());
        let path = format!("/model/{}/invoke", urlencoding::encode(&model));
        let timeout = request.options.timeout();

        let mut vectors = Vec::new();
        let mut raw_responses = Vec::new();
        for text in request.input.texts() {
            let body = json!({"inputText": text});
            let response = self.signed_post(&creds, &path, &body, timeout).await?;
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let text_body = response
                .text()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            if !status.is_success() {
                return Err(provider_error("bedrock", status.as_u16(), &text_body, retry_after).await);
            }
            let raw: Value = serde_json::from_str(&text_body)?;
            let vector = raw
                .get("embedding")
                .and_then(|e| e.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|f| f.as_f64())
                        .map(|f| f as f32)
                        .collect::<Vec<f32>>()
                })
                .unwrap_or_default();
            vectors.push(vector);
            raw_responses.push(raw);
        }
        Ok(EmbeddingResponse {
            raw: Value::Array(raw_responses),
            vectors,
            usage: None,
        })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode each path segment per the SigV4 canonical URI rules.
fn canonical_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pull the next complete event-stream frame's payload out of `buffer`.
///
/// Frame layout: 4-byte total length, 4-byte headers length, 4-byte
/// prelude CRC, headers, payload, 4-byte message CRC (big-endian).
/// Returns `(payload, bytes_consumed)` or `None` when the buffer holds
/// only a partial frame.
fn next_event_frame(buffer: &[u8]) -> Result<Option<(Vec<u8>, usize)>, AiError> {
    if buffer.len() < 12 {
        return Ok(None);
    }
    let total_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    let headers_len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if total_len < 16 || headers_len + 16 > total_len {
        return Err(AiError::Protocol(format!(
            "malformed event-stream frame (total {}, headers {})",
            total_len, headers_len
        )));
    }
    if buffer.len() < total_len {
        return Ok(None);
    }
    let payload_start = 12 + headers_len;
    let payload_end = total_len - 4;
    Ok(Some((
        buffer[payload_start..payload_end].to_vec(),
        total_len,
    )))
}

/// Decode a frame payload into an OpenAI-compatible chunk.
///
/// Payloads are JSON; `bytes` envelopes carry a base64-encoded inner
/// event.  Content deltas map to `choices[0].delta.content`, stop events
/// to a `finish_reason`, metadata to a `usage` object.  Unknown events
/// are dropped.
fn unwrap_event_payload(payload: &[u8]) -> Option<Value> {
    let decoded: Value = serde_json::from_slice(payload).ok()?;
    let event = match decoded.get("bytes").and_then(|b| b.as_str()) {
        Some(encoded) => {
            let inner = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()?;
            serde_json::from_slice(&inner).ok()?
        }
        None => decoded,
    };
    to_openai_chunk(&event)
}

fn to_openai_chunk(event: &Value) -> Option<Value> {
    // Converse stream: {"contentBlockDelta": {"delta": {"text": ...}}}
    if let Some(text) = event
        .get("contentBlockDelta")
        .and_then(|d| d.get("delta"))
        .and_then(|d| d.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(json!({"choices": [{"delta": {"content": text}}]}));
    }
    // Anthropic-on-Bedrock invoke stream: {"type": "content_block_delta", ...}
    if let Some(text) = event
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(json!({"choices": [{"delta": {"content": text}}]}));
    }
    // Titan text: {"outputText": ...}
    if let Some(text) = event.get("outputText").and_then(|t| t.as_str()) {
        return Some(json!({"choices": [{"delta": {"content": text}}]}));
    }
    if let Some(stop) = event
        .get("messageStop")
        .and_then(|s| s.get("stopReason"))
        .and_then(|r| r.as_str())
    {
        return Some(json!({"choices": [{"delta": {}, "finish_reason": stop}]}));
    }
    if let Some(usage) = event.get("metadata").and_then(|m| m.get("usage")) {
        return Some(json!({"choices": [], "usage": {
            "prompt_tokens": usage.get("inputTokens").cloned().unwrap_or(json!(0)),
            "completion_tokens": usage.get("outputTokens").cloned().unwrap_or(json!(0)),
            "total_tokens": usage.get("totalTokens").cloned().unwrap_or(json!(0)),
        }}));
    }
    None
}

/// Normalize a Converse response into the unified envelope.
pub(crate) fn parse_converse_response(model: String, raw: Value) -> ChatResponse {
    let usage = raw.get("usage").and_then(|usage| {
        let input = usage.get("inputTokens")?.as_u64()? as usize;
        let output = usage.get("outputTokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        Some(TokenUsage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        })
    });

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = raw
        .get("output")
        .and_then(|o| o.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    {
        for block in blocks {
            if let Some(fragment) = block.get("text").and_then(|t| t.as_str()) {
                text.push_str(fragment);
            }
            if let Some(tool_use) = block.get("toolUse") {
                tool_calls.push(ToolCall {
                    id: tool_use
                        .get("toolUseId")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: tool_use
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: tool_use.get("input").cloned().unwrap_or(Value::Null),
                });
            }
        }
    }

    let messages = vec![MessageEntry {
        role: Role::Assistant,
        content: MessageContent::Text(text),
        tool_call_id: None,
        tool_calls,
    }];

    ChatResponse {
        raw,
        provider: "bedrock".to_string(),
        model: Some(model),
        messages,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_payload(payload: &[u8]) -> Vec<u8> {
        let headers: &[u8] = &[];
        let total_len = 12 + headers.len() + payload.len() + 4;
        let mut frame = Vec::new();
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]); // prelude CRC (unchecked)
        frame.extend_from_slice(headers);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0, 0, 0, 0]); // message CRC (unchecked)
        frame
    }

    #[test]
    fn event_frame_parsing_handles_partials() {
        let payload = br#"{"contentBlockDelta":{"delta":{"text":"hi"}}}"#;
        let frame = frame_with_payload(payload);

        // Partial frame: nothing yet.
        assert!(next_event_frame(&frame[..8]).unwrap().is_none());

        let (parsed, consumed) = next_event_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(parsed, payload);
    }

    #[test]
    fn base64_bytes_envelope_unwraps_to_openai_chunk() {
        let inner = json!({"type": "content_block_delta", "delta": {"text": "partial"}});
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&inner).unwrap());
        let payload = serde_json::to_vec(&json!({ "bytes": encoded })).unwrap();
        let chunk = unwrap_event_payload(&payload).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], json!("partial"));
    }

    #[test]
    fn converse_response_parses_tool_use() {
        let raw = json!({
            "output": {"message": {"role": "assistant", "content": [
                {"toolUse": {"toolUseId": "tooluse_1", "name": "search", "input": {"q": "x"}}}
            ]}},
            "usage": {"inputTokens": 9, "outputTokens": 4, "totalTokens": 13}
        });
        let response = parse_converse_response(DEFAULT_MODEL.into(), raw);
        assert_eq!(response.tool_calls()[0].id, "tooluse_1");
        assert_eq!(response.usage.as_ref().unwrap().prompt_tokens, 9);
    }

    #[test]
    fn canonical_path_encodes_model_segments() {
        let path = format!("/model/{}/converse", urlencoding::encode(DEFAULT_MODEL));
        let canonical = canonical_path(&path);
        assert!(canonical.contains("anthropic.claude"));
        assert!(!canonical.contains(':'));
    }
}

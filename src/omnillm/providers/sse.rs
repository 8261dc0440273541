//! Shared SSE streaming infrastructure for the provider adapters.
//!
//! Every streaming provider follows the same pattern: receive a
//! `reqwest::Response`, accumulate its body, cut it into events at blank
//! lines, and hand each event's `data:` payload to a provider-specific
//! handler.  [`SseBuffer`] owns the cutting; [`for_each_data_line`] owns
//! the response-driving loop, so adapters only supply the handler.

use crate::omnillm::error::AiError;
use crate::omnillm::service::transport_error;

/// Incremental SSE event splitter.
///
/// Bytes are appended as they arrive; every event a push completes comes
/// back out as its `data:` payload.  Whatever follows the last blank-line
/// terminator stays buffered for the next push, so chunk boundaries can
/// fall anywhere.
pub(crate) struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    pub(crate) fn new() -> Self {
        SseBuffer {
            pending: String::new(),
        }
    }

    /// Append a chunk and collect the payloads of the events it completes.
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let cut = match self.pending.rfind("\n\n") {
            Some(terminator) => terminator + 2,
            // No complete event yet.
            None => return Vec::new(),
        };
        let tail = self.pending.split_off(cut);
        let complete = std::mem::replace(&mut self.pending, tail);
        complete.split("\n\n").filter_map(event_payload).collect()
    }

    /// Treat anything still buffered as a final, unterminated event.
    ///
    /// Called when the body closes without a trailing blank line.
    pub(crate) fn flush(&mut self) -> Option<String> {
        let remainder = std::mem::take(&mut self.pending);
        event_payload(&remainder)
    }
}

/// The `data:` payload of one event block, if it carries one.
///
/// `event:`, `id:`, and `retry:` fields are irrelevant to the adapters.
/// An event with several `data:` lines yields them joined by newlines, per
/// the SSE grammar.
fn event_payload(block: &str) -> Option<String> {
    let mut payload = String::new();
    for line in block.lines() {
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if !payload.is_empty() {
                payload.push('\n');
            }
            payload.push_str(data);
        }
    }
    (!payload.is_empty()).then_some(payload)
}

/// Drive an SSE response body to completion, feeding each event's `data:`
/// payload to `handle`.
///
/// Transport failures surface as errors; the caller decides whether
/// already-delivered payloads turn the failure into a terminal error chunk
/// per the streaming contract.
pub(crate) async fn for_each_data_line<F>(
    mut response: reqwest::Response,
    timeout_secs: u64,
    mut handle: F,
) -> Result<(), AiError>
where
    F: FnMut(&str),
{
    let mut buffer = SseBuffer::new();
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                for payload in buffer.push(&String::from_utf8_lossy(&bytes)) {
                    handle(&payload);
                }
            }
            Ok(None) => {
                if let Some(payload) = buffer.flush() {
                    handle(&payload);
                }
                return Ok(());
            }
            Err(e) => return Err(transport_error(e, timeout_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_event_yields_its_payload() {
        let mut buffer = SseBuffer::new();
        let payloads = buffer.push("event: message\ndata: {\"hello\":\"world\"}\n\n");
        assert_eq!(payloads, vec!["{\"hello\":\"world\"}"]);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn one_push_can_complete_several_events() {
        let mut buffer = SseBuffer::new();
        let payloads = buffer.push("data: first\n\ndata: second\n\n");
        assert_eq!(payloads, vec!["first", "second"]);
    }

    #[test]
    fn unterminated_tail_waits_for_more_bytes() {
        let mut buffer = SseBuffer::new();
        let payloads = buffer.push("data: complete\n\ndata: par");
        assert_eq!(payloads, vec!["complete"]);

        // The split point can land mid-payload.
        let payloads = buffer.push("tial\n\n");
        assert_eq!(payloads, vec!["partial"]);
    }

    #[test]
    fn non_data_fields_and_blank_payloads_are_dropped() {
        let mut buffer = SseBuffer::new();
        let payloads = buffer.push("event: ping\nid: 42\nretry: 5000\ndata: \n\ndata: kept\n\n");
        assert_eq!(payloads, vec!["kept"]);
    }

    #[test]
    fn multi_line_data_joins_with_newlines() {
        let mut buffer = SseBuffer::new();
        let payloads = buffer.push("data: line one\ndata: line two\n\n");
        assert_eq!(payloads, vec!["line one\nline two"]);
    }

    #[test]
    fn done_sentinel_passes_through() {
        let mut buffer = SseBuffer::new();
        assert_eq!(buffer.push("data: [DONE]\n\n"), vec!["[DONE]"]);
    }

    #[test]
    fn flush_recovers_an_event_missing_its_terminator() {
        let mut buffer = SseBuffer::new();
        assert!(buffer.push("data: truncated").is_empty());
        assert_eq!(buffer.flush().as_deref(), Some("truncated"));
        // A second flush has nothing left.
        assert!(buffer.flush().is_none());
    }
}

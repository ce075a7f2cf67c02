//! Server-Sent-Events framing for `message/stream`.
//!
//! `SseBuffer` reassembles event blocks from arbitrary network chunks;
//! `FrameDecoder` turns each `data:` payload into a [`StreamFrame`] and
//! keeps the bookkeeping needed to classify how a stream ended.

use crate::a2a::types::{JsonRpcError, Message, StreamResult, StreamStatusType};
use crate::error::A2aError;
use serde::Deserialize;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Raw bytes are kept until a whole event block has arrived, so a UTF-8
/// sequence split across chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event block (terminated by a blank line), if any.
    pub fn next_event_block(&mut self) -> Option<String> {
        let end = block_end(&self.buffer)?;
        let remaining = self.buffer.split_off(end);
        let block = std::mem::replace(&mut self.buffer, remaining);
        Some(decode(&block))
    }

    /// Whatever is left once the connection closes.
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = decode(&std::mem::take(&mut self.buffer));
        if rest.trim().is_empty() { None } else { Some(rest) }
    }
}

/// Offset just past the first blank line (`\n\n` or `\n\r\n`).
fn block_end(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find_map(|i| match &buf[i..] {
        [b'\n', b'\n', ..] => Some(i + 2),
        [b'\n', b'\r', b'\n', ..] => Some(i + 3),
        _ => None,
    })
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}

pub fn parse_data_lines(event_block: &str) -> Vec<&str> {
    event_block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .collect()
}

/// One decoded frame of a streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Incremental partial output.
    Progress(Message),
    /// Terminal success, optionally carrying the final message.
    Completed(Option<Message>),
    /// Terminal agent-reported failure.
    Failed(String),
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default)]
    result: Option<StreamResult>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, PartialEq)]
pub enum Decoded {
    Frame(StreamFrame),
    /// The `[DONE]` sentinel line.
    Done,
    /// Malformed or foreign frame, already logged.
    Skipped,
}

/// Per-call frame decoder.
pub struct FrameDecoder {
    agent: String,
    call_id: String,
    valid_frames: usize,
    malformed_frames: usize,
}

impl FrameDecoder {
    pub fn new(agent: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            call_id: call_id.into(),
            valid_frames: 0,
            malformed_frames: 0,
        }
    }

    pub fn decode(&mut self, data: &str) -> Decoded {
        if data == DONE_SENTINEL {
            return Decoded::Done;
        }

        let envelope: StreamEnvelope = match serde_json::from_str(data) {
            Ok(env) => env,
            Err(e) => return self.skip(data, &format!("invalid JSON: {e}")),
        };

        if let Some(id) = envelope.id.as_str()
            && id != self.call_id
        {
            return self.skip(data, &format!("frame for foreign call id {id}"));
        }

        if let Some(err) = envelope.error {
            self.valid_frames += 1;
            return Decoded::Frame(StreamFrame::Failed(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }

        let Some(result) = envelope.result else {
            return self.skip(data, "frame has neither result nor error");
        };

        self.valid_frames += 1;
        let frame = match result.status.kind {
            StreamStatusType::InProgress => match result.message {
                Some(msg) => StreamFrame::Progress(msg),
                None => StreamFrame::Progress(Message::new(
                    crate::a2a::types::Role::Agent,
                    Vec::new(),
                )),
            },
            StreamStatusType::Completed => StreamFrame::Completed(result.message),
            StreamStatusType::Failed => StreamFrame::Failed(
                result
                    .error
                    .or_else(|| result.message.map(|m| m.text()))
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ),
        };
        Decoded::Frame(frame)
    }

    /// The error to surface when the stream ends without a terminal frame.
    ///
    /// If nothing but malformed data ever arrived the call is treated as
    /// having produced no answer in time.
    pub fn unterminated_error(&self, after_ms: u64) -> A2aError {
        if self.valid_frames == 0 && self.malformed_frames > 0 {
            A2aError::Timeout {
                agent: self.agent.clone(),
                after_ms,
            }
        } else {
            A2aError::Transport {
                agent: self.agent.clone(),
                message: format!(
                    "stream closed without a terminal frame ({} frames received)",
                    self.valid_frames
                ),
            }
        }
    }

    fn skip(&mut self, data: &str, reason: &str) -> Decoded {
        self.malformed_frames += 1;
        tracing::warn!(
            agent = %self.agent,
            call_id = %self.call_id,
            "A2A: Skipping malformed stream frame: {} ({})",
            reason,
            crate::utils::truncate_str(data, 120)
        );
        Decoded::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn frame(status: &str, text: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": "call-1",
            "result": {
                "status": {"type": status},
                "message": {"role": "agent", "parts": [{"type": "text", "text": text}]}
            }
        })
        .to_string()
    }

    #[test]
    fn test_buffer_returns_complete_blocks_only() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: first\n\npart");
        assert_eq!(buffer.next_event_block().as_deref(), Some("data: first\n\n"));
        assert!(buffer.next_event_block().is_none());

        buffer.push_chunk(b"ial\r\n\r\n");
        assert_eq!(buffer.next_event_block().as_deref(), Some("partial\n\n"));
        assert!(buffer.take_remainder().is_none());
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let payload = "data: café\n\n".as_bytes();
        let split = payload.iter().position(|&b| b == 0xC3).expect("é lead byte") + 1;

        let mut buffer = SseBuffer::new();
        buffer.push_chunk(&payload[..split]);
        assert!(buffer.next_event_block().is_none());
        buffer.push_chunk(&payload[split..]);

        let block = buffer.next_event_block().expect("block");
        assert_eq!(parse_data_lines(&block), vec!["café"]);
    }

    #[test]
    fn test_crlf_blank_line_split_across_chunks() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: one\r\n\r");
        assert!(buffer.next_event_block().is_none());
        buffer.push_chunk(b"\ndata: two");
        assert_eq!(buffer.next_event_block().as_deref(), Some("data: one\n\n"));
        assert_eq!(buffer.take_remainder().as_deref(), Some("data: two"));
    }

    #[test]
    fn test_parse_data_lines() {
        let block = "event: message\ndata: one\nid: 7\ndata:two\n\n";
        assert_eq!(parse_data_lines(block), vec!["one", "two"]);
    }

    #[test]
    fn test_decode_progress_and_terminal() {
        let mut decoder = FrameDecoder::new("writer", "call-1");
        let progress = decoder.decode(&frame("in_progress", "drafting"));
        assert!(matches!(progress, Decoded::Frame(StreamFrame::Progress(_))));

        let completed = decoder.decode(&frame("completed", "final"));
        assert!(matches!(
            &completed,
            Decoded::Frame(StreamFrame::Completed(Some(msg))) if msg.text() == "final"
        ));
        assert_eq!(decoder.decode("[DONE]"), Decoded::Done);
    }

    #[test]
    fn test_decode_failed_and_rpc_error() {
        let mut decoder = FrameDecoder::new("writer", "call-1");
        let failed = serde_json::json!({
            "jsonrpc": "2.0", "id": "call-1",
            "result": {"status": {"type": "failed"}, "error": "quota exceeded"}
        })
        .to_string();
        assert_eq!(
            decoder.decode(&failed),
            Decoded::Frame(StreamFrame::Failed("quota exceeded".to_string()))
        );

        let rpc_error = serde_json::json!({
            "jsonrpc": "2.0", "id": "call-1",
            "error": {"code": -32000, "message": "boom"}
        })
        .to_string();
        assert!(matches!(
            decoder.decode(&rpc_error),
            Decoded::Frame(StreamFrame::Failed(reason)) if reason.contains("boom")
        ));
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        let mut decoder = FrameDecoder::new("writer", "call-1");
        assert_eq!(decoder.decode("{not json"), Decoded::Skipped);
        assert_eq!(decoder.decode(r#"{"jsonrpc":"2.0","id":"call-1"}"#), Decoded::Skipped);
        assert_eq!(
            decoder.decode(&frame("in_progress", "x").replace("call-1", "other")),
            Decoded::Skipped
        );
    }

    #[test]
    fn test_unterminated_error_classification() {
        let mut only_garbage = FrameDecoder::new("writer", "call-1");
        only_garbage.decode("garbage");
        assert_eq!(only_garbage.unterminated_error(10).kind(), ErrorKind::Timeout);

        let mut partial = FrameDecoder::new("writer", "call-1");
        partial.decode("garbage");
        partial.decode(&frame("in_progress", "half"));
        assert_eq!(partial.unterminated_error(10).kind(), ErrorKind::TransportError);

        let silent = FrameDecoder::new("writer", "call-1");
        assert_eq!(silent.unterminated_error(10).kind(), ErrorKind::TransportError);
    }
}

//! A2A wire-protocol client.
//!
//! `message/send` is one JSON-RPC round trip under a caller deadline.
//! `message/stream` yields a lazy, per-call [`FrameStream`]: it cannot be
//! resumed, only restarted by issuing a new call (with a new call id).

use crate::a2a::agent_card::health_endpoint;
use crate::a2a::sse::{parse_data_lines, Decoded, FrameDecoder, SseBuffer, StreamFrame};
use crate::a2a::types::*;
use crate::error::{A2aError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Stream,
}

/// One outbound call. Every call gets a fresh id; a retry is a new call.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub call_id: String,
    pub session_id: String,
    pub accepted_output_modes: Vec<String>,
    pub message: Message,
}

impl AgentCall {
    pub fn new(session_id: impl Into<String>, message: Message) -> Self {
        let accepted_output_modes = message.accepted_output_modes.clone();
        Self {
            call_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            accepted_output_modes,
            message,
        }
    }

    pub fn envelope(&self, method: &str) -> JsonRpcRequest {
        let params = serde_json::json!({
            "id": self.call_id,
            "session_id": self.session_id,
            "accepted_output_modes": self.accepted_output_modes,
            "message": self.message,
        });
        JsonRpcRequest::new(method, params, self.call_id.clone())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// `message/send`: a single request/response round trip.
    async fn send(&self, card: &AgentCard, call: &AgentCall, deadline: Duration)
    -> Result<Message>;

    /// `message/stream`: open the call and return its frames.
    async fn stream(
        &self,
        card: &AgentCard,
        call: &AgentCall,
        deadline: Duration,
    ) -> Result<FrameStream>;

    /// Probe the agent's health endpoint.
    async fn probe(&self, card: &AgentCard, timeout: Duration) -> HealthStatus;

    /// Fetch `/.well-known/agent.json` from an agent's base URL.
    async fn fetch_card(&self, base_url: &str, timeout: Duration) -> Result<AgentCard>;
}

/// Perform one call in the given mode and return the resulting message.
pub async fn call_agent(
    client: &dyn AgentClient,
    card: &AgentCard,
    call: &AgentCall,
    mode: CallMode,
    deadline: Duration,
) -> Result<Message> {
    match mode {
        CallMode::Sync => client.send(card, call, deadline).await,
        CallMode::Stream => {
            let frames = client.stream(card, call, deadline).await?;
            collect_stream(frames, &card.name).await
        }
    }
}

/// Drain a frame stream into its final message.
///
/// A `completed` frame without a message yields the concatenated parts of
/// all progress frames seen so far.
pub async fn collect_stream(mut frames: FrameStream, agent: &str) -> Result<Message> {
    let mut partial: Vec<Part> = Vec::new();
    while let Some(frame) = frames.next().await {
        match frame? {
            StreamFrame::Progress(msg) => partial.extend(msg.parts),
            StreamFrame::Completed(Some(msg)) => return Ok(msg),
            StreamFrame::Completed(None) => return Ok(Message::new(Role::Agent, partial)),
            StreamFrame::Failed(reason) => {
                return Err(A2aError::TaskFailed {
                    agent: agent.to_string(),
                    message: reason,
                });
            }
        }
    }
    Err(A2aError::Transport {
        agent: agent.to_string(),
        message: "stream ended without a terminal frame".to_string(),
    })
}

/// reqwest-backed client speaking JSON-RPC 2.0 over HTTP(S).
#[derive(Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("crabswarm/{}", crate::VERSION))
            .build()
            .map_err(|e| A2aError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn map_reqwest_error(agent: &str, err: reqwest::Error, deadline: Duration) -> A2aError {
    if err.is_timeout() {
        A2aError::Timeout {
            agent: agent.to_string(),
            after_ms: millis(deadline),
        }
    } else {
        A2aError::Transport {
            agent: agent.to_string(),
            message: err.to_string(),
        }
    }
}

fn status_error(agent: &str, status: reqwest::StatusCode) -> A2aError {
    let code = status.as_u16();
    if status.is_server_error() || code == 408 || code == 429 {
        A2aError::Transport {
            agent: agent.to_string(),
            message: format!("HTTP {}", status),
        }
    } else {
        A2aError::Protocol {
            agent: agent.to_string(),
            message: format!("HTTP {}", status),
        }
    }
}

fn protocol(agent: &str, message: impl Into<String>) -> A2aError {
    A2aError::Protocol {
        agent: agent.to_string(),
        message: message.into(),
    }
}

/// Interpret the `result` of a `message/send` response.
///
/// A bare Message is the normal case; a stream-style `{status, message}`
/// body is accepted too.
fn decode_send_result(agent: &str, result: serde_json::Value) -> Result<Message> {
    if result.get("status").is_some() {
        let body: StreamResult = serde_json::from_value(result)
            .map_err(|e| protocol(agent, format!("invalid result: {}", e)))?;
        return match body.status.kind {
            StreamStatusType::Failed => Err(A2aError::TaskFailed {
                agent: agent.to_string(),
                message: body
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            }),
            _ => body
                .message
                .ok_or_else(|| protocol(agent, "result carries no message")),
        };
    }
    serde_json::from_value(result).map_err(|e| protocol(agent, format!("invalid message: {}", e)))
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send(
        &self,
        card: &AgentCard,
        call: &AgentCall,
        deadline: Duration,
    ) -> Result<Message> {
        let agent = card.name.as_str();
        let envelope = call.envelope(methods::MESSAGE_SEND);
        tracing::debug!(agent, call_id = %call.call_id, "A2A: message/send");

        let response = self
            .http
            .post(&card.url)
            .timeout(deadline)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| map_reqwest_error(agent, e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(agent, status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(agent, e, deadline))?;
        let rpc: JsonRpcResponse = serde_json::from_str(&body).map_err(|e| {
            protocol(
                agent,
                format!(
                    "invalid JSON-RPC response: {} ({})",
                    e,
                    crate::utils::truncate_str(&body, 120)
                ),
            )
        })?;

        if rpc.id.as_str() != Some(call.call_id.as_str()) {
            return Err(protocol(
                agent,
                format!("response id {} does not match call {}", rpc.id, call.call_id),
            ));
        }
        if let Some(err) = rpc.error {
            return Err(A2aError::TaskFailed {
                agent: agent.to_string(),
                message: format!("{} (code {})", err.message, err.code),
            });
        }
        let result = rpc
            .result
            .ok_or_else(|| protocol(agent, "response has neither result nor error"))?;
        decode_send_result(agent, result)
    }

    async fn stream(
        &self,
        card: &AgentCard,
        call: &AgentCall,
        deadline: Duration,
    ) -> Result<FrameStream> {
        let agent = card.name.clone();
        let envelope = call.envelope(methods::MESSAGE_STREAM);
        let deadline_at = tokio::time::Instant::now() + deadline;
        let after_ms = millis(deadline);
        tracing::debug!(agent = %agent, call_id = %call.call_id, "A2A: message/stream");

        let request = self
            .http
            .post(&card.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&envelope)
            .send();
        let response = match tokio::time::timeout_at(deadline_at, request).await {
            Err(_) => {
                return Err(A2aError::Timeout {
                    agent,
                    after_ms,
                });
            }
            Ok(res) => res.map_err(|e| map_reqwest_error(&agent, e, deadline))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&agent, status));
        }

        let mut bytes = response.bytes_stream();
        let mut decoder = FrameDecoder::new(agent.clone(), call.call_id.clone());

        let frames = async_stream::stream! {
            let mut buffer = SseBuffer::new();
            loop {
                let chunk = match tokio::time::timeout_at(deadline_at, bytes.next()).await {
                    Err(_) => {
                        yield Err(A2aError::Timeout { agent: agent.clone(), after_ms });
                        return;
                    }
                    Ok(None) => {
                        // Connection closed; a final block may lack its blank line.
                        if let Some(rest) = buffer.take_remainder() {
                            for data in parse_data_lines(&rest) {
                                if let Decoded::Frame(frame) = decoder.decode(data)
                                    && frame.is_terminal()
                                {
                                    yield Ok(frame);
                                    return;
                                }
                            }
                        }
                        yield Err(decoder.unterminated_error(after_ms));
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        yield Err(map_reqwest_error(&agent, e, deadline));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                buffer.push_chunk(&chunk);
                while let Some(block) = buffer.next_event_block() {
                    for data in parse_data_lines(&block) {
                        match decoder.decode(data) {
                            Decoded::Frame(frame) => {
                                let terminal = frame.is_terminal();
                                yield Ok(frame);
                                if terminal {
                                    return;
                                }
                            }
                            Decoded::Done => {
                                yield Err(decoder.unterminated_error(after_ms));
                                return;
                            }
                            Decoded::Skipped => {}
                        }
                    }
                }
            }
        };

        Ok(Box::pin(frames))
    }

    async fn probe(&self, card: &AgentCard, timeout: Duration) -> HealthStatus {
        let Some(url) = health_endpoint(card) else {
            tracing::warn!(agent = %card.name, "A2A: No usable health endpoint");
            return HealthStatus::Unreachable;
        };

        let response = match self.http.get(&url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(agent = %card.name, "A2A: Health probe failed: {}", e);
                return HealthStatus::Unreachable;
            }
        };

        if !response.status().is_success() {
            return HealthStatus::Degraded;
        }

        let reported = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string));
        match reported.as_deref() {
            Some("degraded") => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    async fn fetch_card(&self, base_url: &str, timeout: Duration) -> Result<AgentCard> {
        let url = reqwest::Url::parse(base_url)
            .and_then(|u| u.join("/.well-known/agent.json"))
            .map_err(|e| protocol(base_url, format!("invalid base url: {}", e)))?;

        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(base_url, e, timeout))?;
        if !response.status().is_success() {
            return Err(status_error(base_url, response.status()));
        }
        response
            .json::<AgentCard>()
            .await
            .map_err(|e| protocol(base_url, format!("invalid agent card: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::agent_card::test_card;
    use crate::error::ErrorKind;

    fn card_for(server: &mockito::Server) -> AgentCard {
        let mut card = test_card("remote", &["remote"]);
        card.url = format!("{}/a2a/v1", server.url());
        card
    }

    fn fixed_call() -> AgentCall {
        AgentCall {
            call_id: "call-1".to_string(),
            session_id: "session-1".to_string(),
            accepted_output_modes: vec!["text/plain".to_string()],
            message: Message::user("Summarize document X"),
        }
    }

    fn sse_frame(status: &str, text: &str) -> String {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "call-1",
            "result": {
                "status": {"type": status},
                "message": {"role": "agent", "parts": [{"type": "text", "text": text}]}
            }
        });
        format!("data: {}\n\n", frame)
    }

    #[test]
    fn test_each_call_gets_a_fresh_id() {
        let a = AgentCall::new("s", Message::user("hi"));
        let b = AgentCall::new("s", Message::user("hi"));
        assert_ne!(a.call_id, b.call_id);

        let envelope = a.envelope(methods::MESSAGE_SEND);
        assert_eq!(envelope.jsonrpc, "2.0");
        assert_eq!(envelope.id, serde_json::json!(a.call_id));
        assert_eq!(envelope.params["session_id"], "s");
        assert_eq!(envelope.params["message"]["parts"][0]["type"], "text");
    }

    #[tokio::test]
    async fn test_send_returns_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": "call-1",
                    "result": {"role": "agent", "parts": [{"type": "text", "text": "summary"}]}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let msg = client
            .send(&card_for(&server), &fixed_call(), Duration::from_secs(5))
            .await
            .expect("send");
        assert_eq!(msg.role, Role::Agent);
        assert_eq!(msg.text(), "summary");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_maps_rpc_error_to_task_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_body(
                r#"{"jsonrpc":"2.0","id":"call-1","error":{"code":-32000,"message":"cannot summarize"}}"#,
            )
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let err = client
            .send(&card_for(&server), &fixed_call(), Duration::from_secs(5))
            .await
            .expect_err("rpc error");
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert!(err.to_string().contains("cannot summarize"));
    }

    #[tokio::test]
    async fn test_send_classifies_http_and_body_errors() {
        let mut server = mockito::Server::new_async().await;
        let client = HttpAgentClient::new().expect("client");
        let card = card_for(&server);

        let m = server
            .mock("POST", "/a2a/v1")
            .with_status(503)
            .create_async()
            .await;
        let err = client
            .send(&card, &fixed_call(), Duration::from_secs(5))
            .await
            .expect_err("503");
        assert_eq!(err.kind(), ErrorKind::TransportError);
        m.remove_async().await;

        let m = server
            .mock("POST", "/a2a/v1")
            .with_status(400)
            .create_async()
            .await;
        let err = client
            .send(&card, &fixed_call(), Duration::from_secs(5))
            .await
            .expect_err("400");
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        m.remove_async().await;

        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;
        let err = client
            .send(&card, &fixed_call(), Duration::from_secs(5))
            .await
            .expect_err("garbage");
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_send_rejects_mismatched_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_body(
                r#"{"jsonrpc":"2.0","id":"someone-else","result":{"role":"agent","parts":[]}}"#,
            )
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let err = client
            .send(&card_for(&server), &fixed_call(), Duration::from_secs(5))
            .await
            .expect_err("id mismatch");
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hold = tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(socket);
            }
        });

        let mut card = test_card("slow", &["slow"]);
        card.url = format!("http://{}/a2a/v1", addr);
        let client = HttpAgentClient::new().expect("client");
        let err = client
            .send(&card, &fixed_call(), Duration::from_millis(150))
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        hold.abort();
    }

    #[tokio::test]
    async fn test_stream_yields_progress_then_completed() {
        let mut server = mockito::Server::new_async().await;
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            sse_frame("in_progress", "part one"),
            sse_frame("in_progress", "part two"),
            sse_frame("completed", "all done"),
        );
        server
            .mock("POST", "/a2a/v1")
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let frames: Vec<_> = client
            .stream(&card_for(&server), &fixed_call(), Duration::from_secs(5))
            .await
            .expect("stream")
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Ok(StreamFrame::Progress(_))));
        assert!(matches!(
            &frames[2],
            Ok(StreamFrame::Completed(Some(msg))) if msg.text() == "all done"
        ));
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_frames() {
        let mut server = mockito::Server::new_async().await;
        let body = format!(
            "data: {{broken\n\n{}{}",
            sse_frame("in_progress", "chunk"),
            sse_frame("completed", "final"),
        );
        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let card = card_for(&server);
        let msg = call_agent(
            &client,
            &card,
            &fixed_call(),
            CallMode::Stream,
            Duration::from_secs(5),
        )
        .await
        .expect("message");
        assert_eq!(msg.text(), "final");
    }

    #[tokio::test]
    async fn test_stream_without_terminal_frame_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let body = format!("{}data: [DONE]\n\n", sse_frame("in_progress", "partial"));
        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let err = call_agent(
            &client,
            &card_for(&server),
            &fixed_call(),
            CallMode::Stream,
            Duration::from_secs(5),
        )
        .await
        .expect_err("no terminal frame");
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_stream_with_only_malformed_data_is_timeout() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: not-json\n\n")
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let err = call_agent(
            &client,
            &card_for(&server),
            &fixed_call(),
            CallMode::Stream,
            Duration::from_secs(5),
        )
        .await
        .expect_err("malformed only");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_stream_failed_frame_is_task_failed() {
        let mut server = mockito::Server::new_async().await;
        let failed = serde_json::json!({
            "jsonrpc": "2.0", "id": "call-1",
            "result": {"status": {"type": "failed"}, "error": "document not found"}
        });
        server
            .mock("POST", "/a2a/v1")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(format!("data: {}\n\n", failed))
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let err = call_agent(
            &client,
            &card_for(&server),
            &fixed_call(),
            CallMode::Stream,
            Duration::from_secs(5),
        )
        .await
        .expect_err("failed frame");
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert!(err.to_string().contains("document not found"));
    }

    #[tokio::test]
    async fn test_collect_stream_concatenates_progress_parts() {
        let frames: FrameStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamFrame::Progress(Message::agent("a"))),
            Ok(StreamFrame::Progress(Message::agent("b"))),
            Ok(StreamFrame::Completed(None)),
        ]));
        let msg = collect_stream(frames, "x").await.expect("message");
        assert_eq!(msg.text(), "a\nb");

        let empty: FrameStream = Box::pin(futures::stream::empty());
        let err = collect_stream(empty, "x").await.expect_err("no terminal");
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_probe_maps_health() {
        let mut server = mockito::Server::new_async().await;
        let card = card_for(&server);
        let client = HttpAgentClient::new().expect("client");

        let m = server
            .mock("GET", "/a2a/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;
        assert_eq!(
            client.probe(&card, Duration::from_secs(2)).await,
            HealthStatus::Healthy
        );
        m.remove_async().await;

        let m = server
            .mock("GET", "/a2a/health")
            .with_status(200)
            .with_body(r#"{"status":"degraded"}"#)
            .create_async()
            .await;
        assert_eq!(
            client.probe(&card, Duration::from_secs(2)).await,
            HealthStatus::Degraded
        );
        m.remove_async().await;

        server
            .mock("GET", "/a2a/health")
            .with_status(500)
            .create_async()
            .await;
        assert_eq!(
            client.probe(&card, Duration::from_secs(2)).await,
            HealthStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_probe_unreachable_when_nothing_listens() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let mut card = test_card("gone", &["gone"]);
        card.url = format!("http://127.0.0.1:{}/a2a/v1", port);

        let client = HttpAgentClient::new().expect("client");
        assert_eq!(
            client.probe(&card, Duration::from_millis(500)).await,
            HealthStatus::Unreachable
        );
    }

    #[tokio::test]
    async fn test_fetch_card() {
        let mut server = mockito::Server::new_async().await;
        let mut remote = test_card("hotels", &["hotels"]);
        remote.url = format!("{}/a2a/v1", server.url());
        server
            .mock("GET", "/.well-known/agent.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&remote).expect("json"))
            .create_async()
            .await;

        let client = HttpAgentClient::new().expect("client");
        let card = client
            .fetch_card(&server.url(), Duration::from_secs(2))
            .await
            .expect("card");
        assert_eq!(card, remote);
    }
}

//! Client side of the generation relay.
//!
//! [`StreamConsumer`] turns raw body bytes into [`StreamEvent`]s and keeps
//! the partial model text for progressive rendering. [`RelayClient`] drives it
//! over HTTP.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;

use crate::error::ErrorResponse;
use crate::events::{DONE_SENTINEL, StreamEvent};
use crate::models::{GenerateCodeRequest, GeneratedProject, RefineCodeRequest};
use crate::sse::{LineBuffer, SseLine};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// Terminal `error` event from the server.
    #[error("{0}")]
    Server(String),

    #[error("stream ended without a result")]
    Incomplete,
}

// ============================================================================
// Consumer
// ============================================================================

#[derive(Debug, Default)]
pub struct StreamConsumer {
    lines: LineBuffer,
    text: String,
    terminal: Option<Result<GeneratedProject, String>>,
    closed: bool,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True once the `[DONE]` sentinel arrived.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feeds one network read. Returns the events it completed, in order.
    /// Data lines that do not parse as an event are skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(bytes) {
            if self.closed {
                break;
            }
            let SseLine::Data(data) = SseLine::parse(&line) else {
                continue;
            };
            if data == DONE_SENTINEL {
                self.closed = true;
                continue;
            }
            match StreamEvent::from_data(data) {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        events.push(event);
                    }
                }
                Err(e) => log::debug!("Skipping unparseable event: {}", e),
            }
        }
        events
    }

    fn accept(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        // Nothing after the first terminal event counts.
        if self.terminal.is_some() {
            return None;
        }
        match &event {
            StreamEvent::Chunk(chunk) => self.text.push_str(chunk),
            StreamEvent::Done(project) => self.terminal = Some(Ok(project.clone())),
            StreamEvent::Error(message) => self.terminal = Some(Err(message.clone())),
        }
        Some(event)
    }

    /// Final outcome. A stream without a terminal event is a failure.
    pub fn finish(self) -> Result<GeneratedProject, ClientError> {
        match self.terminal {
            Some(Ok(project)) => Ok(project),
            Some(Err(message)) => Err(ClientError::Server(message)),
            None => Err(ClientError::Incomplete),
        }
    }
}

/// Paths of the file entries already complete in a partial JSON document.
pub fn partial_paths(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("\"path\"") {
        rest = &rest[pos + "\"path\"".len()..];
        let after_colon = match rest.trim_start().strip_prefix(':') {
            Some(r) => r.trim_start(),
            None => continue,
        };
        let Some(literal) = after_colon.strip_prefix('"') else {
            continue;
        };
        let Some(end) = closing_quote(literal) else {
            break;
        };
        if let Ok(path) = serde_json::from_str::<String>(&after_colon[..end + 2]) {
            paths.push(path);
        }
        rest = &literal[end + 1..];
    }
    paths
}

/// Byte offset of the first unescaped `"` in `s`.
fn closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Some(i),
            _ => escaped = false,
        }
    }
    None
}

/// Drives a consumer over a byte stream, reporting each chunk event.
pub async fn consume<S, E>(
    body: S,
    mut on_event: impl FnMut(&StreamEvent, &str),
) -> Result<GeneratedProject, ClientError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut consumer = StreamConsumer::new();
    while let Some(read) = body.next().await {
        let bytes = read.map_err(|e| ClientError::Transport(e.to_string()))?;
        for event in consumer.feed(&bytes) {
            on_event(&event, consumer.text());
        }
        if consumer.is_closed() {
            break;
        }
    }
    consumer.finish()
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
    client_id: Option<String>,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: None,
        }
    }

    /// Sent as `X-Client-ID`, the rate-limit key.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub async fn generate(
        &self,
        request: &GenerateCodeRequest,
        on_event: impl FnMut(&StreamEvent, &str),
    ) -> Result<GeneratedProject, ClientError> {
        self.stream("/api/bots/generate-code", request, on_event).await
    }

    pub async fn refine(
        &self,
        request: &RefineCodeRequest,
        on_event: impl FnMut(&StreamEvent, &str),
    ) -> Result<GeneratedProject, ClientError> {
        self.stream("/api/bots/refine-code", request, on_event).await
    }

    async fn stream<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        on_event: impl FnMut(&StreamEvent, &str),
    ) -> Result<GeneratedProject, ClientError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Accept", "text/event-stream")
            .json(body);
        if let Some(id) = &self.client_id {
            request = request.header("X-Client-ID", id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|r| r.error.message)
                .unwrap_or(text);
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }

        consume(response.bytes_stream(), on_event).await
    }
}

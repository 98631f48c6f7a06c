//! Generation and refinement relay.
//!
//! Turns a stream of model fragments into [`StreamEvent`]s: every non-empty
//! fragment is forwarded verbatim as a chunk, and once the upstream ends the
//! concatenated buffer is parsed into a [`GeneratedProject`]. Exactly one
//! terminal event closes the stream. The `[DONE]` sentinel is added by the
//! HTTP layer, see [`crate::handlers`].

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::events::{ChatEvent, StreamEvent};
use crate::llm::{CompletionBackend, CompletionRequest, LlmError};
use crate::models::{BotFile, GeneratedProject};

// ============================================================================
// Terminal parse
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedOutput {
    #[error("Failed to parse AI response")]
    InvalidJson(String),
    #[error("AI did not return valid file structure")]
    MissingFiles,
}

/// Values used when the model leaves a metadata field out or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDefaults {
    pub name: String,
    pub description: String,
    pub suggested_slug: String,
    /// Only refinements carry a change summary.
    pub change_summary: Option<String>,
}

impl ProjectDefaults {
    pub fn generation() -> Self {
        Self {
            name: "My Bot".to_string(),
            description: String::new(),
            suggested_slug: "my-bot".to_string(),
            change_summary: None,
        }
    }

    pub fn refinement(bot_name: Option<&str>, bot_description: Option<&str>) -> Self {
        Self {
            name: bot_name.unwrap_or("My Bot").to_string(),
            description: bot_description.unwrap_or_default().to_string(),
            suggested_slug: String::new(),
            change_summary: Some("Changes applied".to_string()),
        }
    }
}

/// Parses the full model output. A valid document without a non-empty
/// `files` array is rejected as [`MalformedOutput::MissingFiles`].
pub fn parse_project(
    buffer: &str,
    defaults: &ProjectDefaults,
) -> Result<GeneratedProject, MalformedOutput> {
    let value: Value =
        serde_json::from_str(buffer).map_err(|e| MalformedOutput::InvalidJson(e.to_string()))?;

    let Value::Object(doc) = value else {
        return Err(MalformedOutput::MissingFiles);
    };

    let files = match doc.get("files") {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(parse_file)
            .collect::<Option<Vec<BotFile>>>()
            .ok_or(MalformedOutput::MissingFiles)?,
        _ => return Err(MalformedOutput::MissingFiles),
    };

    Ok(GeneratedProject {
        name: text(&doc, "name").unwrap_or_else(|| defaults.name.clone()),
        description: text(&doc, "description").unwrap_or_else(|| defaults.description.clone()),
        system_prompt: text(&doc, "system_prompt").unwrap_or_default(),
        suggested_slug: text(&doc, "suggested_slug")
            .unwrap_or_else(|| defaults.suggested_slug.clone()),
        change_summary: defaults
            .change_summary
            .as_ref()
            .map(|fallback| text(&doc, "change_summary").unwrap_or_else(|| fallback.clone())),
        files,
    })
}

fn text(doc: &Map<String, Value>, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Entries are taken as sent: `path` and `content` must be strings, other
/// keys ride along untouched.
fn parse_file(item: &Value) -> Option<BotFile> {
    serde_json::from_value(item.clone()).ok()
}

// ============================================================================
// Streams
// ============================================================================

/// Relays fragments as chunk events, then emits exactly one terminal event.
///
/// A transport error stops the relay with an error event carrying its
/// diagnostic; no parse is attempted on the partial buffer.
pub fn relay<S>(mut chunks: S, defaults: ProjectDefaults) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<String, LlmError>> + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut buffer = String::new();
        let mut failure = None;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(fragment) if fragment.is_empty() => {}
                Ok(fragment) => {
                    buffer.push_str(&fragment);
                    yield StreamEvent::Chunk(fragment);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            Some(e) => {
                log::warn!("Upstream stream interrupted after {} bytes: {}", buffer.len(), e);
                yield StreamEvent::Error(e.to_string());
            }
            None => match parse_project(&buffer, &defaults) {
                Ok(project) => {
                    log::info!("Relay finished: {} files, {} bytes", project.files.len(), buffer.len());
                    yield StreamEvent::Done(project);
                }
                Err(e) => {
                    if let MalformedOutput::InvalidJson(detail) = &e {
                        log::warn!("Model output is not valid JSON: {}", detail);
                    }
                    yield StreamEvent::Error(e.to_string());
                }
            },
        }
    }
}

/// Opens the upstream call and relays it. A call that fails to start
/// becomes a single error event.
pub async fn open_relay(
    backend: Arc<dyn CompletionBackend>,
    request: CompletionRequest,
    defaults: ProjectDefaults,
) -> BoxStream<'static, StreamEvent> {
    match backend.stream(request).await {
        Ok(chunks) => relay(chunks, defaults).boxed(),
        Err(e) => {
            log::error!("Upstream {} failed to start: {}", backend.name(), e);
            stream::once(async move { StreamEvent::Error(e.to_string()) }).boxed()
        }
    }
}

/// Chat replies: `content` events for each fragment, one `error` event if
/// the upstream breaks.
pub async fn open_chat(
    backend: Arc<dyn CompletionBackend>,
    request: CompletionRequest,
) -> BoxStream<'static, ChatEvent> {
    let mut chunks = match backend.stream(request).await {
        Ok(chunks) => chunks,
        Err(e) => {
            log::error!("Chat upstream {} failed to start: {}", backend.name(), e);
            return stream::once(async move { ChatEvent::error(e.to_string()) }).boxed();
        }
    };

    async_stream::stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(fragment) if fragment.is_empty() => {}
                Ok(fragment) => yield ChatEvent::content(fragment),
                Err(e) => {
                    log::warn!("Chat stream interrupted: {}", e);
                    yield ChatEvent::error(e.to_string());
                    break;
                }
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelTier, PromptMessage, Script, ScriptedBackend};

    fn chunks(parts: &[&str]) -> BoxStream<'static, Result<String, LlmError>> {
        let items: Vec<Result<String, LlmError>> =
            parts.iter().map(|p| Ok(p.to_string())).collect();
        stream::iter(items).boxed()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(ModelTier::Code, vec![PromptMessage::user("a quiz bot")])
    }

    const PROJECT: &str = r##"{"name":"Quiz","description":"Trivia","system_prompt":"Ask","suggested_slug":"quiz","files":[{"path":"app.py","content":"print(1)"},{"path":"README.md","content":"# Quiz"}]}"##;

    #[tokio::test]
    async fn test_chunks_then_done() {
        let (head, tail) = PROJECT.split_at(40);
        let events: Vec<StreamEvent> =
            relay(chunks(&[head, "", tail]), ProjectDefaults::generation())
                .collect()
                .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Chunk(head.to_string()));
        assert_eq!(events[1], StreamEvent::Chunk(tail.to_string()));
        let StreamEvent::Done(project) = &events[2] else {
            panic!("expected done, got {:?}", events[2]);
        };
        assert_eq!(project.paths(), vec!["app.py", "README.md"]);
        assert_eq!(project.name, "Quiz");
    }

    #[tokio::test]
    async fn test_invalid_json_is_error_not_done() {
        let events: Vec<StreamEvent> =
            relay(chunks(&["{\"files\": ["]), ProjectDefaults::generation())
                .collect()
                .await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error("Failed to parse AI response".to_string()))
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_empty_upstream_is_parse_error() {
        let events: Vec<StreamEvent> = relay(chunks(&[]), ProjectDefaults::generation())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![StreamEvent::Error("Failed to parse AI response".to_string())]
        );
    }

    #[tokio::test]
    async fn test_transport_error_stops_relay() {
        let items: Vec<Result<String, LlmError>> = vec![
            Ok("{\"na".to_string()),
            Err(LlmError::Stream("connection reset".to_string())),
            Ok("never".to_string()),
        ];
        let events: Vec<StreamEvent> =
            relay(stream::iter(items).boxed(), ProjectDefaults::generation())
                .collect()
                .await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Error("Stream error: connection reset".to_string())
        );
    }

    #[test]
    fn test_missing_or_empty_files() {
        let defaults = ProjectDefaults::generation();
        assert_eq!(
            parse_project(r#"{"name":"x"}"#, &defaults),
            Err(MalformedOutput::MissingFiles)
        );
        assert_eq!(
            parse_project(r#"{"files":[]}"#, &defaults),
            Err(MalformedOutput::MissingFiles)
        );
        assert_eq!(
            parse_project(r#"{"files":"app.py"}"#, &defaults),
            Err(MalformedOutput::MissingFiles)
        );
        assert_eq!(parse_project("[1,2]", &defaults), Err(MalformedOutput::MissingFiles));
    }

    #[tokio::test]
    async fn test_done_files_match_parsed_document() {
        let body = r#"{"name":"Quiz","files":[{"content":"x","language":"python","path":"app.py"},{"path":"bot/engine.py","content":"y"}]}"#;
        let (head, tail) = body.split_at(31);
        let events: Vec<StreamEvent> =
            relay(chunks(&[head, tail]), ProjectDefaults::generation())
                .collect()
                .await;

        let StreamEvent::Done(project) = events.last().unwrap() else {
            panic!("expected done, got {:?}", events.last());
        };
        let sent: Value = serde_json::from_str(body).unwrap();
        assert_eq!(serde_json::to_value(&project.files).unwrap(), sent["files"]);
        assert_eq!(project.files[0].extra["language"], "python");
    }

    #[test]
    fn test_non_string_file_fields_are_malformed() {
        let defaults = ProjectDefaults::generation();
        assert_eq!(
            parse_project(r#"{"files":[{"path":"n.py","content":42}]}"#, &defaults),
            Err(MalformedOutput::MissingFiles)
        );
        assert_eq!(
            parse_project(r#"{"files":[{"content":"x"}]}"#, &defaults),
            Err(MalformedOutput::MissingFiles)
        );
    }

    #[test]
    fn test_generation_defaults() {
        let project = parse_project(
            r#"{"name":"","files":[{"path":"app.py","content":""}]}"#,
            &ProjectDefaults::generation(),
        )
        .unwrap();
        assert_eq!(project.name, "My Bot");
        assert_eq!(project.description, "");
        assert_eq!(project.system_prompt, "");
        assert_eq!(project.suggested_slug, "my-bot");
        assert_eq!(project.change_summary, None);
    }

    #[test]
    fn test_refinement_defaults() {
        let defaults = ProjectDefaults::refinement(Some("Quiz Master"), Some("Trivia"));
        let project =
            parse_project(r#"{"files":[{"path":"app.py","content":"x"}]}"#, &defaults).unwrap();
        assert_eq!(project.name, "Quiz Master");
        assert_eq!(project.description, "Trivia");
        assert_eq!(project.suggested_slug, "");
        assert_eq!(project.change_summary.as_deref(), Some("Changes applied"));

        let project = parse_project(
            r#"{"change_summary":"Added hints","files":[{"path":"app.py","content":"x"}]}"#,
            &ProjectDefaults::refinement(None, None),
        )
        .unwrap();
        assert_eq!(project.name, "My Bot");
        assert_eq!(project.change_summary.as_deref(), Some("Added hints"));
    }

    #[tokio::test]
    async fn test_open_relay_start_failure() {
        let backend = Arc::new(ScriptedBackend::new(Script::FailToStart(LlmError::Api {
            status: 401,
            message: "bad key".to_string(),
        })));
        let events: Vec<StreamEvent> =
            open_relay(backend, request(), ProjectDefaults::generation())
                .await
                .collect()
                .await;
        assert_eq!(
            events,
            vec![StreamEvent::Error("API error: 401 - bad key".to_string())]
        );
    }

    #[tokio::test]
    async fn test_open_chat_forwards_content() {
        let backend = Arc::new(ScriptedBackend::new(Script::BreakAfter {
            chunks: vec!["Hel".to_string(), "".to_string(), "lo".to_string()],
            error: LlmError::Stream("eof".to_string()),
        }));
        let events: Vec<ChatEvent> = open_chat(backend, request()).await.collect().await;
        assert_eq!(
            events,
            vec![
                ChatEvent::content("Hel"),
                ChatEvent::content("lo"),
                ChatEvent::error("Stream error: eof"),
            ]
        );
    }
}

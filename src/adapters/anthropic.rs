//! Anthropic Messages API streaming adapter.
//!
//! Grounded on the same request-building / incremental-translation shape as
//! [`super::openai::OpenAiAdapter`], rebuilt around Anthropic's own wire
//! format: `content_block_start`/`_delta`/`_stop` events keyed by block
//! `index` rather than OpenAI's flat delta-per-chunk shape, and a dedicated
//! `thinking` block that carries a provider `signature` the canonical
//! [`crate::types::ThinkingBlock`] already has a slot for.

use super::{AdapterCapabilities, AdapterOptions, ProviderAdapter, filter_orphaned_tool_calls};
use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::stream::{CancelToken, Event, EventStream};
use crate::types::{
    AssistantMessage, ContentBlock, Context, ImageBlock, Message, MessageRole, Model, StopReason,
    TextBlock, ThinkingBlock, ToolUseBlock, Usage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::pin::Pin;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Adapter for Anthropic's native Messages API (`/v1/messages`).
#[derive(Debug, Default)]
pub struct AnthropicAdapter {
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

// --- Request wire types ---

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlockOut>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlockOut {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

fn anthropic_image_source(image: &ImageBlock) -> AnthropicImageSource {
    let url = image.url();
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((header, data)) = rest.split_once(";base64,") {
            return AnthropicImageSource::Base64 {
                media_type: header.to_string(),
                data: data.to_string(),
            };
        }
    }
    AnthropicImageSource::Url {
        url: url.to_string(),
    }
}

fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn stringify_tool_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Splits the filtered canonical message list into an Anthropic `system`
/// string and the alternating user/assistant wire message array.
///
/// Unlike OpenAI's wire format, Anthropic represents a tool result as just
/// another content block inside the user message that follows the tool use,
/// so (unlike [`super::openai::to_openai_messages`]) one canonical message
/// never needs to expand into several wire messages.
fn to_anthropic_messages(messages: &[Message], leading_system: Option<&str>) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<String> = leading_system
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .into_iter()
        .collect();
    let mut out = Vec::new();

    for message in messages {
        match &message.role {
            MessageRole::System | MessageRole::HookMessage => {
                let text = extract_text(&message.content);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            MessageRole::Assistant => {
                let content: Vec<AnthropicContentBlockOut> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text(t) if !t.text.is_empty() => {
                            Some(AnthropicContentBlockOut::Text { text: t.text.clone() })
                        }
                        ContentBlock::Thinking(thinking) => Some(AnthropicContentBlockOut::Thinking {
                            thinking: thinking.text.clone(),
                            signature: thinking.signature.clone(),
                        }),
                        ContentBlock::ToolUse(tool_use) => Some(AnthropicContentBlockOut::ToolUse {
                            id: tool_use.id.clone(),
                            name: tool_use.name.clone(),
                            input: tool_use.input.clone(),
                        }),
                        _ => None,
                    })
                    .collect();
                if !content.is_empty() {
                    out.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content,
                    });
                }
            }
            MessageRole::Tool => {
                let mut content = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::ToolResult(result) => {
                            content.push(AnthropicContentBlockOut::ToolResult {
                                tool_use_id: result.tool_use_id.clone(),
                                content: stringify_tool_result(&result.content),
                            });
                        }
                        ContentBlock::Text(t) if !t.text.is_empty() => {
                            content.push(AnthropicContentBlockOut::Text { text: t.text.clone() });
                        }
                        _ => {}
                    }
                }
                if !content.is_empty() {
                    out.push(AnthropicMessage {
                        role: "user".to_string(),
                        content,
                    });
                }
            }
            MessageRole::User | MessageRole::BashExecution | MessageRole::Navigation => {
                let mut content = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text(t) if !t.text.is_empty() => {
                            content.push(AnthropicContentBlockOut::Text { text: t.text.clone() });
                        }
                        ContentBlock::Image(image) => {
                            content.push(AnthropicContentBlockOut::Image {
                                source: anthropic_image_source(image),
                            });
                        }
                        ContentBlock::ToolResult(result) => {
                            content.push(AnthropicContentBlockOut::ToolResult {
                                tool_use_id: result.tool_use_id.clone(),
                                content: stringify_tool_result(&result.content),
                            });
                        }
                        _ => {}
                    }
                }
                if !content.is_empty() {
                    out.push(AnthropicMessage {
                        role: "user".to_string(),
                        content,
                    });
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (system, out)
}

fn stop_reason_from_anthropic(stop_reason: &str) -> StopReason {
    match stop_reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::Length,
        "refusal" => StopReason::Safety,
        _ => StopReason::Stop,
    }
}

// --- Streaming event wire types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart { message: AnthropicMessageStart },
    ContentBlockStart { index: usize, content_block: AnthropicContentBlockStart },
    ContentBlockDelta { index: usize, delta: AnthropicDelta },
    ContentBlockStop { index: usize },
    MessageDelta { delta: AnthropicMessageDeltaPayload, usage: AnthropicDeltaUsage },
    MessageStop,
    Ping,
    Error { error: AnthropicErrorDetail },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicDeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDeltaPayload {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

/// Parses Anthropic's `text/event-stream` body into [`AnthropicStreamEvent`]s.
///
/// Anthropic repeats its event name on both the `event:` line and a `"type"`
/// field inside the JSON `data:` payload; only the latter is needed to
/// deserialize, so (as in [`crate::utils::parse_sse_stream`]) only `data:`
/// lines are inspected.
fn parse_anthropic_sse(
    body: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<AnthropicStreamEvent>> + Send>> {
    let stream = body.bytes_stream().filter_map(move |result| async move {
        let bytes = match result.map_err(Error::Http) {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };
        let text = String::from_utf8_lossy(&bytes);

        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                let event: AnthropicStreamEvent = match serde_json::from_str(data) {
                    Ok(event) => event,
                    Err(e) => {
                        return Some(Err(Error::stream(format!("failed to parse event: {e}"))));
                    }
                };
                return Some(Ok(event));
            }
        }
        None
    });

    Box::pin(stream)
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Drives one streaming turn, translating [`AnthropicStreamEvent`]s into
/// [`Event`]s one delta at a time.
struct TurnState {
    events: Pin<Box<dyn Stream<Item = Result<AnthropicStreamEvent>> + Send>>,
    cancel: CancelToken,
    pending: VecDeque<Event>,
    done: bool,

    text_open: bool,
    thinking_open: bool,
    text_buf: String,
    thinking_buf: String,
    thinking_signature: Option<String>,
    current_tool: Option<PendingToolCall>,
    content: Vec<ContentBlock>,

    usage: Usage,
    stop_reason: StopReason,

    provider: String,
    model_id: String,
    api: String,
    model: Model,
}

impl TurnState {
    fn close_open_blocks(&mut self) {
        if self.thinking_open {
            let content = std::mem::take(&mut self.thinking_buf);
            let block = match self.thinking_signature.take() {
                Some(signature) => ThinkingBlock::with_signature(content.clone(), signature),
                None => ThinkingBlock::new(content.clone()),
            };
            self.content.push(ContentBlock::Thinking(block));
            self.pending.push_back(Event::ThinkingEnd { content });
            self.thinking_open = false;
        }
        if self.text_open {
            let content = std::mem::take(&mut self.text_buf);
            self.content.push(ContentBlock::Text(TextBlock::new(content.clone())));
            self.pending.push_back(Event::TextEnd { content });
            self.text_open = false;
        }
        if let Some(tool) = self.current_tool.take() {
            let input: serde_json::Value = if tool.arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tool.arguments).unwrap_or(serde_json::Value::Null)
            };
            let tool_call = ToolUseBlock::new(tool.id, tool.name, input);
            self.content.push(ContentBlock::ToolUse(tool_call.clone()));
            self.pending.push_back(Event::ToolCall { tool_call });
        }
    }

    fn process_event(&mut self, event: AnthropicStreamEvent) {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.usage = Usage::from_counts(
                    message.usage.input_tokens,
                    message.usage.output_tokens,
                    message.usage.cache_read_input_tokens,
                    message.usage.cache_creation_input_tokens,
                );
            }
            AnthropicStreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                AnthropicContentBlockStart::Text { .. } => {
                    self.pending.push_back(Event::TextStart);
                    self.text_open = true;
                }
                AnthropicContentBlockStart::Thinking { .. } => {
                    self.pending.push_back(Event::ThinkingStart);
                    self.thinking_open = true;
                }
                AnthropicContentBlockStart::ToolUse { id, name } => {
                    self.current_tool = Some(PendingToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
            },
            AnthropicStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                AnthropicDelta::TextDelta { text } => {
                    self.text_buf.push_str(&text);
                    self.pending.push_back(Event::TextDelta { delta: text });
                }
                AnthropicDelta::ThinkingDelta { thinking } => {
                    self.thinking_buf.push_str(&thinking);
                    self.pending.push_back(Event::ThinkingDelta { delta: thinking });
                }
                AnthropicDelta::SignatureDelta { signature } => {
                    self.thinking_signature = Some(signature);
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = &mut self.current_tool {
                        tool.arguments.push_str(&partial_json);
                    }
                }
            },
            AnthropicStreamEvent::ContentBlockStop { .. } => {
                self.close_open_blocks();
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(stop_reason) = delta.stop_reason {
                    self.stop_reason = stop_reason_from_anthropic(&stop_reason);
                }
                self.usage.output = usage.output_tokens;
            }
            AnthropicStreamEvent::MessageStop | AnthropicStreamEvent::Ping => {}
            AnthropicStreamEvent::Error { error } => {
                self.done = true;
                self.pending.push_back(Event::Error {
                    aborted: false,
                    error: AssistantMessage {
                        content: std::mem::take(&mut self.content),
                        usage: self.usage,
                        stop_reason: StopReason::Error,
                        error_message: Some(error.message),
                        provider: self.provider.clone(),
                        model: self.model_id.clone(),
                        api: self.api.clone(),
                    },
                });
            }
        }
    }

    fn build_done_event(&mut self) -> Event {
        self.usage.compute_cost(&self.model);
        self.close_open_blocks();

        Event::Done {
            message: AssistantMessage {
                content: std::mem::take(&mut self.content),
                usage: self.usage,
                stop_reason: self.stop_reason,
                error_message: None,
                provider: self.provider.clone(),
                model: self.model_id.clone(),
                api: self.api.clone(),
            },
        }
    }
}

fn make_stream(state: TurnState) -> EventStream {
    Box::pin(futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.done {
                return None;
            }

            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    state.done = true;
                    state.close_open_blocks();
                    return Some((
                        Event::Error {
                            aborted: true,
                            error: AssistantMessage {
                                content: std::mem::take(&mut state.content),
                                usage: state.usage,
                                stop_reason: StopReason::Aborted,
                                error_message: Some("turn cancelled".to_string()),
                                provider: state.provider.clone(),
                                model: state.model_id.clone(),
                                api: state.api.clone(),
                            },
                        },
                        state,
                    ));
                }
                next = state.events.next() => {
                    match next {
                        None => {
                            state.done = true;
                            let event = state.build_done_event();
                            return Some((event, state));
                        }
                        Some(Ok(event)) => {
                            state.process_event(event);
                        }
                        Some(Err(err)) => {
                            state.done = true;
                            return Some((
                                Event::Error {
                                    aborted: false,
                                    error: AssistantMessage {
                                        content: std::mem::take(&mut state.content),
                                        usage: state.usage,
                                        stop_reason: StopReason::Error,
                                        error_message: Some(err.to_string()),
                                        provider: state.provider.clone(),
                                        model: state.model_id.clone(),
                                        api: state.api.clone(),
                                    },
                                },
                                state,
                            ));
                        }
                    }
                }
            }
        }
    }))
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_tools: true,
            supports_thinking: true,
            supports_vision: true,
        }
    }

    async fn stream(
        &self,
        model: &Model,
        context: Context,
        options: &AdapterOptions,
        cancel: CancelToken,
    ) -> Result<EventStream> {
        let filtered = filter_orphaned_tool_calls(&context.messages);
        let (system, messages) = to_anthropic_messages(&filtered, context.system_prompt.as_deref());

        let tools = if context.tools.is_empty() {
            None
        } else {
            Some(
                context
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.parameters,
                        })
                    })
                    .collect(),
            )
        };

        let max_tokens = options.max_tokens.unwrap_or(model.max_tokens as u32);
        let (thinking, temperature) = if model.reasoning {
            let budget = (max_tokens / 2).max(1024);
            (Some(json!({"type": "enabled", "budget_tokens": budget})), None)
        } else {
            (None, options.temperature)
        };

        let request = AnthropicRequest {
            model: model.id.clone(),
            max_tokens,
            messages,
            system,
            stream: true,
            temperature,
            tools,
            thinking,
        };

        let base_url = if options.base_url.is_empty() {
            model.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
        } else {
            options.base_url.clone()
        };
        let url = format!("{}/messages", base_url.trim_end_matches('/'));

        let http = self.http.clone();
        let api_key = options.api_key.clone();
        let timeout = options.timeout;
        let retry_config = RetryConfig::default();

        let response = retry_with_backoff_conditional(retry_config, move || {
            let http = http.clone();
            let url = url.clone();
            let api_key = api_key.clone();
            let request = request.clone();
            async move {
                let response = http
                    .post(&url)
                    .timeout(timeout)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("Content-Type", "application/json")
                    .json(&request)
                    .send()
                    .await
                    .map_err(Error::Http)?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<no body>".to_string());
                    return Err(Error::api(format!("API error {status}: {body}")));
                }
                Ok(response)
            }
        })
        .await?;

        let events = parse_anthropic_sse(response);

        let state = TurnState {
            events,
            cancel,
            pending: VecDeque::new(),
            done: false,
            text_open: false,
            thinking_open: false,
            text_buf: String::new(),
            thinking_buf: String::new(),
            thinking_signature: None,
            current_tool: None,
            content: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            provider: model.provider.clone(),
            model_id: model.id.clone(),
            api: model.api.clone(),
            model: model.clone(),
        };

        Ok(make_stream(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolResultBlock, ToolUseBlock};
    use serde_json::json;

    #[test]
    fn test_to_anthropic_messages_keeps_tool_result_in_same_user_message() {
        let messages = vec![
            Message::assistant(vec![ContentBlock::ToolUse(ToolUseBlock::new(
                "call_1",
                "search",
                json!({"q": "rust"}),
            ))]),
            Message::user_with_blocks(vec![
                ContentBlock::ToolResult(ToolResultBlock::new("call_1", json!({"ok": true}))),
                ContentBlock::Text(TextBlock::new("thanks")),
            ]),
        ];

        let (_, converted) = to_anthropic_messages(&messages, None);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "assistant");
        assert_eq!(converted[1].role, "user");
        assert_eq!(converted[1].content.len(), 2);
    }

    #[test]
    fn test_to_anthropic_messages_converts_tool_role_result() {
        // Mirrors agent.rs's dispatch_and_append_results, which tags tool
        // results with MessageRole::Tool rather than MessageRole::User.
        let messages = vec![
            Message::assistant(vec![ContentBlock::ToolUse(ToolUseBlock::new(
                "call_1",
                "search",
                json!({"q": "rust"}),
            ))]),
            Message::new(
                MessageRole::Tool,
                vec![ContentBlock::ToolResult(ToolResultBlock::new(
                    "call_1",
                    json!({"ok": true}),
                ))],
            ),
        ];

        let (_, converted) = to_anthropic_messages(&messages, None);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[1].role, "user");
        match &converted[1].content[0] {
            AnthropicContentBlockOut::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "call_1");
                assert_eq!(content, r#"{"ok":true}"#);
            }
            _ => panic!("expected tool_result block"),
        }
    }

    #[test]
    fn test_to_anthropic_messages_collects_system_text() {
        let messages = vec![
            text_message(MessageRole::System, "be terse"),
            Message::user("hi"),
        ];
        let (system, converted) = to_anthropic_messages(&messages, Some("global preamble"));
        assert_eq!(system.as_deref(), Some("global preamble\nbe terse"));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
    }

    fn text_message(role: MessageRole, text: &str) -> Message {
        Message::new(role, vec![ContentBlock::Text(TextBlock::new(text))])
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason_from_anthropic("tool_use"), StopReason::ToolUse);
        assert_eq!(stop_reason_from_anthropic("max_tokens"), StopReason::Length);
        assert_eq!(stop_reason_from_anthropic("end_turn"), StopReason::Stop);
    }

    #[test]
    fn test_image_source_detects_data_uri() {
        let image = ImageBlock::from_base64("QUJD", "image/png").unwrap();
        match anthropic_image_source(&image) {
            AnthropicImageSource::Base64 { media_type, data } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "QUJD");
            }
            other => panic!("expected base64 source, got {other:?}"),
        }
    }

    #[test]
    fn test_image_source_keeps_http_url() {
        let image = ImageBlock::from_url("https://example.com/cat.png").unwrap();
        match anthropic_image_source(&image) {
            AnthropicImageSource::Url { url } => assert_eq!(url, "https://example.com/cat.png"),
            other => panic!("expected url source, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_text_delta_event() {
        let raw = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#;
        let event: AnthropicStreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            AnthropicStreamEvent::ContentBlockDelta { delta: AnthropicDelta::TextDelta { text }, .. } => {
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

//! OpenAI-compatible streaming adapter.
//!
//! Grounded on the teacher's `client.rs` request-building and
//! `utils::{ToolCallAggregator, parse_sse_stream}`, rearchitected so each
//! incoming [`OpenAIChunk`] is translated directly into the canonical,
//! block-cursor-ordered [`crate::stream::Event`] sequence rather than
//! buffered until `finish_reason`. Serves every provider registered under
//! the `"openai-compatible"` api (LM Studio, Ollama, llama.cpp, vLLM, and
//! hosted OpenAI itself).

use super::{AdapterCapabilities, AdapterOptions, ProviderAdapter, filter_orphaned_tool_calls};
use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::stream::{CancelToken, Event, EventStream};
use crate::types::{
    ContentBlock, Context, Message, MessageRole, Model, OpenAIContent, OpenAIContentPart,
    OpenAIFunction, OpenAIMessage, OpenAIRequest, OpenAIToolCall, StopReason, Usage,
};
use crate::utils::parse_sse_stream;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, VecDeque};

/// Adapter for any server speaking the OpenAI chat-completions wire format.
#[derive(Debug, Default)]
pub struct OpenAiAdapter {
    http: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
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

/// Converts the canonical message list into OpenAI wire-format messages.
///
/// A canonical tool result is a [`ContentBlock::ToolResult`] nested inside a
/// user-role [`Message`] (see [`Message::user_with_blocks`]); OpenAI instead
/// wants it as its own `role: "tool"` message, so one canonical message can
/// expand into several wire messages.
fn to_openai_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    let mut out = Vec::new();

    for message in messages {
        match &message.role {
            MessageRole::System | MessageRole::HookMessage => {
                out.push(OpenAIMessage {
                    role: "system".to_string(),
                    content: Some(OpenAIContent::Text(extract_text(&message.content))),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            MessageRole::Assistant => {
                let text = extract_text(&message.content);
                let tool_calls: Vec<OpenAIToolCall> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolUse(tool_use) => Some(OpenAIToolCall {
                            id: tool_use.id.clone(),
                            call_type: "function".to_string(),
                            function: OpenAIFunction {
                                name: tool_use.name.clone(),
                                arguments: serde_json::to_string(&tool_use.input)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            },
                        }),
                        _ => None,
                    })
                    .collect();

                out.push(OpenAIMessage {
                    role: "assistant".to_string(),
                    content: if text.is_empty() {
                        None
                    } else {
                        Some(OpenAIContent::Text(text))
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
            MessageRole::Tool => {
                let mut pushed_result = false;
                for block in &message.content {
                    if let ContentBlock::ToolResult(result) = block {
                        out.push(OpenAIMessage {
                            role: "tool".to_string(),
                            content: Some(OpenAIContent::Text(stringify_tool_result(
                                &result.content,
                            ))),
                            tool_calls: None,
                            tool_call_id: Some(result.tool_use_id.clone()),
                        });
                        pushed_result = true;
                    }
                }
                if !pushed_result {
                    out.push(OpenAIMessage {
                        role: "tool".to_string(),
                        content: Some(OpenAIContent::Text(extract_text(&message.content))),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
            }
            MessageRole::User | MessageRole::BashExecution | MessageRole::Navigation => {
                let mut text_parts = Vec::new();
                let mut image_parts = Vec::new();

                for block in &message.content {
                    match block {
                        ContentBlock::Text(t) => text_parts.push(t.text.clone()),
                        ContentBlock::Image(image) => {
                            image_parts.push(OpenAIContentPart::image_url(
                                image.url().to_string(),
                                image.detail(),
                            ));
                        }
                        ContentBlock::ToolResult(result) => {
                            out.push(OpenAIMessage {
                                role: "tool".to_string(),
                                content: Some(OpenAIContent::Text(stringify_tool_result(
                                    &result.content,
                                ))),
                                tool_calls: None,
                                tool_call_id: Some(result.tool_use_id.clone()),
                            });
                        }
                        ContentBlock::ToolUse(_) | ContentBlock::Thinking(_) => {}
                    }
                }

                if !text_parts.is_empty() || !image_parts.is_empty() {
                    let content = if image_parts.is_empty() {
                        OpenAIContent::Text(text_parts.join("\n"))
                    } else {
                        let mut parts = Vec::new();
                        if !text_parts.is_empty() {
                            parts.push(OpenAIContentPart::text(text_parts.join("\n")));
                        }
                        parts.extend(image_parts);
                        OpenAIContent::Parts(parts)
                    };
                    out.push(OpenAIMessage {
                        role: "user".to_string(),
                        content: Some(content),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
            }
        }
    }

    out
}

fn stop_reason_from_finish(finish_reason: &str) -> StopReason {
    match finish_reason {
        "tool_calls" => StopReason::ToolUse,
        "length" => StopReason::Length,
        "content_filter" => StopReason::Safety,
        _ => StopReason::Stop,
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Drives one streaming turn, translating [`OpenAIChunk`]s into
/// [`Event`]s one delta at a time.
struct TurnState {
    chunks: std::pin::Pin<Box<dyn futures::Stream<Item = Result<crate::types::OpenAIChunk>> + Send>>,
    cancel: CancelToken,
    pending: VecDeque<Event>,
    done: bool,

    text_open: bool,
    thinking_open: bool,
    text_buf: String,
    thinking_buf: String,
    tool_calls: HashMap<u32, PendingToolCall>,
    tool_order: Vec<u32>,
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
            self.content
                .push(ContentBlock::Thinking(crate::types::ThinkingBlock::new(content.clone())));
            self.pending.push_back(Event::ThinkingEnd { content });
            self.thinking_open = false;
        }
        if self.text_open {
            let content = std::mem::take(&mut self.text_buf);
            self.content
                .push(ContentBlock::Text(crate::types::TextBlock::new(content.clone())));
            self.pending.push_back(Event::TextEnd { content });
            self.text_open = false;
        }
    }

    fn flush_tool_calls(&mut self) {
        for index in std::mem::take(&mut self.tool_order) {
            if let Some(partial) = self.tool_calls.remove(&index) {
                let (Some(id), Some(name)) = (partial.id, partial.name) else {
                    continue;
                };
                let input: serde_json::Value = if partial.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&partial.arguments).unwrap_or(serde_json::Value::Null)
                };
                let tool_call = crate::types::ToolUseBlock::new(id, name, input);
                self.content.push(ContentBlock::ToolUse(tool_call.clone()));
                self.pending.push_back(Event::ToolCall { tool_call });
            }
        }
    }

    fn process_chunk(&mut self, chunk: crate::types::OpenAIChunk) {
        if let Some(usage) = chunk.usage {
            self.usage = Usage::from_counts(
                usage.prompt_tokens,
                usage.completion_tokens,
                usage
                    .prompt_tokens_details
                    .as_ref()
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
                0,
            );
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !self.thinking_open {
                    self.pending.push_back(Event::ThinkingStart);
                    self.thinking_open = true;
                }
                self.thinking_buf.push_str(&reasoning);
                self.pending
                    .push_back(Event::ThinkingDelta { delta: reasoning });
            }

            if let Some(content) = choice.delta.content {
                if self.thinking_open {
                    self.pending.push_back(Event::ThinkingEnd {
                        content: std::mem::take(&mut self.thinking_buf),
                    });
                    self.thinking_open = false;
                }
                if !self.text_open {
                    self.pending.push_back(Event::TextStart);
                    self.text_open = true;
                }
                self.text_buf.push_str(&content);
                self.pending.push_back(Event::TextDelta { delta: content });
            }

            if let Some(tool_calls) = choice.delta.tool_calls {
                for delta in tool_calls {
                    if !self.tool_calls.contains_key(&delta.index) {
                        self.tool_order.push(delta.index);
                    }
                    let entry = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }

            if let Some(finish_reason) = choice.finish_reason {
                self.stop_reason = stop_reason_from_finish(&finish_reason);
                self.close_open_blocks();
                self.flush_tool_calls();
            }
        }
    }

    fn build_done_event(&mut self) -> Event {
        self.usage.compute_cost(&self.model);

        // The underlying chunk stream ended with no trailing finish_reason
        // chunk (some servers omit one); close whatever blocks are still
        // open so the final AssistantMessage is well-formed.
        self.close_open_blocks();
        self.flush_tool_calls();

        Event::Done {
            message: crate::types::AssistantMessage {
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
                            error: crate::types::AssistantMessage {
                                content: Vec::new(),
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
                next = state.chunks.next() => {
                    match next {
                        None => {
                            state.done = true;
                            let event = state.build_done_event();
                            return Some((event, state));
                        }
                        Some(Ok(chunk)) => {
                            state.process_chunk(chunk);
                        }
                        Some(Err(err)) => {
                            state.done = true;
                            return Some((
                                Event::Error {
                                    aborted: false,
                                    error: crate::types::AssistantMessage {
                                        content: Vec::new(),
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
impl ProviderAdapter for OpenAiAdapter {
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

        let mut messages = Vec::new();
        if let Some(system_prompt) = &context.system_prompt {
            if !system_prompt.is_empty() {
                messages.push(OpenAIMessage {
                    role: "system".to_string(),
                    content: Some(OpenAIContent::Text(system_prompt.clone())),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
        messages.extend(to_openai_messages(&filtered));

        let tools = if context.tools.is_empty() {
            None
        } else {
            Some(
                context
                    .tools
                    .iter()
                    .map(|tool| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            )
        };

        let request = OpenAIRequest {
            model: model.id.clone(),
            messages,
            stream: true,
            max_tokens: options.max_tokens.or(Some(model.max_tokens as u32)),
            temperature: options.temperature,
            tools,
            tool_choice: None,
            stream_options: Some(serde_json::json!({"include_usage": true})),
        };

        let base_url = if options.base_url.is_empty() {
            model.base_url.clone().unwrap_or_default()
        } else {
            options.base_url.clone()
        };
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

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
                    .header("Authorization", format!("Bearer {api_key}"))
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

        let chunks = parse_sse_stream(response);

        let state = TurnState {
            chunks,
            cancel,
            pending: VecDeque::new(),
            done: false,
            text_open: false,
            thinking_open: false,
            text_buf: String::new(),
            thinking_buf: String::new(),
            tool_calls: HashMap::new(),
            tool_order: Vec::new(),
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
    use crate::types::{TextBlock, ToolResultBlock, ToolUseBlock};
    use serde_json::json;

    #[test]
    fn test_to_openai_messages_splits_tool_result_into_own_message() {
        let messages = vec![
            Message::assistant(vec![ContentBlock::ToolUse(ToolUseBlock::new(
                "call_1",
                "search",
                json!({"q": "rust"}),
            ))]),
            Message::user_with_blocks(vec![ContentBlock::ToolResult(ToolResultBlock::new(
                "call_1",
                json!({"ok": true}),
            ))]),
        ];

        let converted = to_openai_messages(&messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "assistant");
        assert_eq!(converted[0].tool_calls.as_ref().unwrap()[0].id, "call_1");
        assert_eq!(converted[1].role, "tool");
        assert_eq!(converted[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_to_openai_messages_converts_tool_role_result() {
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

        let converted = to_openai_messages(&messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[1].role, "tool");
        assert_eq!(converted[1].tool_call_id.as_deref(), Some("call_1"));
        match &converted[1].content {
            Some(OpenAIContent::Text(t)) => assert_eq!(t, r#"{"ok":true}"#),
            _ => panic!("expected text content"),
        }
    }

    #[test]
    fn test_to_openai_messages_keeps_plain_user_text() {
        let messages = vec![Message::user("hello")];
        let converted = to_openai_messages(&messages);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
        match &converted[0].content {
            Some(OpenAIContent::Text(t)) => assert_eq!(t, "hello"),
            _ => panic!("expected text content"),
        }
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason_from_finish("tool_calls"), StopReason::ToolUse);
        assert_eq!(stop_reason_from_finish("length"), StopReason::Length);
        assert_eq!(stop_reason_from_finish("stop"), StopReason::Stop);
    }

    #[test]
    fn test_extract_text_joins_blocks() {
        let content = vec![
            ContentBlock::Text(TextBlock::new("a")),
            ContentBlock::Text(TextBlock::new("b")),
        ];
        assert_eq!(extract_text(&content), "a\nb");
    }
}

//! The Agent Loop: the turn-taking state machine tying together the
//! Provider Adapter abstraction, the Session Store, the hook system, and
//! tool dispatch (`SPEC_FULL.md` §4.4).
//!
//! `Idle -> Streaming -> (ToolDispatch -> Streaming)* -> Idle` per user turn.
//! Holds no reference back into anything that holds a reference to it —
//! [`crate::session::compaction::project`] is called as a pure function
//! rather than the loop owning a `SessionStore` trait object that also
//! depended on it, resolving the Session/Agent cyclic-reference note in
//! `SPEC_FULL.md` §9.
//!
//! Grounded on the teacher's `Client::auto_execute_loop` (`client.rs`):
//! the same collect-blocks / split-text-from-tools / execute-tools-and-loop
//! shape, generalized from one hardcoded OpenAI-compatible call to any
//! registered [`crate::adapters::ProviderAdapter`], with session persistence
//! and the full Agent Loop hook set spliced into the same steps the
//! teacher's pre/post tool-use hooks already occupied.

use crate::adapters::AdapterOptions;
use crate::hooks::{
    AgentEndEvent, AgentStartEvent, BeforeAgentStartEvent, ContextEvent, Hooks, PostToolUseEvent,
    PreToolUseEvent, SessionBeforeCompactEvent, SessionBeforeSwitchEvent, ToolResultEvent,
    TurnEndEvent, TurnStartEvent,
};
use crate::registry::ModelRegistry;
use crate::session::compaction;
use crate::session::{ModelChangeEntry, Session, SessionEntryKind, SessionStore};
use crate::stream::{CancelToken, Event, EventStream};
use crate::tools::{Tool, ToolExecutionResult};
use crate::types::{
    AssistantMessage, ContentBlock, Context, Message, MessageRole, Model, StopReason,
    ToolResultBlock, ToolUseBlock,
};
use crate::{Error, Result};
use futures::StreamExt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Where the loop currently sits in its per-turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No turn in progress; ready to accept the next user message.
    Idle,
    /// Waiting on/consuming the adapter's event stream.
    Streaming,
    /// Executing model-requested tool calls before streaming resumes.
    ToolDispatch,
}

/// Everything about the provider/model/tools/hooks that stays fixed for the
/// lifetime of one [`AgentLoop`]. Distinct from [`crate::types::AgentOptions`],
/// which is the older single-provider `Client`'s configuration shape; this
/// is scoped to exactly what the multi-provider Agent Loop needs.
pub struct AgentLoopOptions {
    pub(crate) model: Model,
    pub(crate) adapters: Arc<crate::adapters::ProviderRegistry>,
    pub(crate) adapter_options: AdapterOptions,
    pub(crate) system_prompt: Option<String>,
    pub(crate) tools: Vec<Arc<Tool>>,
    pub(crate) hooks: Hooks,
    /// Open Question #1 (`SPEC_FULL.md` §9): tool calls in one `toolUse` turn
    /// are dispatched in parallel by default; set this to serialize them.
    pub(crate) serialize_tool_calls: bool,
    /// Optional safety cap on `toolUse -> Streaming` round-trips within a
    /// single `run_turn` call, guarding against a model that never stops
    /// requesting tools. `None` means unbounded, matching the spec's state
    /// machine as written.
    pub(crate) max_tool_iterations: Option<u32>,
}

impl AgentLoopOptions {
    /// Starts a builder for the given model and adapter registry.
    pub fn builder(model: Model, adapters: Arc<crate::adapters::ProviderRegistry>) -> AgentLoopOptionsBuilder {
        AgentLoopOptionsBuilder {
            model,
            adapters,
            adapter_options: AdapterOptions::default(),
            system_prompt: None,
            tools: Vec::new(),
            hooks: Hooks::new(),
            serialize_tool_calls: false,
            max_tool_iterations: None,
        }
    }
}

/// Builder for [`AgentLoopOptions`].
pub struct AgentLoopOptionsBuilder {
    model: Model,
    adapters: Arc<crate::adapters::ProviderRegistry>,
    adapter_options: AdapterOptions,
    system_prompt: Option<String>,
    tools: Vec<Arc<Tool>>,
    hooks: Hooks,
    serialize_tool_calls: bool,
    max_tool_iterations: Option<u32>,
}

impl AgentLoopOptionsBuilder {
    /// Sets the system prompt sent ahead of every projected context.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Overrides the default per-call connection settings.
    pub fn adapter_options(mut self, options: AdapterOptions) -> Self {
        self.adapter_options = options;
        self
    }

    /// Registers one tool the model may call.
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Registers every tool in `tools`.
    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools.into_iter().map(Arc::new));
        self
    }

    /// Attaches a fully-populated [`Hooks`].
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Dispatches tool calls one at a time instead of concurrently.
    pub fn serialize_tool_calls(mut self, serialize: bool) -> Self {
        self.serialize_tool_calls = serialize;
        self
    }

    /// Caps the number of `toolUse -> Streaming` round-trips within one
    /// `run_turn` call. `None` (the default) never cuts a turn short.
    pub fn max_tool_iterations(mut self, max: u32) -> Self {
        self.max_tool_iterations = Some(max);
        self
    }

    /// Builds the immutable [`AgentLoopOptions`].
    pub fn build(self) -> AgentLoopOptions {
        AgentLoopOptions {
            model: self.model,
            adapters: self.adapters,
            adapter_options: self.adapter_options,
            system_prompt: self.system_prompt,
            tools: self.tools,
            hooks: self.hooks,
            serialize_tool_calls: self.serialize_tool_calls,
            max_tool_iterations: self.max_tool_iterations,
        }
    }
}

/// Looks up `options.model` in `registry`'s provider/id pair, purely as a
/// convenience for callers assembling an [`AgentLoop`] from a
/// [`ModelRegistry`] rather than a hand-built [`Model`]. Not used internally;
/// the loop only ever needs the already-resolved `Model` it was built with.
pub fn resolve_model(registry: &ModelRegistry, provider: &str, model_id: &str) -> Result<Model> {
    registry
        .get(provider, model_id)?
        .ok_or_else(|| Error::config(format!("no model registered for {provider}/{model_id}")))
}

/// Orchestrates one conversation: calls the selected provider adapter,
/// dispatches tool calls, appends everything to a [`Session`], and runs the
/// full Agent Loop hook set at each lifecycle point (`SPEC_FULL.md` §4.4).
pub struct AgentLoop {
    session: Session,
    store: Arc<dyn SessionStore>,
    options: AgentLoopOptions,
    state: AgentState,
    last_recorded_model: Option<(String, String, String)>,
}

impl AgentLoop {
    /// Opens or creates a session for `cwd` and fires `before_agent_start`/
    /// `agent_start`. `resume = true` picks up the most recently modified
    /// session file for `cwd`; `false` always starts a fresh one.
    pub async fn start(
        options: AgentLoopOptions,
        store: Arc<dyn SessionStore>,
        cwd: &Path,
        resume: bool,
    ) -> Result<Self> {
        options
            .hooks
            .execute_before_agent_start(BeforeAgentStartEvent {
                cwd: cwd.to_string_lossy().into_owned(),
            })
            .await;

        let session = if resume {
            store.continue_recent(cwd).await?
        } else {
            store.create(cwd).await?
        };

        options
            .hooks
            .execute_agent_start(AgentStartEvent {
                session_id: session.id().to_string(),
            })
            .await;

        let last_recorded_model = compaction::project(session.entries()).model;

        Ok(Self {
            session,
            store,
            options,
            state: AgentState::Idle,
            last_recorded_model,
        })
    }

    /// The loop's current state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The session this loop is currently appending to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Runs one full user turn: appends `user_content`, calls the adapter,
    /// dispatches any requested tools, and loops until the turn reaches a
    /// terminal (non-`toolUse`) stop reason or cancellation ends it early.
    ///
    /// `events`, if given, receives every [`Event`] as it is produced, for a
    /// UI to render incrementally; the final [`AssistantMessage`] is always
    /// returned regardless of whether a subscriber is attached.
    pub async fn run_turn(
        &mut self,
        user_content: Vec<ContentBlock>,
        cancel: CancelToken,
        events: Option<UnboundedSender<Event>>,
    ) -> Result<AssistantMessage> {
        if self.state != AgentState::Idle {
            return Err(Error::other(
                "run_turn called while the agent loop is not idle",
            ));
        }

        let user_message = Message::new(MessageRole::User, user_content);
        let history_before = compaction::project(self.session.entries()).messages;
        self.options
            .hooks
            .execute_turn_start(TurnStartEvent {
                user_message: user_message.clone(),
                history: history_before,
            })
            .await;

        self.append_message(user_message).await;
        self.state = AgentState::Streaming;

        let mut iterations: u32 = 0;
        loop {
            self.ensure_model_recorded().await;

            let mut messages = compaction::project(self.session.entries()).messages;
            if let Some(decision) = self
                .options
                .hooks
                .execute_context(ContextEvent {
                    messages: messages.clone(),
                })
                .await
            {
                if let Some(rewritten) = decision.modified_messages {
                    messages = rewritten;
                }
            }

            let mut context = Context::new(messages);
            if let Some(system_prompt) = &self.options.system_prompt {
                context = context.with_system_prompt(system_prompt.clone());
            }
            if !self.options.tools.is_empty() {
                let descriptors = self.options.tools.iter().map(|t| t.to_descriptor()).collect();
                context = context.with_tools(descriptors);
            }

            let adapter = self.options.adapters.get(&self.options.model.api)?;
            let mut stream = adapter
                .stream(
                    &self.options.model,
                    context,
                    &self.options.adapter_options,
                    cancel.clone(),
                )
                .await?;

            let assistant = self.consume_stream(&mut stream, events.as_ref()).await;
            self.append_message(Message::assistant(assistant.content.clone()))
                .await;

            if assistant.stop_reason != StopReason::ToolUse {
                self.state = AgentState::Idle;
                self.fire_turn_end(&assistant).await;
                return Ok(assistant);
            }

            self.state = AgentState::ToolDispatch;
            let tool_calls: Vec<ToolUseBlock> = assistant
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse(tool_use) => Some(tool_use.clone()),
                    _ => None,
                })
                .collect();

            self.dispatch_and_append_results(&tool_calls, &cancel).await;

            if cancel.is_cancelled() {
                self.state = AgentState::Idle;
                self.fire_turn_end(&assistant).await;
                return Ok(assistant);
            }

            iterations += 1;
            if let Some(max) = self.options.max_tool_iterations {
                if iterations >= max {
                    self.state = AgentState::Idle;
                    self.fire_turn_end(&assistant).await;
                    return Ok(assistant);
                }
            }

            self.state = AgentState::Streaming;
        }
    }

    /// Consumes `stream` to completion, forwarding every event to
    /// `events` (if attached) and returning the terminal message. A stream
    /// that ends without a `Done`/`Error` event is a protocol violation by
    /// the adapter; it is reported as a synthesized error rather than
    /// panicking, since a misbehaving adapter shouldn't take the whole loop
    /// down.
    async fn consume_stream(
        &self,
        stream: &mut EventStream,
        events: Option<&UnboundedSender<Event>>,
    ) -> AssistantMessage {
        while let Some(event) = stream.next().await {
            let terminal = match &event {
                Event::Done { message } => Some(message.clone()),
                Event::Error { error, .. } => Some(error.clone()),
                _ => None,
            };
            if let Some(sender) = events {
                let _ = sender.send(event);
            }
            if let Some(message) = terminal {
                return message;
            }
        }

        AssistantMessage {
            content: Vec::new(),
            usage: crate::types::Usage::default(),
            stop_reason: StopReason::Error,
            error_message: Some("event stream ended without a terminal event".to_string()),
            provider: self.options.model.provider.clone(),
            model: self.options.model.id.clone(),
            api: self.options.model.api.clone(),
        }
    }

    /// Dispatches `tool_calls` (in parallel unless `serialize_tool_calls` is
    /// set), running `tool_call`/`tool_result` hooks around each one, and
    /// appends one `toolResult` message per call in call order regardless of
    /// completion order. Once `cancel` has fired, no further `toolResult`
    /// messages are appended: a call racing `cancel` inside `Tool::run` only
    /// "completes" because it lost the race, so its result is not a real
    /// answer and is left unmatched, to be dropped by
    /// `filter_orphaned_tool_calls` on the next turn.
    async fn dispatch_and_append_results(&mut self, tool_calls: &[ToolUseBlock], cancel: &CancelToken) {
        if tool_calls.is_empty() {
            return;
        }

        let results: Vec<ToolExecutionResult> = if self.options.serialize_tool_calls {
            let mut out = Vec::with_capacity(tool_calls.len());
            for call in tool_calls {
                out.push(self.dispatch_tool(call, cancel).await);
            }
            out
        } else {
            let futures = tool_calls.iter().map(|call| self.dispatch_tool(call, cancel));
            futures::future::join_all(futures).await
        };

        if cancel.is_cancelled() {
            return;
        }

        for (call, result) in tool_calls.iter().zip(results.into_iter()) {
            let payload = serde_json::json!({
                "output": result.output,
                "is_error": result.is_error,
            });
            let tool_message = Message::new(
                MessageRole::Tool,
                vec![ContentBlock::ToolResult(ToolResultBlock::new(
                    call.id.clone(),
                    payload,
                ))],
            );
            self.append_message(tool_message).await;
        }
    }

    /// Runs one tool call end to end: `tool_call` hook (the only one that
    /// can block), the tool itself (racing `cancel`), `post_tool_use`
    /// (advisory), and `tool_result` (the only tool hook allowed to
    /// rewrite the outcome actually stored).
    async fn dispatch_tool(&self, call: &ToolUseBlock, cancel: &CancelToken) -> ToolExecutionResult {
        let history_snapshot: Vec<serde_json::Value> = compaction::project(self.session.entries())
            .messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(serde_json::Value::Null))
            .collect();

        let mut input = call.input.clone();
        let pre_event = PreToolUseEvent::new(
            call.name.clone(),
            input.clone(),
            call.id.clone(),
            history_snapshot.clone(),
        );
        if let Some(decision) = self.options.hooks.execute_pre_tool_use(pre_event).await {
            if !decision.continue_execution {
                return ToolExecutionResult {
                    output: decision
                        .reason
                        .unwrap_or_else(|| "blocked by tool_call hook".to_string()),
                    details: None,
                    is_error: true,
                };
            }
            if let Some(modified) = decision.modified_input {
                input = modified;
            }
        }

        let Some(tool) = self.options.tools.iter().find(|t| t.name() == call.name) else {
            return ToolExecutionResult {
                output: format!("no tool registered named \"{}\"", call.name),
                details: None,
                is_error: true,
            };
        };

        let mut result = tool.run(&call.id, input.clone(), cancel).await;

        let post_event = PostToolUseEvent::new(
            call.name.clone(),
            input,
            call.id.clone(),
            serde_json::json!({"output": result.output, "is_error": result.is_error}),
            history_snapshot,
        );
        let _ = self.options.hooks.execute_post_tool_use(post_event).await;

        let tool_result_event = ToolResultEvent {
            tool_name: call.name.clone(),
            tool_use_id: call.id.clone(),
            tool_result: serde_json::json!({"output": result.output, "is_error": result.is_error}),
        };
        if let Some(decision) = self.options.hooks.execute_tool_result(tool_result_event).await {
            if let Some(modified) = decision.modified_input {
                if let Some(output) = modified.get("output").and_then(|v| v.as_str()) {
                    result.output = output.to_string();
                }
                if let Some(is_error) = modified.get("is_error").and_then(|v| v.as_bool()) {
                    result.is_error = is_error;
                }
            }
        }

        result
    }

    /// Appends `message` to the session. Session persistence failures are
    /// non-fatal (`SPEC_FULL.md` §7): [`SessionStore::append`] always
    /// records the entry in memory before attempting the disk write, so a
    /// write failure here is logged and the turn proceeds with the
    /// in-memory session still authoritative.
    async fn append_message(&mut self, message: Message) {
        if let Err(err) = self
            .store
            .append(&mut self.session, SessionEntryKind::Message(message))
            .await
        {
            log::warn!("session persistence error, continuing with in-memory session: {err}");
        }
    }

    /// Appends a `model_change` entry the first time this loop runs a turn
    /// against a model not already reflected in the session's projection,
    /// including a brand new session's very first turn. Needed because
    /// [`Message`] carries no provider/model/api provenance of its own; see
    /// [`compaction::project`]'s doc comment for the full rationale.
    async fn ensure_model_recorded(&mut self) {
        let current = (
            self.options.model.provider.clone(),
            self.options.model.id.clone(),
            self.options.model.api.clone(),
        );
        if self.last_recorded_model.as_ref() == Some(&current) {
            return;
        }
        if let Err(err) = self
            .store
            .append(
                &mut self.session,
                SessionEntryKind::ModelChange(ModelChangeEntry {
                    provider: current.0.clone(),
                    model: current.1.clone(),
                    api: current.2.clone(),
                }),
            )
            .await
        {
            log::warn!("session persistence error recording model change: {err}");
        }
        self.last_recorded_model = Some(current);
    }

    async fn fire_turn_end(&self, assistant: &AssistantMessage) {
        self.options
            .hooks
            .execute_turn_end(TurnEndEvent {
                assistant_message: Message::assistant(assistant.content.clone()),
            })
            .await;
    }

    /// Summarizes `session.entries()[0..first_kept_entry_index)` via
    /// `summarize` and appends a `compaction` marker, firing
    /// `session_before_compact` first (`SPEC_FULL.md` §4.2.5, §4.4).
    pub async fn compact_session<F, Fut>(
        &mut self,
        first_kept_entry_index: usize,
        summarize: F,
    ) -> Result<()>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.options
            .hooks
            .execute_session_before_compact(SessionBeforeCompactEvent {
                session_id: self.session.id().to_string(),
                first_kept_entry_index,
            })
            .await;
        compaction::compact(
            self.store.as_ref(),
            &mut self.session,
            first_kept_entry_index,
            summarize,
        )
        .await
    }

    /// Switches this loop onto `new_session` (e.g. after a branch, or to
    /// resume a different session), firing `session_before_switch` first.
    /// Re-derives `last_recorded_model` from the new session's own
    /// projection so resuming a session that already recorded its model
    /// doesn't re-append a redundant `model_change` entry.
    pub async fn switch_session(&mut self, new_session: Session) {
        self.options
            .hooks
            .execute_session_before_switch(SessionBeforeSwitchEvent {
                from_session_id: self.session.id().to_string(),
                to_session_id: new_session.id().to_string(),
            })
            .await;
        self.last_recorded_model = compaction::project(new_session.entries()).model;
        self.session = new_session;
    }

    /// Fires `agent_end` with the final projected history. Callers should
    /// call this once, when the loop is being torn down for good.
    pub async fn shutdown(&mut self) {
        let history = compaction::project(self.session.entries()).messages;
        self.options
            .hooks
            .execute_agent_end(AgentEndEvent { history })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterCapabilities, ProviderAdapter, ProviderRegistry};
    use crate::types::{ModelCost, TextBlock, Usage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn test_model(api: &str) -> Model {
        Model {
            id: "test-model".into(),
            name: "Test Model".into(),
            provider: "testprov".into(),
            api: api.into(),
            base_url: None,
            reasoning: false,
            input: vec![],
            cost: ModelCost {
                input: 3.0,
                output: 15.0,
                cache_read: 0.0,
                cache_write: 0.0,
            },
            context_window: 128_000,
            max_tokens: 4096,
        }
    }

    /// A `ProviderAdapter` that plays back one scripted event sequence per
    /// call to `stream`, in order, looping the last sequence forever once
    /// exhausted (so tests that don't pop every queued turn don't panic).
    struct ScriptedAdapter {
        turns: StdMutex<Vec<Vec<Event>>>,
    }

    impl ScriptedAdapter {
        fn new(turns: Vec<Vec<Event>>) -> Self {
            Self {
                turns: StdMutex::new(turns),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities {
                supports_tools: true,
                supports_thinking: false,
                supports_vision: false,
            }
        }

        async fn stream(
            &self,
            _model: &Model,
            _context: Context,
            _options: &AdapterOptions,
            _cancel: CancelToken,
        ) -> Result<EventStream> {
            let mut turns = self.turns.lock().unwrap();
            let events = if turns.len() > 1 {
                turns.remove(0)
            } else {
                turns.first().cloned().unwrap_or_default()
            };
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn done_text(text: &str, usage: Usage, provider: &str, model: &str, api: &str) -> Vec<Event> {
        let message = AssistantMessage {
            content: vec![ContentBlock::Text(TextBlock::new(text))],
            usage,
            stop_reason: StopReason::Stop,
            error_message: None,
            provider: provider.into(),
            model: model.into(),
            api: api.into(),
        };
        vec![
            Event::TextStart,
            Event::TextDelta { delta: text.to_string() },
            Event::TextEnd { content: text.to_string() },
            Event::Done { message },
        ]
    }

    fn done_tool_call(call: ToolUseBlock, provider: &str, model: &str, api: &str) -> Vec<Event> {
        let message = AssistantMessage {
            content: vec![ContentBlock::ToolUse(call.clone())],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            provider: provider.into(),
            model: model.into(),
            api: api.into(),
        };
        vec![Event::ToolCall { tool_call: call }, Event::Done { message }]
    }

    async fn harness(turns: Vec<Vec<Event>>, options: AgentLoopOptionsBuilder) -> (AgentLoop, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn SessionStore> = Arc::new(crate::session::FileSessionStore::new(dir.path()));
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register("test-api", Arc::new(ScriptedAdapter::new(turns)))
            .unwrap();
        let built = AgentLoopOptions {
            adapters: registry,
            ..options.build()
        };
        let agent = AgentLoop::start(built, store, Path::new("/work"), false)
            .await
            .unwrap();
        (agent, dir)
    }

    #[tokio::test]
    async fn test_happy_path_no_tools() {
        let model = test_model("test-api");
        let mut usage = Usage::from_counts(10, 2, 0, 0);
        usage.compute_cost(&model);
        let turns = vec![done_text("hi", usage, "testprov", "test-model", "test-api")];
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new()));
        let (mut agent, _dir) = harness(turns, options).await;

        let result = agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("Say hi"))],
                CancelToken::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.stop_reason, StopReason::Stop);
        match &result.content[0] {
            ContentBlock::Text(t) => assert_eq!(t.text, "hi"),
            _ => panic!("expected text block"),
        }
        assert!((result.usage.cost.total - 60e-6).abs() < 1e-9);
        assert_eq!(agent.session().entries().len(), 4); // header + user + model_change + assistant
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_tool_round_trip_appends_four_entries() {
        let model = test_model("test-api");
        let call = ToolUseBlock::new("t1", "add", json!({"a": 2, "b": 3}));
        let turns = vec![
            done_tool_call(call, "testprov", "test-model", "test-api"),
            done_text(
                "The answer is 5.",
                Usage::default(),
                "testprov",
                "test-model",
                "test-api",
            ),
        ];
        let add_tool = Tool::new("add", "add two numbers", json!({"a": "number", "b": "number"}), |args| {
            Box::pin(async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                Ok(json!(a + b))
            })
        });
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new())).tool(add_tool);
        let (mut agent, _dir) = harness(turns, options).await;

        let result = agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("add 2 and 3"))],
                CancelToken::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.stop_reason, StopReason::Stop);
        // header + user + model_change + assistant(toolCall) + toolResult + assistant(text)
        assert_eq!(agent.session().entries().len(), 6);
    }

    #[tokio::test]
    async fn test_cancellation_produces_aborted_message_in_session() {
        let model = test_model("test-api");
        let aborted = AssistantMessage {
            content: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::Aborted,
            error_message: Some("cancelled".to_string()),
            provider: "testprov".into(),
            model: "test-model".into(),
            api: "test-api".into(),
        };
        let turns = vec![vec![Event::Error {
            aborted: true,
            error: aborted,
        }]];
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new()));
        let (mut agent, _dir) = harness(turns, options).await;

        let result = agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("hang on"))],
                CancelToken::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.session().entries().len(), 4); // header + user + model_change + assistant
    }

    #[tokio::test]
    async fn test_cancellation_mid_tool_dispatch_leaves_tool_call_orphaned() {
        let model = test_model("test-api");
        let call = ToolUseBlock::new("t1", "slow", json!({}));
        let turns = vec![done_tool_call(call, "testprov", "test-model", "test-api")];
        let cancel = CancelToken::new();
        let cancel_for_tool = cancel.clone();
        let slow = Tool::new("slow", "a tool that never returns", json!({}), move |_args| {
            let cancel = cancel_for_tool.clone();
            Box::pin(async move {
                cancel.cancel();
                std::future::pending::<()>().await;
                Ok(json!({}))
            })
        });
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new())).tool(slow);
        let (mut agent, _dir) = harness(turns, options).await;

        let result = agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("do it"))],
                cancel,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.stop_reason, StopReason::ToolUse);
        // header + user + model_change + assistant(toolCall); no toolResult is
        // appended, leaving the toolUse block orphaned.
        assert_eq!(agent.session().entries().len(), 4);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_tool_call_hook_blocks_execution() {
        let model = test_model("test-api");
        let call = ToolUseBlock::new("t1", "dangerous", json!({}));
        let turns = vec![
            done_tool_call(call, "testprov", "test-model", "test-api"),
            done_text("done", Usage::default(), "testprov", "test-model", "test-api"),
        ];
        let executed = Arc::new(StdMutex::new(false));
        let executed_clone = executed.clone();
        let dangerous = Tool::new("dangerous", "do something risky", json!({}), move |_args| {
            let executed = executed_clone.clone();
            Box::pin(async move {
                *executed.lock().unwrap() = true;
                Ok(json!({}))
            })
        });
        let hooks = Hooks::new().add_pre_tool_use(|event: PreToolUseEvent| async move {
            if event.tool_name == "dangerous" {
                Some(crate::hooks::HookDecision::block("not allowed"))
            } else {
                None
            }
        });
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new()))
            .tool(dangerous)
            .hooks(hooks);
        let (mut agent, _dir) = harness(turns, options).await;

        agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("do it"))],
                CancelToken::new(),
                None,
            )
            .await
            .unwrap();

        assert!(!*executed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_model_change_recorded_once_across_turns() {
        let model = test_model("test-api");
        let turns = vec![done_text(
            "hi",
            Usage::default(),
            "testprov",
            "test-model",
            "test-api",
        )];
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new()));
        let (mut agent, _dir) = harness(turns, options).await;

        agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("hi"))],
                CancelToken::new(),
                None,
            )
            .await
            .unwrap();
        agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("again"))],
                CancelToken::new(),
                None,
            )
            .await
            .unwrap();

        let model_changes = agent
            .session()
            .entries()
            .iter()
            .filter(|e| matches!(e.kind, SessionEntryKind::ModelChange(_)))
            .count();
        assert_eq!(model_changes, 1);
    }

    #[tokio::test]
    async fn test_run_turn_rejects_reentrant_call_while_not_idle() {
        let model = test_model("test-api");
        let turns = vec![done_text(
            "hi",
            Usage::default(),
            "testprov",
            "test-model",
            "test-api",
        )];
        let options = AgentLoopOptions::builder(model, Arc::new(ProviderRegistry::new()));
        let (mut agent, _dir) = harness(turns, options).await;
        agent.state = AgentState::Streaming;

        let result = agent
            .run_turn(
                vec![ContentBlock::Text(TextBlock::new("hi"))],
                CancelToken::new(),
                None,
            )
            .await;
        assert!(result.is_err());
    }
}

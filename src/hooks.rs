//! Hooks system for intercepting and controlling agent execution
//!
//! This module provides a hooks system for monitoring and controlling agent
//! behavior at key lifecycle points.
//!
//! # Examples
//!
//! ```rust,no_run
//! use open_agent::{Client, AgentOptions, PreToolUseEvent, HookDecision};
//!
//! async fn approve_tool(event: PreToolUseEvent) -> Option<HookDecision> {
//!     if event.tool_name == "delete_file" {
//!         return Some(HookDecision::block("Dangerous operation blocked"));
//!     }
//!     None // Continue normally
//! }
//! ```

use crate::types::Message;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Event fired before tool execution
#[derive(Debug, Clone)]
pub struct PreToolUseEvent {
    /// Name of the tool about to be executed
    pub tool_name: String,
    /// Input parameters for the tool
    pub tool_input: Value,
    /// Unique identifier for this tool use
    pub tool_use_id: String,
    /// Snapshot of conversation history (read-only)
    pub history: Vec<Value>,
}

impl PreToolUseEvent {
    pub fn new(
        tool_name: String,
        tool_input: Value,
        tool_use_id: String,
        history: Vec<Value>,
    ) -> Self {
        Self {
            tool_name,
            tool_input,
            tool_use_id,
            history,
        }
    }
}

/// Event fired after tool execution
#[derive(Debug, Clone)]
pub struct PostToolUseEvent {
    /// Name of the tool that was executed
    pub tool_name: String,
    /// Input parameters that were used
    pub tool_input: Value,
    /// Unique identifier for this tool use
    pub tool_use_id: String,
    /// Result returned by the tool (success or error)
    pub tool_result: Value,
    /// Snapshot of conversation history (read-only)
    pub history: Vec<Value>,
}

impl PostToolUseEvent {
    pub fn new(
        tool_name: String,
        tool_input: Value,
        tool_use_id: String,
        tool_result: Value,
        history: Vec<Value>,
    ) -> Self {
        Self {
            tool_name,
            tool_input,
            tool_use_id,
            tool_result,
            history,
        }
    }
}

/// Event fired before processing user input
#[derive(Debug, Clone)]
pub struct UserPromptSubmitEvent {
    /// The user's input prompt
    pub prompt: String,
    /// Snapshot of conversation history (read-only)
    pub history: Vec<Value>,
}

impl UserPromptSubmitEvent {
    pub fn new(prompt: String, history: Vec<Value>) -> Self {
        Self { prompt, history }
    }
}

/// Event fired once per agent, before the session is opened/created.
#[derive(Debug, Clone)]
pub struct BeforeAgentStartEvent {
    /// Working directory the agent is starting in.
    pub cwd: String,
}

/// Event fired once per agent, right after the session is ready, before the
/// first turn.
#[derive(Debug, Clone)]
pub struct AgentStartEvent {
    /// The session id now in use.
    pub session_id: String,
}

/// Event fired at the start of each user turn, before the adapter is called.
#[derive(Debug, Clone)]
pub struct TurnStartEvent {
    /// The user message that started this turn.
    pub user_message: Message,
    /// Conversation history prior to this turn.
    pub history: Vec<Message>,
}

/// Event fired with the projected [`crate::session::SessionContext`] messages
/// just before they are sent to the adapter. The only Agent Loop hook
/// allowed to rewrite messages, via [`HookDecision::modified_messages`].
#[derive(Debug, Clone)]
pub struct ContextEvent {
    /// Messages as projected from the session, about to be sent as-is unless
    /// a handler rewrites them.
    pub messages: Vec<Message>,
}

/// Event fired once a tool result has been produced, before it is appended
/// to the session. May rewrite the result via `modified_input` (reused as
/// the replacement tool-result payload).
#[derive(Debug, Clone)]
pub struct ToolResultEvent {
    /// Name of the tool that ran.
    pub tool_name: String,
    /// Id correlating this result to its originating tool call.
    pub tool_use_id: String,
    /// The tool's result payload.
    pub tool_result: Value,
}

/// Event fired at the end of each turn, after the assistant message (and any
/// tool results) have been appended to the session.
#[derive(Debug, Clone)]
pub struct TurnEndEvent {
    /// The assistant message that closed this turn.
    pub assistant_message: Message,
}

/// Event fired once per agent, when the loop returns to `Idle` for the last
/// time (the agent is shutting down).
#[derive(Debug, Clone)]
pub struct AgentEndEvent {
    /// Final conversation history.
    pub history: Vec<Message>,
}

/// Event fired before the Agent Loop switches its active session (e.g.
/// resuming a different session, or after a branch).
#[derive(Debug, Clone)]
pub struct SessionBeforeSwitchEvent {
    /// Session id being switched away from.
    pub from_session_id: String,
    /// Session id being switched to.
    pub to_session_id: String,
}

/// Event fired before a compaction is attempted.
#[derive(Debug, Clone)]
pub struct SessionBeforeCompactEvent {
    /// Session being compacted.
    pub session_id: String,
    /// Caller-chosen cut point, as will be passed to
    /// [`crate::session::compaction::compact`].
    pub first_kept_entry_index: usize,
}

/// Decision returned by hook handler to control execution
#[derive(Debug, Clone, Default)]
pub struct HookDecision {
    /// Whether to continue execution (default: true)
    pub continue_execution: bool,
    /// For PreToolUse / ToolCall - modified tool input (overrides original)
    pub modified_input: Option<Value>,
    /// For UserPromptSubmit - modified prompt (overrides original)
    pub modified_prompt: Option<String>,
    /// For the Agent Loop's `context` hook - rewritten message list to send
    /// to the adapter instead of the projected one. `context` is the only
    /// Agent Loop hook allowed to rewrite messages.
    pub modified_messages: Option<Vec<Message>>,
    /// Optional explanation for logging/debugging
    pub reason: Option<String>,
}

impl HookDecision {
    /// Create a decision to continue execution normally
    pub fn continue_() -> Self {
        Self {
            continue_execution: true,
            modified_input: None,
            modified_prompt: None,
            modified_messages: None,
            reason: None,
        }
    }

    /// Create a decision to block execution
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            continue_execution: false,
            modified_input: None,
            modified_prompt: None,
            modified_messages: None,
            reason: Some(reason.into()),
        }
    }

    /// Create a decision to modify tool input
    pub fn modify_input(input: Value, reason: impl Into<String>) -> Self {
        Self {
            continue_execution: true,
            modified_input: Some(input),
            modified_prompt: None,
            modified_messages: None,
            reason: Some(reason.into()),
        }
    }

    /// Create a decision to modify prompt
    pub fn modify_prompt(prompt: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            continue_execution: true,
            modified_input: None,
            modified_prompt: Some(prompt.into()),
            modified_messages: None,
            reason: Some(reason.into()),
        }
    }

    /// Create a decision to rewrite the messages sent to the adapter (the
    /// `context` hook's only capability).
    pub fn rewrite_context(messages: Vec<Message>, reason: impl Into<String>) -> Self {
        Self {
            continue_execution: true,
            modified_input: None,
            modified_prompt: None,
            modified_messages: Some(messages),
            reason: Some(reason.into()),
        }
    }
}

/// Type alias for hook handler functions
///
/// Hook handlers are async functions that take an event and return an optional decision.
///
/// Returns:
/// - `None`: Continue normally with no modifications
/// - `Some(HookDecision)`: Control execution (continue/skip/modify)
///
/// Raising an error will abort execution entirely.
pub type PreToolUseHandler = Arc<
    dyn Fn(PreToolUseEvent) -> Pin<Box<dyn Future<Output = Option<HookDecision>> + Send>>
        + Send
        + Sync,
>;

pub type PostToolUseHandler = Arc<
    dyn Fn(PostToolUseEvent) -> Pin<Box<dyn Future<Output = Option<HookDecision>> + Send>>
        + Send
        + Sync,
>;

pub type UserPromptSubmitHandler = Arc<
    dyn Fn(UserPromptSubmitEvent) -> Pin<Box<dyn Future<Output = Option<HookDecision>> + Send>>
        + Send
        + Sync,
>;

/// Generic handler alias used by every Agent Loop lifecycle hook below:
/// `tool_call`/`tool_result` reuse [`PreToolUseHandler`]/[`PostToolUseHandler`]
/// since they are the same shape at the Agent Loop level.
pub type AgentHookHandler<E> =
    Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = Option<HookDecision>> + Send>> + Send + Sync>;

pub type BeforeAgentStartHandler = AgentHookHandler<BeforeAgentStartEvent>;
pub type AgentStartHandler = AgentHookHandler<AgentStartEvent>;
pub type TurnStartHandler = AgentHookHandler<TurnStartEvent>;
pub type ContextHandler = AgentHookHandler<ContextEvent>;
pub type ToolResultHandler = AgentHookHandler<ToolResultEvent>;
pub type TurnEndHandler = AgentHookHandler<TurnEndEvent>;
pub type AgentEndHandler = AgentHookHandler<AgentEndEvent>;
pub type SessionBeforeSwitchHandler = AgentHookHandler<SessionBeforeSwitchEvent>;
pub type SessionBeforeCompactHandler = AgentHookHandler<SessionBeforeCompactEvent>;

/// Container for all hook types.
///
/// `pre_tool_use`/`post_tool_use` double as the Agent Loop's `tool_call`/
/// `tool_result` hook points (`tool_call` is the only Agent Loop event that
/// can block a call; `pre_tool_use`'s existing block/modify-input semantics
/// already cover that). The remaining fields are the purely-advisory Agent
/// Loop lifecycle hooks, plus `context`, the one other hook allowed to
/// rewrite anything (the projected message list).
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_tool_use: Vec<PreToolUseHandler>,
    pub post_tool_use: Vec<PostToolUseHandler>,
    pub user_prompt_submit: Vec<UserPromptSubmitHandler>,
    pub before_agent_start: Vec<BeforeAgentStartHandler>,
    pub agent_start: Vec<AgentStartHandler>,
    pub turn_start: Vec<TurnStartHandler>,
    pub context: Vec<ContextHandler>,
    pub tool_result: Vec<ToolResultHandler>,
    pub turn_end: Vec<TurnEndHandler>,
    pub agent_end: Vec<AgentEndHandler>,
    pub session_before_switch: Vec<SessionBeforeSwitchHandler>,
    pub session_before_compact: Vec<SessionBeforeCompactHandler>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PreToolUse hook
    pub fn add_pre_tool_use<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PreToolUseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.pre_tool_use
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a PostToolUse hook
    pub fn add_post_tool_use<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PostToolUseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.post_tool_use
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a UserPromptSubmit hook
    pub fn add_user_prompt_submit<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(UserPromptSubmitEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.user_prompt_submit
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `before_agent_start` hook.
    pub fn add_before_agent_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(BeforeAgentStartEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.before_agent_start
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add an `agent_start` hook.
    pub fn add_agent_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AgentStartEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.agent_start
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `turn_start` hook.
    pub fn add_turn_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(TurnStartEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.turn_start
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `context` hook (the only hook that may rewrite messages).
    pub fn add_context<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ContextEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.context
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `tool_result` hook.
    pub fn add_tool_result<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolResultEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.tool_result
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `turn_end` hook.
    pub fn add_turn_end<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(TurnEndEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.turn_end
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add an `agent_end` hook.
    pub fn add_agent_end<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AgentEndEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.agent_end
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `session_before_switch` hook.
    pub fn add_session_before_switch<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SessionBeforeSwitchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.session_before_switch
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add a `session_before_compact` hook.
    pub fn add_session_before_compact<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SessionBeforeCompactEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<HookDecision>> + Send + 'static,
    {
        self.session_before_compact
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Execute PreToolUse hooks and return the first non-None decision
    pub async fn execute_pre_tool_use(&self, event: PreToolUseEvent) -> Option<HookDecision> {
        for handler in &self.pre_tool_use {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Execute PostToolUse hooks and return the first non-None decision
    pub async fn execute_post_tool_use(&self, event: PostToolUseEvent) -> Option<HookDecision> {
        for handler in &self.post_tool_use {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Execute UserPromptSubmit hooks and return the first non-None decision
    pub async fn execute_user_prompt_submit(
        &self,
        event: UserPromptSubmitEvent,
    ) -> Option<HookDecision> {
        for handler in &self.user_prompt_submit {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `before_agent_start` hooks, first-non-None-wins.
    pub async fn execute_before_agent_start(
        &self,
        event: BeforeAgentStartEvent,
    ) -> Option<HookDecision> {
        for handler in &self.before_agent_start {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `agent_start` hooks, first-non-None-wins.
    pub async fn execute_agent_start(&self, event: AgentStartEvent) -> Option<HookDecision> {
        for handler in &self.agent_start {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `turn_start` hooks, first-non-None-wins.
    pub async fn execute_turn_start(&self, event: TurnStartEvent) -> Option<HookDecision> {
        for handler in &self.turn_start {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `context` hooks, first-non-None-wins. The caller is
    /// responsible for honoring `modified_messages` on the returned
    /// decision, if present.
    pub async fn execute_context(&self, event: ContextEvent) -> Option<HookDecision> {
        for handler in &self.context {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `tool_result` hooks, first-non-None-wins.
    pub async fn execute_tool_result(&self, event: ToolResultEvent) -> Option<HookDecision> {
        for handler in &self.tool_result {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `turn_end` hooks, first-non-None-wins.
    pub async fn execute_turn_end(&self, event: TurnEndEvent) -> Option<HookDecision> {
        for handler in &self.turn_end {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `agent_end` hooks, first-non-None-wins.
    pub async fn execute_agent_end(&self, event: AgentEndEvent) -> Option<HookDecision> {
        for handler in &self.agent_end {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `session_before_switch` hooks, first-non-None-wins.
    pub async fn execute_session_before_switch(
        &self,
        event: SessionBeforeSwitchEvent,
    ) -> Option<HookDecision> {
        for handler in &self.session_before_switch {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }

    /// Executes `session_before_compact` hooks, first-non-None-wins.
    pub async fn execute_session_before_compact(
        &self,
        event: SessionBeforeCompactEvent,
    ) -> Option<HookDecision> {
        for handler in &self.session_before_compact {
            if let Some(decision) = handler(event.clone()).await {
                return Some(decision);
            }
        }
        None
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "pre_tool_use",
                &format!("{} handlers", self.pre_tool_use.len()),
            )
            .field(
                "post_tool_use",
                &format!("{} handlers", self.post_tool_use.len()),
            )
            .field(
                "user_prompt_submit",
                &format!("{} handlers", self.user_prompt_submit.len()),
            )
            .field(
                "before_agent_start",
                &format!("{} handlers", self.before_agent_start.len()),
            )
            .field(
                "agent_start",
                &format!("{} handlers", self.agent_start.len()),
            )
            .field(
                "turn_start",
                &format!("{} handlers", self.turn_start.len()),
            )
            .field("context", &format!("{} handlers", self.context.len()))
            .field(
                "tool_result",
                &format!("{} handlers", self.tool_result.len()),
            )
            .field("turn_end", &format!("{} handlers", self.turn_end.len()))
            .field("agent_end", &format!("{} handlers", self.agent_end.len()))
            .field(
                "session_before_switch",
                &format!("{} handlers", self.session_before_switch.len()),
            )
            .field(
                "session_before_compact",
                &format!("{} handlers", self.session_before_compact.len()),
            )
            .finish()
    }
}

/// Hook event name constants
pub const HOOK_PRE_TOOL_USE: &str = "pre_tool_use";
pub const HOOK_POST_TOOL_USE: &str = "post_tool_use";
pub const HOOK_USER_PROMPT_SUBMIT: &str = "user_prompt_submit";
pub const HOOK_BEFORE_AGENT_START: &str = "before_agent_start";
pub const HOOK_AGENT_START: &str = "agent_start";
pub const HOOK_TURN_START: &str = "turn_start";
pub const HOOK_CONTEXT: &str = "context";
/// The Agent Loop's name for [`PreToolUseEvent`]/[`PreToolUseHandler`].
pub const HOOK_TOOL_CALL: &str = "tool_call";
pub const HOOK_TOOL_RESULT: &str = "tool_result";
pub const HOOK_TURN_END: &str = "turn_end";
pub const HOOK_AGENT_END: &str = "agent_end";
pub const HOOK_SESSION_BEFORE_SWITCH: &str = "session_before_switch";
pub const HOOK_SESSION_BEFORE_COMPACT: &str = "session_before_compact";

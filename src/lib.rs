//! # Open Agent Core
//!
//! The core engine of a coding-agent platform: a session-backed, multi-provider
//! Agent Loop, an isolated sandbox runtime for executing model-generated code,
//! and the streaming/hook/tool plumbing both are built on.
//!
//! ## Key Features
//!
//! - **Multi-Provider Streaming**: One [`Event`] model and [`ProviderAdapter`]
//!   trait behind a registry keyed by API, with built-in OpenAI-compatible and
//!   Anthropic adapters
//! - **Durable Sessions**: Append-only, branchable session storage with lazy
//!   compaction and `continueRecent` resume
//! - **Sandboxed Execution**: An isolated code-execution context with a
//!   process-wide message router and a standard set of runtime providers
//!   (console, attachments, downloadable files, artifacts)
//! - **The Agent Loop**: Orchestrates all of the above into one turn-taking
//!   state machine, with a full lifecycle hook set for intercepting and
//!   controlling execution
//! - **Tool Calling**: Define and execute tools with automatic schema generation
//! - **Context Management**: Manual token estimation, history truncation, and
//!   LLM-driven compaction
//! - **Retry Logic**: Exponential backoff with jitter for reliability
//!
//! ## The Agent Loop
//!
//! [`AgentLoop`] is the primary way to drive a conversation: it owns a
//! [`crate::session::Session`], resolves the right [`ProviderAdapter`] for
//! each turn's model, dispatches any requested tools, and persists every step.
//!
//! ```rust,no_run
//! use open_agent::prelude::*;
//! use open_agent::adapters::ProviderRegistry;
//! use open_agent::session::FileSessionStore;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example(model: open_agent::Model) -> open_agent::Result<()> {
//! let adapters = Arc::new(ProviderRegistry::with_default_adapters());
//! let store = Arc::new(FileSessionStore::new("./.agent"));
//! let options = AgentLoopOptions::builder(model, adapters)
//!     .system_prompt("You are a helpful coding agent")
//!     .build();
//!
//! let mut agent = AgentLoop::start(options, store, Path::new("."), true).await?;
//! let reply = agent
//!     .run_turn(
//!         vec![ContentBlock::Text(TextBlock::new("What's 2+2?"))],
//!         CancelToken::new(),
//!         None,
//!     )
//!     .await?;
//! for block in &reply.content {
//!     if let ContentBlock::Text(text) = block {
//!         print!("{}", text.text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## A Lighter-Weight Entry Point
//!
//! For a single provider with no session persistence, the original
//! [`query()`] function and [`Client`] remain available as a smaller surface
//! a host can build a CLI or script against without pulling in the session
//! store or sandbox runtime:
//!
//! ```rust,no_run
//! use open_agent::{query, AgentOptions, ContentBlock};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder()
//!         .system_prompt("You are a helpful assistant")
//!         .model("qwen2.5-32b-instruct")
//!         .base_url("http://localhost:1234/v1")
//!         .build()?;
//!
//!     let mut stream = query("What's the capital of France?", &options).await?;
//!     while let Some(block) = stream.next().await {
//!         if let ContentBlock::Text(text_block) = block? {
//!             print!("{}", text_block.text);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: The Agent Loop state machine tying adapters, session store,
//!   hooks, and tool dispatch together into one turn-taking loop
//! - **session**: Append-only session storage, branching, and compaction
//! - **sandbox**: Isolated code-execution context, process-wide message
//!   router, and the standard runtime providers (console, attachments,
//!   downloadable files, artifacts)
//! - **adapters**: Provider adapter trait, registry, and the built-in OpenAI-compatible
//!   and Anthropic adapters
//! - **stream**: Canonical streaming event model and cancellation token
//! - **registry**: Process-wide model catalog
//! - **hooks**: Lifecycle event system for intercepting execution
//! - **tools**: Tool definition system with automatic JSON schema generation
//! - **types**: Data structures for messages, content blocks, and configuration
//! - **context**: Token estimation and message truncation utilities
//! - **retry**: Exponential backoff retry logic with jitter
//! - **error**: Comprehensive error types and conversions
//! - **client**: The original single-provider streaming query engine and
//!   multi-turn client, kept as a lighter-weight entry point (see above)
//! - **config**: Provider-specific configuration helpers
//! - **utils**: Internal utilities for SSE parsing and tool aggregation

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
// These modules are private (internal implementation details) unless explicitly
// re-exported through `pub use` statements below.

/// Core client implementation providing streaming queries and stateful conversations.
/// Contains the `query()` function for single-turn queries and `Client` struct
/// for multi-turn conversations with automatic state management.
mod client;

/// Provider configuration helpers for LM Studio, Ollama, llama.cpp, and vLLM.
/// Simplifies endpoint and model name resolution with environment variable support.
mod config;

/// Context window management utilities for token estimation and history truncation.
/// Provides manual control over conversation memory to prevent context overflow.
mod context;

/// Error types and conversions for comprehensive error handling throughout the SDK.
/// Defines the `Error` enum and `Result<T>` type alias used across all public APIs.
mod error;

/// Lifecycle hooks system for intercepting and controlling execution at key points.
/// Enables security gates, audit logging, input/output modification, and compliance checks.
mod hooks;

/// Tool definition and execution system with automatic JSON schema generation.
/// Allows LLMs to call Rust functions with type-safe parameter handling.
mod tools;

/// Core type definitions for messages, content blocks, and agent configuration.
/// Includes builder patterns for ergonomic configuration and OpenAI API serialization.
mod types;

/// Internal utilities for Server-Sent Events (SSE) parsing and tool call aggregation.
/// Handles the low-level details of streaming response parsing.
mod utils;

/// Process-wide catalog of callable models, keyed by provider and model id.
mod registry;

/// Canonical streaming event type and cooperative cancellation primitive shared
/// by every provider adapter.
mod stream;

/// Provider Adapter trait and registry: the seam every LLM backend plugs
/// into, plus the built-in OpenAI-compatible and Anthropic adapters.
pub mod adapters;

/// Append-only, branchable session storage and context projection/compaction.
pub mod session;

/// Isolated sandbox execution context, process-wide runtime message router,
/// and the standard runtime providers untrusted model-generated code runs
/// against.
pub mod sandbox;

/// The Agent Loop: orchestrates provider adapters, session storage, hooks,
/// and parallel tool dispatch into one turn-taking state machine.
pub mod agent;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================
// These items form the public API of the SDK. Everything else is internal.

/// Retry utilities with exponential backoff and jitter.
/// Made public as a module so users can access retry configuration and functions
/// for their own operations that need retry logic.
pub mod retry;

// --- Core Client API ---

pub use client::{Client, query};

// --- Provider Configuration ---

pub use config::{Provider, get_base_url, get_model};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_messages};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Lifecycle Hooks ---

pub use hooks::{
    AgentEndEvent, AgentStartEvent, BeforeAgentStartEvent, ContextEvent,
    HOOK_AGENT_END, HOOK_AGENT_START, HOOK_BEFORE_AGENT_START, HOOK_CONTEXT,
    HOOK_POST_TOOL_USE, HOOK_PRE_TOOL_USE, HOOK_SESSION_BEFORE_COMPACT,
    HOOK_SESSION_BEFORE_SWITCH, HOOK_TOOL_CALL, HOOK_TOOL_RESULT, HOOK_TURN_END,
    HOOK_TURN_START, HOOK_USER_PROMPT_SUBMIT, HookDecision, Hooks, PostToolUseEvent,
    PreToolUseEvent, SessionBeforeCompactEvent, SessionBeforeSwitchEvent, ToolResultEvent,
    TurnEndEvent, TurnStartEvent, UserPromptSubmitEvent,
};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, tool};

// --- Core Types ---

pub use types::{
    AgentOptions, AgentOptionsBuilder, AssistantMessage, ContentBlock, Context, ImageBlock,
    ImageDetail, MediaKind, Message, MessageRole, Model, ModelCost, StopReason, TextBlock,
    ThinkingBlock, ToolDescriptor, ToolResultBlock, ToolUseBlock, Usage,
};

// --- Streaming Event Model ---

pub use stream::{CancelToken, Event, EventStream};

// --- Provider Adapters ---

pub use adapters::{AdapterCapabilities, AdapterOptions, ProviderAdapter, ProviderRegistry};

// --- Model Registry ---

pub use registry::ModelRegistry;

// --- Tool Execution Result ---

pub use tools::ToolExecutionResult;

// --- Agent Loop ---

pub use agent::{AgentLoop, AgentLoopOptions, AgentLoopOptionsBuilder, AgentState, resolve_model};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use open_agent::prelude::*;` to get everything you need for typical usage.
///
/// This includes:
/// - Agent Loop: AgentLoop, AgentLoopOptions, AgentState
/// - Legacy single-provider entry point: AgentOptions, AgentOptionsBuilder, Client, query()
/// - Content: ContentBlock, TextBlock, ToolUseBlock
/// - Streaming: CancelToken
/// - Tools: Tool, tool()
/// - Hooks: Hooks, HookDecision, hook event types
/// - Errors: Error, Result
pub mod prelude {
    pub use crate::{
        AgentLoop, AgentLoopOptions, AgentOptions, AgentOptionsBuilder, AgentState, CancelToken,
        Client, ContentBlock, Error, HookDecision, Hooks, PostToolUseEvent, PreToolUseEvent,
        Result, TextBlock, Tool, ToolUseBlock, UserPromptSubmitEvent, query, tool,
    };
}

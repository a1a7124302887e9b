//! Provider Adapter abstraction: the seam every LLM backend plugs into.
//!
//! Mirrors [`crate::registry::ModelRegistry`]'s shape: a process-wide
//! `api -> Arc<dyn ProviderAdapter>` map (here keyed by `api` rather than
//! `provider`, since several providers share one wire protocol), mutable
//! only through [`ProviderRegistry::register`], initialized at startup from
//! the two built-in adapters and extendable at runtime.
//!
//! Grounded on the teacher's `client.rs` (request building, the
//! `auto_execute_loop` turn-taking shape) and `utils.rs` (`ToolCallAggregator`,
//! `parse_sse_stream`), rearchitected so a single request/response cycle
//! yields the canonical, block-cursor-ordered [`crate::stream::Event`]
//! sequence instead of whole-block-at-finish output.

pub mod anthropic;
pub mod openai;

use crate::stream::{CancelToken, EventStream};
use crate::types::{ContentBlock, Context, Message, MessageRole, Model};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Capability flags an adapter declares up front, so the Agent Loop can
/// fail fast on an unsupported combination (e.g. a tool-using turn sent to
/// an adapter with `supports_tools: false`) instead of discovering it via a
/// confusing provider-side error partway through a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Whether this adapter can translate [`crate::types::ToolDescriptor`]s
    /// and emit/consume [`ContentBlock::ToolUse`]/[`ContentBlock::ToolResult`].
    pub supports_tools: bool,
    /// Whether this adapter can emit [`crate::stream::Event::ThinkingDelta`].
    pub supports_thinking: bool,
    /// Whether this adapter accepts [`ContentBlock::Image`] content.
    pub supports_vision: bool,
}

/// Per-call connection settings, distinct from the catalog data in [`Model`]
/// since the same model can be called with different timeouts/credentials
/// across turns (e.g. a session switching API keys).
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Base URL to call, overriding [`Model::base_url`] when set.
    pub base_url: String,
    /// Bearer credential, or an empty string for servers that don't check one.
    pub api_key: String,
    /// Request timeout for the initial connect/first-byte phase.
    pub timeout: Duration,
    /// Caller-requested cap on completion tokens, overriding [`Model::max_tokens`].
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(120),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// A single provider backend: turns a [`Context`] into a stream of canonical
/// [`crate::stream::Event`]s.
///
/// `stream` returning `Err` means the call never got off the ground (DNS,
/// TLS, auth, a non-2xx before any bytes arrived) — this is the only phase
/// [`crate::retry::retry_with_backoff_conditional`] is meant to wrap, since
/// retrying after the first [`crate::stream::Event`] has already been handed
/// to a caller would duplicate content. Once the returned stream starts
/// yielding, every failure thereafter is reported in-band as a terminal
/// [`crate::stream::Event::Error`], never as a second `Err`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Declares what this adapter can and cannot do, so callers can validate
    /// a request before paying for a connection attempt.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Starts one streaming turn against `model`, given the full projected
    /// conversation in `context`. `cancel` is polled cooperatively by the
    /// adapter's internal read loop; once triggered, the adapter stops
    /// reading and emits a terminal `Event::Error { aborted: true, .. }`.
    async fn stream(
        &self,
        model: &Model,
        context: Context,
        options: &AdapterOptions,
        cancel: CancelToken,
    ) -> Result<EventStream>;
}

/// Drops assistant [`ContentBlock::ToolUse`] blocks with no matching
/// [`ContentBlock::ToolResult`] anywhere else in `messages`.
///
/// Pure function over a message list, not over [`crate::session::SessionContext`]
/// directly: an orphaned tool call is an adapter-contract violation (most
/// wire protocols reject a tool call with no paired result), not a property
/// of the canonical session data, so this lives here rather than in
/// [`crate::session::compaction::project`]. Typically produced by an
/// interrupted turn (the model asked for a tool, then the turn was
/// cancelled before the result came back) or by compaction dropping the
/// paired result out of the kept tail.
///
/// An assistant message left with no content after filtering is dropped
/// entirely rather than kept as an empty shell.
pub fn filter_orphaned_tool_calls(messages: &[Message]) -> Vec<Message> {
    let mut result_ids: HashSet<&str> = HashSet::new();
    for message in messages {
        for block in &message.content {
            if let ContentBlock::ToolResult(result) = block {
                result_ids.insert(result.tool_use_id.as_str());
            }
        }
    }

    messages
        .iter()
        .filter_map(|message| {
            if message.role != MessageRole::Assistant {
                return Some(message.clone());
            }
            let had_tool_use = message
                .content
                .iter()
                .any(|block| matches!(block, ContentBlock::ToolUse(_)));
            if !had_tool_use {
                return Some(message.clone());
            }
            let content: Vec<ContentBlock> = message
                .content
                .iter()
                .filter(|block| match block {
                    ContentBlock::ToolUse(tool_use) => {
                        result_ids.contains(tool_use.id.as_str())
                    }
                    _ => true,
                })
                .cloned()
                .collect();
            if content.is_empty() {
                None
            } else {
                Some(Message {
                    role: message.role.clone(),
                    content,
                    timestamp: message.timestamp,
                })
            }
        })
        .collect()
}

/// A thread-safe `api -> Arc<dyn ProviderAdapter>` registry.
///
/// Keyed by [`Model::api`] rather than [`Model::provider`]: several
/// providers (LMStudio, Ollama, vLLM, OpenAI itself) all speak the same
/// `"openai-compatible"` wire protocol and share one adapter instance.
pub struct ProviderRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry pre-populated with the two built-in adapters,
    /// keyed under the same `api` strings [`crate::registry::default_catalog`]
    /// uses: `"openai-compatible"` and `"anthropic"`.
    pub fn with_default_adapters() -> Self {
        let registry = Self::new();
        // Safe to discard: the built-in adapters never collide with each other.
        let _ = registry.register("openai-compatible", Arc::new(openai::OpenAiAdapter::new()));
        let _ = registry.register("anthropic", Arc::new(anthropic::AnthropicAdapter::new()));
        registry
    }

    /// Registers an adapter under `api`, overwriting any existing entry.
    pub fn register(&self, api: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let mut adapters = self
            .adapters
            .write()
            .map_err(|_| Error::other("provider registry lock poisoned"))?;
        adapters.insert(api.into(), adapter);
        Ok(())
    }

    /// Looks up the adapter registered for `api`.
    pub fn get(&self, api: &str) -> Result<Arc<dyn ProviderAdapter>> {
        let adapters = self
            .adapters
            .read()
            .map_err(|_| Error::other("provider registry lock poisoned"))?;
        adapters
            .get(api)
            .cloned()
            .ok_or_else(|| Error::config(format!("no provider adapter registered for api {api}")))
    }

    /// Lists the registered `api` keys.
    pub fn list_apis(&self) -> Result<Vec<String>> {
        let adapters = self
            .adapters
            .read()
            .map_err(|_| Error::other("provider registry lock poisoned"))?;
        Ok(adapters.keys().cloned().collect())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

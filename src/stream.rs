//! The provider-agnostic event stream every adapter emits.
//!
//! A [`ProviderAdapter`](crate::adapters::ProviderAdapter) turns one provider's
//! wire format into a sequence of [`Event`]s terminated by exactly one
//! [`Event::Done`] or [`Event::Error`]. Within a single content block, events
//! are strictly ordered: a `*_start` precedes zero or more `*_delta`s,
//! followed by exactly one `*_end`.

use crate::types::AssistantMessage;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// One item in a streaming provider response.
#[derive(Debug, Clone)]
pub enum Event {
    /// A text content block has begun.
    TextStart,
    /// An incremental fragment of the current text block.
    TextDelta {
        /// The fragment itself.
        delta: String,
    },
    /// The current text block is complete.
    TextEnd {
        /// The block's full accumulated text.
        content: String,
    },
    /// A thinking/reasoning content block has begun.
    ThinkingStart,
    /// An incremental fragment of the current thinking block.
    ThinkingDelta {
        /// The fragment itself.
        delta: String,
    },
    /// The current thinking block is complete.
    ThinkingEnd {
        /// The block's full accumulated text.
        content: String,
    },
    /// A tool call's arguments have been fully accumulated and parsed.
    ToolCall {
        /// The completed tool call block.
        tool_call: crate::types::ToolUseBlock,
    },
    /// An optional coalesced snapshot of everything streamed so far.
    ///
    /// Adapters may emit this to let a UI render a partial transcript
    /// without assembling one itself; not every adapter emits it.
    Partial {
        /// The in-progress assistant message.
        partial: AssistantMessage,
    },
    /// Terminal success event. Exactly one of `Done`/`Error` is ever emitted.
    Done {
        /// The finalized assistant message.
        message: AssistantMessage,
    },
    /// Terminal failure event. Exactly one of `Done`/`Error` is ever emitted.
    Error {
        /// `true` if this was a cancellation rather than a genuine failure.
        aborted: bool,
        /// The (possibly empty) assistant message produced before failure.
        error: AssistantMessage,
    },
}

/// A boxed, ownable stream of [`Event`]s, returned by every adapter.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// A cheaply cloneable cancellation flag, checked between stream chunks and
/// forwarded to tool execution and sandbox RPCs.
///
/// Stands in for a JS `AbortSignal`: there is no single shared abort
/// controller object in this runtime, so instead every holder of a clone can
/// independently observe (`is_cancelled`) or wait on (`cancelled`) the same
/// underlying flag, and any holder can trigger it (`cancel`).
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    /// Creates a new, not-yet-cancelled token.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signals cancellation to every clone of this token.
    ///
    /// Idempotent: cancelling an already-cancelled token is a no-op beyond
    /// waking any waiters again.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](CancelToken::cancel) has been called on
    /// any clone of this token.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](CancelToken::cancel) is called, or returns
    /// immediately if it already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

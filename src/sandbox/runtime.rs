//! The sandbox primitive: an isolated code-execution context with
//! message-passing RPC back to the host.
//!
//! `SPEC_FULL.md` §4.3.1 describes two real-world transports (a cross-origin
//! iframe using `postMessage`, and a content-script interpreter for
//! extension mode using the extension's message-passing channel). Since this
//! crate runs server/CLI-side rather than inside a browser, both collapse to
//! one [`SandboxTransport`] trait backed by an in-process channel — there is
//! no JS engine here, only the host-side bookkeeping every real transport
//! needs: a console log, an RPC `respond` path, and exactly-once completion.
//!
//! Grounded on the teacher's `stream.rs` `CancelToken` (an `Arc`-shared flag
//! plus a `Notify` waiter) for the completion signal, and on `session/mod.rs`'s
//! append-only bookkeeping style for the console/file accumulation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};

/// One envelope exchanged between host and sandbox, matching the wire shape
/// `{type, sandboxId, ...}` from `SPEC_FULL.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMessage {
    /// Discriminator, e.g. `"console"`, `"execution-complete"`,
    /// `"execution-error"`, `"file-returned"`, `"runtime-request"`,
    /// `"runtime-response"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The sandbox this message belongs to.
    pub sandbox_id: String,
    /// Present on `runtime-request`/`runtime-response` pairs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Everything else the message carries, type-specific.
    #[serde(flatten)]
    pub payload: Value,
}

impl SandboxMessage {
    /// Builds a message with no payload fields beyond `type`/`sandboxId`.
    pub fn new(kind: impl Into<String>, sandbox_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            sandbox_id: sandbox_id.into(),
            message_id: None,
            payload,
        }
    }

    /// Attaches a `messageId`, for `runtime-request`/`runtime-response` pairs.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// One buffered `console.*` call, captured by the console provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// `"log"`, `"warn"`, `"error"`, or `"info"`.
    pub level: String,
    /// The rendered console line.
    pub text: String,
}

impl ConsoleEntry {
    pub fn new(level: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            text: text.into(),
        }
    }
}

/// Everything collected by the time a sandbox completes: its console log,
/// any returned files, and an error message if it failed.
#[derive(Debug, Clone, Default)]
pub struct SandboxOutcome {
    /// Console entries in arrival order.
    pub console: Vec<ConsoleEntry>,
    /// `(name, content)` pairs posted via the downloadable-file provider.
    pub returned_files: Vec<(String, Value)>,
    /// Set when the sandbox reported `execution-error` or the soft timeout
    /// fired; `None` on a clean `execution-complete`.
    pub error: Option<String>,
}

/// The outbound half of one sandbox's transport: delivers a host->sandbox or
/// sandbox->host message. Stands in for `postMessage`/the extension's
/// message-passing channel (`SPEC_FULL.md` §4.3.1).
#[async_trait::async_trait]
pub trait SandboxTransport: Send + Sync {
    /// Delivers `message` across the transport.
    async fn send(&self, message: SandboxMessage);
}

/// The in-process channel every real transport reduces to here: there is no
/// cross-process or cross-origin boundary to cross, only an `mpsc` queue.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<SandboxMessage>,
}

impl ChannelTransport {
    /// Wraps a channel sender as a [`SandboxTransport`].
    pub fn new(tx: mpsc::UnboundedSender<SandboxMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl SandboxTransport for ChannelTransport {
    async fn send(&self, message: SandboxMessage) {
        // A closed receiver means the host side has stopped listening
        // (e.g. the sandbox was unregistered); dropping the message is
        // the correct behavior, not an error.
        let _ = self.tx.send(message);
    }
}

#[derive(Default)]
struct SandboxState {
    console: Vec<ConsoleEntry>,
    returned_files: Vec<(String, Value)>,
    error: Option<String>,
    completed: bool,
}

/// Host-side handle on one sandbox instance, identified by a host-allocated
/// `sandboxId` unique per process (`SPEC_FULL.md` §4.3.1).
///
/// Owns no JS engine: the actual untrusted-code execution is assumed to
/// happen out of process (a real browser iframe or extension content
/// script). What lives here is the contract every transport must honor —
/// buffered console output, exactly-once completion, and a `respond` path
/// for the bidirectional RPC providers use.
#[derive(Clone)]
pub struct Sandbox {
    id: String,
    transport: Arc<dyn SandboxTransport>,
    state: Arc<Mutex<SandboxState>>,
    completed_flag: Arc<AtomicBool>,
    completed_notify: Arc<Notify>,
}

/// How long a sandbox may run before the host synthesizes `execution-complete`
/// on its behalf (`SPEC_FULL.md` §4.3.1 "auto-complete after a short delay").
pub const AUTO_COMPLETE_DELAY: Duration = Duration::from_secs(2);

/// The host's soft ceiling on one sandbox's total execution time
/// (`SPEC_FULL.md` §4.3.1/§5 "sandbox execution has a soft 30 s timeout
/// enforced by the host; expiry synthesizes an execution-error"). Distinct
/// from [`AUTO_COMPLETE_DELAY`]: that one assumes passive code that never
/// calls `complete`; this one is the safety net against code that is still
/// actively running (or stuck) well past a reasonable turnaround.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

impl Sandbox {
    /// Creates a sandbox instance and starts its auto-complete and
    /// execution-timeout timers.
    ///
    /// Per `SPEC_FULL.md` §4.3.2, callers must `register_sandbox` (see
    /// [`crate::sandbox::router`]) *before* constructing the sandbox proper,
    /// so the first message from it is never lost; this constructor only
    /// builds the host-side bookkeeping, it does not itself register
    /// anything with the router.
    pub fn create(id: impl Into<String>, transport: Arc<dyn SandboxTransport>) -> Self {
        let sandbox = Self {
            id: id.into(),
            transport,
            state: Arc::new(Mutex::new(SandboxState::default())),
            completed_flag: Arc::new(AtomicBool::new(false)),
            completed_notify: Arc::new(Notify::new()),
        };
        sandbox.spawn_auto_complete_timer();
        sandbox.spawn_execution_timeout_timer();
        sandbox
    }

    fn spawn_auto_complete_timer(&self) {
        let state = self.state.clone();
        let completed_flag = self.completed_flag.clone();
        let completed_notify = self.completed_notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_COMPLETE_DELAY).await;
            if !completed_flag.swap(true, Ordering::SeqCst) {
                let mut state = state.lock().await;
                state.completed = true;
                drop(state);
                completed_notify.notify_waiters();
            }
        });
    }

    /// The safety net against a sandbox that is still actively running past
    /// `EXECUTION_TIMEOUT`: synthesizes an `execution-error` via the same
    /// idempotent `complete` path a real sandbox message would take.
    fn spawn_execution_timeout_timer(&self) {
        let sandbox = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EXECUTION_TIMEOUT).await;
            if !sandbox.is_completed() {
                log::warn!("sandbox {}: execution timed out after {EXECUTION_TIMEOUT:?}", sandbox.id);
                sandbox.complete(Some("execution timed out".to_string())).await;
            }
        });
    }

    /// The sandbox's unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Appends buffered console entries, as delivered by a `"console"`
    /// message from the sandbox.
    pub async fn extend_console(&self, entries: Vec<ConsoleEntry>) {
        let mut state = self.state.lock().await;
        state.console.extend(entries);
    }

    /// Records one file posted via `returnFile`, as delivered by a
    /// `"file-returned"` message.
    pub async fn record_returned_file(&self, name: String, content: Value) {
        let mut state = self.state.lock().await;
        state.returned_files.push((name, content));
    }

    /// Signals completion, successful or not. Idempotent: per
    /// `SPEC_FULL.md` §9's Open Question decision, a second or later call is
    /// a no-op logged at debug level, not a protocol violation.
    pub async fn complete(&self, error: Option<String>) {
        if self.completed_flag.swap(true, Ordering::SeqCst) {
            log::debug!("sandbox {}: complete() called again, ignoring", self.id);
            return;
        }
        let mut state = self.state.lock().await;
        state.error = error;
        state.completed = true;
        drop(state);
        self.completed_notify.notify_waiters();
    }

    /// Sends a `runtime-response` back across the transport, correlated to
    /// `message_id`. This is the `respond(reply)` callback the router hands
    /// providers (`SPEC_FULL.md` §4.3.2).
    pub async fn respond(&self, message_id: &str, reply: Value) {
        let message = SandboxMessage::new("runtime-response", self.id.clone(), reply)
            .with_message_id(message_id);
        self.transport.send(message).await;
    }

    /// Waits for completion (from an `execution-complete`/`execution-error`
    /// message, or the auto-complete timer) and returns everything collected.
    pub async fn join(&self) -> SandboxOutcome {
        loop {
            {
                let state = self.state.lock().await;
                if state.completed {
                    return SandboxOutcome {
                        console: state.console.clone(),
                        returned_files: state.returned_files.clone(),
                        error: state.error.clone(),
                    };
                }
            }
            self.completed_notify.notified().await;
        }
    }

    /// Returns `true` once [`Sandbox::complete`] (or the auto-complete timer)
    /// has fired.
    pub fn is_completed(&self) -> bool {
        self.completed_flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingTransport {
        tx: mpsc::UnboundedSender<SandboxMessage>,
    }

    #[async_trait::async_trait]
    impl SandboxTransport for RecordingTransport {
        async fn send(&self, message: SandboxMessage) {
            let _ = self.tx.send(message);
        }
    }

    #[tokio::test]
    async fn test_console_entries_accumulate() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::create("sb-1", Arc::new(RecordingTransport { tx }));
        sandbox
            .extend_console(vec![ConsoleEntry::new("log", "hello")])
            .await;
        sandbox
            .extend_console(vec![ConsoleEntry::new("error", "oops")])
            .await;
        sandbox.complete(None).await;
        let outcome = sandbox.join().await;
        assert_eq!(outcome.console.len(), 2);
        assert_eq!(outcome.console[0].text, "hello");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_complete_with_error_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::create("sb-2", Arc::new(RecordingTransport { tx }));
        sandbox.complete(Some("boom".to_string())).await;
        let outcome = sandbox.join().await;
        assert_eq!(outcome.error, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::create("sb-3", Arc::new(RecordingTransport { tx }));
        sandbox.complete(Some("first".to_string())).await;
        sandbox.complete(Some("second".to_string())).await;
        let outcome = sandbox.join().await;
        assert_eq!(outcome.error, Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_respond_sends_runtime_response_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::create("sb-4", Arc::new(RecordingTransport { tx }));
        sandbox
            .respond("msg-1", serde_json::json!({"ok": true}))
            .await;
        let message = rx.recv().await.unwrap();
        assert_eq!(message.kind, "runtime-response");
        assert_eq!(message.sandbox_id, "sb-4");
        assert_eq!(message.message_id, Some("msg-1".to_string()));
        assert_eq!(message.payload["ok"], true);
    }

    #[tokio::test]
    async fn test_record_returned_file() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::create("sb-5", Arc::new(RecordingTransport { tx }));
        sandbox
            .record_returned_file("out.json".to_string(), serde_json::json!({"a": 1}))
            .await;
        sandbox.complete(None).await;
        let outcome = sandbox.join().await;
        assert_eq!(outcome.returned_files.len(), 1);
        assert_eq!(outcome.returned_files[0].0, "out.json");
    }

    #[test]
    fn test_execution_timeout_is_thirty_seconds() {
        assert_eq!(EXECUTION_TIMEOUT, Duration::from_secs(30));
        assert!(EXECUTION_TIMEOUT > AUTO_COMPLETE_DELAY);
    }

    #[tokio::test]
    async fn test_auto_complete_fires_after_delay() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::create("sb-6", Arc::new(RecordingTransport { tx }));
        assert!(!sandbox.is_completed());
        tokio::time::timeout(Duration::from_secs(3), sandbox.join())
            .await
            .expect("auto-complete should fire within the timeout");
        assert!(sandbox.is_completed());
    }
}

//! Runtime providers (`SPEC_FULL.md` §4.3.3): the injected globals and
//! host-side handlers every sandbox gets wired up with.
//!
//! Each provider exposes `getData()`/`getRuntime()` (what's injected into the
//! sandbox before user code runs) and an optional `handleMessage` (the
//! host-side half of the provider's RPC). `getRuntime()` returns `&'static
//! str` rather than a closure: per §4.3.1's `handle_scope` constraint, the
//! injected runtime must never close over host-side values, only communicate
//! through `getData()` and message-passing.
//!
//! Grounded on [`crate::tools::Tool`]'s `{name, description, handler}` shape
//! for the provider/tool-like trait split, and on `crate::hooks`'s
//! `Arc<dyn Fn(..) -> Pin<Box<dyn Future<..>>>>` handler alias for
//! [`RespondFn`].

use crate::error::{Error, Result};
use crate::sandbox::runtime::{ConsoleEntry, Sandbox, SandboxMessage};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The `respond(reply)` callback a provider uses to answer a
/// `runtime-request` with a correlated `runtime-response`.
pub type RespondFn = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One standard injection point + host-side handler for sandbox messages.
///
/// `handle_message` returns `Option<Result<()>>`: `None` means "not my
/// message, I didn't handle it" (the router moves on silently); `Some(Err)`
/// means the provider recognized the message but failed handling it (logged,
/// does not stop other providers from running).
#[async_trait::async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Stable identifier, used in logs.
    fn name(&self) -> &'static str;

    /// JSON-serializable data injected into the sandbox's global scope
    /// before user code runs.
    fn get_data(&self) -> Value;

    /// Source of a `(sandboxId) => void` function, stringified and evaluated
    /// inside the sandbox. Must not reference anything outside its own
    /// text: no closures over host state.
    fn get_runtime(&self) -> &'static str;

    /// Host-side handler for messages the injected runtime sends back.
    async fn handle_message(
        &self,
        sandbox: &Sandbox,
        message: &SandboxMessage,
        respond: RespondFn,
    ) -> Option<Result<()>> {
        let _ = (sandbox, message, respond);
        None
    }
}

/// A passive observer of sandbox messages; never responds, never blocks
/// other consumers.
#[async_trait::async_trait]
pub trait RuntimeConsumer: Send + Sync {
    /// Stable identifier, used in logs.
    fn name(&self) -> &'static str;

    /// Observes one message. Errors are logged, not propagated to the
    /// sandbox or other consumers.
    async fn handle_message(&self, message: &SandboxMessage) -> Result<()>;
}

/// Required on every sandbox (`SPEC_FULL.md` §4.3.3): intercepts
/// `console.*`, buffers entries, and installs the terminal-event handlers
/// (`window.onerror`, `unhandledrejection`, `complete(error?)`).
pub struct ConsoleProvider;

const CONSOLE_RUNTIME_SOURCE: &str = r#"
(function (sandboxId) {
  const buffered = [];
  const wrap = (level) => (...args) => {
    buffered.push({ level, text: args.map(String).join(" ") });
  };
  console.log = wrap("log");
  console.info = wrap("info");
  console.warn = wrap("warn");
  console.error = wrap("error");

  let completed = false;
  const finish = (error) => {
    if (completed) return;
    completed = true;
    window.parent.postMessage({
      type: error ? "execution-error" : "execution-complete",
      sandboxId,
      console: buffered,
      message: error ? String(error.message || error) : undefined,
      stack: error ? String(error.stack || "") : undefined,
    }, "*");
  };

  window.onerror = (message, _source, _line, _col, error) => finish(error || new Error(message));
  window.addEventListener("unhandledrejection", (event) => finish(event.reason));
  window.complete = finish;
})
"#;

#[async_trait::async_trait]
impl RuntimeProvider for ConsoleProvider {
    fn name(&self) -> &'static str {
        "console"
    }

    fn get_data(&self) -> Value {
        json!({})
    }

    fn get_runtime(&self) -> &'static str {
        CONSOLE_RUNTIME_SOURCE
    }

    async fn handle_message(
        &self,
        sandbox: &Sandbox,
        message: &SandboxMessage,
        _respond: RespondFn,
    ) -> Option<Result<()>> {
        match message.kind.as_str() {
            "execution-complete" => {
                let entries = parse_console_entries(&message.payload);
                sandbox.extend_console(entries).await;
                sandbox.complete(None).await;
                Some(Ok(()))
            }
            "execution-error" => {
                let entries = parse_console_entries(&message.payload);
                let error_text = message
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("sandbox execution failed")
                    .to_string();
                sandbox.extend_console(entries).await;
                sandbox.complete(Some(error_text)).await;
                Some(Ok(()))
            }
            _ => None,
        }
    }
}

fn parse_console_entries(payload: &Value) -> Vec<ConsoleEntry> {
    payload
        .get("console")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    ConsoleEntry::new(
                        entry.get("level").and_then(Value::as_str).unwrap_or("log"),
                        entry.get("text").and_then(Value::as_str).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One file attachment available to a sandbox's user code.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64-encoded content; `readTextFile`/`readBinaryFile` decode this
    /// host-side when the sandbox requests it.
    pub content_base64: String,
}

/// Injects `attachments[]` plus `listFiles`/`readTextFile`/`readBinaryFile`
/// into the sandbox (`SPEC_FULL.md` §4.3.3).
pub struct AttachmentsProvider {
    attachments: Vec<Attachment>,
}

impl AttachmentsProvider {
    pub fn new(attachments: Vec<Attachment>) -> Self {
        Self { attachments }
    }
}

const ATTACHMENTS_RUNTIME_SOURCE: &str = r#"
(function (sandboxId) {
  window.listFiles = () => window.__attachments.map((a) => a.name);
  window.readTextFile = (name) => window.__readAttachment(sandboxId, name, "text");
  window.readBinaryFile = (name) => window.__readAttachment(sandboxId, name, "binary");
})
"#;

#[async_trait::async_trait]
impl RuntimeProvider for AttachmentsProvider {
    fn name(&self) -> &'static str {
        "attachments"
    }

    fn get_data(&self) -> Value {
        json!({
            "attachments": self.attachments.iter().map(|a| json!({
                "name": a.name,
                "mimeType": a.mime_type,
            })).collect::<Vec<_>>(),
        })
    }

    fn get_runtime(&self) -> &'static str {
        ATTACHMENTS_RUNTIME_SOURCE
    }

    async fn handle_message(
        &self,
        _sandbox: &Sandbox,
        message: &SandboxMessage,
        respond: RespondFn,
    ) -> Option<Result<()>> {
        if message.kind != "runtime-request" || message.payload.get("method") != Some(&json!("readAttachment")) {
            return None;
        }
        let name = message.payload.get("name").and_then(Value::as_str)?;
        let found = self.attachments.iter().find(|a| a.name == name);
        match found {
            Some(attachment) => {
                respond(json!({
                    "content": attachment.content_base64,
                    "mimeType": attachment.mime_type,
                }))
                .await;
                Some(Ok(()))
            }
            None => {
                respond(json!({"error": format!("no such attachment: {name}")})).await;
                Some(Err(Error::sandbox(format!("unknown attachment {name}"))))
            }
        }
    }
}

/// Injects `returnFile(name, content, mimeType?)`, posting a `file-returned`
/// message the host accumulates for the tool result.
///
/// Per `SPEC_FULL.md` §4.3.3, Blob/typed-array content must carry an
/// explicit `mimeType`; a string payload may omit it (treated as
/// `text/plain`).
pub struct DownloadableFileProvider;

const DOWNLOADABLE_FILE_RUNTIME_SOURCE: &str = r#"
(function (sandboxId) {
  window.returnFile = (name, content, mimeType) => {
    window.parent.postMessage({
      type: "file-returned",
      sandboxId,
      name,
      content,
      mimeType,
      isBinary: content instanceof Blob || content instanceof Uint8Array,
    }, "*");
  };
})
"#;

#[async_trait::async_trait]
impl RuntimeProvider for DownloadableFileProvider {
    fn name(&self) -> &'static str {
        "downloadable-file"
    }

    fn get_data(&self) -> Value {
        json!({})
    }

    fn get_runtime(&self) -> &'static str {
        DOWNLOADABLE_FILE_RUNTIME_SOURCE
    }

    async fn handle_message(
        &self,
        sandbox: &Sandbox,
        message: &SandboxMessage,
        _respond: RespondFn,
    ) -> Option<Result<()>> {
        if message.kind != "file-returned" {
            return None;
        }
        let name = message
            .payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string();
        let is_binary = message
            .payload
            .get("isBinary")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mime_type = message.payload.get("mimeType").and_then(Value::as_str);

        if is_binary && mime_type.is_none() {
            return Some(Err(Error::sandbox(format!(
                "returnFile(\"{name}\") with binary content requires an explicit mimeType"
            ))));
        }

        sandbox
            .record_returned_file(name, message.payload.clone())
            .await;
        Some(Ok(()))
    }
}

/// Host-side storage an [`ArtifactsProvider`] is backed by.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn list(&self) -> Result<Vec<String>>;
    async fn get(&self, name: &str) -> Result<Option<Value>>;
    async fn put(&self, name: &str, content: Value) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// An in-memory [`ArtifactStore`], mainly for tests and demos.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(name).cloned())
    }

    async fn put(&self, name: &str, content: Value) -> Result<()> {
        self.entries.lock().await.insert(name.to_string(), content);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.entries.lock().await.remove(name);
        Ok(())
    }
}

/// Injects `listArtifacts`/`getArtifact`/`createOrUpdateArtifact`/
/// `deleteArtifact`, backed by bidirectional RPC to a host [`ArtifactStore`].
pub struct ArtifactsProvider {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactsProvider {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

const ARTIFACTS_RUNTIME_SOURCE: &str = r#"
(function (sandboxId) {
  const call = (method, args) => window.__sendRuntimeMessage(sandboxId, "artifacts", method, args);
  window.listArtifacts = () => call("list", {});
  window.getArtifact = (name) => call("get", { name });
  window.createOrUpdateArtifact = (name, content) => call("put", { name, content });
  window.deleteArtifact = (name) => call("delete", { name });
})
"#;

#[async_trait::async_trait]
impl RuntimeProvider for ArtifactsProvider {
    fn name(&self) -> &'static str {
        "artifacts"
    }

    fn get_data(&self) -> Value {
        json!({})
    }

    fn get_runtime(&self) -> &'static str {
        ARTIFACTS_RUNTIME_SOURCE
    }

    async fn handle_message(
        &self,
        _sandbox: &Sandbox,
        message: &SandboxMessage,
        respond: RespondFn,
    ) -> Option<Result<()>> {
        if message.kind != "runtime-request" || message.payload.get("provider") != Some(&json!("artifacts")) {
            return None;
        }
        let method = message.payload.get("method").and_then(Value::as_str)?;
        let args = message.payload.get("args").cloned().unwrap_or(json!({}));

        let result = match method {
            "list" => self.store.list().await.map(|names| json!(names)),
            "get" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
                self.store.get(name).await.map(|found| json!(found))
            }
            "put" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
                let content = args.get("content").cloned().unwrap_or(Value::Null);
                self.store.put(name, content).await.map(|_| json!(true))
            }
            "delete" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
                self.store.delete(name).await.map(|_| json!(true))
            }
            other => {
                respond(json!({"error": format!("unknown artifact method {other}")})).await;
                return Some(Err(Error::sandbox(format!("unknown artifact method {other}"))));
            }
        };

        match result {
            Ok(value) => {
                respond(json!({"result": value})).await;
                Some(Ok(()))
            }
            Err(err) => {
                respond(json!({"error": err.to_string()})).await;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::ChannelTransport;
    use tokio::sync::mpsc;

    fn test_sandbox() -> Sandbox {
        let (tx, _rx) = mpsc::unbounded_channel();
        Sandbox::create("sb-test", Arc::new(ChannelTransport::new(tx)))
    }

    #[tokio::test]
    async fn test_console_provider_buffers_on_execution_complete() {
        let provider = ConsoleProvider;
        let sandbox = test_sandbox();
        let respond: RespondFn = Arc::new(|_| Box::pin(async {}));
        let message = SandboxMessage::new(
            "execution-complete",
            "sb-test",
            json!({"console": [{"level": "log", "text": "hi"}]}),
        );
        let result = provider.handle_message(&sandbox, &message, respond).await;
        assert!(matches!(result, Some(Ok(()))));
        let outcome = sandbox.join().await;
        assert_eq!(outcome.console.len(), 1);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_console_provider_records_error() {
        let provider = ConsoleProvider;
        let sandbox = test_sandbox();
        let respond: RespondFn = Arc::new(|_| Box::pin(async {}));
        let message = SandboxMessage::new(
            "execution-error",
            "sb-test",
            json!({"message": "boom", "console": []}),
        );
        provider.handle_message(&sandbox, &message, respond).await;
        let outcome = sandbox.join().await;
        assert_eq!(outcome.error, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_console_provider_ignores_unrelated_messages() {
        let provider = ConsoleProvider;
        let sandbox = test_sandbox();
        let respond: RespondFn = Arc::new(|_| Box::pin(async {}));
        let message = SandboxMessage::new("file-returned", "sb-test", json!({}));
        assert!(
            provider
                .handle_message(&sandbox, &message, respond)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_downloadable_file_requires_mime_type_for_binary() {
        let provider = DownloadableFileProvider;
        let sandbox = test_sandbox();
        let respond: RespondFn = Arc::new(|_| Box::pin(async {}));
        let message = SandboxMessage::new(
            "file-returned",
            "sb-test",
            json!({"name": "out.bin", "content": "zz", "isBinary": true}),
        );
        let result = provider.handle_message(&sandbox, &message, respond).await;
        assert!(matches!(result, Some(Err(_))));
    }

    #[tokio::test]
    async fn test_downloadable_file_accepts_text_without_mime_type() {
        let provider = DownloadableFileProvider;
        let sandbox = test_sandbox();
        let respond: RespondFn = Arc::new(|_| Box::pin(async {}));
        let message = SandboxMessage::new(
            "file-returned",
            "sb-test",
            json!({"name": "out.txt", "content": "hello", "isBinary": false}),
        );
        let result = provider.handle_message(&sandbox, &message, respond).await;
        assert!(matches!(result, Some(Ok(()))));
        sandbox.complete(None).await;
        let outcome = sandbox.join().await;
        assert_eq!(outcome.returned_files.len(), 1);
        assert_eq!(outcome.returned_files[0].0, "out.txt");
    }

    #[tokio::test]
    async fn test_artifacts_provider_put_then_get() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let provider = ArtifactsProvider::new(store.clone());
        let sandbox = test_sandbox();

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let respond: RespondFn = Arc::new(move |reply| {
            let reply_tx = reply_tx.clone();
            Box::pin(async move {
                let _ = reply_tx.send(reply);
            })
        });

        let put_message = SandboxMessage::new(
            "runtime-request",
            "sb-test",
            json!({"provider": "artifacts", "method": "put", "args": {"name": "a", "content": {"v": 1}}}),
        );
        provider
            .handle_message(&sandbox, &put_message, respond.clone())
            .await;
        let put_reply = reply_rx.recv().await.unwrap();
        assert_eq!(put_reply["result"], true);

        assert_eq!(
            store.get("a").await.unwrap(),
            Some(json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn test_attachments_provider_rejects_unknown_attachment() {
        let provider = AttachmentsProvider::new(vec![Attachment {
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            content_base64: "aGk=".into(),
        }]);
        let sandbox = test_sandbox();
        let respond: RespondFn = Arc::new(|_| Box::pin(async {}));
        let message = SandboxMessage::new(
            "runtime-request",
            "sb-test",
            json!({"method": "readAttachment", "name": "missing.txt"}),
        );
        let result = provider.handle_message(&sandbox, &message, respond).await;
        assert!(matches!(result, Some(Err(_))));
    }
}

//! Process-wide Runtime Message Router (`SPEC_FULL.md` §4.3.2): the single
//! listener that fans inbound sandbox messages out to providers (which may
//! `respond`) and consumers (which only observe).
//!
//! Grounded on [`crate::registry::ModelRegistry`]'s "singleton, mutable only
//! via register/unregister" shape, generalized to a per-sandbox entry table
//! guarded by its own lock rather than one global lock, since routing must
//! serialize per-sandbox (arrival order) without serializing across sandboxes
//! (`SPEC_FULL.md` §5).

use crate::sandbox::providers::{RespondFn, RuntimeConsumer, RuntimeProvider};
use crate::sandbox::runtime::{Sandbox, SandboxMessage};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

struct SandboxEntry {
    /// `None` between `register_sandbox` and `set_sandbox`: the window in
    /// which `registerSandbox` has run but the sandbox instance (and its
    /// outbound transport) hasn't been constructed yet.
    sandbox: Option<Arc<Sandbox>>,
    providers: Vec<Arc<dyn RuntimeProvider>>,
    consumers: Vec<Arc<dyn RuntimeConsumer>>,
    /// Serializes routing for this sandbox so messages from one sandbox are
    /// handled in arrival order; unrelated sandboxes never contend on this.
    order_lock: Arc<Mutex<()>>,
}

/// The router's table of registered sandboxes.
pub struct RuntimeMessageRouter {
    entries: Mutex<HashMap<String, SandboxEntry>>,
}

impl RuntimeMessageRouter {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn global() -> &'static RuntimeMessageRouter {
        static ROUTER: OnceLock<RuntimeMessageRouter> = OnceLock::new();
        ROUTER.get_or_init(RuntimeMessageRouter::new)
    }

    /// Registers a sandbox's provider/consumer set. Must be called before
    /// the sandbox is constructed (`SPEC_FULL.md` §4.3.2), so the first
    /// message it sends is never lost.
    async fn register_sandbox(
        &self,
        id: String,
        providers: Vec<Arc<dyn RuntimeProvider>>,
        consumers: Vec<Arc<dyn RuntimeConsumer>>,
    ) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            id,
            SandboxEntry {
                sandbox: None,
                providers,
                consumers,
                order_lock: Arc::new(Mutex::new(())),
            },
        );
    }

    /// Attaches the sandbox instance itself (and its outbound transport) once
    /// constructed.
    async fn set_sandbox(&self, id: &str, sandbox: Arc<Sandbox>) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.sandbox = Some(sandbox);
        }
    }

    async fn unregister_sandbox(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(id);
    }

    async fn add_consumer(&self, id: &str, consumer: Arc<dyn RuntimeConsumer>) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.consumers.push(consumer);
        }
    }

    async fn remove_consumer(&self, id: &str, name: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.consumers.retain(|c| c.name() != name);
        }
    }

    /// Routes one inbound message: providers first (in registration order,
    /// each may `respond`), then consumers (broadcast, none consumes).
    /// A handler's failure is logged and does not block the rest
    /// (`SPEC_FULL.md` §4.3.2).
    async fn route(&self, message: SandboxMessage) {
        let (sandbox, providers, consumers, order_lock) = {
            let entries = self.entries.lock().await;
            match entries.get(&message.sandbox_id) {
                Some(entry) => (
                    entry.sandbox.clone(),
                    entry.providers.clone(),
                    entry.consumers.clone(),
                    entry.order_lock.clone(),
                ),
                None => {
                    log::debug!(
                        "runtime router: dropping message for unknown sandbox {}",
                        message.sandbox_id
                    );
                    return;
                }
            }
        };

        // Serializes per-sandbox so arrival order is preserved; two different
        // sandboxes route concurrently against each other.
        let _permit = order_lock.lock().await;

        let respond: RespondFn = {
            let sandbox = sandbox.clone();
            let message_id = message.message_id.clone();
            Arc::new(move |reply: serde_json::Value| {
                let sandbox = sandbox.clone();
                let message_id = message_id.clone();
                Box::pin(async move {
                    match (sandbox, message_id) {
                        (Some(sandbox), Some(id)) => sandbox.respond(&id, reply).await,
                        (None, _) => log::debug!(
                            "runtime router: respond() called before the sandbox transport was attached"
                        ),
                        (_, None) => log::debug!(
                            "runtime router: respond() called on a message with no messageId"
                        ),
                    }
                })
            })
        };

        let Some(sandbox) = sandbox else {
            log::debug!(
                "runtime router: sandbox {} not yet attached, dropping message",
                message.sandbox_id
            );
            return;
        };

        for provider in &providers {
            if let Some(result) = provider
                .handle_message(&sandbox, &message, respond.clone())
                .await
            {
                if let Err(err) = result {
                    log::warn!(
                        "runtime router: provider {} failed on sandbox {}: {err}",
                        provider.name(),
                        message.sandbox_id
                    );
                }
            }
        }

        for consumer in &consumers {
            if let Err(err) = consumer.handle_message(&message).await {
                log::warn!(
                    "runtime router: consumer {} failed on sandbox {}: {err}",
                    consumer.name(),
                    message.sandbox_id
                );
            }
        }
    }
}

/// Registers a sandbox's provider/consumer set with the process-wide router.
/// Call before constructing the [`Sandbox`] itself.
pub async fn register_sandbox(
    id: impl Into<String>,
    providers: Vec<Arc<dyn RuntimeProvider>>,
    consumers: Vec<Arc<dyn RuntimeConsumer>>,
) {
    RuntimeMessageRouter::global()
        .register_sandbox(id.into(), providers, consumers)
        .await;
}

/// Attaches the constructed sandbox (and its outbound transport) so
/// `respond()` has somewhere to deliver replies.
pub async fn set_sandbox_transport(id: &str, sandbox: Arc<Sandbox>) {
    RuntimeMessageRouter::global().set_sandbox(id, sandbox).await;
}

/// Removes a sandbox's routing entry.
pub async fn unregister_sandbox(id: &str) {
    RuntimeMessageRouter::global().unregister_sandbox(id).await;
}

/// Subscribes a consumer to an already-registered sandbox.
pub async fn add_consumer(id: &str, consumer: Arc<dyn RuntimeConsumer>) {
    RuntimeMessageRouter::global().add_consumer(id, consumer).await;
}

/// Unsubscribes a consumer by name.
pub async fn remove_consumer(id: &str, name: &str) {
    RuntimeMessageRouter::global().remove_consumer(id, name).await;
}

/// Routes one inbound sandbox->host message through the process-wide router.
pub async fn route(message: SandboxMessage) {
    RuntimeMessageRouter::global().route(message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::providers::RuntimeProvider;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    struct OrderRecordingProvider {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl RuntimeProvider for OrderRecordingProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn get_data(&self) -> Value {
            json!({})
        }
        fn get_runtime(&self) -> &'static str {
            ""
        }
        async fn handle_message(
            &self,
            _sandbox: &Sandbox,
            _message: &SandboxMessage,
            _respond: RespondFn,
        ) -> Option<crate::Result<()>> {
            self.order.lock().await.push(self.name);
            Some(Ok(()))
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl RuntimeProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn get_data(&self) -> Value {
            json!({})
        }
        fn get_runtime(&self) -> &'static str {
            ""
        }
        async fn handle_message(
            &self,
            _sandbox: &Sandbox,
            _message: &SandboxMessage,
            _respond: RespondFn,
        ) -> Option<crate::Result<()>> {
            Some(Err(crate::Error::sandbox("provider exploded")))
        }
    }

    #[tokio::test]
    async fn test_unknown_sandbox_id_is_dropped() {
        // No registration occurred; routing must not panic.
        route(SandboxMessage::new(
            "console",
            "nonexistent-sandbox",
            json!({}),
        ))
        .await;
    }

    #[tokio::test]
    async fn test_providers_invoked_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let id = "router-order-test";
        register_sandbox(
            id,
            vec![
                Arc::new(OrderRecordingProvider {
                    name: "first",
                    order: order.clone(),
                }),
                Arc::new(OrderRecordingProvider {
                    name: "second",
                    order: order.clone(),
                }),
            ],
            vec![],
        )
        .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Arc::new(Sandbox::create(
            id,
            Arc::new(crate::sandbox::runtime::ChannelTransport::new(tx)),
        ));
        set_sandbox_transport(id, sandbox).await;

        route(SandboxMessage::new("console", id, json!({}))).await;

        assert_eq!(*order.lock().await, vec!["first", "second"]);
        unregister_sandbox(id).await;
    }

    #[tokio::test]
    async fn test_failing_provider_does_not_block_others() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let id = "router-failure-test";
        register_sandbox(
            id,
            vec![
                Arc::new(FailingProvider),
                Arc::new(OrderRecordingProvider {
                    name: "after-failure",
                    order: order.clone(),
                }),
            ],
            vec![],
        )
        .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let sandbox = Arc::new(Sandbox::create(
            id,
            Arc::new(crate::sandbox::runtime::ChannelTransport::new(tx)),
        ));
        set_sandbox_transport(id, sandbox).await;

        route(SandboxMessage::new("console", id, json!({}))).await;

        assert_eq!(*order.lock().await, vec!["after-failure"]);
        unregister_sandbox(id).await;
    }

    #[tokio::test]
    async fn test_respond_delivers_runtime_response_on_transport() {
        let id = "router-respond-test";
        register_sandbox(id, vec![Arc::new(EchoProvider)], vec![]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sandbox = Arc::new(Sandbox::create(
            id,
            Arc::new(crate::sandbox::runtime::ChannelTransport::new(tx)),
        ));
        set_sandbox_transport(id, sandbox).await;

        route(
            SandboxMessage::new("runtime-request", id, json!({"method": "ping"}))
                .with_message_id("req-1"),
        )
        .await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "runtime-response");
        assert_eq!(reply.message_id, Some("req-1".to_string()));
        unregister_sandbox(id).await;
    }

    struct EchoProvider;

    #[async_trait::async_trait]
    impl RuntimeProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn get_data(&self) -> Value {
            json!({})
        }
        fn get_runtime(&self) -> &'static str {
            ""
        }
        async fn handle_message(
            &self,
            _sandbox: &Sandbox,
            message: &SandboxMessage,
            respond: RespondFn,
        ) -> Option<crate::Result<()>> {
            respond(json!({"echo": message.payload.clone()})).await;
            Some(Ok(()))
        }
    }
}

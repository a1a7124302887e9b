//! Sandboxed Code-Generation Agent Demo
//!
//! Demonstrates the Sandbox Runtime & Message Router (`SPEC_FULL.md` §4.3) by
//! wiring a `run_javascript` tool backed by a sandbox with the four standard
//! runtime providers (console, attachments, downloadable files, artifacts)
//! and routing simulated sandbox->host messages through the process-wide
//! router exactly as a real iframe/extension transport would.
//!
//! There is no embedded JS engine here (`src/sandbox/runtime.rs` explains
//! why), so this demo plays the part of "the sandbox" itself: it constructs
//! the message envelopes a real sandbox bootstrap would send and feeds them
//! through `open_agent::sandbox::route`, then shows the host side collecting
//! console output, a returned file, and an artifact write via the
//! bidirectional RPC path.
//!
//! This demo does not require a running model endpoint; it only exercises
//! the sandbox/router/provider stack.
//!
//! Usage:
//!   cargo run --example sandboxed_codegen_agent

use open_agent::sandbox::{
    ArtifactsProvider, Attachment, AttachmentsProvider, ChannelTransport, ConsoleProvider,
    DownloadableFileProvider, InMemoryArtifactStore, Sandbox, SandboxMessage, add_consumer,
    register_sandbox, route, set_sandbox_transport, unregister_sandbox,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(70));
    println!("Sandboxed Code-Generation Agent Demo");
    println!("{}", "=".repeat(70));
    println!();

    // 1. Build the providers this sandbox gets wired up with. A real host
    //    would inject each provider's get_data()/get_runtime() into the
    //    iframe's srcdoc bootstrap before the model-generated HTML/JS runs.
    let artifact_store = Arc::new(InMemoryArtifactStore::new());
    let providers: Vec<Arc<dyn open_agent::sandbox::RuntimeProvider>> = vec![
        Arc::new(ConsoleProvider),
        Arc::new(AttachmentsProvider::new(vec![Attachment {
            name: "input.csv".to_string(),
            mime_type: "text/csv".to_string(),
            content_base64: base64_encode("a,b\n1,2\n"),
        }])),
        Arc::new(DownloadableFileProvider),
        Arc::new(ArtifactsProvider::new(artifact_store.clone())),
    ];

    let sandbox_id = "sb-demo-1";

    // 2. Register before the sandbox exists, so the first message it sends
    //    is never lost (SPEC_FULL.md §4.3.2).
    register_sandbox(sandbox_id, providers, Vec::new()).await;

    // A consumer just observes traffic, e.g. for a transcript/audit log.
    add_consumer(sandbox_id, Arc::new(TranscriptConsumer)).await;

    // 3. Construct the sandbox and attach its outbound transport. In a
    //    browser this would be the iframe's postMessage channel; here it's
    //    an in-process channel standing in for it.
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let sandbox = Arc::new(Sandbox::create(sandbox_id, Arc::new(ChannelTransport::new(tx))));
    set_sandbox_transport(sandbox_id, sandbox.clone()).await;

    // Drain the sandbox's outbound channel (runtime-response replies) on a
    // background task, printing each one as the "code" would receive it.
    let drain = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            println!("  <- sandbox received: {} {:?}", message.kind, message.payload);
        }
    });

    println!("Model-generated code requests an artifact write...");
    route(SandboxMessage::new(
        "runtime-request",
        sandbox_id,
        json!({
            "provider": "artifacts",
            "method": "put",
            "args": {"name": "summary.json", "content": {"rows": 1}},
        }),
    ))
    .await;

    println!("Model-generated code returns a downloadable file...");
    route(SandboxMessage::new(
        "file-returned",
        sandbox_id,
        json!({"name": "report.txt", "content": "done", "mimeType": "text/plain", "isBinary": false}),
    ))
    .await;

    println!("Model-generated code finishes and calls complete()...");
    route(SandboxMessage::new(
        "execution-complete",
        sandbox_id,
        json!({"console": [{"level": "log", "text": "wrote summary.json"}]}),
    ))
    .await;

    // 4. Wait for completion the same way a tool handler would before
    //    returning a ToolResult to the agent loop.
    let outcome = sandbox.join().await;
    unregister_sandbox(sandbox_id).await;
    drop(sandbox);
    let _ = drain.await;

    println!();
    println!("Sandbox outcome:");
    println!("  console entries: {}", outcome.console.len());
    for entry in &outcome.console {
        println!("    [{}] {}", entry.level, entry.text);
    }
    println!("  returned files: {}", outcome.returned_files.len());
    for (name, _) in &outcome.returned_files {
        println!("    {name}");
    }
    println!("  error: {:?}", outcome.error);

    let artifact = artifact_store.get("summary.json").await?;
    println!("  artifact store now holds summary.json: {artifact:?}");

    Ok(())
}

/// A minimal [`open_agent::sandbox::RuntimeConsumer`] that just prints
/// every message it observes, standing in for an audit-log consumer that
/// outlives any single sandbox.
struct TranscriptConsumer;

#[async_trait::async_trait]
impl open_agent::sandbox::RuntimeConsumer for TranscriptConsumer {
    fn name(&self) -> &'static str {
        "transcript"
    }

    async fn handle_message(&self, message: &SandboxMessage) -> open_agent::Result<()> {
        println!("  [transcript] {} {:?}", message.kind, message.payload);
        Ok(())
    }
}

fn base64_encode(input: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(input.as_bytes())
}

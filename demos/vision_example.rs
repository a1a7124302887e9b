//! Vision-capable turn via the Provider Adapter abstraction.
//!
//! `Client`/`query()` are the legacy single-provider, text-only entry point
//! (see `simple_query.rs`); sending [`ContentBlock::Image`] content requires
//! the [`open_agent::adapters::ProviderAdapter`] seam this demo drives
//! directly, the same one the Agent Loop resolves a model's adapter through.
//!
//! Run this example against a local vision-capable model:
//! ```bash
//! cargo run --example vision_example
//! ```

use futures::StreamExt;
use open_agent::adapters::{AdapterOptions, ProviderRegistry};
use open_agent::{
    CancelToken, ContentBlock, Context, Event, ImageBlock, ImageDetail, MediaKind, Message,
    MessageRole, Model, ModelCost, TextBlock,
};

async fn ask(
    registry: &ProviderRegistry,
    model: &Model,
    messages: Vec<Message>,
) -> open_agent::Result<()> {
    let adapter = registry.get(&model.api)?;

    let context = Context {
        system_prompt: None,
        messages,
        tools: Vec::new(),
    };
    let options = AdapterOptions {
        base_url: model.base_url.clone().unwrap_or_default(),
        ..AdapterOptions::default()
    };

    let mut stream = adapter
        .stream(model, context, &options, CancelToken::new())
        .await?;

    println!("Response:");
    while let Some(event) = stream.next().await {
        match event {
            Event::TextDelta { delta } => print!("{delta}"),
            Event::Done { .. } => println!(),
            Event::Error { error, .. } => {
                println!(
                    "\n[error: {}]",
                    error.error_message.as_deref().unwrap_or("unknown")
                );
            }
            _ => {}
        }
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Llava/bakllava on Ollama speak the OpenAI-compatible chat endpoint.
    let model = Model {
        id: "llava".to_string(),
        name: "llava".to_string(),
        provider: "ollama".to_string(),
        api: "openai-compatible".to_string(),
        base_url: Some("http://localhost:11434/v1".to_string()),
        reasoning: false,
        input: vec![MediaKind::Image],
        cost: ModelCost {
            input: 0.0,
            output: 0.0,
            cache_read: 0.0,
            cache_write: 0.0,
        },
        context_window: 4096,
        max_tokens: 1024,
    };

    let registry = ProviderRegistry::with_default_adapters();

    println!("=== Example 1: Simple Image Query ===\n");
    let msg = Message::user_with_image(
        "What's in this image? Describe it in detail.",
        "https://upload.wikimedia.org/wikipedia/commons/thumb/3/3a/Cat03.jpg/1200px-Cat03.jpg",
    )?;
    ask(&registry, &model, vec![msg]).await?;

    println!("=== Example 2: Image with High Detail ===\n");
    let msg = Message::user_with_image_detail(
        "Analyze this diagram in detail, focusing on the architecture.",
        "https://upload.wikimedia.org/wikipedia/commons/thumb/1/1f/Three_layer_neural_network-en.svg/1200px-Three_layer_neural_network-en.svg.png",
        ImageDetail::High,
    )?;
    ask(&registry, &model, vec![msg]).await?;

    println!("=== Example 3: Base64 Image ===\n");
    let base64_data = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8DwHwAFBQIAX8jx0gAAAABJRU5ErkJggg==";
    let msg = Message::user_with_base64_image("What color is this pixel?", base64_data, "image/png")?;
    ask(&registry, &model, vec![msg]).await?;

    println!("=== Example 4: Multiple Images (Custom Blocks) ===\n");
    let image1 = ImageBlock::from_url(
        "https://upload.wikimedia.org/wikipedia/commons/thumb/3/3a/Cat03.jpg/400px-Cat03.jpg",
    )?;
    let image2 = ImageBlock::from_url(
        "https://upload.wikimedia.org/wikipedia/commons/thumb/4/4d/Cat_November_2010-1a.jpg/400px-Cat_November_2010-1a.jpg",
    )?;
    let msg = Message::new(
        MessageRole::User,
        vec![
            ContentBlock::Text(TextBlock::new(
                "Compare these two images. What are the similarities and differences?",
            )),
            ContentBlock::Image(image1),
            ContentBlock::Image(image2),
        ],
    );
    ask(&registry, &model, vec![msg]).await?;

    Ok(())
}

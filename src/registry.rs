//! Process-wide catalog of callable [`Model`]s.
//!
//! Mirrors the shape of [`crate::adapters::ProviderRegistry`]: a simple
//! `provider -> {modelId -> Model}` map, mutable only through
//! [`ModelRegistry::register`], initialized at startup from a small static
//! catalog and extendable at runtime (e.g. an extension registering a model
//! for a provider it knows how to talk to).

use crate::types::{MediaKind, Model, ModelCost};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// A thread-safe `provider -> {modelId -> Model}` catalog.
pub struct ModelRegistry {
    models: RwLock<HashMap<String, HashMap<String, Model>>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry pre-populated with a small built-in catalog
    /// covering the local-LLM providers [`crate::config::Provider`] already
    /// knows about, plus one hosted OpenAI-shaped and one Anthropic-shaped
    /// entry so both built-in adapters have at least one registered model.
    pub fn with_default_catalog() -> Self {
        let registry = Self::new();
        for model in default_catalog() {
            // Safe to discard: the built-in catalog never collides with itself.
            let _ = registry.register(model);
        }
        registry
    }

    /// Registers a model, overwriting any existing entry with the same
    /// `(provider, id)`. This is the only mutating operation on the registry.
    pub fn register(&self, model: Model) -> Result<()> {
        let mut models = self
            .models
            .write()
            .map_err(|_| Error::other("model registry lock poisoned"))?;
        models
            .entry(model.provider.clone())
            .or_default()
            .insert(model.id.clone(), model);
        Ok(())
    }

    /// Looks up a model by provider and id.
    pub fn get(&self, provider: &str, model_id: &str) -> Result<Option<Model>> {
        let models = self
            .models
            .read()
            .map_err(|_| Error::other("model registry lock poisoned"))?;
        Ok(models.get(provider).and_then(|m| m.get(model_id)).cloned())
    }

    /// Lists every registered model across all providers.
    pub fn list(&self) -> Result<Vec<Model>> {
        let models = self
            .models
            .read()
            .map_err(|_| Error::other("model registry lock poisoned"))?;
        Ok(models.values().flat_map(|m| m.values().cloned()).collect())
    }

    /// Lists the distinct provider names that have at least one registered
    /// model.
    pub fn get_providers(&self) -> Result<Vec<String>> {
        let models = self
            .models
            .read()
            .map_err(|_| Error::other("model registry lock poisoned"))?;
        Ok(models.keys().cloned().collect())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_catalog() -> Vec<Model> {
    vec![
        Model {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            api: "openai-compatible".into(),
            base_url: None,
            reasoning: false,
            input: vec![MediaKind::Image],
            cost: ModelCost {
                input: 2.5,
                output: 10.0,
                cache_read: 1.25,
                cache_write: 0.0,
            },
            context_window: 128_000,
            max_tokens: 16_384,
        },
        Model {
            id: "claude-sonnet-4-5".into(),
            name: "Claude Sonnet 4.5".into(),
            provider: "anthropic".into(),
            api: "anthropic".into(),
            base_url: None,
            reasoning: true,
            input: vec![MediaKind::Image],
            cost: ModelCost {
                input: 3.0,
                output: 15.0,
                cache_read: 0.3,
                cache_write: 3.75,
            },
            context_window: 200_000,
            max_tokens: 8_192,
        },
        Model {
            id: "qwen2.5-32b-instruct".into(),
            name: "Qwen2.5 32B Instruct".into(),
            provider: "lmstudio".into(),
            api: "openai-compatible".into(),
            base_url: Some("http://localhost:1234/v1".into()),
            reasoning: false,
            input: vec![],
            cost: ModelCost::default(),
            context_window: 32_768,
            max_tokens: 4_096,
        },
    ]
}

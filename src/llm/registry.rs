use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, ProviderKind};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::provider::ModelProvider;
use crate::llm::providers::ollama::OllamaProvider;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;

/// Registry of all available model providers, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    active: String,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self {
            providers: HashMap::new(),
            active,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get_active(&self) -> DeskPilotResult<Arc<dyn ModelProvider>> {
        self.providers.get(&self.active).cloned().ok_or_else(|| {
            DeskPilotError::Config(format!(
                "Active provider '{}' not found in registry",
                self.active
            ))
        })
    }

    pub fn set_active(&mut self, name: String) -> DeskPilotResult<()> {
        if self.providers.contains_key(&name) {
            self.active = name;
            Ok(())
        } else {
            Err(DeskPilotError::Config(format!("Provider '{name}' not registered")))
        }
    }

    pub fn list_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from environment variables named `DESKPILOT_<ID>_API_KEY`,
    /// falling back to the key stored in config.toml.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new(config.llm.active_provider.clone());
        for (id, entry) in &config.llm.providers {
            let provider: Arc<dyn ModelProvider> = match entry.kind {
                ProviderKind::Ollama => {
                    Arc::new(OllamaProvider::new(id.clone(), entry.api_base.clone()))
                }
                ProviderKind::OpenaiCompatible => {
                    let api_key = std::env::var(format!("DESKPILOT_{}_API_KEY", id.to_uppercase()))
                        .unwrap_or_else(|_| entry.api_key.clone().unwrap_or_default());
                    Arc::new(OpenAiCompatibleProvider::new(
                        id.clone(),
                        entry.api_base.clone(),
                        api_key,
                    ))
                }
            };
            registry.register(provider);
        }
        registry
    }
}

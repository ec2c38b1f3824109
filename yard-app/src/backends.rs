//! Builds real backend handles for the router.

use crate::config::KeysConfig;
use crate::failover::BackendFactory;
use std::sync::Arc;
use yard_llm::{ChatBackend, LlmClient, LlmError};

pub struct LlmBackendFactory {
    keys: KeysConfig,
}

impl LlmBackendFactory {
    pub fn new(keys: KeysConfig) -> Self {
        Self { keys }
    }
}

impl BackendFactory for LlmBackendFactory {
    fn build(&self, model: &str) -> yard_llm::Result<Arc<dyn ChatBackend>> {
        let Some(api_key) = self.keys.for_model(model) else {
            return Err(LlmError::Config(format!("no api key configured for {model}")));
        };
        let client =
            LlmClient::new(api_key, model)?.with_base_url(self.keys.openai_base_url.clone());
        tracing::debug!(model, provider = client.provider().as_str(), "backend handle built");
        Ok(Arc::new(client))
    }
}

//! Name-keyed provider registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::traits::ModelProvider;

/// Registry of model providers, with an optional default.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ModelProvider>>>,
    default_id: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; the first registration becomes the default.
    pub fn register(&self, provider: Arc<dyn ModelProvider>) {
        let id = provider.provider_id().to_string();
        let mut default_id = self.default_id.write();
        if default_id.is_none() {
            *default_id = Some(id.clone());
        }
        self.providers.write().insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.read().get(id).cloned()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn ModelProvider>> {
        let id = self.default_id.read().clone()?;
        self.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

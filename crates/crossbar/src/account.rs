use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::context::Context;
use crate::error::GatewayError;
use crate::keys::Key;
use crate::requests::ProviderId;

/// Source of provider configuration and credentials. The gateway consults it
/// for lazy provider initialization and on every key selection, so
/// implementations should answer from memory.
#[async_trait]
pub trait Account: Send + Sync {
    fn configured_providers(&self) -> Vec<ProviderId>;

    fn config_for(&self, provider: &ProviderId) -> Option<ProviderConfig>;

    async fn keys_for(
        &self,
        ctx: &Context,
        provider: &ProviderId,
    ) -> Result<Vec<Key>, Box<GatewayError>>;
}

/// In-memory account backed by maps. Suitable for static configuration and
/// tests; providers and keys can be updated at runtime.
#[derive(Default)]
pub struct StaticAccount {
    providers: RwLock<HashMap<ProviderId, ProviderConfig>>,
    keys: RwLock<HashMap<ProviderId, Vec<Key>>>,
}

impl StaticAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(self, provider: ProviderId, config: ProviderConfig) -> Self {
        self.set_provider(provider, config);
        self
    }

    pub fn with_keys(self, provider: ProviderId, keys: Vec<Key>) -> Self {
        self.set_keys(provider, keys);
        self
    }

    pub fn set_provider(&self, provider: ProviderId, config: ProviderConfig) {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(provider, config);
    }

    pub fn remove_provider(&self, provider: &ProviderId) {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(provider);
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(provider);
    }

    pub fn set_keys(&self, provider: ProviderId, keys: Vec<Key>) {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(provider, keys);
    }
}

#[async_trait]
impl Account for StaticAccount {
    fn configured_providers(&self) -> Vec<ProviderId> {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn config_for(&self, provider: &ProviderId) -> Option<ProviderConfig> {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(provider)
            .cloned()
    }

    async fn keys_for(
        &self,
        _ctx: &Context,
        provider: &ProviderId,
    ) -> Result<Vec<Key>, Box<GatewayError>> {
        Ok(self
            .keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(provider)
            .cloned()
            .unwrap_or_default())
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::Account;
use crate::context::Context;
use crate::error::GatewayError;
use crate::requests::{ProviderId, RequestKind};

/// Model-to-deployment mappings for providers that address models through
/// named deployments rather than model ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTables {
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub azure: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub bedrock: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub vertex: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub replicate: HashMap<String, String>,
}

impl DeploymentTables {
    pub fn for_provider(&self, provider: &ProviderId) -> Option<&HashMap<String, String>> {
        match provider {
            ProviderId::Azure => Some(&self.azure),
            ProviderId::Bedrock => Some(&self.bedrock),
            ProviderId::Vertex => Some(&self.vertex),
            ProviderId::Replicate => Some(&self.replicate),
            _ => None,
        }
    }
}

/// One credential for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub name: String,
    /// Relative share of traffic under weighted-random selection.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Models this key may serve; empty means all.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub models: Vec<String>,
    /// Whether this key may be used for batch and file APIs.
    #[serde(default)]
    pub batch_eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(default)]
    pub deployments: DeploymentTables,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Key {
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Key {
            id: id.into(),
            name: name.into(),
            weight: 1.0,
            enabled: true,
            models: Vec::new(),
            batch_eligible: false,
            value: Some(value.into()),
            deployments: DeploymentTables::default(),
        }
    }

    /// A placeholder credential for providers that permit keyless calls.
    pub fn empty() -> Self {
        Key {
            id: String::new(),
            name: String::new(),
            weight: 0.0,
            enabled: true,
            models: Vec::new(),
            batch_eligible: false,
            value: None,
            deployments: DeploymentTables::default(),
        }
    }

    fn has_usable_value(&self, provider: &ProviderId) -> bool {
        self.value.as_deref().is_some_and(|v| !v.is_empty())
            || provider.allows_empty_key()
            || provider.has_ambient_credentials()
    }

    fn serves_model(&self, provider: &ProviderId, model: &str) -> bool {
        if !self.models.is_empty() && !self.models.iter().any(|m| m == model) {
            return false;
        }
        if provider.is_deployment_scoped() {
            if let Some(table) = self.deployments.for_provider(provider) {
                if !table.is_empty() && !table.contains_key(model) {
                    return false;
                }
            }
        }
        true
    }
}

/// Picks the index of the winning key among two or more candidates.
pub type SelectorFn = dyn Fn(&[Key]) -> usize + Send + Sync;

/// Credential selection policy for one call.
pub struct KeySelector {
    chooser: Box<SelectorFn>,
}

impl Default for KeySelector {
    fn default() -> Self {
        KeySelector {
            chooser: Box::new(weighted_random),
        }
    }
}

impl KeySelector {
    pub fn with_chooser(chooser: impl Fn(&[Key]) -> usize + Send + Sync + 'static) -> Self {
        KeySelector {
            chooser: Box::new(chooser),
        }
    }

    /// Selects one credential for a single-key operation.
    pub async fn select(
        &self,
        ctx: &Context,
        account: &dyn Account,
        kind: RequestKind,
        provider: &ProviderId,
        model: &str,
        base_provider: &ProviderId,
    ) -> Result<Key, Box<GatewayError>> {
        if let Some(key) = ctx.pinned_key() {
            return Ok(key);
        }
        if ctx.skip_key_selection() && base_provider.allows_empty_key() {
            return Ok(Key::empty());
        }

        let candidates = self
            .supported_keys(ctx, account, kind, provider, base_provider, Some(model))
            .await?;

        if let Some(wanted) = ctx.key_name() {
            return candidates
                .into_iter()
                .find(|k| k.name == wanted)
                .ok_or_else(|| {
                    GatewayError::not_configured(format!(
                        "no key found with name {wanted} for provider {provider}"
                    ))
                    .boxed()
                });
        }

        let mut candidates = candidates;
        if candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }
        let index = (self.chooser)(&candidates).min(candidates.len() - 1);
        debug!(provider = %provider, key = %candidates[index].name, "selected key");
        Ok(candidates.swap_remove(index))
    }

    /// Every eligible credential, for multi-key aggregator operations.
    pub async fn select_all(
        &self,
        ctx: &Context,
        account: &dyn Account,
        kind: RequestKind,
        provider: &ProviderId,
        base_provider: &ProviderId,
    ) -> Result<Vec<Key>, Box<GatewayError>> {
        self.supported_keys(ctx, account, kind, provider, base_provider, None)
            .await
    }

    async fn supported_keys(
        &self,
        ctx: &Context,
        account: &dyn Account,
        kind: RequestKind,
        provider: &ProviderId,
        base_provider: &ProviderId,
        model: Option<&str>,
    ) -> Result<Vec<Key>, Box<GatewayError>> {
        let keys = account.keys_for(ctx, provider).await?;
        if keys.is_empty() {
            return Err(
                GatewayError::not_configured(format!("no keys found for provider {provider}"))
                    .boxed(),
            );
        }

        let batch_gated = kind.requires_batch_keys();
        let mut candidates: Vec<Key> = keys
            .into_iter()
            .filter(|k| k.enabled && k.has_usable_value(base_provider))
            .filter(|k| !batch_gated || k.batch_eligible)
            .collect();

        if candidates.is_empty() {
            return Err(if batch_gated {
                GatewayError::not_configured(format!(
                    "no batch-enabled keys for provider {provider}"
                ))
                .boxed()
            } else {
                GatewayError::not_configured(format!("no valid keys for provider {provider}"))
                    .boxed()
            });
        }

        // Multi-key aggregator kinds skip model filtering entirely.
        if let Some(model) = model {
            if kind.needs_model() {
                candidates.retain(|k| k.serves_model(base_provider, model));
                if candidates.is_empty() {
                    return Err(GatewayError::not_configured(format!(
                        "no keys support model {model} on provider {provider}"
                    ))
                    .boxed());
                }
            }
        }

        Ok(candidates)
    }
}

/// Weighted random choice over integer-scaled weights. Zero and negative
/// weights contribute nothing; if no weight is positive the choice is
/// positionally deterministic: the first candidate wins.
pub fn weighted_random(keys: &[Key]) -> usize {
    use rand::Rng;

    let scaled: Vec<u64> = keys
        .iter()
        .map(|k| if k.weight > 0.0 { (k.weight * 1000.0) as u64 } else { 0 })
        .collect();
    let total: u64 = scaled.iter().sum();
    if total == 0 {
        return 0;
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for (index, weight) in scaled.iter().enumerate() {
        if roll < *weight {
            return index;
        }
        roll -= weight;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::StaticAccount;
    use crate::config::ProviderConfig;

    fn account_with_keys(keys: Vec<Key>) -> StaticAccount {
        StaticAccount::new()
            .with_provider(ProviderId::OpenAi, ProviderConfig::default())
            .with_keys(ProviderId::OpenAi, keys)
    }

    fn selector() -> KeySelector {
        KeySelector::default()
    }

    #[tokio::test]
    async fn pinned_key_wins() {
        let ctx = Context::new();
        ctx.set_pinned_key(Some(Key::new("pin", "pinned", "sk-pin")));
        let account = account_with_keys(vec![Key::new("a", "a", "sk-a")]);
        let key = selector()
            .select(&ctx, &account, RequestKind::Chat, &ProviderId::OpenAi, "m", &ProviderId::OpenAi)
            .await
            .unwrap();
        assert_eq!(key.id, "pin");
    }

    #[tokio::test]
    async fn disabled_and_valueless_keys_filtered() {
        let mut disabled = Key::new("a", "a", "sk-a");
        disabled.enabled = false;
        let mut valueless = Key::new("b", "b", "");
        valueless.value = None;
        let account = account_with_keys(vec![disabled, valueless, Key::new("c", "c", "sk-c")]);
        let key = selector()
            .select(
                &Context::new(),
                &account,
                RequestKind::Chat,
                &ProviderId::OpenAi,
                "m",
                &ProviderId::OpenAi,
            )
            .await
            .unwrap();
        assert_eq!(key.id, "c");
    }

    #[tokio::test]
    async fn model_allow_list_filters() {
        let mut gpt_only = Key::new("a", "a", "sk-a");
        gpt_only.models = vec!["gpt-4o".into()];
        let account = account_with_keys(vec![gpt_only]);
        let err = selector()
            .select(
                &Context::new(),
                &account,
                RequestKind::Chat,
                &ProviderId::OpenAi,
                "o3",
                &ProviderId::OpenAi,
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("no keys support model o3"));
    }

    #[tokio::test]
    async fn deployment_table_gates_deployment_providers() {
        let mut key = Key::new("a", "a", "sk-a");
        key.deployments.azure.insert("gpt-4o".into(), "gpt4o-eastus".into());
        let account = StaticAccount::new()
            .with_provider(ProviderId::Azure, ProviderConfig::default())
            .with_keys(ProviderId::Azure, vec![key]);

        let ok = selector()
            .select(
                &Context::new(),
                &account,
                RequestKind::Chat,
                &ProviderId::Azure,
                "gpt-4o",
                &ProviderId::Azure,
            )
            .await;
        assert!(ok.is_ok());

        let missing = selector()
            .select(
                &Context::new(),
                &account,
                RequestKind::Chat,
                &ProviderId::Azure,
                "o3",
                &ProviderId::Azure,
            )
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn batch_kinds_require_batch_eligible_keys() {
        let plain = Key::new("a", "a", "sk-a");
        let mut batch = Key::new("b", "b", "sk-b");
        batch.batch_eligible = true;
        let account = account_with_keys(vec![plain, batch]);
        let key = selector()
            .select(
                &Context::new(),
                &account,
                RequestKind::BatchCreate,
                &ProviderId::OpenAi,
                "gpt-4o",
                &ProviderId::OpenAi,
            )
            .await
            .unwrap();
        assert_eq!(key.id, "b");
    }

    #[tokio::test]
    async fn select_by_name() {
        let account = account_with_keys(vec![Key::new("a", "first", "sk-a"), Key::new("b", "second", "sk-b")]);
        let ctx = Context::new();
        ctx.set_key_name(Some("second".into()));
        let key = selector()
            .select(&ctx, &account, RequestKind::Chat, &ProviderId::OpenAi, "m", &ProviderId::OpenAi)
            .await
            .unwrap();
        assert_eq!(key.id, "b");

        ctx.set_key_name(Some("absent".into()));
        let err = selector()
            .select(&ctx, &account, RequestKind::Chat, &ProviderId::OpenAi, "m", &ProviderId::OpenAi)
            .await
            .unwrap_err();
        assert!(err.message.contains("no key found with name absent"));
    }

    #[tokio::test]
    async fn multi_key_kinds_skip_model_filter() {
        let mut narrow = Key::new("a", "a", "sk-a");
        narrow.models = vec!["gpt-4o".into()];
        let account = account_with_keys(vec![narrow, Key::new("b", "b", "sk-b")]);
        let keys = selector()
            .select_all(
                &Context::new(),
                &account,
                RequestKind::ListModels,
                &ProviderId::OpenAi,
                &ProviderId::OpenAi,
            )
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn weighted_random_converges_to_weights() {
        let mut heavy = Key::new("h", "heavy", "sk-h");
        heavy.weight = 3.0;
        let light = Key::new("l", "light", "sk-l");
        let keys = vec![heavy, light];

        let trials = 20_000;
        let heavy_hits = (0..trials).filter(|_| weighted_random(&keys) == 0).count();
        let share = heavy_hits as f64 / trials as f64;
        assert!((share - 0.75).abs() < 0.03, "share was {share}");
    }

    #[test]
    fn weighted_random_zero_weights_fall_back_to_first() {
        let mut a = Key::new("a", "a", "sk-a");
        a.weight = 0.0;
        let mut b = Key::new("b", "b", "sk-b");
        b.weight = -1.0;
        assert_eq!(weighted_random(&[a, b]), 0);
    }
}

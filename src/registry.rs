//! Channel and provider registry.
//!
//! Holds the immutable provider set and the read-mostly channel set parsed
//! from configuration. The only runtime mutation is the per-channel `enabled`
//! flag; it is applied by replacing the channel's `Arc` rather than mutating
//! in place, so concurrent readers always observe a consistent record.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;

use crate::config::{Channel, Config, Provider};

pub struct ChannelRegistry {
    providers: HashMap<String, Arc<Provider>>,
    channels: DashMap<String, Arc<Channel>>,
    /// Config-file order, for deterministic iteration.
    order: Vec<String>,
}

impl ChannelRegistry {
    pub fn new(config: &Config) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(name, p)| (name.clone(), Arc::new(p.clone())))
            .collect();

        let channels = DashMap::new();
        let mut order = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            order.push(channel.id.clone());
            channels.insert(channel.id.clone(), Arc::new(channel.clone()));
        }

        Self { providers, channels, order }
    }

    pub fn get_channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn get_provider(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.get(name).map(Arc::clone)
    }

    /// All channels in config order, enabled or not.
    pub fn all_channels(&self) -> Vec<Arc<Channel>> {
        self.order.iter().filter_map(|id| self.get_channel(id)).collect()
    }

    /// Channels eligible for dispatch: enabled with a non-empty credential.
    pub fn get_enabled(&self) -> Vec<Arc<Channel>> {
        self.all_channels()
            .into_iter()
            .filter(|c| c.enabled && !c.api_key.trim().is_empty())
            .collect()
    }

    /// Exact match on the declared `model_name`.
    pub fn get_channels_by_declared_model(&self, name: &str) -> Vec<Arc<Channel>> {
        self.get_enabled()
            .into_iter()
            .filter(|c| c.model_name == name)
            .collect()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.get_channel(id)
            .map(|c| c.enabled && !c.api_key.trim().is_empty())
            .unwrap_or(false)
    }

    /// Flip a channel's enabled flag. Returns false for unknown ids.
    ///
    /// Callers are responsible for invalidating the request cache for the
    /// channel — the registry does not reach into other components.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.channels.get(id).map(|e| Arc::clone(e.value())) {
            Some(current) => {
                let mut updated = (*current).clone();
                updated.enabled = enabled;
                self.channels.insert(id.to_string(), Arc::new(updated));
                true
            }
            None => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry() -> ChannelRegistry {
        let config = Config::from_yaml(
            r#"
            providers:
              openai: { base_url: "https://api.openai.com" }
              local:  { base_url: "http://localhost:11434/v1", local: true }
            channels:
              - { id: c1, provider: openai, model_name: gpt-4o, api_key: k1 }
              - { id: c2, provider: openai, model_name: gpt-4o, api_key: k2 }
              - { id: c3, provider: local,  model_name: auto,   api_key: none }
              - { id: c4, provider: openai, model_name: gpt-4o, api_key: "" }
            "#,
        )
        .unwrap();
        ChannelRegistry::new(&config)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    #[test]
    fn get_channel_by_id() {
        let reg = registry();
        assert_eq!(reg.get_channel("c1").unwrap().model_name, "gpt-4o");
        assert!(reg.get_channel("nope").is_none());
    }

    #[test]
    fn get_provider_by_name() {
        let reg = registry();
        assert!(reg.get_provider("openai").is_some());
        assert!(reg.get_provider("local").unwrap().local);
        assert!(reg.get_provider("missing").is_none());
    }

    #[test]
    fn enabled_excludes_credentialless_channels() {
        let reg = registry();
        let enabled: Vec<_> = reg.get_enabled().iter().map(|c| c.id.clone()).collect();
        // c4 has an empty key and was disabled at load
        assert_eq!(enabled, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn declared_model_lookup_is_exact() {
        let reg = registry();
        let hits = reg.get_channels_by_declared_model("gpt-4o");
        assert_eq!(hits.len(), 2);
        assert!(reg.get_channels_by_declared_model("gpt-4").is_empty());
    }

    // -----------------------------------------------------------------------
    // Runtime enable/disable
    // -----------------------------------------------------------------------

    #[test]
    fn set_enabled_flips_the_flag() {
        let reg = registry();
        assert!(reg.is_enabled("c1"));
        assert!(reg.set_enabled("c1", false));
        assert!(!reg.is_enabled("c1"));
        assert_eq!(reg.get_enabled().len(), 2);

        assert!(reg.set_enabled("c1", true));
        assert!(reg.is_enabled("c1"));
    }

    #[test]
    fn set_enabled_on_unknown_channel_returns_false() {
        let reg = registry();
        assert!(!reg.set_enabled("ghost", true));
    }

    #[test]
    fn iteration_preserves_config_order() {
        let reg = registry();
        let ids: Vec<_> = reg.all_channels().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
    }
}

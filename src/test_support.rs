//! Shared fixtures for unit tests. Compiled only under `cfg(test)`.

use std::sync::Arc;

use dashmap::DashMap;

use crate::catalog::{key_fingerprint, ModelCatalog, ModelSnapshot};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::health::{HealthTracker, KeyTracker};
use crate::registry::ChannelRegistry;
use crate::routing::blacklist::Blacklist;
use crate::routing::Router;
use crate::state::GatewayState;

/// Full gateway state over one channel (`c1`) pointed at `base_url`, with a
/// snapshot containing `models`.
pub fn state_for(base_url: &str, models: &[&str]) -> Arc<GatewayState> {
    let yaml = format!(
        "providers:\n  p: {{ base_url: \"{base_url}\" }}\nchannels:\n  - {{ id: c1, provider: p, model_name: auto, api_key: sk-c1 }}\n"
    );
    let config = Arc::new(Config::from_yaml(&yaml).unwrap());

    let registry = Arc::new(ChannelRegistry::new(&config));
    let catalog = Arc::new(ModelCatalog::new());
    catalog.insert_snapshot(ModelSnapshot::new(
        "c1",
        &key_fingerprint("sk-c1"),
        models.iter().map(|m| m.to_string()).collect(),
    ));

    let blacklist = Arc::new(Blacklist::new());
    let health = Arc::new(HealthTracker::new());
    let keys = Arc::new(KeyTracker::new());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&blacklist),
        Arc::clone(&keys),
        &config.server,
    ));
    let router = Arc::new(Router::new(
        registry,
        catalog,
        blacklist,
        health,
        keys,
        config.routing.clone(),
    ));

    Arc::new(GatewayState::new(
        config,
        router,
        dispatcher,
        Arc::new(DashMap::new()),
    ))
}

/// Gateway state with no channels and the given caller tokens — for
/// middleware tests.
pub fn state_with_tokens(tokens: Vec<String>) -> Arc<GatewayState> {
    let config = Arc::new(Config::default());

    let registry = Arc::new(ChannelRegistry::new(&config));
    let blacklist = Arc::new(Blacklist::new());
    let health = Arc::new(HealthTracker::new());
    let keys = Arc::new(KeyTracker::new());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&blacklist),
        Arc::clone(&keys),
        &config.server,
    ));
    let router = Arc::new(Router::new(
        registry,
        Arc::new(ModelCatalog::new()),
        blacklist,
        health,
        keys,
        config.routing.clone(),
    ));

    let mut state = GatewayState::new(config, router, dispatcher, Arc::new(DashMap::new()));
    state.client_tokens = tokens;
    Arc::new(state)
}

//! Shared application state injected into every request handler.

use std::sync::Arc;

use dashmap::DashMap;

use crate::api::rate_limit::RateLimiter;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::routing::Router;
use crate::scheduler::TaskStats;

pub struct GatewayState {
    pub config: Arc<Config>,
    pub router: Arc<Router>,
    pub dispatcher: Arc<Dispatcher>,
    /// Per-task outcome counters, shared with the scheduler loop.
    pub task_stats: Arc<DashMap<String, TaskStats>>,
    /// Accepted caller Bearer tokens. Empty disables caller auth.
    pub client_tokens: Vec<String>,
    /// `None` disables rate limiting.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub started_at: std::time::Instant,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        router: Arc<Router>,
        dispatcher: Arc<Dispatcher>,
        task_stats: Arc<DashMap<String, TaskStats>>,
    ) -> Self {
        let client_tokens = config.client_tokens();
        let rate_limiter = config
            .server
            .rate_limit_rpm
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Arc::new(RateLimiter::new(rpm)));
        if !client_tokens.is_empty() {
            tracing::info!(tokens = client_tokens.len(), "caller auth enabled");
        }

        Self {
            config,
            router,
            dispatcher,
            task_stats,
            client_tokens,
            rate_limiter,
            started_at: std::time::Instant::now(),
        }
    }
}

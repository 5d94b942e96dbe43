//! `GET /health` — liveness plus aggregate component state.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::GatewayState;

/// Liveness plus snapshot/cache/blacklist counts, per-channel health, and
/// per-task scheduler stats. Cheap enough for a probe: every source is an
/// in-memory read.
pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let router = &state.router;
    let cache = router.cache.stats();
    let router_stats = router.stats();

    let channels: Vec<_> = router
        .health
        .all()
        .into_iter()
        .map(|(id, h)| {
            json!({
                "channel": id,
                "requests": h.request_count,
                "success_rate": h.success_rate(),
                "latency_ewma_ms": h.latency_ewma_ms,
                "score": router.health.health_score(&id),
            })
        })
        .collect();

    let tasks: serde_json::Map<String, serde_json::Value> = state
        .task_stats
        .iter()
        .map(|e| (e.key().clone(), serde_json::to_value(e.value()).unwrap_or_default()))
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "default_strategy": state.config.routing.default_strategy,
            "channels_configured": router.registry.channel_count(),
            "channels_enabled": router.registry.get_enabled().len(),
            "snapshots": router.catalog.snapshot_count(),
            "models": router.catalog.model_count(),
            "invalid_keys": router.keys.invalid_count(),
            "blacklist_active": router.blacklist.active_count(),
            "cache": {
                "entries": cache.entries,
                "hits": cache.hits,
                "misses": cache.misses,
                "invalidations": cache.invalidations,
            },
            "routing": {
                "routes": router_stats.routes,
                "full_routes": router_stats.full_routes,
                "cache_hits": router_stats.cache_hits,
            },
            "tasks": tasks,
            "channel_health": channels,
        })),
    )
}

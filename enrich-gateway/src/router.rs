use std::future::ready;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::handlers;

async fn index() -> &'static str {
    "enrich-gateway"
}

async fn liveness() -> &'static str {
    "ok"
}

pub fn router(context: AppContext, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/enrich", post(handlers::enrich::enrich))
        .route("/enrich/batch", post(handlers::enrich::enrich_batch))
        .route(
            "/admin/circuit-breakers",
            get(handlers::admin::circuit_breakers),
        )
        .route(
            "/admin/circuit-breakers/:provider/reset",
            post(handlers::admin::reset_breaker),
        )
        .route("/admin/cache/stats", get(handlers::admin::cache_stats))
        .route("/admin/dlq", get(handlers::admin::list_dlq))
        .route("/admin/dlq/:id/replay", post(handlers::admin::replay))
        .route(
            "/admin/dlq/replay-batch",
            post(handlers::admin::replay_batch),
        )
        .route("/admin/aggregate", get(handlers::admin::aggregate))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            enrich_common::metrics::track_metrics,
        ))
        .with_state(context);

    // Don't install a /metrics route unless a recorder was set up. Tests and
    // library users run without the global recorder.
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}

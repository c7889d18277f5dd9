use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};

use enrich_common::metrics::setup_metrics_recorder;
use enrich_gateway::api::ReplayBatchPayload;
use enrich_gateway::config::Config;
use enrich_gateway::context::AppContext;
use enrich_gateway::router::router;
use enrich_gateway::transport::HttpTransport;

async fn listen(app: Router, address: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!("listening on {}", address);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically replay active DLQ messages and purge archived ones that
/// outlived the retention window.
async fn replay_sweep_loop(context: AppContext, sweep_interval: Duration, retention: Duration) {
    let mut interval = tokio::time::interval(sweep_interval);

    loop {
        interval.tick().await;

        match context.waterfall.replay_batch(&ReplayBatchPayload::default()).await {
            Ok(reports) if !reports.is_empty() => {
                tracing::info!(replayed = reports.len(), "dlq replay sweep finished")
            }
            Ok(_) => {}
            Err(error) => tracing::error!(%error, "dlq replay sweep failed"),
        }

        let purged = context.dlq.purge_expired(retention);
        if purged > 0 {
            tracing::info!(purged, "purged expired archived dlq messages");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let providers = config
        .providers()
        .expect("failed to load provider configuration");

    let transport = Arc::new(HttpTransport::new(&providers, config.request_timeout.0));
    let context =
        AppContext::new(&config, transport).expect("failed to construct gateway context");

    let recorder_handle = config.export_prometheus.then(setup_metrics_recorder);
    let app = router(context.clone(), recorder_handle);

    let http_server = Box::pin(listen(app, config.address));
    let sweep = Box::pin(replay_sweep_loop(
        context,
        config.replay_sweep_interval.0,
        config.dlq_retention.0,
    ));

    match select(http_server, sweep).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(error) => tracing::error!("failed to start enrich-gateway http server, {}", error),
        },
        Either::Right((_, _)) => {
            tracing::error!("enrich-gateway replay sweep task exited")
        }
    };
}

//! Cluster crash reports waiting in a spool directory.
use std::future::ready;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ureport_common::metrics::{serve, setup_metrics_routes};
use ureport_worker::config::{Config, RunMode};
use ureport_worker::context::{build_coordinator, build_runner, build_store};
use ureport_worker::error::PipelineError;

pub fn app(liveness: HealthRegistry, readiness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(readiness.get_status())))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "ureport worker"
}

async fn shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    info!("shutting down, waiting for in-flight reports");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let readiness = HealthRegistry::new("readiness");
    let deadline = config.liveness_timeout.0 + config.poll_interval.0;
    let runner_liveness = liveness.register("pipeline", deadline);
    let runner_readiness = readiness.register("pipeline", deadline);

    let bind = config.bind();
    match setup_metrics_routes(app(liveness, readiness)) {
        Ok(router) => {
            tokio::task::spawn(async move {
                if let Err(e) = serve(router, &bind).await {
                    error!("failed to serve metrics and health routes: {}", e);
                }
            });
        }
        Err(e) => error!("failed to install metrics recorder: {}", e),
    }

    let store = build_store(&config).await?;
    let coordinator = build_coordinator(&config, store);
    if config.init_spool {
        coordinator.spool().init().await?;
    }
    let runner = build_runner(&config, coordinator);
    tokio::task::spawn(shutdown_signal(runner.cancellation_token()));

    info!(
        spool_root = config.spool_root.as_str(),
        concurrency = config.concurrency,
        run_mode = ?config.run_mode,
        "starting ureport worker"
    );

    match config.run_mode {
        RunMode::Once => {
            runner_liveness.report_healthy();
            let summary = runner.run_once(config.concurrency).await?;
            runner_readiness.report_healthy();
            info!(
                processed = summary.processed,
                errors = summary.errors,
                "single run finished"
            );
        }
        RunMode::Loop => {
            runner
                .run(
                    config.concurrency,
                    config.poll_interval.0,
                    runner_liveness,
                    runner_readiness,
                )
                .await
        }
    }

    info!("exiting");
    Ok(())
}

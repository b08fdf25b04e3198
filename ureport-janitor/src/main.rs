use std::{future::ready, time::Duration};

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::{HealthHandle, HealthRegistry};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ureport_common::metrics::setup_metrics_routes;
use ureport_common::spool::Spool;
use ureport_janitor::{config::Config, janitor::Janitor};

async fn cleanup_loop(janitor: Janitor, liveness: HealthHandle, interval_secs: u64) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        // A broken spool is for the workers' readiness to report, the janitor keeps going
        if let Err(e) = janitor.run_once().await {
            error!("janitor failed cleanup with: {}", e);
        }
        liveness.report_healthy();
    }
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "ureport janitor"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let liveness = HealthRegistry::new("liveness");

    let settings = config.get_janitor_settings();
    info!("Starting janitor with ID {:?}", settings.id);

    let janitor = Janitor::new(Spool::new(&config.spool_root), settings);

    let janitor_liveness = liveness.register(
        "janitor",
        Duration::from_secs(config.cleanup_interval_secs * 4),
    );

    let janitor_loop = tokio::spawn(cleanup_loop(
        janitor,
        janitor_liveness,
        config.cleanup_interval_secs,
    ));

    let app = setup_metrics_routes(app(liveness)).wrap_err("failed to install metrics recorder")?;
    let http_server = tokio::spawn(listen(app, config.bind()));

    tokio::select! {
        res = janitor_loop => {
            error!("janitor loop exited");
            if let Err(e) = res {
                error!("janitor failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
    Ok(())
}

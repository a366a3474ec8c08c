use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::{EndpointExt, Route};
use prometheus::Registry;
use remux_common::tracing::init_tracing_with_default_env_filter;
use remux_orchestrator::api::make_open_api_service;
use remux_orchestrator::bootstrap::Services;
use remux_orchestrator::config::{make_config_loader, OrchestratorConfig};
use remux_orchestrator::foreman::Foreman;
use remux_orchestrator::metrics;
use remux_service_base::db;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    let config = make_config_loader()
        .load()
        .map_err(|e| std::io::Error::other(format!("Failed to load config: {e}")))?;

    init_tracing_with_default_env_filter(&config.tracing);
    let prometheus = metrics::register_all();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(&config, prometheus))
}

async fn async_main(
    config: &OrchestratorConfig,
    prometheus_registry: Registry,
) -> Result<(), std::io::Error> {
    info!("Starting orchestrator on http port {}", config.http_port);

    db::sqlite_migrate(&config.db).await.map_err(|e| {
        error!("DB - init error: {}", e);
        std::io::Error::other(format!("Init error: {e:?}"))
    })?;

    let services = Services::new(config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;

    let cancel = CancellationToken::new();

    let foreman = Foreman::new(services.foreman_deps(), cancel.child_token()).await;
    let foreman_task = foreman.spawn();
    let post_processor_task = services.post_processor().spawn(cancel.child_token());
    let monitor_task = services.monitor().spawn(cancel.child_token());

    let api_service = make_open_api_service(&services);
    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    let cors = Cors::new().allow_origin_regex(&config.cors_origin_regex);

    let app = Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .with(cors);

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            cancel.cancel();
        }
    };

    poem::Server::new(TcpListener::bind(format!("0.0.0.0:{}", config.http_port)))
        .run_with_graceful_shutdown(app, shutdown, None)
        .await?;

    cancel.cancel();
    let _ = tokio::join!(foreman_task, post_processor_task, monitor_task);

    Ok(())
}

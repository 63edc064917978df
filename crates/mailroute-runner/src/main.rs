use std::{env, sync::Arc, time::Duration};

use mailroute_core::{
    AppCredentials, Config, ContentNormalizer, Database, EmailProcessor, FolderManager,
    GraphClient, ModelApiClient, RecordRepository, RetryPolicy, TokenManager, init_telemetry,
    migrations,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    db.health_check().await?;
    let applied = migrations::run_migrations(&db).await?;
    info!(location = %db.location(), applied, "record database ready");

    let processor = build_processor(&config, db).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match processor.run(&shutdown).await {
        Ok(report) => {
            info!(
                batch_id = %report.batch_id,
                processed = report.metrics.processed,
                classified = report.metrics.classified,
                skipped = report.metrics.skipped,
                errored = report.metrics.errored,
                moved = report.metrics.moved,
                stopped_early = report.stopped_early,
                "run finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "run failed");
            Err(err.into())
        }
    }
}

async fn build_processor(
    config: &Config,
    db: Database,
) -> Result<EmailProcessor, Box<dyn std::error::Error>> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let tokens = TokenManager::new(
        http.clone(),
        AppCredentials::from_config(&config.graph),
        config.graph.authority_base.clone(),
    )
    .with_safety_margin(config.heuristics.token_safety_margin());
    let graph = GraphClient::from_config(
        http.clone(),
        &config.graph,
        Arc::new(tokens),
        RetryPolicy::from_config(&config.retry),
    );

    let model = ModelApiClient::from_config(http, &config.model);
    if !model.health_check().await {
        warn!(api_url = %config.model.api_url, "model api is not reachable, classifications will degrade");
    }

    Ok(EmailProcessor::new(
        Arc::new(graph),
        Arc::new(model),
        Arc::new(RecordRepository::new(db)),
    )
    .with_folder_manager(FolderManager::new(config.graph.parent_folder.clone()))
    .with_normalizer(ContentNormalizer::new(config.heuristics.thread_ratio))
    .with_delivery(config.delivery)
    .with_batch_size(config.graph.batch_size))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, finishing current message then stopping");
        }
        _ = terminate => {
            warn!("received terminate signal, finishing current message then stopping");
        }
    }

    shutdown.cancel();
}

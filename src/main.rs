use std::{process, sync::Arc};

use scudo::{
    config::{self, EngineSettings, RemoteConfigDoc},
    engine::{
        config::EngineConfig,
        fetch::HttpFetcher,
        metrics::MetricsRegistry,
        ops::SeedPurgeEngine,
        pipeline::Pipeline,
        resolver::{BulkRequest, KeyResolver},
        store::{MemoryBlobStore, StoreManager},
    },
    infra::{
        error::InfraError,
        http::{self, EngineState},
        telemetry,
    },
    util::ring::RingLog,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (_cli_args, mut settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("scudo/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| InfraError::http(format!("failed to build HTTP client: {err}")))?;

    if let Some(url) = settings.admin.remote_config_url.clone() {
        apply_remote_overlay(&client, &url, &mut settings.engine).await;
    }

    let engine_config = Arc::new(
        EngineConfig::from_settings(&settings.engine)
            .map_err(|err| InfraError::configuration(err.to_string()))?,
    );

    let stores = StoreManager::new(Arc::new(MemoryBlobStore::new()), &engine_config);
    let dropped = stores.reconcile_namespaces().await;
    if dropped > 0 {
        info!(target = "scudo::startup", dropped, "Reconciled stale store namespaces");
    }

    let fetcher = Arc::new(HttpFetcher::new(client.clone()));
    let metrics = Arc::new(MetricsRegistry::new());
    let ring = Arc::new(RingLog::new());
    let pipeline = Arc::new(Pipeline::new(
        engine_config.clone(),
        stores.clone(),
        fetcher.clone(),
        metrics.clone(),
        ring.clone(),
    ));
    let resolver = Arc::new(KeyResolver::new(engine_config.clone(), fetcher.clone()));
    let ops = Arc::new(SeedPurgeEngine::new(
        engine_config.clone(),
        stores.clone(),
        fetcher,
        metrics.clone(),
        ring.clone(),
    ));

    if !engine_config.preload.is_empty() {
        let request = BulkRequest {
            keys: engine_config.preload.clone(),
            ..Default::default()
        };
        let keys = resolver.resolve(&request).await;
        let report = ops.seed(&keys, false).await;
        info!(
            target = "scudo::startup",
            requested = keys.len(),
            seeded = report.count,
            "Preload finished"
        );
    }

    let state = EngineState {
        config: engine_config,
        stores,
        pipeline: pipeline.clone(),
        resolver,
        ops,
        metrics,
        ring,
        secret: settings.admin.secret.as_deref().map(Arc::from),
        client,
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(target = "scudo::startup", addr = %settings.server.addr, "Listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Give in-flight revalidations a chance to finish writing.
    pipeline.tasks().close();
    if tokio::time::timeout(settings.server.graceful_shutdown, pipeline.tasks().wait())
        .await
        .is_err()
    {
        warn!(
            target = "scudo::shutdown",
            "revalidation tasks did not finish before the shutdown deadline"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
    }
}

/// Fetch and apply the remote configuration overlay. Failure to load
/// the document is never fatal; the local settings simply stand.
async fn apply_remote_overlay(client: &reqwest::Client, url: &str, engine: &mut EngineSettings) {
    let response = match client.get(url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(
                target = "scudo::startup",
                url,
                status = response.status().as_u16(),
                "Remote configuration fetch returned non-success"
            );
            return;
        }
        Err(error) => {
            warn!(target = "scudo::startup", url, %error, "Remote configuration fetch failed");
            return;
        }
    };

    match response.json::<RemoteConfigDoc>().await {
        Ok(doc) => {
            doc.overlay(engine);
            info!(target = "scudo::startup", url, "Applied remote configuration overlay");
        }
        Err(error) => {
            warn!(target = "scudo::startup", url, %error, "Remote configuration document is invalid");
        }
    }
}

use std::{process, sync::Arc};

use beekeeper::{
    cache::{
        CacheLayer, Fetcher, FileStorage, ProfileStorage, QueryKey, WarmingEngine,
        warming::{WarmContext, WarmReport},
    },
    config::{self, Command, GetArgs, Settings, WarmArgs},
    infra::{api::RestFetcher, error::InfraError, telemetry},
};
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
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
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let command = cli_args
        .command
        .unwrap_or_else(|| Command::Warm(WarmArgs::default()));

    match command {
        Command::Warm(args) => run_warm(settings, args).await,
        Command::Get(args) => run_get(settings, args).await,
    }
}

async fn run_warm(settings: Settings, args: WarmArgs) -> Result<(), InfraError> {
    let layer = CacheLayer::create(settings.cache.clone());
    let fetcher: Arc<dyn Fetcher> = Arc::new(RestFetcher::new(&settings.api)?);
    let storage: Arc<dyn ProfileStorage> =
        Arc::new(FileStorage::new(settings.storage.directory.clone()));
    let engine = WarmingEngine::create(Arc::clone(&layer), fetcher, storage);

    engine.load_profile().await;
    let restored = engine.restore_critical().await;
    engine.navigate(&args.route);

    let report: WarmReport = match args.strategy.as_deref() {
        Some(name) => engine.warm(name, Some(WarmContext::at(&args.route))).await,
        None => engine.app_init().await,
    };

    let saved = engine.persist_critical().await;
    engine.dispose().await;
    info!(
        route = %args.route,
        restored,
        saved,
        "warm run finished"
    );

    let summary = json!({
        "report": report,
        "warming": engine.stats(),
        "cache": layer.stats(),
        "dedup": layer.dedup_stats(),
        "snapshot": { "restored": restored, "saved": saved },
    });
    print_json(&summary)?;

    layer.dispose();
    Ok(())
}

async fn run_get(settings: Settings, args: GetArgs) -> Result<(), InfraError> {
    let key: QueryKey = serde_json::from_str(&args.key)
        .map_err(|err| InfraError::invalid_input(format!("key must be a JSON array: {err}")))?;

    let layer = CacheLayer::create(settings.cache.clone());
    let fetcher: Arc<dyn Fetcher> = Arc::new(RestFetcher::new(&settings.api)?);

    let data = layer.fetch_with(&key, fetcher).await?;
    print_json(data.as_ref())?;

    layer.dispose();
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<(), InfraError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| InfraError::invalid_input(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

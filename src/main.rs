use std::time::Duration;

use launcher_downloads::config::CoreConfig;
use launcher_downloads::errors::Result;
use launcher_downloads::logging;
use launcher_downloads::utils::paths::resolve_log_dir;
use launcher_downloads::AppState;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!("launcher-downloads exited with error: {err}");
        eprintln!("launcher-downloads: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = CoreConfig::from_env();
    let log_dir = resolve_log_dir(config.log_dir.as_deref());
    logging::init(Some(log_dir.as_path()))?;
    tracing::info!(
        "starting against {} (push={}, enrichment={}, turbo={})",
        config.api_url,
        config.push_enabled,
        config.enrichment_enabled,
        config.enrichment_turbo
    );

    let state = AppState::build(config)?;

    if let Err(err) = state.jobs.refresh().await {
        tracing::warn!("initial job refresh failed: {}", err);
    }
    match state.sources.fetch_sources().await {
        Ok(_) => {
            if let Err(err) = state.sources.fetch_all_items().await {
                tracing::warn!("source items load failed: {}", err);
            }
        }
        Err(err) => tracing::warn!("source list load failed: {}", err),
    }
    if state.config.push_enabled {
        state.channel.connect();
    }
    if state.config.enrichment_enabled {
        match state.library.fetch_library(false).await {
            Ok(_) => state.enrichment.start(None),
            Err(err) => tracing::warn!("library fetch failed, enrichment skipped: {}", err),
        }
    }

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => log_status(&state),
        }
    }

    tracing::info!("shutting down");
    state.enrichment.stop();
    state.channel.disconnect();
    Ok(())
}

fn log_status(state: &AppState) {
    let enrichment = state.enrichment.status();
    tracing::info!(
        "jobs={} active={} speed={:.0}B/s progress={}% push={:?} sources={} enrich_queue={} cooling={}",
        state.registry.len(),
        state.registry.active().len(),
        state.registry.total_speed(),
        state.registry.total_progress(),
        state.channel.phase(),
        state.sources.sources().len(),
        enrichment.queued,
        enrichment.cooling_down
    );
}

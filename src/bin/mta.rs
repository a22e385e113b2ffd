use anyhow::Context;
use mailzone::{
    AppConfig, hooks::HookBus, init_tracing, queue::memory::MemoryQueue, reload_on_sighup,
    router::{Router, RoutingTables},
    run_mta, shutdown_signal,
    zone::dns::DnsResolver,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid config {}", path.display()))
        }
        None => {
            warn!("MAILZONE_CONFIG not set, using the development configuration");
            Ok(AppConfig::development())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let config_path = std::env::var("MAILZONE_CONFIG").ok().map(PathBuf::from);
    let config = load_config(config_path.as_ref())?;

    let router = Arc::new(Router::new(RoutingTables::from_zones(&config.zones)));
    let queue = Arc::new(MemoryQueue::new(router.clone()));
    let hooks = Arc::new(HookBus::new());

    let shutdown = CancellationToken::new();
    let app = Arc::new(
        run_mta(
            config,
            router,
            queue,
            hooks,
            DnsResolver::new(),
            shutdown.clone(),
        )
        .await?,
    );

    reload_on_sighup(
        app,
        move || {
            load_config(config_path.as_ref())
                .inspect_err(|err| warn!("{err:?}"))
                .ok()
        },
        shutdown.clone(),
    );

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give listeners and zone workers the opportunity to drain
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}

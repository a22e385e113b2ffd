use serde::Deserialize;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod address;
pub mod domains;
pub mod envelope;
pub mod headers;
pub mod hooks;
pub mod maildrop;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod response;
pub mod router;
pub mod smtp;
pub mod zone;

pub use maildrop::MailDrop;
pub use response::SmtpResponse;

use crate::{
    domains::DomainConfigStore,
    hooks::HookBus,
    queue::Queue,
    router::{Router, RoutingTables},
    smtp::{InterfaceConfig, InterfaceContext, server::SmtpServer},
    zone::{ZoneConfig, dns::DnsResolver, supervisor::ZoneSupervisor},
};

/// Top-level configuration: the ingress interfaces and the outbound zones.
/// Parsing the operator's config file into this shape happens outside the
/// core.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Hostname this node identifies as.
    pub hostname: String,
    pub interfaces: Vec<InterfaceConfig>,
    pub zones: Vec<ZoneConfig>,
}

impl AppConfig {
    /// A single-interface, single-zone setup for local development.
    pub fn development() -> Self {
        let mut zone = ZoneConfig::named("default");
        zone.default = true;

        Self {
            hostname: "localhost".to_string(),
            interfaces: vec![InterfaceConfig::named(
                "feeder",
                "127.0.0.1:2525".parse().unwrap(),
                "localhost",
            )],
            zones: vec![zone],
        }
    }
}

/// Handles to the running services, kept around for config reloads.
pub struct App {
    router: Arc<Router>,
    supervisors: Vec<Arc<ZoneSupervisor>>,
}

impl App {
    /// Swap routing tables and zone runtimes in place; workers pick the new
    /// state up without restarting.
    pub fn reload(&self, config: &AppConfig) {
        self.router.reload(RoutingTables::from_zones(&config.zones));
        for supervisor in &self.supervisors {
            if let Some(zone) = config.zones.iter().find(|z| z.name == supervisor.name()) {
                supervisor.reload(zone.clone());
            }
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug,info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wire everything together and start the listeners and zone workers.
pub async fn run_mta(
    config: AppConfig,
    router: Arc<Router>,
    queue: Arc<dyn Queue>,
    hooks: Arc<HookBus>,
    resolver: DnsResolver,
    shutdown: CancellationToken,
) -> Result<App, smtp::server::SmtpServerError> {
    install_crypto_provider();

    let domains = Arc::new(DomainConfigStore::default());
    let maildrop = Arc::new(MailDrop::new(
        queue.clone(),
        hooks.clone(),
        router.clone(),
        config.hostname.clone(),
    ));

    for interface in &config.interfaces {
        let context = Arc::new(InterfaceContext {
            config: interface.clone(),
            hooks: hooks.clone(),
            queue: queue.clone(),
            maildrop: maildrop.clone(),
            shutdown: shutdown.clone(),
        });
        SmtpServer::new(context)?.spawn();
    }

    let mut supervisors = Vec::new();
    for zone in &config.zones {
        let supervisor = Arc::new(ZoneSupervisor::new(
            zone.clone(),
            queue.clone(),
            domains.clone(),
            resolver.clone(),
            config.hostname.clone(),
            shutdown.clone(),
        ));
        supervisor.spawn();
        supervisors.push(supervisor);
    }

    Ok(App {
        router,
        supervisors,
    })
}

/// Both the ingress TLS listener and the outbound client need a process
/// wide rustls crypto provider.
pub fn install_crypto_provider() {
    use tokio_rustls::rustls::crypto::{CryptoProvider, aws_lc_rs};

    if CryptoProvider::get_default().is_none() {
        aws_lc_rs::default_provider()
            .install_default()
            .expect("failed to install crypto provider");
    }
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Watch for SIGHUP and reapply the configuration source each time.
pub fn reload_on_sighup(
    app: Arc<App>,
    load: impl Fn() -> Option<AppConfig> + Send + 'static,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("failed to install SIGHUP handler: {err}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    match load() {
                        Some(config) => {
                            tracing::info!("reloading configuration");
                            app.reload(&config);
                        }
                        None => warn!("configuration reload failed, keeping the old state"),
                    }
                }
            }
        }
    });
}

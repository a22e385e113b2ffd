use crate::{
    domains::DomainConfigStore,
    queue::Queue,
    zone::{ZoneConfig, ZoneRuntime, delivery::DeliveryWorker, dns::DnsResolver},
};
use std::{collections::BTreeSet, net::IpAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const RESPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// Owns the worker tasks of one sending zone. The routing/throttling/pool
/// logic lives in the immutable [`ZoneRuntime`]; a config reload builds a
/// new runtime and workers reinitialize in place through the watch channel.
pub struct ZoneSupervisor {
    name: String,
    runtime: watch::Sender<Arc<ZoneRuntime>>,
    queue: Arc<dyn Queue>,
    domains: Arc<DomainConfigStore>,
    resolver: DnsResolver,
    hostname: String,
    shutdown: CancellationToken,
}

impl ZoneSupervisor {
    pub fn new(
        config: ZoneConfig,
        queue: Arc<dyn Queue>,
        domains: Arc<DomainConfigStore>,
        resolver: DnsResolver,
        hostname: String,
        shutdown: CancellationToken,
    ) -> Self {
        let name = config.name.clone();
        let (runtime, _) = watch::channel(Arc::new(ZoneRuntime::new(config)));
        Self {
            name,
            runtime,
            queue,
            domains,
            resolver,
            hostname,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Swap in a fresh runtime; running workers pick it up on their next
    /// delivery without restarting.
    pub fn reload(&self, config: ZoneConfig) {
        info!(zone = self.name, "reloading zone configuration");
        self.runtime.send_replace(Arc::new(ZoneRuntime::new(config)));
    }

    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let runtime = self.runtime.borrow().clone();
        if runtime.config().disabled {
            info!(zone = self.name, "zone is disabled, not spawning workers");
            return Vec::new();
        }

        self.check_pool_addresses(&runtime);

        (0..runtime.config().processes.max(1))
            .map(|index| {
                let supervisor = self.clone();
                tokio::spawn(async move { supervisor.supervise_worker(index).await })
            })
            .collect()
    }

    /// Warn about configured source addresses the host does not actually
    /// carry; sending from those will fail at bind time.
    fn check_pool_addresses(&self, runtime: &ZoneRuntime) {
        let host_ips: BTreeSet<IpAddr> = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces.into_iter().map(|iface| iface.ip()).collect(),
            Err(err) => {
                warn!(zone = self.name, "could not list host interfaces: {err}");
                return;
            }
        };

        for address in runtime.pool().addresses() {
            if !host_ips.contains(&address) {
                warn!(
                    zone = self.name,
                    address = %address,
                    "pool address not present on any host interface"
                );
            }
        }
    }

    async fn supervise_worker(self: Arc<Self>, index: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let worker = Arc::new(DeliveryWorker::new(
                self.name.clone(),
                self.runtime.subscribe(),
                self.queue.clone(),
                self.domains.clone(),
                self.resolver.clone(),
                self.hostname.clone(),
                self.shutdown.clone(),
            ));
            let lock_owner = worker.lock_owner().to_string();

            let (ready_tx, ready_rx) = oneshot::channel();
            let mut handle = tokio::spawn(worker.run(ready_tx));

            if timeout(STARTUP_TIMEOUT, ready_rx).await.is_err() {
                error!(zone = self.name, index, "worker did not acknowledge startup, killing it");
                handle.abort();
            } else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        // workers observe the token themselves and drain
                        let _ = (&mut handle).await;
                    }
                    result = &mut handle => {
                        if let Err(err) = result {
                            error!(zone = self.name, index, "worker task failed: {err}");
                        }
                    }
                }
            }

            // whatever the worker still held is re-offered to its successor
            if let Err(err) = self.queue.release_owner_locks(&lock_owner).await {
                error!(zone = self.name, "failed to release worker locks: {err}");
            }

            if self.shutdown.is_cancelled() {
                return;
            }
            warn!(zone = self.name, index, "worker exited, respawning");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(RESPAWN_BACKOFF) => {}
            }
        }
    }
}

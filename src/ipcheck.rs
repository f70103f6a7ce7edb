use crate::bus::EventBus;
use crate::fleet::Fleet;
use crate::keyed::KeyedMutex;
use crate::provider::{CloudProvider, ProviderErrorKind};
use crate::store::ConfigStore;
use futures::stream;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const CHECK_CONCURRENCY: usize = 8;

/// Rotates the IPs of instances that sit outside their tenant's required
/// per-region prefix.
///
/// Double-lock pattern: the per-tenant mutex serializes actual checking,
/// while the checking set lets callers bail out instead of queueing behind
/// a slow rotation (one pass can legitimately take hours).
pub struct IpRangeChecker {
    store: Arc<dyn ConfigStore>,
    fleet: Arc<Fleet>,
    provider: Arc<dyn CloudProvider>,
    bus: Arc<EventBus>,
    locks: KeyedMutex,
    checking: Arc<Mutex<HashSet<u64>>>,
    /// Rotation budget per instance.
    max_attempts: usize,
    /// Pause between rotation attempts.
    attempt_pause: Duration,
}

struct CheckingGuard {
    checking: Arc<Mutex<HashSet<u64>>>,
    tenant: u64,
}

impl Drop for CheckingGuard {
    fn drop(&mut self) {
        self.checking
            .lock()
            .expect("checking set poisoned")
            .remove(&self.tenant);
    }
}

impl IpRangeChecker {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        fleet: Arc<Fleet>,
        provider: Arc<dyn CloudProvider>,
        bus: Arc<EventBus>,
        max_attempts: usize,
        attempt_pause: Duration,
    ) -> Self {
        Self {
            store,
            fleet,
            provider,
            bus,
            locks: KeyedMutex::new(),
            checking: Arc::new(Mutex::new(HashSet::new())),
            max_attempts,
            attempt_pause,
        }
    }

    pub fn is_checking(&self, tenant: u64) -> bool {
        self.checking
            .lock()
            .expect("checking set poisoned")
            .contains(&tenant)
    }

    /// Check one tenant's instances, rotating non-compliant IPs until they
    /// match or the per-instance budget runs out.
    pub async fn check_one(&self, tenant: u64, mut shutdown: watch::Receiver<bool>) {
        if !self
            .checking
            .lock()
            .expect("checking set poisoned")
            .insert(tenant)
        {
            tracing::debug!(tenant, "ip range check already running; skipping");
            return;
        }
        let _checking = CheckingGuard {
            checking: self.checking.clone(),
            tenant,
        };
        let _guard = self.locks.lock(&tenant.to_string()).await;

        let config = match self.store.monitor_config(tenant).await {
            Ok(Some(config)) if config.ip_range_enabled => config,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(tenant, error = %err, "failed to load monitor config for ip check");
                return;
            }
        };

        for instance in self.fleet.list_by_tenant(tenant) {
            let prefix = config.ip_prefix_for(instance.region);
            if prefix.is_empty() || instance.ipv4.starts_with(prefix) {
                continue;
            }

            tracing::info!(
                tenant,
                instance_id = %instance.instance_id,
                region = %instance.region,
                ipv4 = %instance.ipv4,
                prefix,
                "instance outside required prefix; rotating"
            );

            'rotate: for attempt in 1..=self.max_attempts {
                // Re-read the live record: the instance may have been
                // evicted, or another path may have fixed the IP already.
                match self.fleet.get(&instance.instance_id) {
                    None => break 'rotate,
                    Some(live) if live.ipv4.starts_with(prefix) => break 'rotate,
                    Some(_) => {}
                }

                match self
                    .provider
                    .change_instance_ip(instance.region, &instance.instance_id)
                    .await
                {
                    Ok(new_ip) => {
                        self.bus.publish_ip_change(&instance.instance_id, &new_ip);
                        if new_ip.starts_with(prefix) {
                            tracing::info!(
                                tenant,
                                instance_id = %instance.instance_id,
                                new_ip = %new_ip,
                                attempt,
                                "instance ip now compliant"
                            );
                            break 'rotate;
                        }
                    }
                    Err(err) if err.kind == ProviderErrorKind::Other => {
                        tracing::warn!(
                            instance_id = %instance.instance_id,
                            attempt,
                            error = %err,
                            "ip rotation attempt failed"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            instance_id = %instance.instance_id,
                            error = %err,
                            "terminal provider error; abandoning rotation"
                        );
                        break 'rotate;
                    }
                }

                if attempt == self.max_attempts {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        attempts = attempt,
                        "rotation budget exhausted without compliance"
                    );
                    break 'rotate;
                }

                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(self.attempt_pause) => {}
                }
            }
        }
    }

    /// Fan out over every tenant with the gate enabled. Tenants already
    /// being checked filter themselves out.
    pub async fn check_all(&self, shutdown: watch::Receiver<bool>) {
        let configs = match self.store.monitor_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load monitor configs for ip check");
                return;
            }
        };

        let tenants: Vec<u64> = configs
            .iter()
            .filter(|c| c.ip_range_enabled)
            .map(|c| c.tenant_id)
            .collect();

        stream::iter(tenants)
            .for_each_concurrent(CHECK_CONCURRENCY, |tenant| {
                let shutdown = shutdown.clone();
                async move {
                    self.check_one(tenant, shutdown).await;
                }
            })
            .await;
    }

    pub async fn run_loop(
        self: Arc<Self>,
        initial_delay: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }
        loop {
            self.check_all(shutdown.clone()).await;
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

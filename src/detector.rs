use crate::fleet::Fleet;
use crate::history::MakeupHistory;
use crate::keyed::KeyedMutex;
use crate::model::{MonitorConfig, Region, REGIONS};
use crate::queue::MakeupQueue;
use crate::store::ConfigStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Computes per-(tenant, region) shortfalls and feeds the makeup queue.
///
/// The all-tenants pass locks each (tenant, region) composite; the
/// single-tenant pass takes one tenant-wide lock and debounces before
/// computing, because it is triggered by eviction bursts. The two key
/// namespaces share one map: composite keys always contain ':'.
pub struct ShortfallDetector {
    store: Arc<dyn ConfigStore>,
    fleet: Arc<Fleet>,
    queue: Arc<MakeupQueue>,
    history: Arc<MakeupHistory>,
    locks: KeyedMutex,
    /// Window during which a recorded makeup decision suppresses new ones.
    cooldown: Duration,
    /// Settle time before a heartbeat-triggered pass computes anything.
    debounce: Duration,
    warned_missing: Mutex<HashSet<u64>>,
}

impl ShortfallDetector {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        fleet: Arc<Fleet>,
        queue: Arc<MakeupQueue>,
        history: Arc<MakeupHistory>,
        cooldown: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            fleet,
            queue,
            history,
            locks: KeyedMutex::new(),
            cooldown,
            debounce,
            warned_missing: Mutex::new(HashSet::new()),
        }
    }

    /// Periodic pass over every enabled tenant and all managed regions.
    pub async fn detect_all(&self) {
        let configs = match self.store.monitor_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load monitor configs; skipping pass");
                return;
            }
        };

        for config in configs.iter().filter(|c| c.enabled) {
            for region in REGIONS {
                let key = format!("{}:{}", config.tenant_id, region);
                let _guard = self.locks.lock(&key).await;
                self.evaluate(config, region);
            }
        }
    }

    /// Single-tenant pass, triggered when the tenant loses instances.
    pub async fn detect_one(&self, tenant: u64) {
        let _guard = self.locks.lock(&tenant.to_string()).await;

        // Evictions arrive in bursts (one sweep can drop several
        // instances); give the burst time to finish before counting.
        tokio::time::sleep(self.debounce).await;

        let config = match self.store.monitor_config(tenant).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                if self.warned_missing.lock().expect("warn set poisoned").insert(tenant) {
                    tracing::warn!(tenant, "no monitor config; skipping detection");
                }
                return;
            }
            Err(err) => {
                tracing::warn!(tenant, error = %err, "failed to load monitor config");
                return;
            }
        };
        if !config.enabled {
            return;
        }

        for region in REGIONS {
            self.evaluate(&config, region);
        }
    }

    /// The shortfall calculation. Caller holds the appropriate lock.
    fn evaluate(&self, config: &MonitorConfig, region: Region) {
        let tenant = config.tenant_id;
        let threshold = config.threshold_for(region);
        if threshold == 0 {
            return;
        }

        let current = self.fleet.count_by(tenant, region) as u32;
        let pending = self.queue.pending_for(tenant, region);
        let effective = current.saturating_add(pending);
        if effective >= threshold {
            return;
        }
        let need = threshold - effective;

        if self.history.count_within(tenant, region, self.cooldown) > 0 {
            tracing::info!(tenant, region = %region, need, "shortfall in cooldown; skipping");
            return;
        }

        tracing::info!(tenant, region = %region, threshold, current, pending, need, "shortfall detected");
        self.history.add(tenant, region, need);
        self.queue.enqueue(tenant, region, need);
    }
}

use crate::admin::Admin;
use crate::bus::EventBus;
use crate::config::KeeperConfig;
use crate::detector::ShortfallDetector;
use crate::fleet::{Fleet, FleetEvents};
use crate::history::MakeupHistory;
use crate::ipcheck::IpRangeChecker;
use crate::notify::Notifier;
use crate::pool::{AccountPool, PoolEvents};
use crate::provider::CloudProvider;
use crate::provision::Provisioner;
use crate::queue::{MakeupQueue, QueueEvents};
use crate::store::ConfigStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Construction-time root: one instance of every component, wired through
/// explicit references. Business logic never reaches for globals.
pub struct ControlPlane {
    pub config: KeeperConfig,
    /// Kept on the root so external ingestion paths (e.g. credential
    /// import) can publish lifecycle events.
    #[allow(dead_code)]
    pub bus: Arc<EventBus>,
    pub pool: Arc<AccountPool>,
    pub fleet: Arc<Fleet>,
    pub history: Arc<MakeupHistory>,
    pub queue: Arc<MakeupQueue>,
    pub detector: Arc<ShortfallDetector>,
    pub checker: Arc<IpRangeChecker>,
    #[allow(dead_code)]
    pub store: Arc<dyn ConfigStore>,
}

impl ControlPlane {
    pub fn new(
        config: KeeperConfig,
        store: Arc<dyn ConfigStore>,
        provider: Arc<dyn CloudProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(AccountPool::new(
            bus.clone(),
            store.clone(),
            config.credential_capacity,
        ));
        let fleet = Arc::new(Fleet::new(notifier, config.ip_lock_ttl, config.staleness));
        let history = Arc::new(MakeupHistory::new(config.history_dedup));
        let provisioner = Arc::new(Provisioner::new(pool.clone(), store.clone(), provider.clone()));
        let queue = Arc::new(MakeupQueue::new(
            pool.clone(),
            provisioner,
            config.queue_tuning(),
        ));
        let detector = Arc::new(ShortfallDetector::new(
            store.clone(),
            fleet.clone(),
            queue.clone(),
            history.clone(),
            config.cooldown,
            config.debounce,
        ));
        let checker = Arc::new(IpRangeChecker::new(
            store.clone(),
            fleet.clone(),
            provider,
            bus.clone(),
            config.ip_rotate_attempts,
            config.ip_rotate_pause,
        ));

        // Bus wiring: the bus holds the listeners, the components hold the
        // bus; traversal from bus to component happens only through the
        // listener interface.
        bus.subscribe_accounts(Arc::new(PoolEvents { pool: pool.clone() }));
        bus.subscribe_accounts(Arc::new(QueueEvents { queue: queue.clone() }));
        bus.subscribe_ip_changes(Arc::new(FleetEvents { fleet: fleet.clone() }));

        Self {
            config,
            bus,
            pool,
            fleet,
            history,
            queue,
            detector,
            checker,
            store,
        }
    }

    pub fn admin(&self, shutdown: watch::Receiver<bool>) -> Admin {
        Admin::new(
            self.pool.clone(),
            self.fleet.clone(),
            self.queue.clone(),
            self.history.clone(),
            self.detector.clone(),
            self.checker.clone(),
            shutdown,
        )
    }

    /// Spawn every periodic task. All loops terminate on the shutdown
    /// signal; none of them blocks another's cadence.
    pub fn spawn_loops(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.queue.clone().worker_loop(shutdown.clone()),
        ));
        handles.push(tokio::spawn(self.queue.clone().sweep_loop(shutdown.clone())));
        handles.push(tokio::spawn(
            self.queue.clone().region_reset_loop(shutdown.clone()),
        ));

        // Staleness sweep; evictions fan out into single-tenant detection.
        {
            let fleet = self.fleet.clone();
            let detector = self.detector.clone();
            let interval = self.config.sweep_interval;
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => {}
                    }
                    for tenant in fleet.sweep_stale() {
                        let detector = detector.clone();
                        tokio::spawn(async move { detector.detect_one(tenant).await });
                    }
                }
            }));
        }

        // All-tenants detection pass.
        {
            let detector = self.detector.clone();
            let interval = self.config.detect_interval;
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the immediate tick: after a restart the fleet view
                // is empty until instances heartbeat again, and a pass on
                // the empty view would provision for every tenant.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => {}
                    }
                    detector.detect_all().await;
                }
            }));
        }

        handles.push(tokio::spawn(self.checker.clone().run_loop(
            self.config.ip_check_delay,
            self.config.ip_check_interval,
            shutdown,
        )));

        handles
    }
}

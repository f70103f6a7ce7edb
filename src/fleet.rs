use crate::bus::IpChangeListener;
use crate::model::{HeartbeatRecord, Region};
use crate::notify::Notifier;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// One running instance as last reported by its heartbeat.
#[derive(Debug, Clone)]
pub struct LiveInstance {
    pub instance_id: String,
    pub instance_type: String,
    pub tenant_id: u64,
    pub credential_id: String,
    pub ipv4: String,
    pub region: Region,
    pub launched_at: u64,
    pub last_seen: Instant,
}

impl LiveInstance {
    pub fn seen_secs_ago(&self) -> u64 {
        self.last_seen.elapsed().as_secs()
    }
}

#[derive(Debug, Clone)]
struct IpLock {
    ipv4: String,
    expires: Instant,
}

/// Live view of the running fleet, updated by heartbeats.
///
/// Reads dominate writes, so instances sit behind a reader/writer lock. The
/// IP-lock table has its own mutex; when both are needed the lock table is
/// always taken (and released) before the fleet lock.
pub struct Fleet {
    instances: RwLock<HashMap<String, LiveInstance>>,
    ip_locks: Mutex<HashMap<String, IpLock>>,
    notifier: Arc<dyn Notifier>,
    /// How long a provider-reported IP overrides heartbeat-reported IPs.
    lock_ttl: Duration,
    /// Instances unseen for longer than this are evicted.
    staleness: Duration,
}

impl Fleet {
    pub fn new(notifier: Arc<dyn Notifier>, lock_ttl: Duration, staleness: Duration) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            ip_locks: Mutex::new(HashMap::new()),
            notifier,
            lock_ttl,
            staleness,
        }
    }

    /// Ingest one heartbeat. The IP-lock table overrides the reported IP
    /// while a non-expired lock exists; first sight of an instance emits an
    /// online notification.
    pub fn upsert_heartbeat(&self, mut hb: HeartbeatRecord) {
        {
            let mut locks = self.ip_locks.lock().expect("ip lock table poisoned");
            if let Some(lock) = locks.get(&hb.instance_id) {
                if lock.expires > Instant::now() {
                    hb.ipv4 = lock.ipv4.clone();
                } else {
                    locks.remove(&hb.instance_id);
                }
            }
        }

        let instance = LiveInstance {
            instance_id: hb.instance_id.clone(),
            instance_type: hb.instance_type,
            tenant_id: hb.tenant_id,
            credential_id: hb.credential_id,
            ipv4: hb.ipv4,
            region: hb.region,
            launched_at: hb.launched_at,
            last_seen: Instant::now(),
        };

        let is_new = {
            let mut instances = self.instances.write().expect("fleet poisoned");
            instances.insert(hb.instance_id.clone(), instance.clone()).is_none()
        };

        if is_new {
            tracing::info!(
                instance_id = %instance.instance_id,
                tenant = instance.tenant_id,
                region = %instance.region,
                ipv4 = %instance.ipv4,
                "instance joined fleet"
            );
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                notifier
                    .instance_online(
                        instance.tenant_id,
                        &instance.instance_id,
                        instance.region,
                        &instance.ipv4,
                    )
                    .await;
            });
        }
    }

    /// Evict instances whose last heartbeat is older than the staleness
    /// bound, emit offline notifications, and prune expired IP locks.
    /// Returns the tenants that lost instances so the caller can trigger
    /// single-tenant detection.
    pub fn sweep_stale(&self) -> HashSet<u64> {
        let now = Instant::now();

        // Lock order: ip_locks before instances, as everywhere else.
        {
            let mut locks = self.ip_locks.lock().expect("ip lock table poisoned");
            locks.retain(|_, lock| lock.expires > now);
        }

        let evicted: Vec<LiveInstance> = {
            let mut instances = self.instances.write().expect("fleet poisoned");
            let stale_ids: Vec<String> = instances
                .values()
                .filter(|i| now.duration_since(i.last_seen) > self.staleness)
                .map(|i| i.instance_id.clone())
                .collect();
            stale_ids
                .iter()
                .filter_map(|id| instances.remove(id))
                .collect()
        };

        let mut tenants = HashSet::new();
        for instance in evicted {
            tracing::warn!(
                instance_id = %instance.instance_id,
                tenant = instance.tenant_id,
                region = %instance.region,
                unseen_s = now.duration_since(instance.last_seen).as_secs(),
                "instance evicted as stale"
            );
            tenants.insert(instance.tenant_id);
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                notifier
                    .instance_offline(
                        instance.tenant_id,
                        &instance.instance_id,
                        instance.region,
                        &instance.ipv4,
                    )
                    .await;
            });
        }
        tenants
    }

    /// Provider reported a fresh IP before the instance's cached heartbeat
    /// caught up: pin the new IP for the lock TTL and rewrite the live
    /// record right away.
    pub fn on_ip_change(&self, instance_id: &str, new_ip: &str) {
        {
            let mut locks = self.ip_locks.lock().expect("ip lock table poisoned");
            locks.insert(
                instance_id.to_string(),
                IpLock {
                    ipv4: new_ip.to_string(),
                    expires: Instant::now() + self.lock_ttl,
                },
            );
        }

        let mut instances = self.instances.write().expect("fleet poisoned");
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.ipv4 = new_ip.to_string();
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<LiveInstance> {
        self.instances
            .read()
            .expect("fleet poisoned")
            .get(instance_id)
            .cloned()
    }

    pub fn list_all(&self) -> Vec<LiveInstance> {
        self.instances
            .read()
            .expect("fleet poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_by_tenant(&self, tenant: u64) -> Vec<LiveInstance> {
        self.instances
            .read()
            .expect("fleet poisoned")
            .values()
            .filter(|i| i.tenant_id == tenant)
            .cloned()
            .collect()
    }

    pub fn count_by(&self, tenant: u64, region: Region) -> usize {
        self.instances
            .read()
            .expect("fleet poisoned")
            .values()
            .filter(|i| i.tenant_id == tenant && i.region == region)
            .count()
    }
}

/// Bus subscription delivering provider IP changes into the fleet.
pub struct FleetEvents {
    pub fleet: Arc<Fleet>,
}

impl IpChangeListener for FleetEvents {
    fn on_ip_change(&self, instance_id: &str, new_ip: &str) {
        self.fleet.on_ip_change(instance_id, new_ip);
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::notify::Notifier;
    use async_trait::async_trait;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub online: Mutex<Vec<String>>,
        pub offline: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn instance_online(&self, _tenant: u64, instance_id: &str, _region: Region, _ipv4: &str) {
            self.online.lock().unwrap().push(instance_id.to_string());
        }

        async fn instance_offline(&self, _tenant: u64, instance_id: &str, _region: Region, _ipv4: &str) {
            self.offline.lock().unwrap().push(instance_id.to_string());
        }
    }

    pub fn heartbeat(instance_id: &str, tenant: u64, region: Region, ipv4: &str) -> HeartbeatRecord {
        HeartbeatRecord {
            instance_id: instance_id.to_string(),
            instance_type: "c5n.large".to_string(),
            tenant_id: tenant,
            credential_id: "2".to_string(),
            ipv4: ipv4.to_string(),
            region,
            launched_at: 1_700_000_000,
            reported_at: 1_700_000_042,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::{heartbeat, RecordingNotifier};
    use super::*;

    fn fleet(notifier: Arc<RecordingNotifier>, lock_ttl: Duration, staleness: Duration) -> Fleet {
        Fleet::new(notifier, lock_ttl, staleness)
    }

    #[tokio::test]
    async fn duplicate_heartbeat_stores_once_and_notifies_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let fleet = fleet(notifier.clone(), Duration::from_secs(30), Duration::from_secs(60));

        fleet.upsert_heartbeat(heartbeat("i-1", 7, Region::Hk, "9.9.9.9"));
        fleet.upsert_heartbeat(heartbeat("i-1", 7, Region::Hk, "9.9.9.9"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fleet.list_all().len(), 1);
        assert_eq!(notifier.online.lock().unwrap().len(), 1);
        assert_eq!(fleet.count_by(7, Region::Hk), 1);
        assert_eq!(fleet.count_by(7, Region::Jp), 0);
    }

    #[tokio::test]
    async fn ip_lock_overlays_heartbeats_until_expiry() {
        let notifier = Arc::new(RecordingNotifier::default());
        let fleet = fleet(notifier, Duration::from_millis(60), Duration::from_secs(60));

        fleet.on_ip_change("i-1", "1.2.3.4");
        fleet.upsert_heartbeat(heartbeat("i-1", 7, Region::Hk, "9.9.9.9"));
        assert_eq!(fleet.get("i-1").unwrap().ipv4, "1.2.3.4");

        tokio::time::sleep(Duration::from_millis(90)).await;
        fleet.upsert_heartbeat(heartbeat("i-1", 7, Region::Hk, "9.9.9.9"));
        assert_eq!(fleet.get("i-1").unwrap().ipv4, "9.9.9.9");
        assert!(fleet.ip_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ip_change_rewrites_live_record_immediately() {
        let notifier = Arc::new(RecordingNotifier::default());
        let fleet = fleet(notifier, Duration::from_secs(30), Duration::from_secs(60));

        fleet.upsert_heartbeat(heartbeat("i-1", 7, Region::Sg, "9.9.9.9"));
        fleet.on_ip_change("i-1", "1.2.3.4");
        assert_eq!(fleet.get("i-1").unwrap().ipv4, "1.2.3.4");
    }

    #[tokio::test]
    async fn stale_instances_are_evicted_with_offline_notifications() {
        let notifier = Arc::new(RecordingNotifier::default());
        let fleet = fleet(notifier.clone(), Duration::from_secs(30), Duration::from_millis(40));

        fleet.upsert_heartbeat(heartbeat("i-1", 7, Region::Hk, "9.9.9.9"));
        fleet.upsert_heartbeat(heartbeat("i-2", 8, Region::Jp, "9.9.9.8"));

        // Nothing stale yet.
        assert!(fleet.sweep_stale().is_empty());

        tokio::time::sleep(Duration::from_millis(70)).await;
        fleet.upsert_heartbeat(heartbeat("i-2", 8, Region::Jp, "9.9.9.8"));

        let tenants = fleet.sweep_stale();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(tenants, HashSet::from([7]));
        assert!(fleet.get("i-1").is_none());
        assert!(fleet.get("i-2").is_some());
        assert_eq!(notifier.offline.lock().unwrap().as_slice(), ["i-1"]);
    }
}

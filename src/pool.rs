use crate::bus::{AccountEvent, AccountListener, EventBus};
use crate::model::{units_for, Region};
use crate::store::{ConfigStore, CredentialRecord};
use eyre::Result;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Why a credential is benched. Exactly one reason applies while a
/// credential is globally skipped; per-type skips carry their own reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    RegionNotEnabled,
    RegionPendingVerification,
    RegionQuotaExhausted,
    RegionCapacityFull,
    RegionCredentialsFailed,
    RegionOther,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::RegionNotEnabled => "region not enabled",
            SkipReason::RegionPendingVerification => "region pending verification",
            SkipReason::RegionQuotaExhausted => "region quota exhausted",
            SkipReason::RegionCapacityFull => "region capacity full",
            SkipReason::RegionCredentialsFailed => "region credentials failed",
            SkipReason::RegionOther => "region other",
        }
    }

    /// Reasons the hourly HK re-enablement sweep is allowed to clear.
    pub fn is_region_enablement(self) -> bool {
        matches!(
            self,
            SkipReason::RegionNotEnabled | SkipReason::RegionPendingVerification
        )
    }
}

#[derive(Debug, Clone)]
struct PooledCredential {
    record: CredentialRecord,
    skipped: Option<SkipReason>,
    skipped_types: HashMap<String, SkipReason>,
    /// Units consumed in the credential's region since the last reset.
    used_capacity: u32,
    /// Last provisioning error seen on this credential, for operators.
    last_error: Option<String>,
}

impl PooledCredential {
    fn fresh(record: CredentialRecord) -> Self {
        Self {
            record,
            skipped: None,
            skipped_types: HashMap::new(),
            used_capacity: 0,
            last_error: None,
        }
    }

    fn usable(&self) -> bool {
        self.skipped.is_none() && self.skipped_types.is_empty()
    }
}

/// Operator-facing snapshot of one pool entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub id: String,
    pub tenant_id: u64,
    pub region: Region,
    pub used_capacity: u32,
    pub skipped: Option<SkipReason>,
    pub skipped_types: Vec<(String, SkipReason)>,
    pub last_error: Option<String>,
    pub provider_status: Option<String>,
}

/// Selection order: numeric id ascending, lexicographic for ties and
/// non-numeric ids. Deterministic ordering is load-bearing for selection.
fn cmp_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn truncate_note(note: &str) -> String {
    const MAX: usize = 240;
    let mut out: String = note.chars().take(MAX).collect();
    if out.len() < note.len() {
        out.push_str("...");
    }
    out
}

/// Indexed mutable set of provisioning credentials.
///
/// One mutex guards the whole map including selection decisions; the mutex
/// is never held across a bus publish or a provider call.
pub struct AccountPool {
    inner: Mutex<HashMap<String, PooledCredential>>,
    bus: Arc<EventBus>,
    store: Arc<dyn ConfigStore>,
    /// Per-credential region capacity budget in units.
    capacity: u32,
}

impl AccountPool {
    pub fn new(bus: Arc<EventBus>, store: Arc<dyn ConfigStore>, capacity: u32) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            bus,
            store,
            capacity,
        }
    }

    /// Replace all credentials from the external store, skipping records
    /// marked permanently invalid. Transient skip state of credentials that
    /// survive the reload is preserved; only an explicit reset clears it.
    pub async fn load(&self) -> Result<()> {
        let records = self.store.credentials().await?;

        let mut added = 0usize;
        {
            let mut inner = self.inner.lock().expect("pool poisoned");
            let mut next: HashMap<String, PooledCredential> = HashMap::new();
            for record in records {
                if record.invalidated {
                    tracing::debug!(id = %record.id, "skipping invalidated credential on load");
                    continue;
                }
                let id = record.id.clone();
                match inner.remove(&id) {
                    Some(mut existing) => {
                        existing.record = record;
                        next.insert(id, existing);
                    }
                    None => {
                        added += 1;
                        next.insert(id, PooledCredential::fresh(record));
                    }
                }
            }
            *inner = next;
        }

        tracing::info!(added, total = self.size(), "credential pool loaded");
        if added > 0 {
            self.bus.publish(AccountEvent::Added, "");
        }
        Ok(())
    }

    /// Upsert a single credential. Publishes `Added` only for new ids.
    pub fn add(&self, record: CredentialRecord) {
        let id = record.id.clone();
        let is_new = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            match inner.get_mut(&id) {
                Some(existing) => {
                    existing.record = record;
                    false
                }
                None => {
                    inner.insert(id.clone(), PooledCredential::fresh(record));
                    true
                }
            }
        };
        if is_new {
            tracing::info!(id = %id, "credential added to pool");
            self.bus.publish(AccountEvent::Added, &id);
        }
    }

    pub fn remove(&self, id: &str) {
        let removed = self
            .inner
            .lock()
            .expect("pool poisoned")
            .remove(id)
            .is_some();
        if removed {
            tracing::info!(id, "credential removed from pool");
        }
    }

    pub fn mark_skipped(&self, id: &str, reason: SkipReason, note: Option<&str>) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if let Some(cred) = inner.get_mut(id) {
            cred.skipped = Some(reason);
            if let Some(note) = note {
                cred.last_error = Some(truncate_note(note));
            }
            tracing::warn!(id, reason = reason.as_str(), "credential skipped");
        }
    }

    pub fn mark_instance_type_skipped(
        &self,
        id: &str,
        instance_type: &str,
        reason: SkipReason,
        note: Option<&str>,
    ) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if let Some(cred) = inner.get_mut(id) {
            cred.skipped_types.insert(instance_type.to_string(), reason);
            if let Some(note) = note {
                cred.last_error = Some(truncate_note(note));
            }
            tracing::warn!(id, instance_type, reason = reason.as_str(), "instance type skipped");
        }
    }

    /// Clear skip flags, the per-type set, and the usage counter. Publishes
    /// `Reset` if the credential went from unusable to usable.
    pub fn reset(&self, id: &str) -> bool {
        let became_usable = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            let Some(cred) = inner.get_mut(id) else {
                return false;
            };
            let was_usable = cred.usable();
            cred.skipped = None;
            cred.skipped_types.clear();
            cred.used_capacity = 0;
            cred.last_error = None;
            !was_usable
        };
        if became_usable {
            tracing::info!(id, "credential reset");
            self.bus.publish(AccountEvent::Reset, id);
        }
        true
    }

    /// Reset every credential. Publishes a single `ManualReset` if any
    /// credential went from unusable to usable.
    pub fn reset_all(&self) -> usize {
        let woke = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            let mut woke = 0usize;
            for cred in inner.values_mut() {
                if !cred.usable() {
                    woke += 1;
                }
                cred.skipped = None;
                cred.skipped_types.clear();
                cred.used_capacity = 0;
                cred.last_error = None;
            }
            woke
        };
        if woke > 0 {
            tracing::info!(woke, "pool reset by operator");
            self.bus.publish(AccountEvent::ManualReset, "");
        }
        woke
    }

    /// Reset all credentials benched for region-enablement reasons (the
    /// hourly HK sweep). Returns the ids that were reset.
    pub fn reset_region_enablement_skips(&self) -> Vec<String> {
        let ids: Vec<String> = {
            let inner = self.inner.lock().expect("pool poisoned");
            inner
                .values()
                .filter(|c| c.skipped.is_some_and(|r| r.is_region_enablement()))
                .map(|c| c.record.id.clone())
                .collect()
        };
        for id in &ids {
            self.reset(id);
        }
        ids
    }

    /// Record successful provisioning. Capacity reaching the budget benches
    /// the credential until an operator (or the hourly sweep) resets it.
    pub fn increment_usage(&self, id: &str, instance_type: &str, units: u32) {
        let full = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            let Some(cred) = inner.get_mut(id) else {
                return;
            };
            cred.used_capacity = cred.used_capacity.saturating_add(units);
            tracing::debug!(id, instance_type, used = cred.used_capacity, "usage incremented");
            cred.used_capacity >= self.capacity
        };
        if full {
            self.mark_skipped(id, SkipReason::RegionCapacityFull, None);
        }
    }

    /// Deterministic selection: first credential in ascending id order that
    /// matches the region, is not skipped globally or for this type, and has
    /// room for the request.
    pub fn select_for(&self, instance_type: &str, region: Region) -> Option<CredentialRecord> {
        let units = units_for(instance_type);

        let mut full_ids: Vec<String> = Vec::new();
        let selected = {
            let inner = self.inner.lock().expect("pool poisoned");
            let mut ids: Vec<&String> = inner.keys().collect();
            ids.sort_by(|a, b| cmp_ids(a, b));

            let mut selected = None;
            for id in ids {
                let cred = &inner[id];
                if cred.record.region != region {
                    continue;
                }
                if cred.skipped.is_some() {
                    continue;
                }
                if cred.skipped_types.contains_key(instance_type) {
                    continue;
                }
                if cred.used_capacity >= self.capacity {
                    // Selection never mutates; marking happens after the
                    // lock is released to avoid re-entering the pool.
                    full_ids.push(id.clone());
                    continue;
                }
                if cred.used_capacity + units > self.capacity {
                    continue;
                }
                selected = Some(cred.record.clone());
                break;
            }
            selected
        };

        for id in full_ids {
            self.mark_skipped(&id, SkipReason::RegionCapacityFull, None);
        }

        selected
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("pool poisoned").len()
    }

    pub fn status(&self) -> Vec<CredentialStatus> {
        let inner = self.inner.lock().expect("pool poisoned");
        let mut out: Vec<CredentialStatus> = inner
            .values()
            .map(|c| CredentialStatus {
                id: c.record.id.clone(),
                tenant_id: c.record.tenant_id,
                region: c.record.region,
                used_capacity: c.used_capacity,
                skipped: c.skipped,
                skipped_types: c
                    .skipped_types
                    .iter()
                    .map(|(t, r)| (t.clone(), *r))
                    .collect(),
                last_error: c.last_error.clone(),
                provider_status: c.record.provider_status.clone(),
            })
            .collect();
        out.sort_by(|a, b| cmp_ids(&a.id, &b.id));
        out
    }
}

/// Bus subscription: the pool reacts to upstream deletions. An empty
/// account id means the deletion set is unknown and the pool reloads.
pub struct PoolEvents {
    pub pool: Arc<AccountPool>,
}

impl AccountListener for PoolEvents {
    fn on_account_event(&self, event: AccountEvent, account_id: &str) {
        if event != AccountEvent::Deleted {
            return;
        }
        if account_id.is_empty() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                if let Err(err) = pool.load().await {
                    tracing::error!(error = %err, "pool reload after deletion failed");
                }
            });
        } else {
            self.pool.remove(account_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::MemStore;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct EventCounter {
        added: AtomicUsize,
        reset: AtomicUsize,
        manual: AtomicUsize,
    }

    impl EventCounter {
        fn new() -> Self {
            Self {
                added: AtomicUsize::new(0),
                reset: AtomicUsize::new(0),
                manual: AtomicUsize::new(0),
            }
        }
    }

    impl AccountListener for EventCounter {
        fn on_account_event(&self, event: AccountEvent, _account_id: &str) {
            match event {
                AccountEvent::Added => self.added.fetch_add(1, AtomicOrdering::SeqCst),
                AccountEvent::Reset => self.reset.fetch_add(1, AtomicOrdering::SeqCst),
                AccountEvent::ManualReset => self.manual.fetch_add(1, AtomicOrdering::SeqCst),
                AccountEvent::Deleted => 0,
            };
        }
    }

    fn record(id: &str, region: Region) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            tenant_id: 7,
            access_key_id: format!("AK{id}"),
            secret_access_key: "secret".to_string(),
            region,
            provider_status: None,
            invalidated: false,
        }
    }

    fn has(pool: &AccountPool, id: &str) -> bool {
        pool.status().iter().any(|c| c.id == id)
    }

    fn pool_with(records: Vec<CredentialRecord>) -> (Arc<AccountPool>, Arc<EventCounter>) {
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(EventCounter::new());
        bus.subscribe_accounts(counter.clone());
        let store = Arc::new(MemStore::default());
        let pool = Arc::new(AccountPool::new(bus, store, 4));
        for r in records {
            pool.add(r);
        }
        (pool, counter)
    }

    #[test]
    fn id_order_is_numeric_then_lexicographic() {
        assert_eq!(cmp_ids("2", "10"), Ordering::Less);
        assert_eq!(cmp_ids("10", "2"), Ordering::Greater);
        assert_eq!(cmp_ids("abc", "abd"), Ordering::Less);
        assert_eq!(cmp_ids("2", "2"), Ordering::Equal);
    }

    #[test]
    fn selection_is_ascending_and_capacity_benches_credentials() {
        let (pool, _) = pool_with(vec![record("2", Region::Hk), record("10", Region::Hk)]);

        let picked = pool.select_for("c5n.large", Region::Hk).unwrap();
        assert_eq!(picked.id, "2");

        for _ in 0..4 {
            pool.increment_usage("2", "c5n.large", 1);
        }

        let status = pool.status();
        let two = status.iter().find(|c| c.id == "2").unwrap();
        assert_eq!(two.skipped, Some(SkipReason::RegionCapacityFull));
        assert_eq!(two.used_capacity, 4);

        let picked = pool.select_for("c5n.large", Region::Hk).unwrap();
        assert_eq!(picked.id, "10");
    }

    #[test]
    fn selection_respects_region_type_skips_and_units() {
        let (pool, _) = pool_with(vec![record("1", Region::Jp), record("2", Region::Hk)]);

        // Region mismatch is not selectable.
        assert!(pool.select_for("c5n.large", Region::Sg).is_none());

        // Type skip hides the credential for that type only.
        pool.mark_instance_type_skipped("2", "c5n.2xlarge", SkipReason::RegionQuotaExhausted, None);
        assert!(pool.select_for("c5n.2xlarge", Region::Hk).is_none());
        assert_eq!(pool.select_for("c5n.large", Region::Hk).unwrap().id, "2");

        // A 2-unit request does not fit a credential at used=3, but the
        // credential is not benched for it either.
        pool.increment_usage("2", "c5n.large", 3);
        assert!(pool.select_for("c5n.xlarge", Region::Hk).is_none());
        assert_eq!(pool.select_for("c5n.large", Region::Hk).unwrap().id, "2");
        assert!(pool.status().iter().find(|c| c.id == "2").unwrap().skipped.is_none());
    }

    #[test]
    fn skip_then_reset_round_trips_and_publishes() {
        let (pool, counter) = pool_with(vec![record("3", Region::Sg)]);

        pool.mark_skipped("3", SkipReason::RegionOther, Some("boom"));
        pool.increment_usage("3", "c5n.large", 2);
        assert!(pool.select_for("c5n.large", Region::Sg).is_none());

        assert!(pool.reset("3"));
        assert_eq!(counter.reset.load(AtomicOrdering::SeqCst), 1);

        let status = pool.status().remove(0);
        assert!(status.skipped.is_none());
        assert!(status.skipped_types.is_empty());
        assert_eq!(status.used_capacity, 0);
        assert!(status.last_error.is_none());

        // Resetting an already-usable credential publishes nothing.
        assert!(pool.reset("3"));
        assert_eq!(counter.reset.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn reset_all_publishes_one_manual_reset() {
        let (pool, counter) = pool_with(vec![record("1", Region::Hk), record("2", Region::Hk)]);
        pool.mark_skipped("1", SkipReason::RegionQuotaExhausted, None);
        pool.mark_skipped("2", SkipReason::RegionOther, None);

        assert_eq!(pool.reset_all(), 2);
        assert_eq!(counter.manual.load(AtomicOrdering::SeqCst), 1);

        // Nothing benched, nothing published.
        assert_eq!(pool.reset_all(), 0);
        assert_eq!(counter.manual.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn region_enablement_sweep_only_touches_enablement_skips() {
        let (pool, _) = pool_with(vec![
            record("1", Region::Hk),
            record("2", Region::Hk),
            record("3", Region::Hk),
        ]);
        pool.mark_skipped("1", SkipReason::RegionNotEnabled, None);
        pool.mark_skipped("2", SkipReason::RegionPendingVerification, None);
        pool.mark_skipped("3", SkipReason::RegionQuotaExhausted, None);

        let mut reset = pool.reset_region_enablement_skips();
        reset.sort();
        assert_eq!(reset, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(
            pool.status().iter().filter(|c| c.skipped.is_some()).count(),
            1
        );
    }

    #[tokio::test]
    async fn load_preserves_transient_state_and_skips_invalidated() {
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(EventCounter::new());
        bus.subscribe_accounts(counter.clone());

        let store = Arc::new(MemStore::default());
        store.put_credentials(vec![record("1", Region::Hk), record("2", Region::Hk)]);

        let pool = Arc::new(AccountPool::new(bus, store.clone(), 4));
        pool.load().await.unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(counter.added.load(AtomicOrdering::SeqCst), 1);

        // Reload with no growth publishes nothing and keeps skip state.
        pool.mark_skipped("1", SkipReason::RegionOther, None);
        pool.load().await.unwrap();
        assert_eq!(counter.added.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(
            pool.status().iter().find(|c| c.id == "1").unwrap().skipped,
            Some(SkipReason::RegionOther)
        );

        // Invalidated records drop out on the next load.
        let mut invalid = record("2", Region::Hk);
        invalid.invalidated = true;
        store.put_credentials(vec![record("1", Region::Hk), invalid]);
        pool.load().await.unwrap();
        assert_eq!(pool.size(), 1);
        assert!(!has(&pool, "2"));
    }

    #[tokio::test]
    async fn deleted_event_removes_named_credential() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemStore::default());
        let pool = Arc::new(AccountPool::new(bus.clone(), store, 4));
        pool.add(record("5", Region::Jp));
        bus.subscribe_accounts(Arc::new(PoolEvents { pool: pool.clone() }));

        bus.publish(AccountEvent::Deleted, "5");
        assert!(!has(&pool, "5"));
    }

    #[tokio::test]
    async fn deleted_event_with_empty_id_reloads() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemStore::default());
        store.put_credentials(vec![record("9", Region::Sg)]);
        let pool = Arc::new(AccountPool::new(bus.clone(), store, 4));
        pool.add(record("5", Region::Jp));
        bus.subscribe_accounts(Arc::new(PoolEvents { pool: pool.clone() }));

        bus.publish(AccountEvent::Deleted, "");
        // The reload runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(has(&pool, "9"));
        assert!(!has(&pool, "5"));
    }
}

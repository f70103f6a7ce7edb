use crate::bus::{AccountEvent, AccountListener};
use crate::model::{now_unix, Region};
use crate::pool::AccountPool;
use crate::provision::Provisioner;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Waiting,
    InProgress,
    Done,
}

/// One replenishment task. Only the queue worker transitions status.
#[derive(Debug, Clone)]
pub struct MakeupTask {
    pub queue_id: String,
    pub tenant_id: u64,
    pub region: Region,
    pub total: u32,
    pub completed: u32,
    pub status: TaskStatus,
    pub created_unix: u64,
    pub added_at: Instant,
}

/// Queue timing knobs; production defaults live in `KeeperConfig`.
#[derive(Debug, Clone)]
pub struct QueueTuning {
    pub wake_capacity: usize,
    /// Re-schedule delay when a wake arrives while the worker is busy.
    pub busy_retry: Duration,
    /// Re-publish delay when the wake channel is full at enqueue time.
    pub enqueue_retry: Duration,
    /// Pacing sleep between provisioning attempts inside one task.
    pub attempt_pacing: Duration,
    /// Upper bound on the per-task retry counter (the effective bound is
    /// `min(pool size, this)`).
    pub max_retries: usize,
    /// Hard ceiling on one task-processing stint.
    pub safety_timeout: Duration,
    /// Park delay when no eligible credential exists.
    pub no_credential_retry: Duration,
    /// Sweep cadence and the waiting-age that triggers a re-publish.
    pub sweep_interval: Duration,
    pub republish_age: Duration,
    /// Cadence of the region-enablement credential reset sweep.
    pub region_reset_interval: Duration,
}

/// In-memory work queue of replenishment tasks with a single worker.
///
/// The busy gate serializes provisioning across the whole process; that is
/// what bounds provider request concurrency, so it must stay a singleton.
pub struct MakeupQueue {
    tasks: Mutex<HashMap<String, MakeupTask>>,
    wake_tx: mpsc::Sender<String>,
    /// The worker holds this only while parked in `recv`; the account-event
    /// re-arm path uses `try_lock` to drain stale wakes.
    wake_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    /// `Some(since)` while a task is being processed.
    busy: Mutex<Option<Instant>>,
    tuning: QueueTuning,
    pool: Arc<AccountPool>,
    provisioner: Arc<Provisioner>,
}

impl MakeupQueue {
    pub fn new(pool: Arc<AccountPool>, provisioner: Arc<Provisioner>, tuning: QueueTuning) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(tuning.wake_capacity.max(1));
        Self {
            tasks: Mutex::new(HashMap::new()),
            wake_tx,
            wake_rx: tokio::sync::Mutex::new(wake_rx),
            busy: Mutex::new(None),
            tuning,
            pool,
            provisioner,
        }
    }

    /// Create a fresh task (never merged into an existing one) and wake the
    /// worker.
    pub fn enqueue(&self, tenant: u64, region: Region, count: u32) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let queue_id = format!("{tenant}:{region}:{nanos}");

        let task = MakeupTask {
            queue_id: queue_id.clone(),
            tenant_id: tenant,
            region,
            total: count,
            completed: 0,
            status: TaskStatus::Waiting,
            created_unix: now_unix(),
            added_at: Instant::now(),
        };
        self.tasks
            .lock()
            .expect("task map poisoned")
            .insert(queue_id.clone(), task);

        tracing::info!(tenant, region = %region, count, queue_id = %queue_id, "makeup task enqueued");
        self.publish(queue_id.clone());
        queue_id
    }

    /// Units still owed by waiting tasks for (tenant, region); the detector
    /// subtracts this from the shortfall.
    pub fn pending_for(&self, tenant: u64, region: Region) -> u32 {
        self.tasks
            .lock()
            .expect("task map poisoned")
            .values()
            .filter(|t| {
                t.tenant_id == tenant && t.region == region && t.status == TaskStatus::Waiting
            })
            .map(|t| t.total.saturating_sub(t.completed))
            .sum()
    }

    pub fn snapshot(&self) -> Vec<MakeupTask> {
        let mut tasks: Vec<MakeupTask> = self
            .tasks
            .lock()
            .expect("task map poisoned")
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        tasks
    }

    /// Drop all tasks (operator escape hatch).
    pub fn clear_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        let n = tasks.len();
        tasks.clear();
        n
    }

    #[cfg(test)]
    pub(crate) fn try_take_wake(&self) -> Option<String> {
        self.wake_rx.try_lock().ok()?.try_recv().ok()
    }

    fn publish(&self, queue_id: String) {
        match self.wake_tx.try_send(queue_id) {
            Ok(()) => {}
            Err(TrySendError::Full(queue_id)) => {
                let tx = self.wake_tx.clone();
                let delay = self.tuning.enqueue_retry;
                tracing::warn!(queue_id = %queue_id, "wake channel full; retrying publish");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(queue_id).await.is_err() {
                        tracing::warn!("wake channel closed during deferred publish");
                    }
                });
            }
            Err(TrySendError::Closed(queue_id)) => {
                tracing::warn!(queue_id = %queue_id, "wake channel closed; wake dropped");
            }
        }
    }

    fn republish_after(&self, queue_id: String, delay: Duration) {
        let tx = self.wake_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(queue_id).await;
        });
    }

    fn busy_since(&self) -> Option<Instant> {
        *self.busy.lock().expect("busy gate poisoned")
    }

    fn set_busy(&self) {
        *self.busy.lock().expect("busy gate poisoned") = Some(Instant::now());
    }

    fn clear_busy(&self) {
        *self.busy.lock().expect("busy gate poisoned") = None;
    }

    fn set_waiting(&self, queue_id: &str) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(task) = tasks.get_mut(queue_id) {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Waiting;
            }
        }
    }

    /// Record one provisioned instance; returns true when the task is
    /// complete (and marks it done).
    fn record_success(&self, queue_id: &str) -> bool {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        let Some(task) = tasks.get_mut(queue_id) else {
            return true;
        };
        task.completed = (task.completed + 1).min(task.total);
        if task.completed >= task.total {
            task.status = TaskStatus::Done;
            tracing::info!(queue_id, total = task.total, "makeup task done");
            return true;
        }
        false
    }

    /// Single worker: receives queue ids, processes one task at a time
    /// under the safety timeout, and survives panics in task processing.
    pub async fn worker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let maybe_id = {
                let mut rx = self.wake_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    id = rx.recv() => id,
                }
            };
            let Some(queue_id) = maybe_id else {
                tracing::info!("makeup worker stopping");
                return;
            };

            if self.busy_since().is_some() {
                // Never drop a wake: another task owns the worker, so come
                // back for this one later.
                self.republish_after(queue_id, self.tuning.busy_retry);
                continue;
            }

            let Some((tenant, region, remaining)) = ({
                let mut tasks = self.tasks.lock().expect("task map poisoned");
                match tasks.get_mut(&queue_id) {
                    None => {
                        tracing::debug!(queue_id = %queue_id, "wake for unknown task; skipping");
                        None
                    }
                    Some(task) if task.status != TaskStatus::Waiting => None,
                    Some(task) if task.completed >= task.total => {
                        task.status = TaskStatus::Done;
                        None
                    }
                    Some(task) => {
                        task.status = TaskStatus::InProgress;
                        Some((task.tenant_id, task.region, task.total - task.completed))
                    }
                }
            }) else {
                continue;
            };

            self.set_busy();

            let runner = self.clone();
            let task_id = queue_id.clone();
            let mut handle =
                tokio::spawn(async move { runner.process_task(&task_id, tenant, region, remaining).await });

            tokio::select! {
                joined = &mut handle => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            tracing::error!(queue_id = %queue_id, "task processing panicked; re-arming");
                            self.set_waiting(&queue_id);
                        }
                    }
                }
                _ = tokio::time::sleep(self.tuning.safety_timeout) => {
                    handle.abort();
                    tracing::warn!(queue_id = %queue_id, "task hit safety timeout; re-arming");
                    self.set_waiting(&queue_id);
                    self.publish(queue_id.clone());
                }
            }

            self.clear_busy();
        }
    }

    /// Drain one task: provision until `remaining` successes, a dry pool,
    /// or the retry bound.
    async fn process_task(&self, queue_id: &str, tenant: u64, region: Region, remaining: u32) {
        let mut successes = 0u32;
        let mut retries = 0usize;

        while successes < remaining {
            let retry_cap = self.pool.size().min(self.tuning.max_retries).max(1);

            match self.provisioner.provision(tenant, region).await {
                Ok(_instance) => {
                    successes += 1;
                    retries = 0;
                    if self.record_success(queue_id) {
                        return;
                    }
                    tokio::time::sleep(self.tuning.attempt_pacing).await;
                }
                Err(err) if err.is_no_credential() => {
                    tracing::warn!(
                        queue_id,
                        tenant,
                        region = %region,
                        retry_in_s = self.tuning.no_credential_retry.as_secs(),
                        "no eligible credential; parking task"
                    );
                    self.set_waiting(queue_id);
                    self.republish_after(queue_id.to_string(), self.tuning.no_credential_retry);
                    return;
                }
                Err(err) => {
                    retries += 1;
                    tracing::warn!(
                        queue_id,
                        tenant,
                        region = %region,
                        retries,
                        retry_cap,
                        error = %err,
                        "provisioning attempt failed"
                    );
                    if retries >= retry_cap {
                        self.set_waiting(queue_id);
                        return;
                    }
                    tokio::time::sleep(self.tuning.attempt_pacing).await;
                }
            }
        }
    }

    /// Credentials came back: every in-progress, incomplete task goes back
    /// to waiting and gets re-published. Stale wakes are drained first
    /// (best-effort; the worker tolerates duplicate ids anyway).
    pub fn rearm_stuck(&self) -> usize {
        let mut drained: Vec<String> = Vec::new();
        if let Ok(mut rx) = self.wake_rx.try_lock() {
            while let Ok(id) = rx.try_recv() {
                drained.push(id);
            }
        }

        let stuck: Vec<String> = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            tasks
                .values_mut()
                .filter(|t| t.status == TaskStatus::InProgress && t.completed < t.total)
                .map(|t| {
                    t.status = TaskStatus::Waiting;
                    t.queue_id.clone()
                })
                .collect()
        };
        self.clear_busy();

        let mut to_publish: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        {
            let tasks = self.tasks.lock().expect("task map poisoned");
            for id in stuck.iter().chain(drained.iter()) {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if tasks
                    .get(id)
                    .is_some_and(|t| t.status == TaskStatus::Waiting)
                {
                    to_publish.push(id.clone());
                }
            }
        }

        let rearmed = stuck.len();
        for id in to_publish {
            self.publish(id);
        }
        if rearmed > 0 {
            tracing::info!(rearmed, "stuck makeup tasks re-armed");
        }
        rearmed
    }

    /// Periodic hygiene: re-publish waiting tasks that have sat past the
    /// re-publish age, and force-clear a busy gate stuck well past the
    /// safety timeout.
    pub async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tuning.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let aged: Vec<String> = {
                let tasks = self.tasks.lock().expect("task map poisoned");
                tasks
                    .values()
                    .filter(|t| {
                        t.status == TaskStatus::Waiting
                            && now.duration_since(t.added_at) > self.tuning.republish_age
                    })
                    .map(|t| t.queue_id.clone())
                    .collect()
            };
            for id in aged {
                tracing::info!(queue_id = %id, "re-publishing aged waiting task");
                self.publish(id);
            }

            let stuck_gate = self
                .busy_since()
                .is_some_and(|since| now.duration_since(since) > self.tuning.safety_timeout + Duration::from_secs(300));
            if stuck_gate {
                tracing::warn!("busy gate stuck past safety timeout; force-clearing");
                self.clear_busy();
            }
        }
    }

    /// Hourly sweep giving region-enablement-benched credentials another
    /// chance (their resets publish bus events, which re-arm parked tasks).
    pub async fn region_reset_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tuning.region_reset_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip the startup tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            let reset = self.pool.reset_region_enablement_skips();
            if !reset.is_empty() {
                tracing::info!(count = reset.len(), "re-enabled region-benched credentials");
            }
        }
    }
}

/// Bus subscription: credential availability events re-arm stuck tasks.
pub struct QueueEvents {
    pub queue: Arc<MakeupQueue>,
}

impl AccountListener for QueueEvents {
    fn on_account_event(&self, event: AccountEvent, _account_id: &str) {
        match event {
            AccountEvent::Added | AccountEvent::Reset | AccountEvent::ManualReset => {
                self.queue.rearm_stuck();
            }
            AccountEvent::Deleted => {}
        }
    }
}

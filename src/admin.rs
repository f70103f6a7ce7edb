use crate::detector::ShortfallDetector;
use crate::fleet::Fleet;
use crate::history::MakeupHistory;
use crate::ipcheck::IpRangeChecker;
use crate::pool::AccountPool;
use crate::queue::{MakeupQueue, TaskStatus};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::watch;

const USAGE: &str = "commands:\n  pool\n  pool reset <id...>\n  pool reset-all\n  fleet [tenant]\n  queue\n  queue reset-stuck\n  queue clear\n  detect\n  history clear\n  ipcheck <tenant|all>";

/// Command-oriented operator surface. Each handler returns a human-readable
/// aggregate; long-running work is started, not awaited.
pub struct Admin {
    pool: Arc<AccountPool>,
    fleet: Arc<Fleet>,
    queue: Arc<MakeupQueue>,
    history: Arc<MakeupHistory>,
    detector: Arc<ShortfallDetector>,
    checker: Arc<IpRangeChecker>,
    shutdown: watch::Receiver<bool>,
}

impl Admin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<AccountPool>,
        fleet: Arc<Fleet>,
        queue: Arc<MakeupQueue>,
        history: Arc<MakeupHistory>,
        detector: Arc<ShortfallDetector>,
        checker: Arc<IpRangeChecker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { pool, fleet, queue, history, detector, checker, shutdown }
    }

    pub async fn handle(&self, line: &str) -> String {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["pool"] => self.pool_overview(),
            ["pool", "reset-all"] => {
                let woke = self.pool.reset_all();
                format!("reset all: {woke} credential(s) back in rotation")
            }
            ["pool", "reset", ids @ ..] if !ids.is_empty() => self.reset_credentials(ids),
            ["fleet"] => self.fleet_overview(self.fleet.list_all()),
            ["fleet", tenant] => match tenant.parse::<u64>() {
                Ok(tenant) => self.fleet_overview(self.fleet.list_by_tenant(tenant)),
                Err(_) => format!("invalid tenant id '{tenant}'"),
            },
            ["queue"] => self.queue_overview(),
            ["queue", "reset-stuck"] => {
                let rearmed = self.queue.rearm_stuck();
                format!("re-armed {rearmed} stuck task(s)")
            }
            ["queue", "clear"] => {
                let dropped = self.queue.clear_tasks();
                format!("cleared {dropped} task(s)")
            }
            ["detect"] => {
                self.detector.detect_all().await;
                "detection pass complete".to_string()
            }
            ["history", "clear"] => {
                self.history.clear_all();
                "makeup history cleared; cooldowns lifted".to_string()
            }
            ["ipcheck", "all"] => {
                let checker = self.checker.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move { checker.check_all(shutdown).await });
                "ip range check started for all gated tenants".to_string()
            }
            ["ipcheck", tenant] => match tenant.parse::<u64>() {
                Ok(tenant) if self.checker.is_checking(tenant) => {
                    format!("ip range check already running for tenant {tenant}")
                }
                Ok(tenant) => {
                    let checker = self.checker.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move { checker.check_one(tenant, shutdown).await });
                    format!("ip range check started for tenant {tenant}")
                }
                Err(_) => format!("invalid tenant id '{tenant}'"),
            },
            _ => USAGE.to_string(),
        }
    }

    fn reset_credentials(&self, ids: &[&str]) -> String {
        let mut ok = 0usize;
        let mut unknown: Vec<&str> = Vec::new();
        for &id in ids {
            if self.pool.reset(id) {
                ok += 1;
            } else {
                unknown.push(id);
            }
        }
        if unknown.is_empty() {
            format!("reset {ok} ok")
        } else {
            format!("reset {ok} ok, {} unknown id(s): {}", unknown.len(), unknown.join(", "))
        }
    }

    fn pool_overview(&self) -> String {
        let status = self.pool.status();
        if status.is_empty() {
            return "pool is empty".to_string();
        }
        let mut out = format!("{} credential(s)\n", status.len());
        for c in status {
            let _ = write!(
                out,
                "id={} tenant={} region={} used={}",
                c.id, c.tenant_id, c.region, c.used_capacity
            );
            if let Some(reason) = c.skipped {
                let _ = write!(out, " skipped=\"{}\"", reason.as_str());
            }
            if !c.skipped_types.is_empty() {
                let types: Vec<String> = c
                    .skipped_types
                    .iter()
                    .map(|(t, r)| format!("{t}:{}", r.as_str()))
                    .collect();
                let _ = write!(out, " typeSkips=[{}]", types.join(", "));
            }
            if let Some(status) = &c.provider_status {
                let _ = write!(out, " providerStatus=\"{status}\"");
            }
            if let Some(err) = &c.last_error {
                let _ = write!(out, " lastError=\"{err}\"");
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    fn fleet_overview(&self, mut instances: Vec<crate::fleet::LiveInstance>) -> String {
        if instances.is_empty() {
            return "no live instances".to_string();
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let mut out = format!("{} instance(s)\n", instances.len());
        for i in instances {
            let _ = writeln!(
                out,
                "id={} tenant={} region={} type={} ip={} credential={} launched_at={} seen_s_ago={}",
                i.instance_id,
                i.tenant_id,
                i.region,
                i.instance_type,
                i.ipv4,
                i.credential_id,
                i.launched_at,
                i.seen_secs_ago()
            );
        }
        out.trim_end().to_string()
    }

    fn queue_overview(&self) -> String {
        let tasks = self.queue.snapshot();
        if tasks.is_empty() {
            return "queue is empty".to_string();
        }
        let mut out = format!("{} task(s)\n", tasks.len());
        for t in tasks {
            let status = match t.status {
                TaskStatus::Waiting => "waiting",
                TaskStatus::InProgress => "in-progress",
                TaskStatus::Done => "done",
            };
            let _ = writeln!(
                out,
                "id={} status={} completed={}/{} created={} age_s={}",
                t.queue_id,
                status,
                t.completed,
                t.total,
                t.created_unix,
                t.added_at.elapsed().as_secs()
            );
        }
        out.trim_end().to_string()
    }
}

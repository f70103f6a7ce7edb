use crate::queue::QueueTuning;
use clap::Parser;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fleet-keeper", version, about = "Fleet control plane keeper")]
pub struct Args {
    /// Path to the JSON store document (tenants, monitor configs,
    /// settings, credentials).
    #[arg(long)]
    pub store: PathBuf,

    /// Heartbeat ingress listen address.
    #[arg(long, default_value = "0.0.0.0:7700")]
    pub listen: String,

    /// Admin console listen address. Keep this on localhost.
    #[arg(long, default_value = "127.0.0.1:7701")]
    pub admin_listen: String,

    /// Base URL of the provider gateway.
    #[arg(long)]
    pub provider_url: String,

    /// Optional webhook URL for instance online/offline alerts.
    #[arg(long)]
    pub notify_url: Option<String>,

    /// Cooldown (seconds) after a makeup decision for a (tenant, region).
    #[arg(long, default_value_t = 300)]
    pub cooldown_seconds: u64,

    /// Instances unseen for this long (seconds) are evicted.
    #[arg(long, default_value_t = 60)]
    pub staleness_seconds: u64,

    /// Staleness sweep cadence (seconds).
    #[arg(long, default_value_t = 15)]
    pub sweep_seconds: u64,

    /// How long (seconds) a provider-reported IP overrides heartbeats.
    #[arg(long, default_value_t = 30)]
    pub ip_lock_ttl_seconds: u64,

    /// Settle time (seconds) before an eviction-triggered detection pass.
    #[arg(long, default_value_t = 10)]
    pub debounce_seconds: u64,

    /// Cadence (seconds) of the all-tenants detection pass.
    #[arg(long, default_value_t = 180)]
    pub detect_interval_seconds: u64,

    /// Makeup queue wake channel capacity.
    #[arg(long, default_value_t = 100)]
    pub wake_capacity: usize,

    /// Re-schedule delay (seconds) when a wake arrives while busy.
    #[arg(long, default_value_t = 10)]
    pub busy_retry_seconds: u64,

    /// Deferred publish delay (seconds) when the wake channel is full.
    #[arg(long, default_value_t = 3)]
    pub enqueue_retry_seconds: u64,

    /// Pacing sleep (seconds) between provisioning attempts.
    #[arg(long, default_value_t = 2)]
    pub attempt_pacing_seconds: u64,

    /// Per-task retry ceiling (effective bound is min(pool size, this)).
    #[arg(long, default_value_t = 10)]
    pub max_retries: usize,

    /// Hard ceiling (seconds) on one task-processing stint.
    #[arg(long, default_value_t = 1800)]
    pub safety_timeout_seconds: u64,

    /// Park delay (seconds) when no eligible credential exists.
    #[arg(long, default_value_t = 900)]
    pub no_credential_retry_seconds: u64,

    /// Queue hygiene sweep cadence (seconds).
    #[arg(long, default_value_t = 600)]
    pub queue_sweep_seconds: u64,

    /// Waiting tasks older than this (seconds) are re-published.
    #[arg(long, default_value_t = 900)]
    pub republish_age_seconds: u64,

    /// Cadence (seconds) of the region-enablement credential reset sweep.
    #[arg(long, default_value_t = 3600)]
    pub region_reset_seconds: u64,

    /// Initial delay (seconds) before the first IP range pass.
    #[arg(long, default_value_t = 10)]
    pub ip_check_delay_seconds: u64,

    /// IP range check cadence (seconds).
    #[arg(long, default_value_t = 300)]
    pub ip_check_interval_seconds: u64,

    /// Per-instance IP rotation budget.
    #[arg(long, default_value_t = 120)]
    pub ip_rotate_attempts: usize,

    /// Pause (seconds) between IP rotation attempts.
    #[arg(long, default_value_t = 60)]
    pub ip_rotate_pause_seconds: u64,

    /// Deadline (seconds) for each provider gateway call.
    #[arg(long, default_value_t = 60)]
    pub provider_timeout_seconds: u64,

    /// Deadline (seconds) for webhook notifications.
    #[arg(long, default_value_t = 10)]
    pub notify_timeout_seconds: u64,

    /// Per-credential region capacity budget in units.
    #[arg(long, default_value_t = 4)]
    pub credential_capacity: u32,
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub store_file: PathBuf,
    pub listen: String,
    pub admin_listen: String,
    pub provider_url: String,
    pub notify_url: Option<String>,

    pub cooldown: Duration,
    pub staleness: Duration,
    pub sweep_interval: Duration,
    pub ip_lock_ttl: Duration,
    pub debounce: Duration,
    pub detect_interval: Duration,
    /// Suppression window for duplicate makeup records.
    pub history_dedup: Duration,

    pub wake_capacity: usize,
    pub busy_retry: Duration,
    pub enqueue_retry: Duration,
    pub attempt_pacing: Duration,
    pub max_retries: usize,
    pub safety_timeout: Duration,
    pub no_credential_retry: Duration,
    pub queue_sweep_interval: Duration,
    pub republish_age: Duration,
    pub region_reset_interval: Duration,

    pub ip_check_delay: Duration,
    pub ip_check_interval: Duration,
    pub ip_rotate_attempts: usize,
    pub ip_rotate_pause: Duration,

    pub provider_timeout: Duration,
    pub notify_timeout: Duration,
    pub credential_capacity: u32,
}

impl KeeperConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.wake_capacity == 0 {
            return Err(eyre!("wake capacity must be > 0"));
        }
        if args.credential_capacity == 0 {
            return Err(eyre!("credential capacity must be > 0"));
        }
        if args.ip_rotate_attempts == 0 {
            return Err(eyre!("ip rotation attempts must be > 0"));
        }
        if args.provider_url.trim().is_empty() {
            return Err(eyre!("provider url must not be empty"));
        }

        if args.staleness_seconds <= args.sweep_seconds {
            tracing::warn!(
                staleness = args.staleness_seconds,
                sweep = args.sweep_seconds,
                "staleness bound is not larger than the sweep cadence; instances may flap"
            );
        }
        if args.cooldown_seconds < args.attempt_pacing_seconds {
            tracing::warn!(
                cooldown = args.cooldown_seconds,
                "cooldown is shorter than attempt pacing; expect over-provisioning"
            );
        }

        Ok(Self {
            store_file: args.store,
            listen: args.listen,
            admin_listen: args.admin_listen,
            provider_url: args.provider_url,
            notify_url: args.notify_url,
            cooldown: Duration::from_secs(args.cooldown_seconds.max(1)),
            staleness: Duration::from_secs(args.staleness_seconds.max(1)),
            sweep_interval: Duration::from_secs(args.sweep_seconds.max(1)),
            ip_lock_ttl: Duration::from_secs(args.ip_lock_ttl_seconds.max(1)),
            debounce: Duration::from_secs(args.debounce_seconds),
            detect_interval: Duration::from_secs(args.detect_interval_seconds.max(1)),
            history_dedup: Duration::from_secs(1),
            wake_capacity: args.wake_capacity,
            busy_retry: Duration::from_secs(args.busy_retry_seconds.max(1)),
            enqueue_retry: Duration::from_secs(args.enqueue_retry_seconds.max(1)),
            attempt_pacing: Duration::from_secs(args.attempt_pacing_seconds),
            max_retries: args.max_retries.max(1),
            safety_timeout: Duration::from_secs(args.safety_timeout_seconds.max(60)),
            no_credential_retry: Duration::from_secs(args.no_credential_retry_seconds.max(1)),
            queue_sweep_interval: Duration::from_secs(args.queue_sweep_seconds.max(1)),
            republish_age: Duration::from_secs(args.republish_age_seconds.max(1)),
            region_reset_interval: Duration::from_secs(args.region_reset_seconds.max(60)),
            ip_check_delay: Duration::from_secs(args.ip_check_delay_seconds),
            ip_check_interval: Duration::from_secs(args.ip_check_interval_seconds.max(1)),
            ip_rotate_attempts: args.ip_rotate_attempts,
            ip_rotate_pause: Duration::from_secs(args.ip_rotate_pause_seconds.max(1)),
            provider_timeout: Duration::from_secs(args.provider_timeout_seconds.max(5)),
            notify_timeout: Duration::from_secs(args.notify_timeout_seconds.max(1)),
            credential_capacity: args.credential_capacity,
        })
    }

    pub fn queue_tuning(&self) -> QueueTuning {
        QueueTuning {
            wake_capacity: self.wake_capacity,
            busy_retry: self.busy_retry,
            enqueue_retry: self.enqueue_retry,
            attempt_pacing: self.attempt_pacing,
            max_retries: self.max_retries,
            safety_timeout: self.safety_timeout,
            no_credential_retry: self.no_credential_retry,
            sweep_interval: self.queue_sweep_interval,
            republish_age: self.republish_age,
            region_reset_interval: self.region_reset_interval,
        }
    }
}

use crate::model::Region;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct MakeupRecord {
    count: u32,
    at: Instant,
}

/// Append-only log of makeup decisions keyed by (tenant, region).
///
/// The detector records every replenishment decision here and consults the
/// log for cooldown enforcement. Records survive until an operator clears
/// them.
pub struct MakeupHistory {
    records: Mutex<HashMap<(u64, Region), Vec<MakeupRecord>>>,
    /// Suppression window for identical back-to-back records (guards
    /// against event storms double-recording one decision).
    dedup_window: Duration,
}

impl MakeupHistory {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            dedup_window,
        }
    }

    pub fn add(&self, tenant: u64, region: Region, count: u32) {
        let now = Instant::now();
        let mut records = self.records.lock().expect("history poisoned");
        let log = records.entry((tenant, region)).or_default();

        if let Some(last) = log
            .iter()
            .rev()
            .find(|r| r.count == count)
        {
            if now.duration_since(last.at) < self.dedup_window {
                tracing::debug!(tenant, region = %region, count, "duplicate makeup record suppressed");
                return;
            }
        }

        log.push(MakeupRecord { count, at: now });
    }

    /// Sum of recorded counts within `now - window`, newest first.
    pub fn count_within(&self, tenant: u64, region: Region, window: Duration) -> u32 {
        let now = Instant::now();
        let records = self.records.lock().expect("history poisoned");
        let Some(log) = records.get(&(tenant, region)) else {
            return 0;
        };

        let mut total = 0u32;
        // Timestamps are monotonic per key, so we can stop at the first
        // record that falls outside the window.
        for record in log.iter().rev() {
            if now.duration_since(record.at) > window {
                break;
            }
            total = total.saturating_add(record.count);
        }
        total
    }

    pub fn clear_all(&self) {
        self.records.lock().expect("history poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> MakeupHistory {
        MakeupHistory::new(Duration::from_millis(50))
    }

    #[test]
    fn windowed_count_sums_recent_records() {
        let h = history();
        h.add(7, Region::Hk, 2);
        h.add(7, Region::Hk, 3);
        assert_eq!(h.count_within(7, Region::Hk, Duration::from_secs(60)), 5);
        assert_eq!(h.count_within(7, Region::Jp, Duration::from_secs(60)), 0);
        assert_eq!(h.count_within(8, Region::Hk, Duration::from_secs(60)), 0);
    }

    #[test]
    fn records_age_out_of_the_window() {
        let h = history();
        h.add(7, Region::Sg, 1);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(h.count_within(7, Region::Sg, Duration::from_millis(20)), 0);
        assert_eq!(h.count_within(7, Region::Sg, Duration::from_secs(60)), 1);
    }

    #[test]
    fn identical_record_within_dedup_window_is_suppressed() {
        let h = history();
        h.add(7, Region::Hk, 2);
        h.add(7, Region::Hk, 2);
        assert_eq!(h.count_within(7, Region::Hk, Duration::from_secs(60)), 2);

        // A different count is not a duplicate.
        h.add(7, Region::Hk, 3);
        assert_eq!(h.count_within(7, Region::Hk, Duration::from_secs(60)), 5);

        // Past the window the same count records again.
        std::thread::sleep(Duration::from_millis(80));
        h.add(7, Region::Hk, 2);
        assert_eq!(h.count_within(7, Region::Hk, Duration::from_secs(60)), 7);
    }

    #[test]
    fn clear_all_drops_everything() {
        let h = history();
        h.add(1, Region::Jp, 4);
        h.add(2, Region::Sg, 1);
        h.clear_all();
        assert_eq!(h.count_within(1, Region::Jp, Duration::from_secs(60)), 0);
        assert_eq!(h.count_within(2, Region::Sg, Duration::from_secs(60)), 0);
    }
}

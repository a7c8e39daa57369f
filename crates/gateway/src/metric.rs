//! Per-account response outcome counters, bucketed by minute.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::AccountId;

/// Who a response is attributed to. Requests rejected before a credential
/// resolved are counted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Anonymous,
    Account(AccountId),
}

type MinuteCounts = HashMap<i64, HashMap<u16, u64>>;

#[derive(Default)]
pub struct Metrics {
    counts: Mutex<HashMap<Subject, MinuteCounts>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one response with `status` at Unix time `at_secs`.
    pub fn record(&self, subject: Subject, status: u16, at_secs: i64) {
        let minute = at_secs.div_euclid(60);
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts
            .entry(subject)
            .or_default()
            .entry(minute)
            .or_default()
            .entry(status)
            .or_insert(0) += 1;
    }

    /// Minute bucket -> status -> count. Empty for unseen subjects.
    pub fn snapshot(&self, subject: Subject) -> MinuteCounts {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Status -> count across all minutes.
    pub fn totals(&self, subject: Subject) -> HashMap<u16, u64> {
        let mut totals = HashMap::new();
        for per_status in self.snapshot(subject).into_values() {
            for (status, count) in per_status {
                *totals.entry(status).or_insert(0) += count;
            }
        }
        totals
    }

    /// Drop buckets older than `before_minute`. Returns how many were removed.
    pub fn prune(&self, before_minute: i64) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for minutes in counts.values_mut() {
            let before = minutes.len();
            minutes.retain(|minute, _| *minute >= before_minute);
            removed += before - minutes.len();
        }
        counts.retain(|_, minutes| !minutes.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_by_minute_and_status() {
        let metrics = Metrics::new();
        let account = Subject::Account(7);

        metrics.record(account, 200, 5);
        metrics.record(account, 429, 59);
        metrics.record(account, 200, 60);
        metrics.record(Subject::Anonymous, 401, 5);

        let snap = metrics.snapshot(account);
        assert_eq!(snap[&0].get(&200), Some(&1));
        assert_eq!(snap[&0].get(&429), Some(&1));
        assert_eq!(snap[&1].get(&200), Some(&1));

        let totals = metrics.totals(account);
        assert_eq!(totals.get(&200), Some(&2));
        assert_eq!(metrics.totals(Subject::Anonymous).get(&401), Some(&1));
        assert!(metrics.snapshot(Subject::Account(8)).is_empty());
    }

    #[test]
    fn prune_drops_old_minutes() {
        let metrics = Metrics::new();
        metrics.record(Subject::Account(1), 200, 0);
        metrics.record(Subject::Account(1), 200, 120);
        metrics.record(Subject::Account(2), 200, 0);

        assert_eq!(metrics.prune(2), 2);
        assert_eq!(metrics.snapshot(Subject::Account(1)).len(), 1);
        assert!(metrics.snapshot(Subject::Account(2)).is_empty());
    }
}

//! Repair of runaway retry backoff.
//!
//! Repeated failures keep doubling a transaction's retry interval. Rows whose
//! `next_cron_time` ended up beyond `now + max_cron_interval` are pulled back
//! to `now` in bounded pages.

use chrono::{DateTime, Duration, Utc};

use dtx_kernel::{CronResetOutcome, StoreResult, TransStore};

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Ceiling on how far in the future a pending row may be scheduled.
    pub max_cron_interval: Duration,
    /// Rows reset per store call. Treated as at least 1.
    pub reset_page_limit: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_cron_interval: Duration::hours(1),
            reset_page_limit: 100,
        }
    }
}

/// Aggregate of a multi-page repair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffRepairReport {
    pub pages: u32,
    pub fixed: u64,
    pub has_more: bool,
}

pub struct BackoffGovernor<S: TransStore> {
    store: S,
    config: BackoffConfig,
}

impl<S: TransStore> BackoffGovernor<S> {
    pub fn new(store: S, config: BackoffConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn repair_overdue_backoff(&self) -> StoreResult<CronResetOutcome> {
        self.repair_overdue_backoff_at(Utc::now())
    }

    /// One bounded page of repairs relative to `now`.
    pub fn repair_overdue_backoff_at(&self, now: DateTime<Utc>) -> StoreResult<CronResetOutcome> {
        let ceiling = self.config.max_cron_interval.max(Duration::zero());
        let limit = self.config.reset_page_limit.max(1);
        // A ceiling past the representable range means nothing is overdue.
        let overdue_after = now
            .checked_add_signed(ceiling)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let outcome = self.store.reset_cron_time(overdue_after, now, limit)?;
        if outcome.fixed > 0 {
            log::info!(
                "backoff_repaired fixed={} has_more={} ceiling_secs={}",
                outcome.fixed,
                outcome.has_more,
                ceiling.num_seconds()
            );
        } else {
            log::debug!("backoff_repair_noop ceiling_secs={}", ceiling.num_seconds());
        }
        Ok(outcome)
    }

    pub fn repair_all(&self, max_pages: u32) -> StoreResult<BackoffRepairReport> {
        self.repair_all_at(Utc::now(), max_pages)
    }

    /// Repeats page repairs at a fixed `now` until no offenders remain or
    /// `max_pages` pages ran.
    pub fn repair_all_at(
        &self,
        now: DateTime<Utc>,
        max_pages: u32,
    ) -> StoreResult<BackoffRepairReport> {
        let mut report = BackoffRepairReport::default();
        while report.pages < max_pages {
            let outcome = self.repair_overdue_backoff_at(now)?;
            report.pages += 1;
            report.fixed += outcome.fixed;
            report.has_more = outcome.has_more;
            if !outcome.has_more {
                break;
            }
        }
        if report.has_more {
            log::warn!(
                "backoff_repair_incomplete pages={} fixed={}",
                report.pages,
                report.fixed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use dtx_kernel::ms_to_dt;

    use super::*;
    use crate::testing::RecordingStore;

    fn base_time() -> DateTime<Utc> {
        ms_to_dt(1_700_000_000_000)
    }

    fn outcome(fixed: u64, has_more: bool) -> CronResetOutcome {
        CronResetOutcome { fixed, has_more }
    }

    #[test]
    fn repair_passes_ceiling_and_page_limit_to_store() {
        let store = RecordingStore::with_reset_outcomes([outcome(2, false)]);
        let governor = BackoffGovernor::new(store.clone(), BackoffConfig::default());
        let now = base_time();

        let result = governor.repair_overdue_backoff_at(now).expect("repair");
        assert_eq!(result, outcome(2, false));
        assert_eq!(store.resets(), vec![(now + Duration::hours(1), now, 100)]);
    }

    #[test]
    fn negative_ceiling_and_zero_limit_are_clamped() {
        let store = RecordingStore::default();
        let governor = BackoffGovernor::new(
            store.clone(),
            BackoffConfig {
                max_cron_interval: Duration::seconds(-30),
                reset_page_limit: 0,
            },
        );
        let now = base_time();
        governor.repair_overdue_backoff_at(now).expect("repair");
        assert_eq!(store.resets(), vec![(now, now, 1)]);
    }

    #[test]
    fn huge_ceiling_saturates_instead_of_overflowing() {
        let store = RecordingStore::default();
        let governor = BackoffGovernor::new(
            store.clone(),
            BackoffConfig {
                max_cron_interval: Duration::days(365 * 1_000_000),
                reset_page_limit: 10,
            },
        );
        let now = base_time();
        assert_eq!(
            governor.repair_overdue_backoff_at(now).expect("repair"),
            CronResetOutcome::default()
        );
        assert_eq!(
            governor.store().resets(),
            vec![(DateTime::<Utc>::MAX_UTC, now, 10)]
        );
    }

    #[test]
    fn repair_all_stops_when_nothing_remains() {
        let store = RecordingStore::with_reset_outcomes([
            outcome(100, true),
            outcome(100, true),
            outcome(7, false),
        ]);
        let governor = BackoffGovernor::new(store.clone(), BackoffConfig::default());

        let report = governor.repair_all_at(base_time(), 10).expect("repair all");
        assert_eq!(
            report,
            BackoffRepairReport {
                pages: 3,
                fixed: 207,
                has_more: false
            }
        );
        assert_eq!(store.resets().len(), 3);
    }

    #[test]
    fn repair_all_respects_page_budget() {
        let store = RecordingStore::with_reset_outcomes([
            outcome(1, true),
            outcome(1, true),
            outcome(1, true),
        ]);
        let governor = BackoffGovernor::new(store.clone(), BackoffConfig::default());

        let report = governor.repair_all_at(base_time(), 2).expect("repair all");
        assert_eq!(report.pages, 2);
        assert_eq!(report.fixed, 2);
        assert!(report.has_more);

        let idle = governor.repair_all_at(base_time(), 0).expect("zero budget");
        assert_eq!(idle, BackoffRepairReport::default());
    }

    #[test]
    fn repair_surfaces_storage_errors() {
        let store = RecordingStore {
            fail_resets: true,
            ..RecordingStore::default()
        };
        let governor = BackoffGovernor::new(store, BackoffConfig::default());
        let err = governor
            .repair_all_at(base_time(), 3)
            .expect_err("storage failure");
        assert!(err.is_storage());
    }

    #[cfg(feature = "sqlite-persistence")]
    #[test]
    fn runaway_rows_are_pulled_back_to_now() {
        use dtx_kernel::{status, GlobalTransaction};

        use crate::SqliteTransStore;

        let store = SqliteTransStore::new(":memory:").expect("sqlite store");
        let now = base_time();
        let governor = BackoffGovernor::new(
            store.clone(),
            BackoffConfig {
                max_cron_interval: Duration::hours(1),
                reset_page_limit: 1,
            },
        );
        store
            .may_save_new_trans(
                &GlobalTransaction::new("gid-runaway-1", "saga", status::SUBMITTED, now)
                    .with_next_cron(36_000, now + Duration::hours(10)),
                &[],
            )
            .expect("create");
        store
            .may_save_new_trans(
                &GlobalTransaction::new("gid-healthy", "saga", status::SUBMITTED, now)
                    .with_next_cron(60, now + Duration::minutes(1)),
                &[],
            )
            .expect("create");

        assert_eq!(
            governor.repair_overdue_backoff_at(now).expect("repair"),
            outcome(1, false)
        );
        let repaired = store
            .find_global("gid-runaway-1")
            .expect("find")
            .expect("exists");
        assert_eq!(repaired.next_cron_time, now);
        let healthy = store.find_global("gid-healthy").expect("find").expect("exists");
        assert_eq!(healthy.next_cron_time, now + Duration::minutes(1));

        for gid in ["gid-runaway-2", "gid-runaway-3"] {
            store
                .may_save_new_trans(
                    &GlobalTransaction::new(gid, "saga", status::SUBMITTED, now)
                        .with_next_cron(36_000, now + Duration::hours(10)),
                    &[],
                )
                .expect("create");
        }
        assert_eq!(
            governor.repair_overdue_backoff_at(now).expect("repair"),
            outcome(1, true)
        );
        let report = governor.repair_all_at(now, 5).expect("repair all");
        assert_eq!(report.fixed, 1);
        assert!(!report.has_more);
    }
}

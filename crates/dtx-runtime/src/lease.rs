//! Lease claiming for due global transactions.
//!
//! [LeaseScheduler::claim_one_due] hands at most one due, pending transaction
//! to the calling worker. Exclusivity comes from the store's conditional
//! update; the scheduler only supplies the clock and a fresh owner token.
//! Pushing `next_cron_time` forward by `retry_interval` is the lease: if the
//! worker dies, the row becomes due again once that interval passes.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use dtx_kernel::{GlobalTransaction, OwnerToken, StoreError, StoreResult, TransStore};

/// Lease tuning knobs for polling workers.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// How far a claim pushes `next_cron_time`.
    pub retry_interval: Duration,
    /// Also claim rows that become due within this window.
    pub claim_lookahead: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::seconds(10),
            claim_lookahead: Duration::zero(),
        }
    }
}

/// Fresh correlation key for one claim.
pub fn new_owner_token() -> OwnerToken {
    Uuid::new_v4().to_string()
}

pub struct LeaseScheduler<S: TransStore> {
    store: S,
    config: LeaseConfig,
}

impl<S: TransStore> LeaseScheduler<S> {
    pub fn new(store: S, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn claim_one_due(&self) -> StoreResult<Option<GlobalTransaction>> {
        self.claim_one_due_at(Utc::now())
    }

    /// Claims one transaction due at `now` (plus lookahead).
    pub fn claim_one_due_at(&self, now: DateTime<Utc>) -> StoreResult<Option<GlobalTransaction>> {
        let lookahead = self.config.claim_lookahead;
        let cutoff = match now.checked_add_signed(lookahead) {
            Some(cutoff) => cutoff,
            None if lookahead < Duration::zero() => DateTime::<Utc>::MIN_UTC,
            None => DateTime::<Utc>::MAX_UTC,
        };
        let next_cron_time = now
            .checked_add_signed(self.config.retry_interval)
            .ok_or_else(|| {
                StoreError::Storage(format!(
                    "claim global trans: retry_interval {}s overflows from {}",
                    self.config.retry_interval.num_seconds(),
                    now
                ))
            })?;
        let owner = new_owner_token();
        let claimed = self
            .store
            .lock_one_global_trans(cutoff, &owner, next_cron_time)?;
        match &claimed {
            Some(global) => log::info!(
                "lease_claimed gid={} status={} owner={} next_cron_time={}",
                global.gid,
                global.status,
                owner,
                next_cron_time
            ),
            None => log::debug!("lease_claim_empty cutoff={}", cutoff),
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    #[cfg(feature = "sqlite-persistence")]
    use std::collections::HashSet;
    #[cfg(feature = "sqlite-persistence")]
    use std::sync::Arc;
    #[cfg(feature = "sqlite-persistence")]
    use std::thread;

    use dtx_kernel::ms_to_dt;
    #[cfg(feature = "sqlite-persistence")]
    use dtx_kernel::status;

    use super::*;
    use crate::testing::RecordingStore;
    #[cfg(feature = "sqlite-persistence")]
    use crate::SqliteTransStore;

    fn base_time() -> DateTime<Utc> {
        ms_to_dt(1_700_000_000_000)
    }

    #[test]
    fn claim_uses_now_as_cutoff_and_pushes_by_retry_interval() {
        let store = RecordingStore::default();
        let scheduler = LeaseScheduler::new(store.clone(), LeaseConfig::default());
        let now = base_time();

        assert!(scheduler.claim_one_due_at(now).expect("claim").is_none());

        let claims = store.claims();
        assert_eq!(claims.len(), 1);
        let (cutoff, owner, next_cron_time) = &claims[0];
        assert_eq!(*cutoff, now);
        assert!(!owner.is_empty());
        assert_eq!(*next_cron_time, now + Duration::seconds(10));
    }

    #[test]
    fn claim_lookahead_extends_cutoff() {
        let store = RecordingStore::default();
        let scheduler = LeaseScheduler::new(
            store.clone(),
            LeaseConfig {
                retry_interval: Duration::seconds(30),
                claim_lookahead: Duration::seconds(2),
            },
        );
        let now = base_time();
        scheduler.claim_one_due_at(now).expect("claim");

        let (cutoff, _, next_cron_time) = store.claims()[0].clone();
        assert_eq!(cutoff, now + Duration::seconds(2));
        assert_eq!(next_cron_time, now + Duration::seconds(30));
    }

    #[test]
    fn each_claim_uses_a_fresh_owner_token() {
        let store = RecordingStore::default();
        let scheduler = LeaseScheduler::new(store.clone(), LeaseConfig::default());
        scheduler.claim_one_due_at(base_time()).expect("first");
        scheduler.claim_one_due_at(base_time()).expect("second");

        let claims = store.claims();
        assert_ne!(claims[0].1, claims[1].1);
    }

    #[test]
    fn huge_lookahead_claims_everything_pending() {
        let store = RecordingStore::default();
        let scheduler = LeaseScheduler::new(
            store.clone(),
            LeaseConfig {
                retry_interval: Duration::seconds(10),
                claim_lookahead: Duration::days(365 * 1_000_000),
            },
        );
        let now = base_time();
        assert!(scheduler.claim_one_due_at(now).expect("claim").is_none());

        let (cutoff, _, next_cron_time) = scheduler.store().claims()[0].clone();
        assert_eq!(cutoff, DateTime::<Utc>::MAX_UTC);
        assert_eq!(next_cron_time, now + Duration::seconds(10));
    }

    #[test]
    fn overflowing_retry_interval_is_a_storage_error() {
        let store = RecordingStore::default();
        let scheduler = LeaseScheduler::new(
            store.clone(),
            LeaseConfig {
                retry_interval: Duration::days(365 * 1_000_000),
                claim_lookahead: Duration::zero(),
            },
        );
        let err = scheduler
            .claim_one_due_at(base_time())
            .expect_err("retry interval overflow");
        assert!(err.is_storage());
        assert!(store.claims().is_empty());
    }

    #[cfg(feature = "sqlite-persistence")]
    #[test]
    fn claimed_row_is_hidden_until_retry_interval_passes() {
        let store = SqliteTransStore::new(":memory:").expect("sqlite store");
        store
            .may_save_new_trans(
                &GlobalTransaction::new("gid-lease", "saga", status::SUBMITTED, base_time()),
                &[],
            )
            .expect("create");
        let scheduler = LeaseScheduler::new(store, LeaseConfig::default());
        let now = base_time() + Duration::seconds(1);

        let claimed = scheduler
            .claim_one_due_at(now)
            .expect("claim")
            .expect("due row");
        assert_eq!(claimed.gid, "gid-lease");
        assert_eq!(claimed.next_cron_time, now + Duration::seconds(10));

        assert!(scheduler
            .claim_one_due_at(now + Duration::seconds(5))
            .expect("claim while leased")
            .is_none());
        let reclaimed = scheduler
            .claim_one_due_at(now + Duration::seconds(11))
            .expect("claim after expiry")
            .expect("row due again");
        assert_ne!(reclaimed.owner, claimed.owner);
    }

    #[cfg(feature = "sqlite-persistence")]
    #[test]
    fn concurrent_claimers_partition_due_rows() {
        let store = Arc::new(SqliteTransStore::new(":memory:").expect("sqlite store"));
        for idx in 0..3 {
            store
                .may_save_new_trans(
                    &GlobalTransaction::new(
                        format!("gid-due-{idx}"),
                        "saga",
                        status::SUBMITTED,
                        base_time(),
                    ),
                    &[],
                )
                .expect("create");
        }
        let scheduler = Arc::new(LeaseScheduler::new(store, LeaseConfig::default()));
        let now = base_time() + Duration::seconds(1);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let scheduler = scheduler.clone();
            handles.push(thread::spawn(move || {
                scheduler.claim_one_due_at(now).expect("claim")
            }));
        }
        let claimed: Vec<GlobalTransaction> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("join claimer"))
            .collect();

        assert_eq!(claimed.len(), 3);
        let gids: HashSet<_> = claimed.iter().map(|g| g.gid.clone()).collect();
        assert_eq!(gids.len(), 3);
    }
}

//! Storage contract for global transactions and their branches.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::columns::{BranchColumn, GlobalColumn};
use crate::cursor::ScanCursor;
use crate::error::StoreResult;
use crate::trans::{BranchRecord, GlobalTransaction};

/// Result of one bounded backoff-repair pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CronResetOutcome {
    /// Rows whose `next_cron_time` was reset.
    pub fixed: u64,
    /// More offending rows remain beyond this page.
    pub has_more: bool,
}

/// Transaction store used by the API layer, the lease scheduler and the
/// backoff governor.
///
/// Implementations carry all mutual exclusion; callers never coordinate
/// in-process:
/// - `change_global_status` is a compare-and-swap on `(gid, status)` and
///   reports a miss as `StoreError::NotFound`.
/// - `lock_global_save_branches` holds an exclusive lock on the
///   `(gid, status)` row for the whole branch write.
/// - `may_save_new_trans` is one atomic unit; a second call for the same gid
///   fails with `StoreError::UniqueConflict` and writes nothing.
/// - `lock_one_global_trans` and `reset_cron_time` take their time bounds as
///   plain values; no backend computes "now" on its own.
pub trait TransStore: Send + Sync {
    /// Executes a trivial statement against the backend.
    fn ping(&self) -> StoreResult<()>;

    /// Creates the transaction tables. Drops existing ones first unless
    /// `skip_drop` is set.
    fn populate_schema(&self, skip_drop: bool) -> StoreResult<()>;

    /// Looks up a transaction header. Absence is `Ok(None)`.
    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTransaction>>;

    /// Reads up to `limit` headers below `cursor` by descending id and moves
    /// the cursor. A short page clears it. `limit == 0` reads nothing and
    /// leaves the cursor as is.
    fn scan_globals(
        &self,
        cursor: &mut ScanCursor,
        limit: usize,
    ) -> StoreResult<Vec<GlobalTransaction>>;

    /// Branches of `gid` in execution (ascending id) order.
    fn find_branches(&self, gid: &str) -> StoreResult<Vec<BranchRecord>>;

    /// Inserts branches; on a `(gid, branch_id, op)` conflict overwrites only
    /// `updates`. Returns the number of rows inserted or updated.
    fn update_branches(
        &self,
        branches: &[BranchRecord],
        updates: &[BranchColumn],
    ) -> StoreResult<usize>;

    /// Upserts `branches` while holding an exclusive lock on the header row
    /// matching `(gid, status)`. Fails with `NotFound`, writing nothing, when
    /// no such row exists.
    fn lock_global_save_branches(
        &self,
        gid: &str,
        status: &str,
        branches: &[BranchRecord],
    ) -> StoreResult<()>;

    /// Registers a transaction and its initial branches exactly once.
    fn may_save_new_trans(
        &self,
        global: &GlobalTransaction,
        branches: &[BranchRecord],
    ) -> StoreResult<()>;

    /// Moves `global` from its current `status` to `new_status`, also
    /// persisting `updates` from `global`. On success `global.status` is set
    /// to `new_status`; on `NotFound` the record is left untouched and the
    /// caller should re-read before deciding to retry.
    fn change_global_status(
        &self,
        global: &mut GlobalTransaction,
        new_status: &str,
        updates: &[GlobalColumn],
    ) -> StoreResult<()>;

    /// Reschedules `global`, matched on `(gid, status)`.
    ///
    /// Best effort: if the status moved underneath the caller, zero rows match
    /// and the call still returns `Ok(())`. Only storage failures surface.
    fn touch_cron_time(
        &self,
        global: &mut GlobalTransaction,
        next_cron_interval: i64,
        next_cron_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Claims at most one pending row with `next_cron_time < due_before`,
    /// stamping `owner` and `next_cron_time`, and returns it re-read by
    /// `owner`. There is no ordering among several due rows.
    fn lock_one_global_trans(
        &self,
        due_before: DateTime<Utc>,
        owner: &str,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<Option<GlobalTransaction>>;

    /// Resets `next_cron_time` to `reset_to` on at most `limit` pending rows
    /// scheduled after `overdue_after`, probing whether more remain when the
    /// page was full.
    fn reset_cron_time(
        &self,
        overdue_after: DateTime<Utc>,
        reset_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<CronResetOutcome>;
}

impl<T: TransStore + ?Sized> TransStore for Arc<T> {
    fn ping(&self) -> StoreResult<()> {
        (**self).ping()
    }

    fn populate_schema(&self, skip_drop: bool) -> StoreResult<()> {
        (**self).populate_schema(skip_drop)
    }

    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTransaction>> {
        (**self).find_global(gid)
    }

    fn scan_globals(
        &self,
        cursor: &mut ScanCursor,
        limit: usize,
    ) -> StoreResult<Vec<GlobalTransaction>> {
        (**self).scan_globals(cursor, limit)
    }

    fn find_branches(&self, gid: &str) -> StoreResult<Vec<BranchRecord>> {
        (**self).find_branches(gid)
    }

    fn update_branches(
        &self,
        branches: &[BranchRecord],
        updates: &[BranchColumn],
    ) -> StoreResult<usize> {
        (**self).update_branches(branches, updates)
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        status: &str,
        branches: &[BranchRecord],
    ) -> StoreResult<()> {
        (**self).lock_global_save_branches(gid, status, branches)
    }

    fn may_save_new_trans(
        &self,
        global: &GlobalTransaction,
        branches: &[BranchRecord],
    ) -> StoreResult<()> {
        (**self).may_save_new_trans(global, branches)
    }

    fn change_global_status(
        &self,
        global: &mut GlobalTransaction,
        new_status: &str,
        updates: &[GlobalColumn],
    ) -> StoreResult<()> {
        (**self).change_global_status(global, new_status, updates)
    }

    fn touch_cron_time(
        &self,
        global: &mut GlobalTransaction,
        next_cron_interval: i64,
        next_cron_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        (**self).touch_cron_time(global, next_cron_interval, next_cron_time, now)
    }

    fn lock_one_global_trans(
        &self,
        due_before: DateTime<Utc>,
        owner: &str,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<Option<GlobalTransaction>> {
        (**self).lock_one_global_trans(due_before, owner, next_cron_time)
    }

    fn reset_cron_time(
        &self,
        overdue_after: DateTime<Utc>,
        reset_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<CronResetOutcome> {
        (**self).reset_cron_time(overdue_after, reset_to, limit)
    }
}

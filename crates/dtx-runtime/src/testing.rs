//! Recording `TransStore` double for scheduler, governor and scanner tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use dtx_kernel::{
    BranchColumn, BranchRecord, CronResetOutcome, GlobalColumn, GlobalTransaction, ScanCursor,
    StoreError, StoreResult, TransStore,
};

pub(crate) type ClaimCall = (DateTime<Utc>, String, DateTime<Utc>);
pub(crate) type ResetCall = (DateTime<Utc>, DateTime<Utc>, usize);

#[derive(Clone, Default)]
pub(crate) struct RecordingStore {
    pub claims: Arc<Mutex<Vec<ClaimCall>>>,
    pub resets: Arc<Mutex<Vec<ResetCall>>>,
    pub reset_outcomes: Arc<Mutex<VecDeque<CronResetOutcome>>>,
    pub fail_resets: bool,
    pub fail_scans: bool,
}

impl RecordingStore {
    pub fn with_reset_outcomes(outcomes: impl IntoIterator<Item = CronResetOutcome>) -> Self {
        Self {
            reset_outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn claims(&self) -> Vec<ClaimCall> {
        self.claims.lock().expect("claims lock").clone()
    }

    pub fn resets(&self) -> Vec<ResetCall> {
        self.resets.lock().expect("resets lock").clone()
    }
}

impl TransStore for RecordingStore {
    fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn populate_schema(&self, _skip_drop: bool) -> StoreResult<()> {
        Ok(())
    }

    fn find_global(&self, _gid: &str) -> StoreResult<Option<GlobalTransaction>> {
        Ok(None)
    }

    fn scan_globals(
        &self,
        cursor: &mut ScanCursor,
        limit: usize,
    ) -> StoreResult<Vec<GlobalTransaction>> {
        if self.fail_scans {
            return Err(StoreError::Storage("scan globals: connection reset".to_string()));
        }
        cursor.advance(&[], limit);
        Ok(Vec::new())
    }

    fn find_branches(&self, _gid: &str) -> StoreResult<Vec<BranchRecord>> {
        Ok(Vec::new())
    }

    fn update_branches(
        &self,
        _branches: &[BranchRecord],
        _updates: &[BranchColumn],
    ) -> StoreResult<usize> {
        Ok(0)
    }

    fn lock_global_save_branches(
        &self,
        _gid: &str,
        _status: &str,
        _branches: &[BranchRecord],
    ) -> StoreResult<()> {
        Ok(())
    }

    fn may_save_new_trans(
        &self,
        _global: &GlobalTransaction,
        _branches: &[BranchRecord],
    ) -> StoreResult<()> {
        Ok(())
    }

    fn change_global_status(
        &self,
        _global: &mut GlobalTransaction,
        _new_status: &str,
        _updates: &[GlobalColumn],
    ) -> StoreResult<()> {
        Ok(())
    }

    fn touch_cron_time(
        &self,
        _global: &mut GlobalTransaction,
        _next_cron_interval: i64,
        _next_cron_time: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        Ok(())
    }

    fn lock_one_global_trans(
        &self,
        due_before: DateTime<Utc>,
        owner: &str,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<Option<GlobalTransaction>> {
        self.claims.lock().expect("claims lock").push((
            due_before,
            owner.to_string(),
            next_cron_time,
        ));
        Ok(None)
    }

    fn reset_cron_time(
        &self,
        overdue_after: DateTime<Utc>,
        reset_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<CronResetOutcome> {
        self.resets
            .lock()
            .expect("resets lock")
            .push((overdue_after, reset_to, limit));
        if self.fail_resets {
            return Err(StoreError::Storage("reset cron time: disk full".to_string()));
        }
        Ok(self
            .reset_outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or_default())
    }
}

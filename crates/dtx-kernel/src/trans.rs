//! Global transaction and branch records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Gid, RowId};

/// Well-known status values. The store treats status as an opaque string and
/// only needs the pending subset to decide what is schedulable.
pub mod status {
    pub const PREPARED: &str = "prepared";
    pub const SUBMITTED: &str = "submitted";
    pub const SUCCEED: &str = "succeed";
    pub const FAILED: &str = "failed";
    pub const ABORTING: &str = "aborting";
    pub const ABORTED: &str = "aborted";

    /// Statuses the lease scheduler and backoff governor act on.
    pub const PENDING: [&str; 3] = [PREPARED, ABORTING, SUBMITTED];

    pub fn is_pending(status: &str) -> bool {
        PENDING.contains(&status)
    }

    pub fn is_final(status: &str) -> bool {
        matches!(status, SUCCEED | FAILED | ABORTED)
    }
}

/// Header row of one distributed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTransaction {
    /// Assigned by the store; 0 until persisted.
    pub id: RowId,
    pub gid: Gid,
    pub trans_type: String,
    pub status: String,
    pub query_prepared: String,
    pub protocol: String,
    pub options: String,
    pub custom_data: String,
    pub ext_data: String,
    pub result: String,
    pub rollback_reason: String,
    /// Lease token from the last claim; empty when never claimed.
    pub owner: String,
    /// Backoff interval in seconds last used to compute `next_cron_time`.
    pub next_cron_interval: i64,
    pub next_cron_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

impl GlobalTransaction {
    /// A new, unpersisted transaction that becomes due at `now`.
    pub fn new(
        gid: impl Into<Gid>,
        trans_type: impl Into<String>,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            gid: gid.into(),
            trans_type: trans_type.into(),
            status: status.into(),
            query_prepared: String::new(),
            protocol: String::new(),
            options: String::new(),
            custom_data: String::new(),
            ext_data: String::new(),
            result: String::new(),
            rollback_reason: String::new(),
            owner: String::new(),
            next_cron_interval: 0,
            next_cron_time: now,
            create_time: now,
            update_time: now,
            finish_time: None,
            rollback_time: None,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_custom_data(mut self, custom_data: impl Into<String>) -> Self {
        self.custom_data = custom_data.into();
        self
    }

    pub fn with_next_cron(mut self, interval_secs: i64, at: DateTime<Utc>) -> Self {
        self.next_cron_interval = interval_secs;
        self.next_cron_time = at;
        self
    }

    pub fn is_pending(&self) -> bool {
        status::is_pending(&self.status)
    }
}

/// One branch action (or compensation) of a global transaction.
///
/// Identity within a transaction is `(gid, branch_id, op)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Assigned by the store; 0 until persisted. Ascending id is execution order.
    pub id: RowId,
    pub gid: Gid,
    pub url: String,
    pub bin_data: Vec<u8>,
    pub branch_id: String,
    pub op: String,
    pub status: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

impl BranchRecord {
    /// A new, unpersisted branch in `prepared` status.
    pub fn new(
        gid: impl Into<Gid>,
        branch_id: impl Into<String>,
        op: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            gid: gid.into(),
            url: String::new(),
            bin_data: Vec::new(),
            branch_id: branch_id.into(),
            op: op.into(),
            status: status::PREPARED.to_string(),
            create_time: now,
            update_time: now,
            finish_time: None,
            rollback_time: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_bin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.bin_data = data.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_subset_is_prepared_aborting_submitted() {
        for s in [status::PREPARED, status::ABORTING, status::SUBMITTED] {
            assert!(status::is_pending(s), "{s} should be pending");
        }
        for s in [status::SUCCEED, status::FAILED, status::ABORTED, "custom"] {
            assert!(!status::is_pending(s), "{s} should not be pending");
        }
        assert!(status::is_final(status::ABORTED));
        assert!(!status::is_final(status::ABORTING));
    }

    #[test]
    fn new_global_is_due_immediately() {
        let now = Utc::now();
        let g = GlobalTransaction::new("gid-1", "saga", status::SUBMITTED, now);
        assert_eq!(g.id, 0);
        assert_eq!(g.next_cron_time, now);
        assert_eq!(g.next_cron_interval, 0);
        assert!(g.owner.is_empty());
        assert!(g.is_pending());
    }

    #[test]
    fn branch_builders_fill_payload() {
        let b = BranchRecord::new("gid-1", "01", "action", Utc::now())
            .with_url("http://svc/transout")
            .with_bin_data(b"{\"amount\":30}".to_vec())
            .with_status(status::SUCCEED);
        assert_eq!(b.url, "http://svc/transout");
        assert_eq!(b.bin_data, b"{\"amount\":30}");
        assert_eq!(b.status, "succeed");
    }
}

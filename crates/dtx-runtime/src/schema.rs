//! Table and column names shared by the SQL backends.
//!
//! Only names and the pending-status predicate live here; DDL and placeholder
//! syntax stay with each backend.

use dtx_kernel::status;

pub(crate) const GLOBAL_TABLE: &str = "trans_global";
pub(crate) const BRANCH_TABLE: &str = "trans_branch_op";

/// Select list matching `map_row_to_global` in each backend.
pub(crate) const GLOBAL_SELECT_COLUMNS: &str = "id, gid, trans_type, status, query_prepared, \
     protocol, options, custom_data, ext_data, result, rollback_reason, owner, \
     next_cron_interval, next_cron_time_ms, create_time_ms, update_time_ms, \
     finish_time_ms, rollback_time_ms";

/// Insert list for `trans_global`; `id` is assigned by the store.
pub(crate) const GLOBAL_INSERT_COLUMNS: &str = "gid, trans_type, status, query_prepared, \
     protocol, options, custom_data, ext_data, result, rollback_reason, owner, \
     next_cron_interval, next_cron_time_ms, create_time_ms, update_time_ms, \
     finish_time_ms, rollback_time_ms";

/// Select list matching `map_row_to_branch` in each backend.
pub(crate) const BRANCH_SELECT_COLUMNS: &str = "id, gid, url, bin_data, branch_id, op, status, \
     create_time_ms, update_time_ms, finish_time_ms, rollback_time_ms";

/// Insert list for `trans_branch_op`; `id` is assigned by the store.
pub(crate) const BRANCH_INSERT_COLUMNS: &str = "gid, url, bin_data, branch_id, op, status, \
     create_time_ms, update_time_ms, finish_time_ms, rollback_time_ms";

/// `status IN (...)` predicate over the pending statuses.
pub(crate) fn pending_status_predicate() -> String {
    let quoted: Vec<String> = status::PENDING.iter().map(|s| format!("'{}'", s)).collect();
    format!("status IN ({})", quoted.join(", "))
}

/// Page limit as a SQL integer. A wrapped cast would turn into a negative
/// LIMIT, which SQLite reads as unbounded.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_predicate_lists_every_pending_status() {
        assert_eq!(
            pending_status_predicate(),
            "status IN ('prepared', 'aborting', 'submitted')"
        );
    }

    #[test]
    fn insert_lists_are_select_lists_without_id() {
        assert_eq!(
            format!("id, {}", GLOBAL_INSERT_COLUMNS),
            GLOBAL_SELECT_COLUMNS
        );
        assert_eq!(
            format!("id, {}", BRANCH_INSERT_COLUMNS),
            BRANCH_SELECT_COLUMNS
        );
    }

    #[test]
    fn sql_limit_saturates_instead_of_wrapping() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}

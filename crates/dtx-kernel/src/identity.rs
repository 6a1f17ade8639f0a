//! Identity types for transaction records.
//!
//! Gid identifies a global transaction across coordinators; RowId is the
//! store-assigned, monotonically increasing row id used for ordering and paging.

/// Caller-supplied global transaction id.
pub type Gid = String;

/// Store-assigned row id. Ascending order is insertion order.
pub type RowId = i64;

/// Ephemeral lease token stamped on a claimed transaction.
pub type OwnerToken = String;

//! dtx kernel: record models, error taxonomy and the storage contract shared
//! by every transaction store backend.
//!
//! The runtime crate (`dtx-runtime`) provides the SQL backends plus the lease
//! scheduler and backoff governor built on top of [TransStore].

pub mod columns;
pub mod cursor;
pub mod error;
pub mod identity;
pub mod store;
pub mod trans;

pub use columns::{dt_to_ms, ms_to_dt, BranchColumn, ColumnValue, GlobalColumn};
pub use cursor::ScanCursor;
pub use error::{StoreError, StoreResult};
pub use identity::{Gid, OwnerToken, RowId};
pub use store::{CronResetOutcome, TransStore};
pub use trans::{status, BranchRecord, GlobalTransaction};

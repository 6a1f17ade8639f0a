//! dtx runtime: SQL transaction stores and the background drivers built on
//! the [dtx_kernel::TransStore] contract.
//!
//! - [SqliteTransStore] (feature `sqlite-persistence`, default) and
//!   [PostgresTransStore] (feature `kernel-postgres`).
//! - [LeaseScheduler] claims due transactions for polling workers.
//! - [BackoffGovernor] pulls runaway retry schedules back under a ceiling.
//! - [GlobalScanner] pages through every transaction, newest first.
//! - [StoreConfig] selects and opens a backend from the environment.

pub mod backend_config;
pub mod backoff;
pub mod lease;
#[cfg(feature = "kernel-postgres")]
pub mod postgres_trans_store;
pub mod scan;
#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
mod schema;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_trans_store;
#[cfg(test)]
mod testing;

pub use backend_config::{StoreBackend, StoreConfig};
pub use backoff::{BackoffConfig, BackoffGovernor, BackoffRepairReport};
pub use lease::{new_owner_token, LeaseConfig, LeaseScheduler};
#[cfg(feature = "kernel-postgres")]
pub use postgres_trans_store::PostgresTransStore;
pub use scan::GlobalScanner;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_trans_store::SqliteTransStore;

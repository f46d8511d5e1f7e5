//! SQLite-backed worker registry and job store.
//!
//! [`SqliteStore`] implements both [`WorkerRegistry`](crate::registry::WorkerRegistry)
//! and [`JobStore`](crate::scheduler::JobStore) over one connection pool.
//! Every value that reaches SQL is bound as a parameter.

pub mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

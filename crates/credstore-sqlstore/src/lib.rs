//! # credstore-sqlstore
//!
//! SQLite persistence for secrets:
//! - Declarative schema for the `secret` table and its indexes
//! - An idempotent migrator with a `migration_log` table
//! - Transaction sessions that publish events only after commit
//! - `SqlStore`, the transactional secret DAO

pub mod migrator;
pub mod schema;
pub mod session;
pub mod store;

pub use migrator::Migrator;
pub use schema::{secret_table, Column, ColumnType, Index, Table};
pub use session::TxSession;
pub use store::SqlStore;

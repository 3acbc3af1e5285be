//! Persistence — the ingestion ledger and everything around it.

mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{DeadLetter, DisabledMailbox, LedgerStateCount, Store};

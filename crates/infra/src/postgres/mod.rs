//! Postgres-backed outbox storage.
//!
//! Concurrency model:
//!
//! - materialization serializes per (group, tenant) via a transactional
//!   advisory lock, so concurrent schedulers cannot double-advance the
//!   watermark;
//! - claims use `FOR UPDATE SKIP LOCKED`, so concurrent claimers never
//!   block and always take disjoint rows;
//! - renew and finalize carry the round's lease token in the WHERE
//!   clause and simply match zero rows when the token is stale.

mod schema;
mod store;

pub use schema::{ensure_schema, PgPartitionManager};
pub use store::PgOutboxStore;

use postbox_engine::StoreError;

/// Map a sqlx failure onto the engine's error taxonomy. Connection-level
/// failures and serialization/deadlock aborts are transient; everything
/// else is a hard storage error.
pub(crate) fn map_sqlx_error(operation: &str, error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::Transient(format!("{operation}: {error}"))
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => {
                StoreError::Transient(format!("{operation}: {error}"))
            }
            _ => StoreError::Storage(format!("{operation}: {error}")),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("{operation}: {error}"))
        }
        _ => StoreError::Storage(format!("{operation}: {error}")),
    }
}

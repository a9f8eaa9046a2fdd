//! Storage adapters for the outbox engine.
//!
//! Two implementations of the `postbox-engine` port traits:
//!
//! - [`postgres`] — production store on sqlx/Postgres: advisory-lock
//!   materialization, `FOR UPDATE SKIP LOCKED` claims, token-fenced
//!   finalization, partitioned message/delivery-log tables.
//! - [`in_memory`] — full-semantics store for tests and local dev.

pub mod in_memory;
pub mod partition;
pub mod postgres;


pub use in_memory::InMemoryOutboxStore;
pub use partition::{NoopPartitionManager, PartitionManager, PartitionedTable};
pub use postgres::{PgOutboxStore, PgPartitionManager};

//! `postbox-engine` — storage-agnostic delivery engine.
//!
//! The engine drives one delivery round per (consumer group, tenant):
//! materialize → claim → deliver → finalize, with a lease-renewal task
//! running alongside consumer invocation. Storage is reached through the
//! port traits in [`store`]; `postbox-infra` provides the Postgres and
//! in-memory implementations.

pub mod batch;
pub mod courier;
pub mod renewer;
pub mod retry;
pub mod round;
pub mod settings;
pub mod store;

pub use batch::{DeliveryBatch, DeliveryHandle, DeliveryOutcome, Failure};
pub use courier::{BoxError, Consumer, Courier};
pub use renewer::LeaseRenewer;
pub use retry::{RetryPolicy, TransientRetry};
pub use round::{DeliveryRound, EngineError, RoundReport};
pub use settings::DeliverySettings;
pub use store::{ClaimedDelivery, MaterializeReport, MessageStore, StoreError, WorkStore};

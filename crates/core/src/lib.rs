//! `postbox-core` — domain foundation for the transactional outbox.
//!
//! This crate contains **pure domain** primitives (no infrastructure
//! concerns): strongly-typed identifiers, the outcome state machine, the
//! delivery filter, and the message / work-item row types shared by the
//! engine and the storage adapters.

pub mod error;
pub mod filter;
pub mod id;
pub mod message;
pub mod outcome;
pub mod work_item;

pub use error::{DomainError, DomainResult};
pub use filter::DeliveryFilter;
pub use id::{ConsumerGroup, LeaseToken, MsgId, PayloadId, TaskId, TenantId};
pub use message::{Message, NewMessage, PartitionKey};
pub use outcome::OutcomeCode;
pub use work_item::{DeliveryLogEntry, ErrorId, ErrorRecord, GroupOffset, WorkItem};

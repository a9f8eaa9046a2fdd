//! Storage port traits.
//!
//! The engine makes no storage assumptions: everything it needs from the
//! database is expressed here, and `postbox-infra` supplies a Postgres
//! implementation for production and an in-memory one for tests/dev.
//!
//! All four `WorkStore` operations are scoped by a [`DeliveryFilter`];
//! `extend_lease` and `finalize` additionally fence on the filter's
//! `transact_id` and must affect zero rows when the token is stale.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use postbox_core::{ConsumerGroup, DeliveryFilter, MsgId, NewMessage, WorkItem};

use crate::batch::DeliveryOutcome;

/// Storage operation error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Persistent storage failure; retrying is pointless.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transient infrastructure failure (connection lost, serialization
    /// conflict). The round runner retries these with jittered backoff.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Row data could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Result of one materializer round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Work items inserted this round. Zero means "nothing new", not an
    /// error.
    pub inserted: usize,
    /// Watermark after the round (unchanged when `inserted == 0`).
    pub watermark: MsgId,
}

/// A claimed work item joined with its message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDelivery {
    pub work_item: WorkItem,
    pub payload_type: String,
    pub payload: JsonValue,
}

/// Append-only write path for producer messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Ensure the target partitions exist for every distinct
    /// (tenant, part, day) in the batch, then bulk-append. Returns the
    /// count written. The only mutation point for messages.
    async fn save(&self, messages: &[NewMessage]) -> Result<usize, StoreError>;
}

/// Per-consumer-group work-item queue operations.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Copy newly-visible messages into the group's work-item queue,
    /// advancing the group watermark under an advisory lock keyed by
    /// (group, tenant). Serializes concurrent schedulers for the same
    /// pair without blocking other pairs.
    async fn materialize_new_work(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
    ) -> Result<MaterializeReport, StoreError>;

    /// Exclusively claim up to `batch_size` eligible work items, stamping
    /// them `Processing` with the filter's `transact_id` as lease token
    /// and `lease_expires_at = now + lease_duration`. Concurrent claimers
    /// must never block each other (skip locked rows) and must return
    /// disjoint sets. An empty result ends the round.
    async fn claim_batch(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedDelivery>, StoreError>;

    /// Push `lease_expires_at` forward for rows still holding the
    /// filter's token. Returns the number of rows extended; zero means
    /// the lease was reclaimed elsewhere and is not an error.
    async fn extend_lease(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        lease_duration: Duration,
    ) -> Result<u64, StoreError>;

    /// Durably record outcomes: one delivery-log row per message plus an
    /// in-place work-item update, both fenced by the filter's token.
    /// Rows whose token no longer matches are left untouched. Returns
    /// the number of work items actually finalized.
    async fn finalize(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        outcomes: &[DeliveryOutcome],
    ) -> Result<u64, StoreError>;

    /// Read a group's watermark, if one has been recorded.
    async fn group_watermark(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
    ) -> Result<Option<(MsgId, DateTime<Utc>)>, StoreError>;
}

#[async_trait]
impl<S> WorkStore for Arc<S>
where
    S: WorkStore + ?Sized,
{
    async fn materialize_new_work(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
    ) -> Result<MaterializeReport, StoreError> {
        (**self).materialize_new_work(group, filter, batch_size).await
    }

    async fn claim_batch(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedDelivery>, StoreError> {
        (**self)
            .claim_batch(group, filter, batch_size, lease_duration)
            .await
    }

    async fn extend_lease(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        lease_duration: Duration,
    ) -> Result<u64, StoreError> {
        (**self).extend_lease(group, filter, lease_duration).await
    }

    async fn finalize(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        outcomes: &[DeliveryOutcome],
    ) -> Result<u64, StoreError> {
        (**self).finalize(group, filter, outcomes).await
    }

    async fn group_watermark(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
    ) -> Result<Option<(MsgId, DateTime<Utc>)>, StoreError> {
        (**self).group_watermark(group, filter).await
    }
}

#[async_trait]
impl<S> MessageStore for Arc<S>
where
    S: MessageStore + ?Sized,
{
    async fn save(&self, messages: &[NewMessage]) -> Result<usize, StoreError> {
        (**self).save(messages).await
    }
}

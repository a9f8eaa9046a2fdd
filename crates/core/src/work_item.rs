//! Per-consumer-group work items, the delivery log, and error records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::id::{ConsumerGroup, LeaseToken, MsgId, PayloadId, TaskId, TenantId};
use crate::outcome::OutcomeCode;

/// One consumer group's claim state for one message.
///
/// Created once per (message, consumer group) by the materializer; mutated
/// in place by every claim/finalize cycle; never deleted. Attempt history
/// lives in the append-only delivery log, not in this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_id: TaskId,
    pub consumer_group: ConsumerGroup,
    pub tenant_id: TenantId,
    pub msg_id: MsgId,
    pub part: String,
    pub payload_id: PayloadId,
    /// `created_at` of the referenced message; scan-window filter column.
    pub msg_created_at: DateTime<Utc>,
    /// Token of the current (or most recent) claim.
    pub lease_token: LeaseToken,
    /// A row is claimable only after this instant has passed.
    pub lease_expires_at: DateTime<Utc>,
    /// Delivery-log row of the most recent finalized attempt.
    pub delivery_id: Option<Uuid>,
    /// Finalized attempts so far (postponed finalizes do not count).
    pub attempt_count: i32,
    pub outcome_code: OutcomeCode,
    pub outcome_message: Option<String>,
    pub outcome_created_at: Option<DateTime<Utc>>,
    pub error_ref: Option<ErrorId>,
    pub created_at: DateTime<Utc>,
}

/// One immutable row per finalized attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub delivery_id: Uuid,
    pub task_id: TaskId,
    pub consumer_group: ConsumerGroup,
    pub tenant_id: TenantId,
    pub msg_id: MsgId,
    pub part: String,
    pub payload_id: PayloadId,
    pub msg_created_at: DateTime<Utc>,
    /// Lease under which this attempt was finalized.
    pub lease_token: LeaseToken,
    pub attempt_count: i32,
    pub outcome_code: OutcomeCode,
    pub outcome_message: Option<String>,
    pub outcome_created_at: DateTime<Utc>,
    pub error_ref: Option<ErrorId>,
}

/// Content-hash identifier of a deduplicated error record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorId(String);

impl ErrorId {
    /// Hash the failure's textual form. Byte-identical failure text yields
    /// the same id, which is what makes the dedup work.
    pub fn from_failure_text(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        Self(format!("{digest:x}"))
    }

    /// Rebuild an id from its stored textual form.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ErrorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplicated failure record; many work items in one finalize flush may
/// reference the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_id: ErrorId,
    pub error_type: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        let error_message = error_message.into();
        Self {
            error_id: ErrorId::from_failure_text(&error_message),
            error_type: error_type.into(),
            error_message,
            created_at: Utc::now(),
        }
    }
}

/// Per (consumer group, tenant) watermark of the highest message id already
/// materialized into that group's work-item queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOffset {
    pub consumer_group: ConsumerGroup,
    pub tenant_id: TenantId,
    pub watermark: MsgId,
    pub updated_at: DateTime<Utc>,
}

impl GroupOffset {
    /// Empty watermark for a group/tenant pair seen for the first time.
    pub fn initial(consumer_group: ConsumerGroup, tenant_id: TenantId) -> Self {
        Self {
            consumer_group,
            tenant_id,
            watermark: MsgId::ZERO,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_failure_text_hashes_identically() {
        let a = ErrorRecord::new("consumer", "connection refused");
        let b = ErrorRecord::new("consumer", "connection refused");
        let c = ErrorRecord::new("consumer", "connection reset");

        assert_eq!(a.error_id, b.error_id);
        assert_ne!(a.error_id, c.error_id);
    }

    #[test]
    fn initial_offset_starts_at_zero() {
        let offset = GroupOffset::initial(ConsumerGroup::new("g").unwrap(), TenantId::new());
        assert_eq!(offset.watermark, MsgId::ZERO);
    }
}

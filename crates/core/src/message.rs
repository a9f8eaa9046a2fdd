//! The shared append-only message log.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{MsgId, PayloadId, TenantId};

/// A message ready to be appended to the log (not yet assigned an id).
///
/// Written once by a producer, ideally inside the same transaction as the
/// producer's business writes. Immutable after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Producer-supplied idempotency key.
    pub payload_id: PayloadId,
    pub tenant_id: TenantId,
    /// Logical part (queue name within a tenant).
    pub part: String,
    pub payload_type: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(
        tenant_id: TenantId,
        part: impl Into<String>,
        payload_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            payload_id: PayloadId::new(),
            tenant_id,
            part: part.into(),
            payload_type: payload_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Byte size of the serialized payload, persisted for operational
    /// inspection.
    pub fn payload_size(&self) -> i64 {
        self.payload.to_string().len() as i64
    }

    /// The partition bucket this message routes to.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            tenant_id: self.tenant_id,
            part: self.part.clone(),
            day: self.created_at.date_naive(),
        }
    }
}

/// A stored message (assigned a log position).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: MsgId,
    pub payload_id: PayloadId,
    pub tenant_id: TenantId,
    pub part: String,
    pub payload_type: String,
    pub payload: JsonValue,
    pub payload_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Physical partition bucket: one table shard per (tenant, part, day).
///
/// Partitions are created on demand by the partition lifecycle manager
/// before any insert that would route into them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub tenant_id: TenantId,
    pub part: String,
    pub day: NaiveDate,
}

impl core::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.part, self.day)
    }
}

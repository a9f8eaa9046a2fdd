//! The query filter passed across all core operations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{LeaseToken, TenantId};

/// Scope of one delivery round.
///
/// `from_date`/`now_date` bound the partition scan window on every query
/// that touches a partitioned table; `transact_id` is the round's lease
/// and fencing token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFilter {
    /// Per-round lease/fencing token. Fresh per claim round.
    pub transact_id: LeaseToken,
    /// Restrict to one payload type, or deliver everything in the part.
    pub payload_type: Option<String>,
    pub tenant_id: TenantId,
    /// Logical part (queue name within a tenant).
    pub part: String,
    /// Lower bound of the lookback window.
    pub from_date: DateTime<Utc>,
    /// Upper bound of the scan window; also the round's notion of "now".
    pub now_date: DateTime<Utc>,
}

impl DeliveryFilter {
    /// Filter for a fresh round: new token, window ending now.
    pub fn new(tenant_id: TenantId, part: impl Into<String>, lookback: Duration) -> Self {
        let now = Utc::now();
        Self {
            transact_id: LeaseToken::new(),
            payload_type: None,
            tenant_id,
            part: part.into(),
            from_date: now - lookback,
            now_date: now,
        }
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    /// Same scope, fresh token. Used when a round loops over several
    /// claim batches: each batch gets its own lease identity.
    pub fn next_round(&self) -> Self {
        let now = Utc::now();
        Self {
            transact_id: LeaseToken::new(),
            payload_type: self.payload_type.clone(),
            tenant_id: self.tenant_id,
            part: self.part.clone(),
            from_date: self.from_date,
            now_date: now,
        }
    }
}

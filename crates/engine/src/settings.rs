//! Delivery round settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{RetryPolicy, TransientRetry};

/// Settings for one consumer group's delivery rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Maximum work items per claim.
    pub batch_size: usize,
    /// How long a claim holds before a crashed node's rows self-heal.
    pub lease_duration: Duration,
    /// Renewal cadence; should be well under `lease_duration`.
    pub lease_renewal: Duration,
    /// Scan-window lookback on partitioned tables.
    pub lookback: Duration,
    /// Restrict rounds to one payload type.
    pub payload_type: Option<String>,
    /// Per-message retry state machine.
    pub retry: RetryPolicy,
    /// Round-level retry of transient storage failures.
    pub transient: TransientRetry,
    /// Parallelism cap for multi-tenant rounds.
    pub max_parallel_tenants: usize,
    /// Cancel a single tenant's round after this long. Leases self-heal.
    pub tenant_timeout: Option<Duration>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease_duration: Duration::from_secs(5 * 60),
            lease_renewal: Duration::from_secs(60),
            lookback: Duration::from_secs(7 * 24 * 60 * 60),
            payload_type: None,
            retry: RetryPolicy::default(),
            transient: TransientRetry::default(),
            max_parallel_tenants: 4,
            tenant_timeout: None,
        }
    }
}

impl DeliverySettings {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_lease_renewal(mut self, lease_renewal: Duration) -> Self {
        self.lease_renewal = lease_renewal;
        self
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_parallel_tenants(mut self, max: usize) -> Self {
        self.max_parallel_tenants = max.max(1);
        self
    }

    pub fn with_tenant_timeout(mut self, timeout: Duration) -> Self {
        self.tenant_timeout = Some(timeout);
        self
    }

    /// Lookback as a chrono duration for filter construction.
    pub(crate) fn lookback_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lookback).unwrap_or_else(|_| chrono::Duration::days(7))
    }
}

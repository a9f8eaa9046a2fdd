//! Partition lifecycle collaborator.
//!
//! Partition creation is an external concern: the store only asks that
//! the buckets an insert will route into exist beforehand. The Postgres
//! implementation lives in [`crate::postgres`]; the no-op one backs the
//! in-memory store and unpartitioned deployments.

use async_trait::async_trait;

use postbox_core::{PartitionKey, TenantId};
use postbox_engine::StoreError;

/// Logical tables sharded by (tenant, part, day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionedTable {
    Message,
    DeliveryLog,
}

impl PartitionedTable {
    pub fn base_name(&self) -> &'static str {
        match self {
            PartitionedTable::Message => "message",
            PartitionedTable::DeliveryLog => "delivery_log",
        }
    }
}

/// "Ensure partitions exist" collaborator interface.
#[async_trait]
pub trait PartitionManager: Send + Sync {
    /// Create (if missing) the physical partitions for every key. Called
    /// before any insert that would route into them.
    async fn ensure_partitions(
        &self,
        table: PartitionedTable,
        keys: &[PartitionKey],
    ) -> Result<(), StoreError>;

    /// Pre-create day partitions `today .. today + days` for one
    /// (tenant, part), so inserts near midnight never race creation.
    async fn migrate_forward(
        &self,
        table: PartitionedTable,
        tenant_id: TenantId,
        part: &str,
        days: u32,
    ) -> Result<(), StoreError>;
}

/// Partition manager that does nothing; for storage without physical
/// partitioning.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPartitionManager;

#[async_trait]
impl PartitionManager for NoopPartitionManager {
    async fn ensure_partitions(
        &self,
        _table: PartitionedTable,
        _keys: &[PartitionKey],
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn migrate_forward(
        &self,
        _table: PartitionedTable,
        _tenant_id: TenantId,
        _part: &str,
        _days: u32,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

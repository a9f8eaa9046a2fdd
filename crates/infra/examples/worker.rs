//! Minimal delivery worker: drains one (consumer group, tenant, part)
//! queue from Postgres and logs what it delivered.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/postbox TENANT_ID=<uuid> \
//!     cargo run -p postbox-infra --example worker
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;

use postbox_core::{ConsumerGroup, TenantId};
use postbox_engine::{BoxError, Consumer, DeliveryBatch, DeliveryRound, DeliverySettings};
use postbox_infra::postgres::{ensure_schema, PgOutboxStore};

struct LoggingConsumer;

#[async_trait]
impl Consumer for LoggingConsumer {
    async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError> {
        for handle in batch.handles() {
            tracing::info!(
                msg_id = %handle.msg_id(),
                payload_type = handle.payload_type(),
                payload = %handle.payload(),
                "delivered"
            );
            // Untouched handles finalize as success.
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    postbox_observability::init();

    let database_url = std::env::var("DATABASE_URL")?;
    let tenant: TenantId = std::env::var("TENANT_ID")?.parse()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    ensure_schema(&pool).await?;

    let store = Arc::new(PgOutboxStore::new(pool));
    let round = DeliveryRound::new(store, DeliverySettings::default());
    let group = ConsumerGroup::new("worker")?;

    let report = round.run(&group, tenant, "orders", &LoggingConsumer).await?;
    tracing::info!(
        materialized = report.materialized,
        claimed = report.claimed,
        finalized = report.finalized,
        "round complete"
    );
    Ok(())
}

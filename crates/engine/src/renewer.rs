//! Background lease renewal.
//!
//! One renewer runs per claimed batch, for the lifetime of that batch's
//! processing, racing the main delivery path. It is cancelled and awaited
//! when processing completes, so a renewal can never land after finalize
//! from the same node. A renewal that matches zero rows means the lease
//! was reclaimed elsewhere; the renewer absorbs that silently and the
//! finalize will be fenced out the same way.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use postbox_core::{ConsumerGroup, DeliveryFilter};

use crate::store::WorkStore;

/// Handle to a running lease-renewal task.
#[derive(Debug)]
pub struct LeaseRenewer {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl LeaseRenewer {
    /// Spawn a renewal loop for the batch identified by `filter`'s lease
    /// token. Every `every`, pushes the lease `lease_duration` past the
    /// renewal instant.
    pub fn spawn<S>(
        store: Arc<S>,
        group: ConsumerGroup,
        filter: DeliveryFilter,
        every: Duration,
        lease_duration: Duration,
    ) -> Self
    where
        S: WorkStore + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; the
            // claim already stamped a fresh expiry, so skip it.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match store.extend_lease(&group, &filter, lease_duration).await {
                            Ok(0) => {
                                debug!(
                                    group = %group,
                                    transact_id = %filter.transact_id,
                                    "lease no longer held; renewal is a no-op"
                                );
                            }
                            Ok(n) => {
                                debug!(
                                    group = %group,
                                    transact_id = %filter.transact_id,
                                    rows = n,
                                    "lease extended"
                                );
                            }
                            Err(e) => {
                                // Not fatal: the claim predicate's expiry
                                // check self-heals a lost lease.
                                warn!(group = %group, error = %e, "lease renewal failed");
                            }
                        }
                    }
                }
            }
        });

        Self { cancel, join }
    }

    /// Cancel the loop and wait for it to drain.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use postbox_core::MsgId;

    use super::*;
    use crate::batch::DeliveryOutcome;
    use crate::store::{ClaimedDelivery, MaterializeReport, StoreError};

    #[derive(Default)]
    struct CountingStore {
        extends: AtomicU64,
    }

    #[async_trait]
    impl WorkStore for CountingStore {
        async fn materialize_new_work(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _batch_size: usize,
        ) -> Result<MaterializeReport, StoreError> {
            Ok(MaterializeReport {
                inserted: 0,
                watermark: MsgId::ZERO,
            })
        }

        async fn claim_batch(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _batch_size: usize,
            _lease_duration: Duration,
        ) -> Result<Vec<ClaimedDelivery>, StoreError> {
            Ok(Vec::new())
        }

        async fn extend_lease(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _lease_duration: Duration,
        ) -> Result<u64, StoreError> {
            self.extends.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }

        async fn finalize(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _outcomes: &[DeliveryOutcome],
        ) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn group_watermark(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
        ) -> Result<Option<(MsgId, DateTime<Utc>)>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn renews_periodically_until_stopped() {
        let store = Arc::new(CountingStore::default());
        let group = ConsumerGroup::new("g").unwrap();
        let filter = DeliveryFilter::new(
            postbox_core::TenantId::new(),
            "orders",
            chrono::Duration::days(1),
        );

        let renewer = LeaseRenewer::spawn(
            store.clone(),
            group,
            filter,
            Duration::from_millis(10),
            Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        renewer.stop().await;

        let seen = store.extends.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several renewals, saw {seen}");

        // Drained: no further renewals after stop.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.extends.load(Ordering::SeqCst), seen);
    }
}

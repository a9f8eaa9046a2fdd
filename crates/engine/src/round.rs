//! The delivery round runner.
//!
//! One round per (consumer group, tenant): materialize, then loop
//! claim → deliver → finalize while claims keep returning non-empty
//! batches. An external periodic scheduler invokes rounds on its own
//! cadence; nothing here owns a thread pool. The lease renewer is the one
//! background task, spawned per batch and joined before finalize.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use postbox_core::{ConsumerGroup, DeliveryFilter, TenantId};

use crate::batch::DeliveryBatch;
use crate::courier::{Consumer, Courier};
use crate::renewer::LeaseRenewer;
use crate::settings::DeliverySettings;
use crate::store::{StoreError, WorkStore};

/// Engine-level error surfaced to the scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage failed and transient retries were exhausted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A single tenant's round exceeded its timeout and was cancelled.
    /// Claimed rows self-heal once their lease expires.
    #[error("tenant round timed out after {0:?}")]
    TenantTimeout(Duration),
}

/// What one round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Work items materialized before claiming started.
    pub materialized: usize,
    /// Work items claimed across all batches of the round.
    pub claimed: usize,
    /// Claim batches processed.
    pub batches: usize,
    /// Work items actually finalized (fenced-out rows excluded).
    pub finalized: u64,
}

/// Runs delivery rounds for one consumer group over a work store.
#[derive(Debug)]
pub struct DeliveryRound<S> {
    store: Arc<S>,
    settings: DeliverySettings,
    courier: Courier,
}

impl<S> Clone for DeliveryRound<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            settings: self.settings.clone(),
            courier: self.courier.clone(),
        }
    }
}

impl<S> DeliveryRound<S>
where
    S: WorkStore + 'static,
{
    pub fn new(store: Arc<S>, settings: DeliverySettings) -> Self {
        let courier = Courier::new(settings.retry.clone());
        Self {
            store,
            settings,
            courier,
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Run one full round for a (group, tenant, part) queue.
    #[instrument(skip(self, consumer), fields(group = %group, tenant = %tenant, part))]
    pub async fn run<C>(
        &self,
        group: &ConsumerGroup,
        tenant: TenantId,
        part: &str,
        consumer: &C,
    ) -> Result<RoundReport, EngineError>
    where
        C: Consumer + ?Sized,
    {
        let mut filter = DeliveryFilter::new(tenant, part, self.settings.lookback_chrono());
        if let Some(payload_type) = &self.settings.payload_type {
            filter = filter.with_payload_type(payload_type.clone());
        }

        let materialized = self
            .retrying("materialize", || {
                self.store
                    .materialize_new_work(group, &filter, self.settings.batch_size)
            })
            .await?;

        let mut report = RoundReport {
            materialized: materialized.inserted,
            ..RoundReport::default()
        };

        loop {
            // Fresh lease identity per claim batch.
            let filter = filter.next_round();

            let claimed = self
                .retrying("claim", || {
                    self.store.claim_batch(
                        group,
                        &filter,
                        self.settings.batch_size,
                        self.settings.lease_duration,
                    )
                })
                .await?;

            if claimed.is_empty() {
                debug!("nothing eligible; round complete");
                break;
            }

            report.batches += 1;
            report.claimed += claimed.len();

            let mut batch = DeliveryBatch::new(claimed);
            let renewer = LeaseRenewer::spawn(
                self.store.clone(),
                group.clone(),
                filter.clone(),
                self.settings.lease_renewal,
                self.settings.lease_duration,
            );

            self.courier.deliver(consumer, &mut batch).await;
            renewer.stop().await;

            let outcomes = batch.outcomes();
            let finalized = self
                .retrying("finalize", || {
                    self.store.finalize(group, &filter, &outcomes)
                })
                .await?;

            if finalized < outcomes.len() as u64 {
                // The difference was reclaimed by another node; its
                // finalize won, ours was fenced out. Expected under races.
                debug!(
                    finalized,
                    resolved = outcomes.len(),
                    "some rows were fenced out at finalize"
                );
            }
            report.finalized += finalized;
        }

        info!(
            materialized = report.materialized,
            claimed = report.claimed,
            batches = report.batches,
            finalized = report.finalized,
            "delivery round finished"
        );
        Ok(report)
    }

    /// Run rounds for several tenants concurrently, up to the configured
    /// parallelism degree, each under its own optional timeout. Results
    /// are returned in completion order.
    pub async fn run_tenants<C>(
        &self,
        group: &ConsumerGroup,
        tenants: &[TenantId],
        part: &str,
        consumer: Arc<C>,
    ) -> Vec<(TenantId, Result<RoundReport, EngineError>)>
    where
        C: Consumer + ?Sized + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_tenants));
        let mut join = JoinSet::new();

        for &tenant in tenants {
            let semaphore = semaphore.clone();
            let runner = self.clone();
            let group = group.clone();
            let part = part.to_string();
            let consumer = consumer.clone();

            join.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = match runner.settings.tenant_timeout {
                    Some(timeout) => {
                        match tokio::time::timeout(
                            timeout,
                            runner.run(&group, tenant, &part, consumer.as_ref()),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(tenant = %tenant, ?timeout, "tenant round cancelled on timeout");
                                Err(EngineError::TenantTimeout(timeout))
                            }
                        }
                    }
                    None => runner.run(&group, tenant, &part, consumer.as_ref()).await,
                };
                (tenant, result)
            });
        }

        let mut results = Vec::with_capacity(tenants.len());
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => {
                    // A panicked round drops out of the results; its
                    // claimed rows self-heal on lease expiry.
                    warn!(error = %e, "tenant round task failed to join");
                }
            }
        }
        results
    }

    /// Retry a storage call on transient failures with jittered backoff.
    async fn retrying<T, Fut>(
        &self,
        op: &str,
        mut call: impl FnMut() -> Fut,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && self.settings.transient.should_retry(attempt) => {
                    let delay = self.settings.transient.delay_for_attempt(attempt);
                    warn!(op, attempt, ?delay, error = %e, "transient storage failure; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use postbox_core::{
        LeaseToken, MsgId, OutcomeCode, PayloadId, TaskId, WorkItem,
    };
    use serde_json::json;

    use super::*;
    use crate::batch::DeliveryOutcome;
    use crate::courier::BoxError;
    use crate::store::{ClaimedDelivery, MaterializeReport};

    fn claimed(task: i64, tenant: TenantId) -> ClaimedDelivery {
        let now = Utc::now();
        ClaimedDelivery {
            work_item: WorkItem {
                task_id: TaskId(task),
                consumer_group: ConsumerGroup::new("g").unwrap(),
                tenant_id: tenant,
                msg_id: MsgId(task),
                part: "orders".to_string(),
                payload_id: PayloadId::new(),
                msg_created_at: now,
                lease_token: LeaseToken::new(),
                lease_expires_at: now,
                delivery_id: None,
                attempt_count: 0,
                outcome_code: OutcomeCode::Processing,
                outcome_message: None,
                outcome_created_at: None,
                error_ref: None,
                created_at: now,
            },
            payload_type: "t".to_string(),
            payload: json!({}),
        }
    }

    /// Serves a scripted sequence of claim batches, then empties.
    struct ScriptedStore {
        batches: Mutex<Vec<Vec<ClaimedDelivery>>>,
        finalized: Mutex<Vec<Vec<DeliveryOutcome>>>,
        transient_claims_left: AtomicU32,
    }

    impl ScriptedStore {
        fn new(batches: Vec<Vec<ClaimedDelivery>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                finalized: Mutex::new(Vec::new()),
                transient_claims_left: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkStore for ScriptedStore {
        async fn materialize_new_work(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _batch_size: usize,
        ) -> Result<MaterializeReport, StoreError> {
            Ok(MaterializeReport {
                inserted: 4,
                watermark: MsgId(4),
            })
        }

        async fn claim_batch(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _batch_size: usize,
            _lease_duration: Duration,
        ) -> Result<Vec<ClaimedDelivery>, StoreError> {
            if self.transient_claims_left.load(Ordering::SeqCst) > 0 {
                self.transient_claims_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Transient("connection reset".into()));
            }
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }

        async fn extend_lease(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _lease_duration: Duration,
        ) -> Result<u64, StoreError> {
            Ok(1)
        }

        async fn finalize(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            outcomes: &[DeliveryOutcome],
        ) -> Result<u64, StoreError> {
            let count = outcomes.len() as u64;
            self.finalized.lock().unwrap().push(outcomes.to_vec());
            Ok(count)
        }

        async fn group_watermark(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
        ) -> Result<Option<(MsgId, DateTime<Utc>)>, StoreError> {
            Ok(Some((MsgId(4), Utc::now())))
        }
    }

    struct SucceedsAll;

    #[async_trait]
    impl Consumer for SucceedsAll {
        async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError> {
            for mut handle in batch.handles() {
                handle.succeed();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn round_loops_until_claims_are_exhausted() {
        let tenant = TenantId::new();
        let store = Arc::new(ScriptedStore::new(vec![
            (1..=2).map(|i| claimed(i, tenant)).collect(),
            vec![claimed(3, tenant)],
        ]));
        let round = DeliveryRound::new(store.clone(), DeliverySettings::default());
        let group = ConsumerGroup::new("g").unwrap();

        let report = round.run(&group, tenant, "orders", &SucceedsAll).await.unwrap();

        assert_eq!(report.materialized, 4);
        assert_eq!(report.claimed, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(report.finalized, 3);
        assert_eq!(store.finalized.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transient_claim_failures_are_retried_inside_the_round() {
        let tenant = TenantId::new();
        let store = Arc::new(ScriptedStore::new(vec![vec![claimed(1, tenant)]]));
        store.transient_claims_left.store(2, Ordering::SeqCst);

        let mut settings = DeliverySettings::default();
        settings.transient.base_delay = Duration::from_millis(1);
        settings.transient.max_delay = Duration::from_millis(2);

        let round = DeliveryRound::new(store, settings);
        let group = ConsumerGroup::new("g").unwrap();

        let report = round.run(&group, tenant, "orders", &SucceedsAll).await.unwrap();
        assert_eq!(report.claimed, 1);
    }

    #[tokio::test]
    async fn exhausted_transient_retries_surface_a_store_error() {
        let tenant = TenantId::new();
        let store = Arc::new(ScriptedStore::new(vec![vec![claimed(1, tenant)]]));
        store.transient_claims_left.store(100, Ordering::SeqCst);

        let mut settings = DeliverySettings::default();
        settings.transient.max_attempts = 2;
        settings.transient.base_delay = Duration::from_millis(1);

        let round = DeliveryRound::new(store, settings);
        let group = ConsumerGroup::new("g").unwrap();

        let err = round.run(&group, tenant, "orders", &SucceedsAll).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Transient(_))));
    }

    struct StallingStore;

    #[async_trait]
    impl WorkStore for StallingStore {
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
            // Simulates a wedged database call.
            std::future::pending().await
        }

        async fn extend_lease(
            &self,
            _group: &ConsumerGroup,
            _filter: &DeliveryFilter,
            _lease_duration: Duration,
        ) -> Result<u64, StoreError> {
            Ok(0)
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
    async fn tenant_timeout_cancels_only_that_round() {
        let store = Arc::new(StallingStore);
        let settings = DeliverySettings::default()
            .with_tenant_timeout(Duration::from_millis(20));
        let round = DeliveryRound::new(store, settings);
        let group = ConsumerGroup::new("g").unwrap();

        let results = round
            .run_tenants(&group, &[TenantId::new()], "orders", Arc::new(SucceedsAll))
            .await;

        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].1,
            Err(EngineError::TenantTimeout(_))
        ));
    }

    #[tokio::test]
    async fn panicked_tenant_round_is_dropped_without_wedging_the_run() {
        struct PanicsMidBatch;

        #[async_trait]
        impl Consumer for PanicsMidBatch {
            async fn consume(&self, _batch: &mut DeliveryBatch) -> Result<(), BoxError> {
                panic!("consumer blew up");
            }
        }

        let tenant = TenantId::new();
        let store = Arc::new(ScriptedStore::new(vec![vec![claimed(1, tenant)]]));
        let round = DeliveryRound::new(store.clone(), DeliverySettings::default());
        let group = ConsumerGroup::new("g").unwrap();

        let results = round
            .run_tenants(&group, &[tenant], "orders", Arc::new(PanicsMidBatch))
            .await;

        // The panicked round yields no result entry and nothing was
        // finalized; join still completes.
        assert!(results.is_empty());
        assert!(store.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_tenant_rounds_report_per_tenant() {
        let tenants = [TenantId::new(), TenantId::new()];
        let mut batches = Vec::new();
        batches.push(vec![claimed(1, tenants[0])]);
        batches.push(vec![claimed(2, tenants[1])]);
        let store = Arc::new(ScriptedStore::new(batches));

        let round = DeliveryRound::new(store, DeliverySettings::default());
        let group = ConsumerGroup::new("g").unwrap();

        let results = round
            .run_tenants(&group, &tenants, "orders", Arc::new(SucceedsAll))
            .await;

        assert_eq!(results.len(), 2);
        for (_, result) in results {
            assert!(result.is_ok());
        }
    }
}

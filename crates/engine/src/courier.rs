//! The delivery courier: consumer invocation and outcome policies.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::batch::DeliveryBatch;
use crate::retry::RetryPolicy;

/// Boxed consumer-side error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer logic: consume a claimed batch, mutating each handle's
/// outcome.
///
/// Contract:
/// - handles left untouched finalize as implicit successes;
/// - returning `Err` is the "unhandled exception" path: every message
///   still undecided in the batch becomes a retryable warning, and the
///   error is never rethrown to the scheduler.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError>;
}

#[async_trait]
impl<C> Consumer for std::sync::Arc<C>
where
    C: Consumer + ?Sized,
{
    async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError> {
        (**self).consume(batch).await
    }
}

/// Invokes consumer logic and classifies every message of the batch into
/// the outcome state machine.
#[derive(Debug, Clone, Default)]
pub struct Courier {
    policy: RetryPolicy,
}

impl Courier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Deliver one claimed batch. After this returns, no slot in the
    /// batch is left pending:
    ///
    /// - consumer returned `Ok`: untouched slots become `Ok`;
    /// - consumer returned `Err`: undecided slots become `Warning` with a
    ///   randomized backoff, so one failing message cannot stall the
    ///   batch;
    /// - retryable slots whose next attempt would exceed the configured
    ///   maximum are promoted to `PermanentFailure`.
    pub async fn deliver<C>(&self, consumer: &C, batch: &mut DeliveryBatch)
    where
        C: Consumer + ?Sized,
    {
        if batch.is_empty() {
            return;
        }

        match consumer.consume(batch).await {
            Ok(()) => {
                batch.resolve_pending_as_success();
            }
            Err(e) => {
                let text = e.to_string();
                warn!(error = %text, len = batch.len(), "consumer failed; batch marked retryable");
                batch.resolve_pending_as_warning(&text, || self.policy.random_postpone());
            }
        }

        batch.apply_retry_policy(self.policy.max_attempts, || self.policy.random_postpone());
        debug!(len = batch.len(), "batch outcomes resolved");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use postbox_core::{
        ConsumerGroup, LeaseToken, MsgId, OutcomeCode, PayloadId, TaskId, TenantId, WorkItem,
    };
    use serde_json::json;

    use super::*;
    use crate::store::ClaimedDelivery;

    fn claimed(task: i64, attempts: i32) -> ClaimedDelivery {
        let now = Utc::now();
        ClaimedDelivery {
            work_item: WorkItem {
                task_id: TaskId(task),
                consumer_group: ConsumerGroup::new("g").unwrap(),
                tenant_id: TenantId::new(),
                msg_id: MsgId(task),
                part: "orders".to_string(),
                payload_id: PayloadId::new(),
                msg_created_at: now,
                lease_token: LeaseToken::new(),
                lease_expires_at: now,
                delivery_id: None,
                attempt_count: attempts,
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

    struct MarksThreeOfFour;

    #[async_trait]
    impl Consumer for MarksThreeOfFour {
        async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError> {
            for (i, mut handle) in batch.handles().enumerate() {
                if i < 3 {
                    handle.succeed();
                }
            }
            Ok(())
        }
    }

    struct AlwaysThrows;

    #[async_trait]
    impl Consumer for AlwaysThrows {
        async fn consume(&self, _batch: &mut DeliveryBatch) -> Result<(), BoxError> {
            Err("kaboom".into())
        }
    }

    #[tokio::test]
    async fn untouched_messages_finalize_as_success() {
        let mut batch = DeliveryBatch::new((1..=4).map(|i| claimed(i, 0)).collect());
        Courier::default().deliver(&MarksThreeOfFour, &mut batch).await;

        for outcome in batch.outcomes() {
            assert_eq!(outcome.outcome, OutcomeCode::Ok);
        }
    }

    #[tokio::test]
    async fn consumer_error_blankets_batch_with_backoff_window() {
        let mut batch = DeliveryBatch::new((1..=4).map(|i| claimed(i, 0)).collect());
        Courier::default().deliver(&AlwaysThrows, &mut batch).await;

        let min = Duration::from_secs(10 * 60);
        let max = Duration::from_secs(45 * 60);
        for outcome in batch.outcomes() {
            assert_eq!(outcome.outcome, OutcomeCode::Warning);
            assert_eq!(outcome.message.as_deref(), Some("kaboom"));
            assert!(outcome.postpone >= min && outcome.postpone <= max);
            assert!(outcome.failure.is_some());
        }
    }

    #[tokio::test]
    async fn explicit_outcomes_survive_a_consumer_error() {
        struct SucceedsOneThenThrows;

        #[async_trait]
        impl Consumer for SucceedsOneThenThrows {
            async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError> {
                if let Some(mut handle) = batch.handle(0) {
                    handle.succeed();
                }
                Err("kaboom".into())
            }
        }

        let mut batch = DeliveryBatch::new((1..=2).map(|i| claimed(i, 0)).collect());
        Courier::default().deliver(&SucceedsOneThenThrows, &mut batch).await;

        let outcomes = batch.outcomes();
        assert_eq!(outcomes[0].outcome, OutcomeCode::Ok);
        assert_eq!(outcomes[1].outcome, OutcomeCode::Warning);
    }

    #[tokio::test]
    async fn exhausted_attempts_promote_to_permanent_failure() {
        let mut batch = DeliveryBatch::new(vec![claimed(1, 3)]);
        Courier::default().deliver(&AlwaysThrows, &mut batch).await;

        assert_eq!(batch.outcomes()[0].outcome, OutcomeCode::PermanentFailure);
    }

    #[tokio::test]
    async fn postponed_messages_are_not_promoted() {
        struct PostponesEverything;

        #[async_trait]
        impl Consumer for PostponesEverything {
            async fn consume(&self, batch: &mut DeliveryBatch) -> Result<(), BoxError> {
                for mut handle in batch.handles() {
                    handle.postpone(Duration::from_secs(30));
                }
                Ok(())
            }
        }

        let mut batch = DeliveryBatch::new(vec![claimed(1, 10)]);
        Courier::default().deliver(&PostponesEverything, &mut batch).await;

        let outcome = &batch.outcomes()[0];
        assert_eq!(outcome.outcome, OutcomeCode::Postponed);
        assert_eq!(outcome.postpone, Duration::from_secs(30));
    }
}

//! Claimed batches and per-message outcome handles.
//!
//! Consumer logic never touches work-item rows directly: it receives a
//! [`DeliveryBatch`] and records outcomes through mutable
//! [`DeliveryHandle`]s. A handle that is never touched finalizes as an
//! implicit success.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use postbox_core::{DomainError, MsgId, OutcomeCode, PayloadId, TaskId, TenantId};

use crate::store::ClaimedDelivery;

/// Failure details carried to the finalizer for error dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error_type: String,
    pub error_text: String,
}

/// One message's resolved outcome, ready to be flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub task_id: TaskId,
    pub msg_id: MsgId,
    pub payload_id: PayloadId,
    pub msg_created_at: DateTime<Utc>,
    pub outcome: OutcomeCode,
    pub message: Option<String>,
    /// Re-claim delay: `lease_expires_at = finalize time + postpone`.
    /// Only meaningful for non-terminal outcomes.
    pub postpone: Duration,
    pub failure: Option<Failure>,
}

#[derive(Debug)]
struct Slot {
    claimed: ClaimedDelivery,
    outcome: OutcomeCode,
    message: Option<String>,
    postpone: Duration,
    failure: Option<Failure>,
}

/// A claimed batch with mutable per-message outcome slots.
#[derive(Debug)]
pub struct DeliveryBatch {
    slots: Vec<Slot>,
}

impl DeliveryBatch {
    pub fn new(claimed: Vec<ClaimedDelivery>) -> Self {
        let slots = claimed
            .into_iter()
            .map(|claimed| Slot {
                claimed,
                outcome: OutcomeCode::Pending,
                message: None,
                postpone: Duration::ZERO,
                failure: None,
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Mutable handles over the batch, in claim (ascending task id) order.
    pub fn handles(&mut self) -> impl Iterator<Item = DeliveryHandle<'_>> {
        self.slots.iter_mut().map(|slot| DeliveryHandle { slot })
    }

    pub fn handle(&mut self, index: usize) -> Option<DeliveryHandle<'_>> {
        self.slots.get_mut(index).map(|slot| DeliveryHandle { slot })
    }

    /// Snapshot the batch for the finalizer.
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.slots
            .iter()
            .map(|slot| DeliveryOutcome {
                task_id: slot.claimed.work_item.task_id,
                msg_id: slot.claimed.work_item.msg_id,
                payload_id: slot.claimed.work_item.payload_id,
                msg_created_at: slot.claimed.work_item.msg_created_at,
                outcome: slot.outcome,
                message: slot.message.clone(),
                postpone: slot.postpone,
                failure: slot.failure.clone(),
            })
            .collect()
    }

    /// Resolve every still-pending slot as an implicit success.
    pub(crate) fn resolve_pending_as_success(&mut self) {
        for slot in &mut self.slots {
            if slot.outcome.is_pending() {
                slot.outcome = OutcomeCode::Ok;
            }
        }
    }

    /// Blanket-resolve every still-pending slot as a retryable warning.
    /// `postpone_for` supplies a (randomized) backoff per message.
    pub(crate) fn resolve_pending_as_warning(
        &mut self,
        error_text: &str,
        mut postpone_for: impl FnMut() -> Duration,
    ) {
        for slot in &mut self.slots {
            if slot.outcome.is_pending() {
                slot.outcome = OutcomeCode::Warning;
                slot.message = Some(error_text.to_string());
                slot.postpone = postpone_for();
                slot.failure = Some(Failure {
                    error_type: "consumer".to_string(),
                    error_text: error_text.to_string(),
                });
            }
        }
    }

    /// Give every retryable slot without an explicit delay a backoff
    /// window, and promote slots whose next attempt would exceed
    /// `max_attempts` to permanent failure.
    pub(crate) fn apply_retry_policy(
        &mut self,
        max_attempts: i32,
        mut postpone_for: impl FnMut() -> Duration,
    ) {
        for slot in &mut self.slots {
            if !slot.outcome.is_retryable() {
                continue;
            }
            if slot.claimed.work_item.attempt_count + 1 > max_attempts {
                slot.outcome = OutcomeCode::PermanentFailure;
                slot.postpone = Duration::ZERO;
            } else if slot.postpone.is_zero() {
                slot.postpone = postpone_for();
            }
        }
    }
}

/// Mutable view over one message in a claimed batch.
#[derive(Debug)]
pub struct DeliveryHandle<'a> {
    slot: &'a mut Slot,
}

impl DeliveryHandle<'_> {
    pub fn task_id(&self) -> TaskId {
        self.slot.claimed.work_item.task_id
    }

    pub fn msg_id(&self) -> MsgId {
        self.slot.claimed.work_item.msg_id
    }

    pub fn payload_id(&self) -> PayloadId {
        self.slot.claimed.work_item.payload_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.slot.claimed.work_item.tenant_id
    }

    pub fn part(&self) -> &str {
        &self.slot.claimed.work_item.part
    }

    pub fn payload_type(&self) -> &str {
        &self.slot.claimed.payload_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.slot.claimed.payload
    }

    /// Finalized attempts before this one.
    pub fn attempt_count(&self) -> i32 {
        self.slot.claimed.work_item.attempt_count
    }

    /// Outcome recorded so far in this attempt (`Pending` if untouched).
    pub fn outcome(&self) -> OutcomeCode {
        self.slot.outcome
    }

    /// Mark delivered.
    pub fn succeed(&mut self) {
        self.slot.outcome = OutcomeCode::Ok;
        self.slot.message = None;
    }

    /// Mark delivered with a specific success-bucket outcome.
    pub fn succeed_as(&mut self, outcome: OutcomeCode) -> Result<(), DomainError> {
        if !outcome.is_terminal_success() {
            return Err(DomainError::invariant(format!(
                "{outcome} is not a terminal success outcome"
            )));
        }
        self.slot.outcome = outcome;
        Ok(())
    }

    /// Deliberately discard the message. Terminal; no retry.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.slot.outcome = OutcomeCode::Aborted;
        self.slot.message = Some(reason.into());
    }

    /// Re-queue with an explicit delay without consuming an attempt.
    pub fn postpone(&mut self, delay: Duration) {
        self.slot.outcome = OutcomeCode::Postponed;
        self.slot.postpone = delay;
    }

    /// Record a retryable warning. The courier assigns the backoff
    /// window unless [`warn_in`](Self::warn_in) was used.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.slot.outcome = OutcomeCode::Warning;
        self.slot.failure = Some(Failure {
            error_type: "consumer".to_string(),
            error_text: message.clone(),
        });
        self.slot.message = Some(message);
    }

    /// Record a retryable warning with an explicit re-claim delay.
    pub fn warn_in(&mut self, message: impl Into<String>, delay: Duration) {
        self.warn(message);
        self.slot.postpone = delay;
    }

    /// Record a consumer failure (error bucket, retry-eligible).
    pub fn fail(&mut self, message: impl Into<String>) {
        // HandlerError is the catch-all of the error bucket.
        let _ = self.fail_as(OutcomeCode::HandlerError, message);
    }

    /// Record a specific error-bucket outcome.
    pub fn fail_as(
        &mut self,
        outcome: OutcomeCode,
        message: impl Into<String>,
    ) -> Result<(), DomainError> {
        if !outcome.is_error() {
            return Err(DomainError::invariant(format!(
                "{outcome} is not an error outcome"
            )));
        }
        let message = message.into();
        self.slot.outcome = outcome;
        self.slot.failure = Some(Failure {
            error_type: format!("{outcome:?}"),
            error_text: message.clone(),
        });
        self.slot.message = Some(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postbox_core::{ConsumerGroup, LeaseToken, WorkItem};
    use serde_json::json;

    fn claimed(attempts: i32) -> ClaimedDelivery {
        let now = Utc::now();
        ClaimedDelivery {
            work_item: WorkItem {
                task_id: TaskId(1),
                consumer_group: ConsumerGroup::new("g").unwrap(),
                tenant_id: TenantId::new(),
                msg_id: MsgId(1),
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
            payload_type: "order_created".to_string(),
            payload: json!({"n": 1}),
        }
    }

    #[test]
    fn untouched_slots_stay_pending() {
        let batch = DeliveryBatch::new(vec![claimed(0)]);
        assert_eq!(batch.outcomes()[0].outcome, OutcomeCode::Pending);
    }

    #[test]
    fn succeed_as_rejects_non_success_outcomes() {
        let mut batch = DeliveryBatch::new(vec![claimed(0)]);
        let mut handle = batch.handle(0).unwrap();
        assert!(handle.succeed_as(OutcomeCode::Warning).is_err());
        assert!(handle.succeed_as(OutcomeCode::NoContent).is_ok());
        assert_eq!(batch.outcomes()[0].outcome, OutcomeCode::NoContent);
    }

    #[test]
    fn warn_records_failure_for_dedup() {
        let mut batch = DeliveryBatch::new(vec![claimed(0)]);
        batch.handle(0).unwrap().warn("downstream flaked");

        let outcome = &batch.outcomes()[0];
        assert_eq!(outcome.outcome, OutcomeCode::Warning);
        assert_eq!(
            outcome.failure.as_ref().unwrap().error_text,
            "downstream flaked"
        );
    }

    #[test]
    fn apply_retry_policy_promotes_exhausted_slots() {
        let mut batch = DeliveryBatch::new(vec![claimed(3), claimed(0)]);
        batch.handle(0).unwrap().fail("boom");
        batch.handle(1).unwrap().fail("boom");

        batch.apply_retry_policy(3, || Duration::from_secs(600));

        let outcomes = batch.outcomes();
        assert_eq!(outcomes[0].outcome, OutcomeCode::PermanentFailure);
        assert_eq!(outcomes[1].outcome, OutcomeCode::HandlerError);
        assert_eq!(outcomes[1].postpone, Duration::from_secs(600));
    }
}

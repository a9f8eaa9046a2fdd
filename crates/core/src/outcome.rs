//! The delivery outcome state machine.
//!
//! Outcomes are a closed enum with stable wire codes and **centralized**
//! bucket predicates. Storage adapters build their eligibility predicates
//! from [`OutcomeCode::claim_eligible_codes`] instead of re-deriving
//! numeric ranges at each call site.
//!
//! Buckets, in lifecycle order:
//!
//! - non-terminal: `Pending`, `Processing`
//! - success-terminal (2xx family)
//! - `Postponed` — non-terminal re-queue with explicit delay
//! - warning (3xx–4xx family) — terminal per attempt, retry-eligible
//! - error (5xx family) — retry-eligible
//! - `PermanentFailure` — terminal, attempts exhausted

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Per-message delivery outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCode {
    /// Materialized, never claimed (or reclaim-eligible after lease expiry).
    Pending,
    /// Claimed by a live lease; not eligible while the lease holds.
    Processing,
    /// Delivered.
    Ok,
    /// Delivered; consumer created a resource.
    Created,
    /// Delivered; consumer accepted for deferred handling.
    Accepted,
    /// Delivered; nothing to do.
    NoContent,
    /// Delivered to a successor destination.
    MovedPermanently,
    /// Consumer deliberately discarded the message. Terminal success:
    /// the message will not be retried.
    Aborted,
    /// Re-queue with an explicit delay. Does not consume an attempt.
    Postponed,
    /// Retryable consumer-side warning.
    Warning,
    /// Consumer rejected the payload as malformed.
    RejectedPayload,
    /// Consumer asked to slow down.
    RateLimited,
    /// Consumer logic failed.
    HandlerError,
    /// Payload could not be (de)serialized.
    SerializationError,
    /// A downstream dependency of the consumer was unavailable.
    DependencyUnavailable,
    /// Consumer did not finish in time.
    Timeout,
    /// Attempts exhausted. Terminal; requires no recovery action.
    PermanentFailure,
}

impl OutcomeCode {
    /// Stable wire code persisted in the work-item and delivery-log rows.
    pub fn code(&self) -> i32 {
        match self {
            OutcomeCode::Pending => 0,
            OutcomeCode::Processing => 102,
            OutcomeCode::Ok => 200,
            OutcomeCode::Created => 201,
            OutcomeCode::Accepted => 202,
            OutcomeCode::NoContent => 204,
            OutcomeCode::MovedPermanently => 210,
            OutcomeCode::Aborted => 220,
            OutcomeCode::Postponed => 300,
            OutcomeCode::Warning => 350,
            OutcomeCode::RejectedPayload => 422,
            OutcomeCode::RateLimited => 429,
            OutcomeCode::HandlerError => 500,
            OutcomeCode::SerializationError => 502,
            OutcomeCode::DependencyUnavailable => 503,
            OutcomeCode::Timeout => 504,
            OutcomeCode::PermanentFailure => 600,
        }
    }

    /// Decode a persisted wire code.
    pub fn from_code(code: i32) -> Result<Self, DomainError> {
        let outcome = match code {
            0 => OutcomeCode::Pending,
            102 => OutcomeCode::Processing,
            200 => OutcomeCode::Ok,
            201 => OutcomeCode::Created,
            202 => OutcomeCode::Accepted,
            204 => OutcomeCode::NoContent,
            210 => OutcomeCode::MovedPermanently,
            220 => OutcomeCode::Aborted,
            300 => OutcomeCode::Postponed,
            350 => OutcomeCode::Warning,
            422 => OutcomeCode::RejectedPayload,
            429 => OutcomeCode::RateLimited,
            500 => OutcomeCode::HandlerError,
            502 => OutcomeCode::SerializationError,
            503 => OutcomeCode::DependencyUnavailable,
            504 => OutcomeCode::Timeout,
            600 => OutcomeCode::PermanentFailure,
            other => return Err(DomainError::UnknownOutcomeCode(other)),
        };
        Ok(outcome)
    }

    /// All defined codes, in wire-code order.
    pub const ALL: [OutcomeCode; 17] = [
        OutcomeCode::Pending,
        OutcomeCode::Processing,
        OutcomeCode::Ok,
        OutcomeCode::Created,
        OutcomeCode::Accepted,
        OutcomeCode::NoContent,
        OutcomeCode::MovedPermanently,
        OutcomeCode::Aborted,
        OutcomeCode::Postponed,
        OutcomeCode::Warning,
        OutcomeCode::RejectedPayload,
        OutcomeCode::RateLimited,
        OutcomeCode::HandlerError,
        OutcomeCode::SerializationError,
        OutcomeCode::DependencyUnavailable,
        OutcomeCode::Timeout,
        OutcomeCode::PermanentFailure,
    ];

    /// Not yet resolved in this attempt: pending or processing.
    pub fn is_pending(&self) -> bool {
        matches!(self, OutcomeCode::Pending | OutcomeCode::Processing)
    }

    /// Delivered for good; never claimed again.
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            OutcomeCode::Ok
                | OutcomeCode::Created
                | OutcomeCode::Accepted
                | OutcomeCode::NoContent
                | OutcomeCode::MovedPermanently
                | OutcomeCode::Aborted
        )
    }

    /// Re-queued with an explicit delay; does not consume an attempt.
    pub fn is_postponed(&self) -> bool {
        matches!(self, OutcomeCode::Postponed)
    }

    /// Warning bucket: consumer-reported, retry-eligible.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            OutcomeCode::Warning | OutcomeCode::RejectedPayload | OutcomeCode::RateLimited
        )
    }

    /// Error bucket: infrastructure-flavoured consumer failure, retry-eligible.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            OutcomeCode::HandlerError
                | OutcomeCode::SerializationError
                | OutcomeCode::DependencyUnavailable
                | OutcomeCode::Timeout
        )
    }

    /// Eligible for another attempt (warning or error bucket).
    pub fn is_retryable(&self) -> bool {
        self.is_warning() || self.is_error()
    }

    /// Attempts exhausted; never claimed again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, OutcomeCode::PermanentFailure)
    }

    /// Whether a claim may select a row in this state once its lease has
    /// expired: pending, postponed, or retryable.
    pub fn is_claim_eligible(&self) -> bool {
        self.is_pending() || self.is_postponed() || self.is_retryable()
    }

    /// Wire codes a claim predicate may select (`outcome_code = ANY($n)`).
    ///
    /// `Processing` is included on purpose: a processing row whose lease
    /// has expired belongs to a crashed claimer and must become claimable
    /// again. The lease-expiry predicate does the actual gating.
    pub fn claim_eligible_codes() -> Vec<i32> {
        Self::ALL
            .iter()
            .filter(|c| c.is_claim_eligible())
            .map(|c| c.code())
            .collect()
    }
}

impl core::fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wire_codes_round_trip() {
        for outcome in OutcomeCode::ALL {
            assert_eq!(OutcomeCode::from_code(outcome.code()).unwrap(), outcome);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(
            OutcomeCode::from_code(999),
            Err(DomainError::UnknownOutcomeCode(999))
        ));
    }

    #[test]
    fn claim_eligible_covers_pending_postponed_and_retryable() {
        let eligible = OutcomeCode::claim_eligible_codes();
        assert!(eligible.contains(&OutcomeCode::Pending.code()));
        assert!(eligible.contains(&OutcomeCode::Processing.code()));
        assert!(eligible.contains(&OutcomeCode::Postponed.code()));
        assert!(eligible.contains(&OutcomeCode::Warning.code()));
        assert!(eligible.contains(&OutcomeCode::HandlerError.code()));
        assert!(!eligible.contains(&OutcomeCode::Ok.code()));
        assert!(!eligible.contains(&OutcomeCode::Aborted.code()));
        assert!(!eligible.contains(&OutcomeCode::PermanentFailure.code()));
    }

    proptest! {
        /// Property: every defined outcome lands in exactly one lifecycle
        /// bucket (pending / success / postponed / warning / error /
        /// permanent).
        #[test]
        fn buckets_partition_the_state_machine(idx in 0usize..OutcomeCode::ALL.len()) {
            let outcome = OutcomeCode::ALL[idx];
            let buckets = [
                outcome.is_pending(),
                outcome.is_terminal_success(),
                outcome.is_postponed(),
                outcome.is_warning(),
                outcome.is_error(),
                outcome.is_permanent(),
            ];
            prop_assert_eq!(buckets.iter().filter(|b| **b).count(), 1);
        }
    }
}

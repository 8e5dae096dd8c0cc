//! Retry policy: turns each attempt's outcome into either a final result or a
//! re-enqueue onto the record's original queue.
//!
//! Retries carry no backoff of their own. A re-enqueued record rejoins the tail of
//! its queue and waits for the queue's fixed interval like any other record.

use crate::adapter::{FailureKind, SendResult};
use crate::queue::PendingRecord;
use crate::types::{Attempt, AttemptOutcome, ResultOutcome, ResultRecord};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per record, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// What to do with a record after an attempt.
#[derive(Debug)]
pub enum Decision {
    /// Write this result; no further attempts
    Finalize(ResultRecord),
    /// Put the record back on its queue for another attempt
    Requeue(PendingRecord),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Record the outcome on `attempt` and decide what happens to the record.
    pub fn settle(
        &self,
        pending: PendingRecord,
        attempt: &mut Attempt,
        result: SendResult,
    ) -> Decision {
        let attempts_used = attempt.attempt_number;

        let outcome = match result {
            Ok(response) => {
                attempt.outcome = AttemptOutcome::Success;
                ResultOutcome::Response(response)
            }
            Err(failure) => match failure.kind {
                FailureKind::Retryable if attempts_used < self.max_attempts => {
                    attempt.outcome = AttemptOutcome::RetryableFailure;
                    return Decision::Requeue(PendingRecord {
                        record: pending.record,
                        attempts_made: attempts_used,
                    });
                }
                FailureKind::Retryable => {
                    attempt.outcome = AttemptOutcome::RetryableFailure;
                    ResultOutcome::Error(format!(
                        "{}: retries exhausted after {} attempts",
                        failure.message, attempts_used
                    ))
                }
                FailureKind::Terminal => {
                    attempt.outcome = AttemptOutcome::TerminalFailure;
                    ResultOutcome::Error(format!(
                        "{}: terminal failure on attempt {}",
                        failure.message, attempts_used
                    ))
                }
            },
        };

        Decision::Finalize(ResultRecord {
            request: (*pending.record).clone(),
            outcome,
            attempts_used,
            sent_at: attempt.sent_at,
        })
    }
}

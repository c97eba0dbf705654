//! Injectable retry strategy for failed deliveries.

/// What to do with a delivery whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Leave the delivery unacknowledged; the broker redelivers it.
    Leave,
    /// Republish with an incremented attempt counter and ack the
    /// original delivery.
    Retry { next_attempt: u32 },
    /// Route the body to the dead-letter queue and ack the original.
    DeadLetter,
}

/// Decides the disposition of failed deliveries from their attempt
/// count. `max_attempts == 0` disables explicit retries entirely:
/// failures stay unacknowledged and broker redelivery applies, which
/// also means unparseable messages circulate forever.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn disabled() -> Self {
        Self { max_attempts: 0 }
    }

    /// Disposition for a failed delivery already republished `attempts`
    /// times.
    pub fn on_failure(&self, attempts: u32) -> FailureAction {
        if self.max_attempts == 0 {
            FailureAction::Leave
        } else if attempts + 1 >= self.max_attempts {
            FailureAction::DeadLetter
        } else {
            FailureAction::Retry {
                next_attempt: attempts + 1,
            }
        }
    }

    /// Disposition for a delivery that can never succeed, however often
    /// it is retried.
    pub fn on_poison(&self) -> FailureAction {
        if self.max_attempts == 0 {
            FailureAction::Leave
        } else {
            FailureAction::DeadLetter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_policy_leaves_failures_to_the_broker() {
        let policy = RetryPolicy::disabled();
        assert_eq!(policy.on_failure(0), FailureAction::Leave);
        assert_eq!(policy.on_failure(99), FailureAction::Leave);
        assert_eq!(policy.on_poison(), FailureAction::Leave);
    }

    #[test]
    fn test_retries_below_the_limit() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.on_failure(0), FailureAction::Retry { next_attempt: 1 });
        assert_eq!(policy.on_failure(1), FailureAction::Retry { next_attempt: 2 });
    }

    #[test]
    fn test_dead_letters_at_the_limit() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.on_failure(2), FailureAction::DeadLetter);
        assert_eq!(policy.on_failure(7), FailureAction::DeadLetter);
    }

    #[test]
    fn test_poison_skips_retries() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.on_poison(), FailureAction::DeadLetter);
    }
}

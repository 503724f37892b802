//! Retrying collector: one telemetry fetch wrapped in a bounded exponential backoff
//!
//! Attempt 1 runs immediately, attempt 2 after 2s, attempt 3 after 4s more.
//! Retry bookkeeping lives in a `RetryState` value owned by each call, so
//! concurrent targets never share counters.

use crate::error::{CollectionError, FetchError};
use crate::model::{Credentials, Endpoint};
use crate::sampler::Sample;
use crate::telemetry::TelemetryClient;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Retry budget for one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait between attempt `attempt` and the next one (`base * 2^(attempt-1)`),
    /// `None` once the budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << (attempt - 1).min(20);
        Some(self.base_delay.saturating_mul(factor))
    }
}

/// Attempt counter threaded through one `collect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// State for the next attempt
    pub fn begin(self) -> Self {
        Self {
            attempt: self.attempt + 1,
        }
    }

    /// Delay before retrying after the current attempt failed, `None` when exhausted
    pub fn after_failure(&self, policy: &RetryPolicy) -> Option<Duration> {
        policy.delay_after(self.attempt)
    }
}

/// Emitted for every failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub attempt: u32,
    pub max_attempts: u32,
    pub cause: String,
    /// `None` on the final attempt
    pub next_delay: Option<Duration>,
}

/// Turns a series of fetch attempts into one sample or one `CollectionError`
pub struct RetryingCollector<'a, C> {
    client: &'a C,
    policy: RetryPolicy,
}

impl<'a, C: TelemetryClient> RetryingCollector<'a, C> {
    pub fn new(client: &'a C, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub async fn collect<F>(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        mut on_retry: F,
    ) -> Result<Sample, CollectionError>
    where
        F: FnMut(RetryEvent),
    {
        let mut state = RetryState::default();

        loop {
            state = state.begin();

            let err = match self.client.fetch(endpoint, credentials).await {
                Ok(snapshot) => return Ok(Sample::new(snapshot)),
                Err(FetchError::Contract(contract)) => return Err(CollectionError::Contract(contract)),
                Err(err) => err,
            };

            let next_delay = state.after_failure(&self.policy);
            debug!(
                "Fetch from {} failed (attempt {}/{}): {}",
                endpoint,
                state.attempt(),
                self.policy.max_attempts,
                err
            );

            on_retry(RetryEvent {
                attempt: state.attempt(),
                max_attempts: self.policy.max_attempts,
                cause: err.to_string(),
                next_delay,
            });

            match next_delay {
                Some(delay) => sleep(delay).await,
                None => {
                    return Err(CollectionError::Exhausted {
                        attempts: state.attempt(),
                        last_cause: err,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContractError;
    use crate::testing::{snapshot, transient, ScriptedClient};
    use tokio::time::Instant;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "10.1.2.3".into(),
            port: 443,
            host_header: None,
        }
    }

    #[test]
    fn test_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_after(3), None);
        assert_eq!(policy.delay_after(0), None);
    }

    #[test]
    fn test_state_machine() {
        let policy = RetryPolicy::default();
        let state = RetryState::default().begin();
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.after_failure(&policy), Some(Duration::from_secs(2)));
        let state = state.begin().begin();
        assert_eq!(state.attempt(), 3);
        assert_eq!(state.after_failure(&policy), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_succeeds() {
        let client = ScriptedClient::new(vec![Ok(snapshot(250))]);
        let mut events = Vec::new();

        let sample = RetryingCollector::new(&client, RetryPolicy::default())
            .collect(&endpoint(), &Credentials::new("root", "calvin"), |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(sample.system_watts(), Some(250));
        assert!(events.is_empty());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let client = ScriptedClient::new(vec![transient(), transient(), Ok(snapshot(300))]);
        let mut events = Vec::new();
        let started = Instant::now();

        let sample = RetryingCollector::new(&client, RetryPolicy::default())
            .collect(&endpoint(), &Credentials::new("root", "calvin"), |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(sample.system_watts(), Some(300));
        let delays: Vec<_> = events.iter().map(|e| e.next_delay).collect();
        assert_eq!(
            delays,
            vec![Some(Duration::from_secs(2)), Some(Duration::from_secs(4))]
        );
        assert_eq!(events[0].attempt, 1);
        assert_eq!(events[1].attempt, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_one_delay() {
        let client = ScriptedClient::new(vec![transient(), Ok(snapshot(300))]);
        let mut events = Vec::new();
        let started = Instant::now();

        RetryingCollector::new(&client, RetryPolicy::default())
            .collect(&endpoint(), &Credentials::new("root", "calvin"), |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].next_delay, Some(Duration::from_secs(2)));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_without_third_delay() {
        let client = ScriptedClient::new(vec![transient(), transient(), transient(), transient()]);
        let mut events = Vec::new();
        let started = Instant::now();

        let err = RetryingCollector::new(&client, RetryPolicy::default())
            .collect(&endpoint(), &Credentials::new("root", "calvin"), |e| events.push(e))
            .await
            .unwrap_err();

        assert!(matches!(err, CollectionError::Exhausted { attempts: 3, .. }));
        assert_eq!(client.calls(), 3);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].next_delay, None);
        // 2s + 4s, nothing after the last attempt
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contract_failure_is_not_retried() {
        let client = ScriptedClient::new(vec![
            Err(FetchError::Contract(ContractError("No chassis found".into()))),
            Ok(snapshot(300)),
        ]);
        let mut events = Vec::new();
        let started = Instant::now();

        let err = RetryingCollector::new(&client, RetryPolicy::default())
            .collect(&endpoint(), &Credentials::new("root", "calvin"), |e| events.push(e))
            .await
            .unwrap_err();

        assert!(matches!(err, CollectionError::Contract(_)));
        assert_eq!(client.calls(), 1);
        assert!(events.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}

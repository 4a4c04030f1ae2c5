use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, StateMachine};
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

/// Breaker shared by all calls to one external collaborator.
pub type ServiceBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for an HTTP collaborator (content, intel, relay).
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// While OPEN, calls fail fast with `ExternalApiError` and the caller's own
/// degradation path (template content, rules-only scoring, follow-up flag)
/// takes over immediately instead of waiting out a timeout.
pub fn create_service_circuit_breaker() -> ServiceBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Runs `call` through `breaker`, unwrapping the breaker's error type.
pub async fn guarded<T, F>(breaker: &ServiceBreaker, service: &str, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match failsafe::futures::CircuitBreaker::call(breaker, Box::pin(call)).await {
        Ok(value) => Ok(value),
        Err(failsafe::Error::Inner(e)) => Err(e),
        Err(failsafe::Error::Rejected) => {
            tracing::warn!("{} circuit is open, failing fast", service);
            Err(AppError::ExternalApiError(format!(
                "{} circuit open after repeated failures",
                service
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_opens_after_failures() {
        let cb = create_service_circuit_breaker();

        // Simulate 5 consecutive failures
        for _ in 0..5 {
            let result: Result<(), AppError> = guarded(&cb, "relay", async {
                Err(AppError::Delivery("simulated error".to_string()))
            })
            .await;
            assert!(matches!(result, Err(AppError::Delivery(_))));
        }

        // Next call should be rejected without running
        let result: Result<(), AppError> = guarded(&cb, "relay", async { Ok(()) }).await;
        assert!(matches!(result, Err(AppError::ExternalApiError(_))));
    }

    #[tokio::test]
    async fn test_circuit_passes_success_through() {
        let cb = create_service_circuit_breaker();
        let result = guarded(&cb, "intel", async { Ok::<i32, AppError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}

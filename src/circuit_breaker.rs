use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{CircuitBreaker, Config, StateMachine};
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

/// Circuit breaker type shared by the upstream data providers.
pub type UpstreamBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for an upstream data provider.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// While OPEN, callers skip the network entirely and go straight to their
/// fallback value.
pub fn create_upstream_circuit_breaker() -> UpstreamBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Runs `request` through `breaker`, recording its outcome.
///
/// Returns `ExternalApiError` without polling `request` when the circuit is open.
pub async fn call_guarded<T, F>(
    breaker: &UpstreamBreaker,
    upstream: &str,
    request: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    if !breaker.is_call_permitted() {
        tracing::warn!("Circuit open for {}, skipping upstream call", upstream);
        return Err(AppError::ExternalApiError(format!(
            "{} circuit is open",
            upstream
        )));
    }

    let outcome = request.await;

    match breaker.call(|| outcome) {
        Ok(value) => Ok(value),
        Err(failsafe::Error::Inner(e)) => Err(e),
        Err(failsafe::Error::Rejected) => Err(AppError::ExternalApiError(format!(
            "{} circuit is open",
            upstream
        ))),
    }
}

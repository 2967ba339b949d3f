use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use askrepo_core::context::LlmContext;
use askrepo_core::errors::GatewayError;
use askrepo_core::provider::{Completion, CompletionOptions, LanguageModel};

/// Retry and circuit breaker settings for [`ReliableProvider`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a [`LanguageModel`] with retries and a circuit breaker.
///
/// - Retryable errors are retried with exponential backoff plus jitter
/// - A `Retry-After` hint replaces the computed delay
/// - N consecutive failed calls open the circuit; after the cooldown one
///   trial call is let through and a success closes it again
pub struct ReliableProvider<P: LanguageModel> {
    inner: P,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    total_retries: AtomicU64,
}

impl<P: LanguageModel> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.circuit_state.write();
        let trip = match *state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.config.circuit_breaker_threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            warn!(
                failures,
                cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                "circuit breaker opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }

        let exp_delay =
            self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(1.0);

        Duration::from_millis(final_ms as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[async_trait]
impl<P: LanguageModel> LanguageModel for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(
        &self,
        context: &LlmContext,
        options: &CompletionOptions,
    ) -> Result<Completion, GatewayError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.complete(context, options).await {
                Ok(completion) => {
                    self.record_success();
                    return Ok(completion);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        self.record_failure();
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying language model call"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.check_circuit()?;
                }
            }
        }
    }
}

//! Stability predicates and their evaluation
//!
//! Cluster stability (data redistribution finishing, members rejoining) is not
//! something the engine can subscribe to, only observe. A [`StabilityEvaluator`]
//! therefore polls a [`StabilityPredicate`] with bounded backoff until it holds
//! or a deadline passes.

use crate::cluster::Cluster;
use crate::error::{EnsembleError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable overriding the stability timeout, in seconds
pub const TIMEOUT_ENV: &str = "ENSEMBLE_STABILITY_TIMEOUT";
/// Environment variable overriding the maximum poll interval, in milliseconds
pub const MAX_POLL_ENV: &str = "ENSEMBLE_STABILITY_MAX_POLL_MS";
/// Environment variable overriding the retry strategy
pub const STRATEGY_ENV: &str = "ENSEMBLE_STABILITY_STRATEGY";

/// Shortest pause between two attempts
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Base delay of the exponential and fixed strategies
const BASE_DELAY: Duration = Duration::from_millis(50);

type Check = dyn Fn(&Cluster) -> Result<bool> + Send + Sync;

/// A condition over the whole cluster that must hold before a rolling
/// mutation continues
#[derive(Clone)]
pub struct StabilityPredicate {
    name: String,
    check: Arc<Check>,
}

impl StabilityPredicate {
    /// Create a named predicate
    pub fn new<F>(name: &str, check: F) -> Self
    where
        F: Fn(&Cluster) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            check: Arc::new(check),
        }
    }

    /// A predicate that always holds
    pub fn always() -> Self {
        Self::new("always", |_| Ok(true))
    }

    /// Holds when every member of the cluster is operational
    pub fn all_operational() -> Self {
        Self::new("all members operational", |cluster| {
            Ok(cluster.members().iter().all(|m| m.is_operational()))
        })
    }

    /// Holds when the cluster has at least `size` members
    pub fn minimum_size(size: usize) -> Self {
        Self::new(&format!("at least {} members", size), move |cluster| {
            Ok(cluster.len() >= size)
        })
    }

    /// Holds when both predicates hold
    pub fn and(self, other: StabilityPredicate) -> Self {
        let name = format!("{} and {}", self.name, other.name);
        Self::new(&name, move |cluster| {
            Ok(self.test(cluster)? && other.test(cluster)?)
        })
    }

    /// Predicate name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the predicate once
    pub fn test(&self, cluster: &Cluster) -> Result<bool> {
        (self.check)(cluster)
    }
}

impl fmt::Debug for StabilityPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StabilityPredicate").field(&self.name).finish()
    }
}

/// How long to wait between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// 1, 1, 2, 3, 5, ... milliseconds
    Fibonacci,
    /// 50, 100, 200, ... milliseconds
    Exponential,
    /// A constant 50 milliseconds
    Fixed,
}

impl RetryStrategy {
    fn delays(self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            RetryStrategy::Fibonacci => {
                let sequence = std::iter::successors(Some((1u64, 1u64)), |&(a, b)| {
                    Some((b, a.saturating_add(b)))
                });
                Box::new(sequence.map(|(a, _)| Duration::from_millis(a)))
            }
            RetryStrategy::Exponential => {
                let sequence = std::iter::successors(Some(BASE_DELAY), |d| Some(d.saturating_mul(2)));
                Box::new(sequence)
            }
            RetryStrategy::Fixed => Box::new(std::iter::repeat(BASE_DELAY)),
        }
    }
}

/// Stability polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Maximum time to wait for the predicate
    pub timeout: Duration,
    /// Pause before the first attempt
    pub initial_delay: Duration,
    /// Upper bound on the pause between attempts
    pub max_poll_interval: Duration,
    /// Growth of the pause between attempts
    pub strategy: RetryStrategy,
    /// Randomize each pause between half and all of its value
    pub jitter: bool,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            initial_delay: Duration::ZERO,
            max_poll_interval: Duration::from_millis(1000),
            strategy: RetryStrategy::Fibonacci,
            jitter: true,
        }
    }
}

impl StabilityConfig {
    /// Defaults overridden by the `ENSEMBLE_STABILITY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(TIMEOUT_ENV) {
            let secs: u64 = value.trim().parse().map_err(|_| {
                EnsembleError::InvalidConfig(format!("{} must be a number of seconds: {}", TIMEOUT_ENV, value))
            })?;
            config.timeout = Duration::from_secs(secs);
        }

        if let Ok(value) = std::env::var(MAX_POLL_ENV) {
            let millis: u64 = value.trim().parse().map_err(|_| {
                EnsembleError::InvalidConfig(format!("{} must be a number of milliseconds: {}", MAX_POLL_ENV, value))
            })?;
            config.max_poll_interval = Duration::from_millis(millis);
        }

        if let Ok(value) = std::env::var(STRATEGY_ENV) {
            let named: NamedStrategy = value.parse()?;
            config.strategy = named.strategy;
            config.jitter = named.jitter;
        }

        Ok(config)
    }

    /// Same configuration with another timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A retry strategy as written in configuration, e.g. `random.fibonacci`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedStrategy {
    pub strategy: RetryStrategy,
    pub jitter: bool,
}

impl FromStr for NamedStrategy {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        let (jitter, name) = match normalized.strip_prefix("random.") {
            Some(rest) => (true, rest),
            None => (false, normalized.as_str()),
        };

        let strategy = match name {
            "fibonacci" => RetryStrategy::Fibonacci,
            "exponential" => RetryStrategy::Exponential,
            "fixed" => RetryStrategy::Fixed,
            other => {
                return Err(EnsembleError::InvalidConfig(format!(
                    "unknown retry strategy: {}",
                    other
                )))
            }
        };

        Ok(Self { strategy, jitter })
    }
}

/// Polls stability predicates
#[derive(Debug, Clone, Default)]
pub struct StabilityEvaluator {
    config: StabilityConfig,
}

impl StabilityEvaluator {
    /// Create an evaluator
    pub fn new(config: StabilityConfig) -> Self {
        Self { config }
    }

    /// Evaluator configuration
    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Poll `predicate` against `cluster` until it holds or the timeout passes.
    ///
    /// Returns the number of attempts made.
    pub fn evaluate(&self, predicate: &StabilityPredicate, cluster: &Cluster) -> Result<u32> {
        self.ensure(predicate.name(), || predicate.test(cluster))
    }

    /// Poll `probe` until it returns `Ok(true)` or the timeout passes.
    ///
    /// A probe error means "not yet"; it is remembered and reported if the
    /// deadline is reached. The probe is always attempted at least once.
    pub fn ensure<F>(&self, name: &str, mut probe: F) -> Result<u32>
    where
        F: FnMut() -> Result<bool>,
    {
        let started = Instant::now();
        // A timeout too large for an Instant never expires
        let deadline = started.checked_add(self.config.timeout);

        if !self.config.initial_delay.is_zero() {
            thread::sleep(self.config.initial_delay.min(self.config.timeout));
        }

        let mut delays = self.config.strategy.delays();
        let mut attempts = 0u32;
        let mut last_error = None;

        loop {
            attempts += 1;

            match probe() {
                Ok(true) => {
                    tracing::debug!(
                        "'{}' satisfied after {} attempt(s) in {:?}",
                        name,
                        attempts,
                        started.elapsed()
                    );
                    return Ok(attempts);
                }
                Ok(false) => last_error = None,
                Err(e) => {
                    tracing::debug!("'{}' could not be evaluated: {}", name, e);
                    last_error = Some(e.to_string());
                }
            }

            let mut delay = self.next_delay(&mut delays);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(EnsembleError::StabilityTimeout {
                        predicate: name.to_string(),
                        timeout: self.config.timeout,
                        attempts,
                        last_error,
                    });
                }
                delay = delay.min(deadline - now);
            }
            thread::sleep(delay);
        }
    }

    fn next_delay(&self, delays: &mut dyn Iterator<Item = Duration>) -> Duration {
        let mut delay = delays
            .next()
            .unwrap_or(self.config.max_poll_interval)
            .min(self.config.max_poll_interval);

        if self.config.jitter && delay > MIN_POLL_INTERVAL {
            let millis = delay.as_millis() as u64;
            delay = Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis));
        }

        delay.max(MIN_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::platform::{Role, SimulatedPlatform};

    fn quick(timeout: Duration) -> StabilityEvaluator {
        StabilityEvaluator::new(StabilityConfig {
            timeout,
            max_poll_interval: Duration::from_millis(5),
            ..StabilityConfig::default()
        })
    }

    #[test]
    fn test_ensure_returns_on_first_success() {
        let attempts = quick(Duration::from_secs(1)).ensure("ready", || Ok(true)).unwrap();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_ensure_retries_until_true() {
        let mut calls = 0;
        let attempts = quick(Duration::from_secs(5))
            .ensure("third time", || {
                calls += 1;
                Ok(calls >= 3)
            })
            .unwrap();

        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_errors_count_as_not_yet_stable() {
        let mut calls = 0;
        let attempts = quick(Duration::from_secs(5))
            .ensure("flaky", || {
                calls += 1;
                if calls < 2 {
                    Err(EnsembleError::Process("member unreachable".to_string()))
                } else {
                    Ok(true)
                }
            })
            .unwrap();

        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_timeout_reports_last_error() {
        let started = Instant::now();
        let result = quick(Duration::from_millis(50))
            .ensure("never", || Err(EnsembleError::Process("unreachable".to_string())));

        match result {
            Err(EnsembleError::StabilityTimeout {
                predicate,
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(predicate, "never");
                assert!(attempts >= 1);
                assert!(last_error.unwrap().contains("unreachable"));
            }
            other => panic!("expected a stability timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_zero_timeout_still_attempts_once() {
        let mut calls = 0;
        let result = quick(Duration::ZERO).ensure("once", || {
            calls += 1;
            Ok(false)
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_unbounded_timeout_does_not_overflow() {
        let evaluator = StabilityEvaluator::new(StabilityConfig::default().with_timeout(Duration::MAX));
        assert_eq!(evaluator.ensure("ready", || Ok(true)).unwrap(), 1);

        let mut calls = 0;
        let attempts = quick(Duration::MAX)
            .ensure("second time", || {
                calls += 1;
                Ok(calls >= 2)
            })
            .unwrap();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_fibonacci_delays() {
        let delays: Vec<u128> = RetryStrategy::Fibonacci
            .delays()
            .take(6)
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_delays_are_capped() {
        let evaluator = StabilityEvaluator::new(StabilityConfig {
            max_poll_interval: Duration::from_millis(100),
            strategy: RetryStrategy::Exponential,
            jitter: false,
            ..StabilityConfig::default()
        });

        let mut delays = RetryStrategy::Exponential.delays();
        let observed: Vec<Duration> = (0..5).map(|_| evaluator.next_delay(&mut *delays)).collect();

        assert_eq!(observed[0], Duration::from_millis(50));
        assert!(observed.iter().all(|d| *d <= Duration::from_millis(100)));
    }

    #[test]
    fn test_named_strategy_parsing() {
        let named: NamedStrategy = "random.exponential".parse().unwrap();
        assert_eq!(named.strategy, RetryStrategy::Exponential);
        assert!(named.jitter);

        let named: NamedStrategy = "Fixed".parse().unwrap();
        assert_eq!(named.strategy, RetryStrategy::Fixed);
        assert!(!named.jitter);

        assert!("sometimes".parse::<NamedStrategy>().is_err());
    }

    #[test]
    fn test_builtin_predicates() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = Cluster::new(Options::empty());
        cluster
            .expand(2, platform.clone(), Role::new("node"), &Options::empty())
            .unwrap();

        assert!(StabilityPredicate::all_operational().test(&cluster).unwrap());
        assert!(StabilityPredicate::minimum_size(2).test(&cluster).unwrap());

        let combined = StabilityPredicate::always().and(StabilityPredicate::minimum_size(3));
        assert_eq!(combined.name(), "always and at least 3 members");
        assert!(!combined.test(&cluster).unwrap());

        let attempts = quick(Duration::from_secs(1))
            .evaluate(&StabilityPredicate::minimum_size(2), &cluster)
            .unwrap();
        assert_eq!(attempts, 1);
    }
}

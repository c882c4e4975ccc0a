//! Retry loop for transient backend failures.
//!
//! A [`RetryPolicy`] holds an ordered list of delays. An operation is run
//! once, and after each failure the caller's classifier decides whether the
//! error is transient. Transient failures wait the next delay and run the
//! operation again from scratch; anything else, or running out of delays,
//! returns the error as is.
//!
//! With delays `[1s, 3s, 5s]` an operation is attempted at most four times.

use std::time::Duration;

/// Default delays between attempts against the database.
pub const DEFAULT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Ordered delays between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DELAYS.to_vec())
    }
}

impl RetryPolicy {
    /// Creates a policy that waits each of `delays` in turn.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// The configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Runs `op`, retrying while `is_transient` accepts the error and delays
    /// remain.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once every delay has been used.
    pub fn run<T, E, F, C>(&self, is_transient: C, op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_with_sleep(is_transient, op, std::thread::sleep)
    }

    /// Same as [`RetryPolicy::run`] with the sleep function supplied by the
    /// caller.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::run`].
    pub fn run_with_sleep<T, E, F, C, S>(&self, is_transient: C, mut op: F, mut sleep: S) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        C: Fn(&E) -> bool,
        S: FnMut(Duration),
        E: std::fmt::Display,
    {
        let mut delays = self.delays.iter();
        let mut attempt = 1usize;

        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_transient(&err) {
                return Err(err);
            }

            let Some(&delay) = delays.next() else {
                return Err(err);
            };

            tracing::warn!(attempt, ?delay, error = %err, "transient failure, retrying");
            sleep(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn transient(err: &Failure) -> bool {
        *err == Failure::Transient
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let d1 = Duration::from_millis(10);
        let d2 = Duration::from_millis(20);
        let policy = RetryPolicy::new(vec![d1, d2]);

        let mut calls = 0;
        let mut waits = Vec::new();
        let result = policy.run_with_sleep(
            transient,
            || {
                calls += 1;
                if calls < 3 { Err(Failure::Transient) } else { Ok(calls) }
            },
            |d| waits.push(d),
        );

        assert_eq!(result, Ok(3));
        assert_eq!(waits, vec![d1, d2]);
    }

    #[test]
    fn test_permanent_failure_returns_without_waiting() {
        let policy = RetryPolicy::new(vec![Duration::from_secs(1), Duration::from_secs(3)]);

        let mut calls = 0;
        let mut waits = Vec::new();
        let result: Result<(), _> = policy.run_with_sleep(
            transient,
            || {
                calls += 1;
                Err(Failure::Permanent)
            },
            |d| waits.push(d),
        );

        assert_eq!(result, Err(Failure::Permanent));
        assert_eq!(calls, 1);
        assert!(waits.is_empty());
    }

    #[test]
    fn test_gives_up_after_delays_exhausted() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(1), Duration::from_millis(2)]);

        let mut calls = 0;
        let mut waits = Vec::new();
        let result: Result<(), _> = policy.run_with_sleep(
            transient,
            || {
                calls += 1;
                Err(Failure::Transient)
            },
            |d| waits.push(d),
        );

        assert_eq!(result, Err(Failure::Transient));
        assert_eq!(calls, 3);
        assert_eq!(waits.len(), 2);
    }

    #[test]
    fn test_permanent_failure_after_transient_stops_immediately() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(1); 5]);

        let mut calls = 0;
        let result: Result<(), _> = policy.run_with_sleep(
            transient,
            || {
                calls += 1;
                if calls == 1 { Err(Failure::Transient) } else { Err(Failure::Permanent) }
            },
            |_| {},
        );

        assert_eq!(result, Err(Failure::Permanent));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_empty_policy_runs_once() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::none().run(transient, || {
            calls += 1;
            Err(Failure::Transient)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_run_sleeps_real_delays() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(20)]);
        let start = std::time::Instant::now();
        let mut calls = 0;
        let result = policy.run(transient, || {
            calls += 1;
            if calls == 1 { Err(Failure::Transient) } else { Ok(()) }
        });
        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}

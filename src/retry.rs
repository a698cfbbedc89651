use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A single attempt, no retries.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// Earlier failures are logged and dropped; the caller only sees the
    /// error of the final attempt.
    pub fn run<T, E, F>(&self, what: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        self.run_if(what, |_| true, op)
    }

    /// Like [`run`](Self::run), but an error for which `is_transient`
    /// returns false is handed back at once.
    pub fn run_if<T, E, P, F>(&self, what: &str, is_transient: P, mut op: F) -> Result<T, E>
    where
        E: Display,
        P: Fn(&E) -> bool,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && is_transient(&e) => {
                    log::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what,
                        attempt,
                        attempts,
                        e,
                        self.delay
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    log::debug!("{} failed after {} attempt(s): {}", what, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use log::warn;

/// Runs `op` up to `attempts` times (at least once), sleeping `delay`
/// between failures. Returns the last error if every attempt fails.
pub fn with_retry<T, E, F>(attempts: u32, delay: Duration, what: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("Attempt {}/{} for {} failed: {}. Retrying in {:?}...", attempt, attempts, what, e, delay);
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = with_retry(3, Duration::ZERO, "test", || {
            calls += 1;
            if calls < 3 {
                Err(format!("fail {}", calls))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn gives_up_with_last_error() {
        let mut calls = 0;
        let result: Result<(), String> = with_retry(2, Duration::ZERO, "test", || {
            calls += 1;
            Err(format!("fail {}", calls))
        });
        assert_eq!(result, Err("fail 2".to_string()));
        assert_eq!(calls, 2);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _: Result<(), &str> = with_retry(0, Duration::ZERO, "test", || {
            calls += 1;
            Err("nope")
        });
        assert_eq!(calls, 1);
    }
}

use anyhow::Error;
use log::debug;
use stack_string::StackString;
use std::{future::Future, time::Duration};
use tokio::time::sleep;

use crate::errors::HygieneError;

/// Outcome of one poll attempt. Unrecoverable failures are returned as `Err`.
#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus<T> {
    Done(T),
    Pending,
}

/// Call `f` up to `attempts` times, sleeping `delay` between attempts, until
/// it reports `Done`.
/// # Errors
/// Returns the first error from `f`, or `PollExhausted` when every attempt
/// was still pending
pub async fn poll_with_fixed_delay<T, F, Fut>(
    what: &str,
    attempts: usize,
    delay: Duration,
    mut f: F,
) -> Result<T, Error>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, Error>>,
{
    for attempt in 1..=attempts {
        if let PollStatus::Done(value) = f(attempt).await? {
            return Ok(value);
        }
        debug!("waiting on {what} attempt={attempt} of {attempts}");
        if attempt < attempts {
            sleep(delay).await;
        }
    }
    Err(HygieneError::PollExhausted {
        what: StackString::from(what),
        attempts,
    }
    .into())
}

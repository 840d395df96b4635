//! Poll-until-terminal as a lazy stream.
//!
//! Every status poll in the console follows the same discipline: fetch on a
//! fixed cadence, yield each snapshot, and stop by itself right after the
//! first terminal snapshot. Dropping the stream drops the timer with it, so
//! cancelling a consumer never leaves a ticking interval behind.

use futures::Stream;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// A status snapshot that knows whether polling should continue.
pub trait PollStatus {
    fn is_terminal(&self) -> bool;
}

struct PollState<F> {
    ticker: Interval,
    fetch: F,
    finished: bool,
}

/// Poll `fetch` every `period` until it yields a terminal snapshot.
///
/// The first fetch happens immediately. Errors are yielded and polling
/// continues; the consumer decides when to give up by dropping the stream.
/// After a terminal snapshot the stream ends and `fetch` is never called
/// again.
pub fn poll_until_terminal<T, E, F, Fut>(
    period: Duration,
    fetch: F,
) -> impl Stream<Item = Result<T, E>>
where
    T: PollStatus,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut ticker = interval(period);
    // A slow response delays the next poll instead of causing a burst.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = PollState {
        ticker,
        fetch,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        state.ticker.tick().await;
        let result = (state.fetch)().await;
        if matches!(&result, Ok(snapshot) if snapshot.is_terminal()) {
            state.finished = true;
        }
        Some((result, state))
    })
}

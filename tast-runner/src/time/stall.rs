// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use pin_project_lite::pin_project;
use std::{future::Future, pin::Pin, task::Poll, time::Duration};
use tokio::time::{Instant, Sleep};

pub(crate) fn stall_timer(budget: Duration) -> StallTimer {
    StallTimer::new(budget)
}

pin_project! {
    /// A wrapper around `tokio::time::Sleep` that rearms every time an event
    /// is observed. Completes once a full budget elapses with no rearm.
    #[derive(Debug)]
    pub(crate) struct StallTimer {
        #[pin]
        sleep: Sleep,
        budget: Duration,
    }
}

impl StallTimer {
    fn new(budget: Duration) -> Self {
        Self {
            sleep: tokio::time::sleep(budget),
            budget,
        }
    }

    /// Pushes the deadline out by the given budget, measured from now.
    pub(crate) fn rearm(self: Pin<&mut Self>, budget: Duration) {
        let this = self.project();
        *this.budget = budget;
        this.sleep.reset(Instant::now() + budget);
    }

    /// Returns the budget the timer is currently armed with.
    pub(crate) fn budget(&self) -> Duration {
        self.budget
    }
}

impl Future for StallTimer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.project().sleep.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearm_pushes_out_the_deadline() {
        let mut timer = std::pin::pin!(stall_timer(Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        timer.as_mut().rearm(Duration::from_secs(5));

        // 3s in: would have fired at 5s without the rearm; now fires at 8s.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(4)) => {}
            _ = &mut timer => panic!("timer fired before rearmed deadline"),
        }

        tokio::time::timeout(Duration::from_secs(2), &mut timer)
            .await
            .expect("timer fires after the rearmed budget");
    }
}

// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run cancellation with a typed reason.
//!
//! The run's root [`CancelHandle`] cascades to every open SSH command, gRPC
//! call, port forward, and the bundle subprocess. Carrying the reason lets
//! callers distinguish a timeout from a user abort from fail-fast when
//! synthesizing terminal errors.

use std::fmt;
use tokio::sync::watch;

/// Why a run was cancelled.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum CancelReason {
    /// The run's overall deadline expired.
    Timeout,

    /// The user interrupted the run.
    UserAbort,

    /// The maximum-failures threshold was reached.
    FailFast,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => write!(f, "run timed out"),
            CancelReason::UserAbort => write!(f, "run aborted by user"),
            CancelReason::FailFast => write!(f, "maximum failure threshold reached"),
        }
    }
}

/// The cancelling side of a cancellation pair.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
}

/// The observing side of a cancellation pair.
#[derive(Clone, Debug)]
pub struct Cancelled {
    rx: watch::Receiver<Option<CancelReason>>,
}

/// Creates a new cancellation pair.
pub fn cancel_pair() -> (CancelHandle, Cancelled) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx }, Cancelled { rx })
}

impl CancelHandle {
    /// Cancels with the given reason. The first reason wins; later calls are
    /// ignored.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl Cancelled {
    /// Returns the cancellation reason if cancellation has been requested.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Waits until cancellation is requested and returns the reason.
    ///
    /// If every [`CancelHandle`] is dropped without cancelling, this pends
    /// forever; callers always race it against real work in a `select!`.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Senders are gone; nothing will ever cancel us.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_reason_wins() {
        let (handle, mut cancelled) = cancel_pair();
        handle.cancel(CancelReason::FailFast);
        handle.cancel(CancelReason::UserAbort);
        assert_eq!(cancelled.cancelled().await, CancelReason::FailFast);
        assert_eq!(cancelled.reason(), Some(CancelReason::FailFast));
    }

    #[tokio::test]
    async fn uncancelled_pends() {
        let (_handle, mut cancelled) = cancel_pair();
        let res =
            tokio::time::timeout(Duration::from_millis(20), cancelled.cancelled()).await;
        assert!(res.is_err(), "cancelled() should pend without a cancel");
    }
}

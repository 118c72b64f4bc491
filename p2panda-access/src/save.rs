// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-flight state machine coordinating saves of one access design.
//!
//! ```text
//! Idle ──defer──▶ Pending ──begin_flush──▶ Flushing ──finish──▶ Idle
//!   └──────────────begin_flush───────────────▲
//! ```
//!
//! All callers asking for a save while a deferred save exists share its [`SaveHandle`] and thus
//! its outcome. At most one flush runs at a time; asking to flush while flushing joins the
//! running flush instead.
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::operation::OperationError;

pub type SaveResult = Result<(), SaveError>;

/// Error of a failed save, shared by every handle waiting for it.
#[derive(Clone, Debug, Error)]
pub enum SaveError {
    #[error("failed writing design document: {0}")]
    Store(Arc<dyn std::error::Error + Send + Sync>),

    #[error("failed updating security document: {0}")]
    Security(Arc<dyn std::error::Error + Send + Sync>),

    #[error("pending operations do not apply to the stored design: {0}")]
    Replay(#[from] OperationError),

    #[error("design store did not hand out the stored design")]
    NotApplied,

    #[error("access state lock is poisoned")]
    LockPoisoned,

    #[error("save ended before reporting an outcome")]
    Cancelled,
}

impl SaveError {
    pub(crate) fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Arc::new(err))
    }

    pub(crate) fn security<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Security(Arc::new(err))
    }
}

/// Awaitable outcome of a requested save.
#[derive(Clone, Debug)]
pub struct SaveHandle {
    outcome: watch::Receiver<Option<SaveResult>>,
}

impl SaveHandle {
    /// A handle which is already settled.
    pub(crate) fn settled(result: SaveResult) -> Self {
        let (_, outcome) = watch::channel(Some(result));
        Self { outcome }
    }

    /// Returns the outcome if the save already finished.
    pub fn outcome(&self) -> Option<SaveResult> {
        self.outcome.borrow().clone()
    }

    /// Waits until the save finished.
    pub async fn wait(mut self) -> SaveResult {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        outcome.unwrap_or(Err(SaveError::Cancelled))
    }
}

impl IntoFuture for SaveHandle {
    type Output = SaveResult;
    type IntoFuture = Pin<Box<dyn Future<Output = SaveResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// A save somebody is waiting for.
#[derive(Debug)]
pub struct Deferred {
    outcome: watch::Sender<Option<SaveResult>>,
    timer: Option<JoinHandle<()>>,
}

impl Deferred {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            outcome,
            timer: None,
        }
    }

    fn handle(&self) -> SaveHandle {
        SaveHandle {
            outcome: self.outcome.subscribe(),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Timers armed while flushing stay alive, they start the next save for changes made
    /// meanwhile.
    fn settle(self, result: SaveResult) {
        self.outcome.send_replace(Some(result));
    }
}

#[derive(Debug, Default)]
pub enum SaveState {
    /// Nobody asked for a save.
    #[default]
    Idle,

    /// A save was asked for, possibly with a timer armed to start it.
    Pending(Deferred),

    /// Pending operations are being written.
    Flushing(Deferred),
}

impl SaveState {
    pub fn is_flushing(&self) -> bool {
        matches!(self, SaveState::Flushing(_))
    }

    /// Makes sure a deferred save exists and returns a handle to it.
    pub fn defer(&mut self) -> SaveHandle {
        match self {
            SaveState::Idle => {
                let deferred = Deferred::new();
                let handle = deferred.handle();
                *self = SaveState::Pending(deferred);
                handle
            }
            SaveState::Pending(deferred) | SaveState::Flushing(deferred) => deferred.handle(),
        }
    }

    /// Returns `true` when a deferred save exists which has no timer yet.
    pub fn needs_timer(&self) -> bool {
        match self {
            SaveState::Idle => false,
            SaveState::Pending(deferred) | SaveState::Flushing(deferred) => {
                deferred.timer.is_none()
            }
        }
    }

    /// Keeps the timer which will start the deferred save, aborting it if there is none.
    pub fn arm(&mut self, timer: JoinHandle<()>) {
        match self {
            SaveState::Idle => timer.abort(),
            SaveState::Pending(deferred) | SaveState::Flushing(deferred) => {
                if let Some(previous) = deferred.timer.replace(timer) {
                    previous.abort();
                }
            }
        }
    }

    /// Transitions into flushing, cancelling any armed timer.
    ///
    /// Returns `false` when a flush is already running, the caller must not start another one.
    pub fn begin_flush(&mut self) -> bool {
        match std::mem::take(self) {
            SaveState::Idle => {
                *self = SaveState::Flushing(Deferred::new());
                true
            }
            SaveState::Pending(mut deferred) => {
                deferred.cancel_timer();
                *self = SaveState::Flushing(deferred);
                true
            }
            flushing @ SaveState::Flushing(_) => {
                *self = flushing;
                false
            }
        }
    }

    /// Settles the running flush with its outcome and returns to idle.
    pub fn finish(&mut self, result: SaveResult) {
        match std::mem::take(self) {
            SaveState::Flushing(deferred) => deferred.settle(result),
            other => *self = other,
        }
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

use tokio::sync::broadcast;

use crate::operation::Operation;

/// Number of events buffered per subscriber before the oldest ones are dropped.
pub(crate) const EVENTS_CAPACITY: usize = 128;

/// Events emitted while changing and saving an access design.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessEvent {
    /// An operation is about to be applied to the local design.
    Applying(Operation),

    /// An operation was applied to the local design and queued for saving.
    Applied(Operation),

    /// Pending operations are being written to the store.
    Saving,

    /// Pending operations were written to the store.
    Saved,

    /// Writing failed, the operations are pending again.
    SaveFailed(String),
}

pub(crate) fn channel() -> broadcast::Sender<AccessEvent> {
    let (tx, _) = broadcast::channel(EVENTS_CAPACITY);
    tx
}

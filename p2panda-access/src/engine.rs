// SPDX-License-Identifier: MIT OR Apache-2.0

//! Access design bound to the stores it is persisted in.
//!
//! Changes are applied locally right away through the [`Transform`] and written to the design
//! store in batches. Saving snapshots the pending operations, replays them on the stored design
//! and writes the result back. When anything fails on the way the operations are put back in
//! front of the queue, leaving the local design as if the save never happened.
//!
//! The stored design only becomes the new base of the local design once the save fully
//! succeeded, including the update of the security document.
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::access::UserContext;
use crate::config::Config;
use crate::design::{Design, Level};
use crate::event::{self, AccessEvent};
use crate::operation::{self, Operation, OperationError};
use crate::save::{SaveError, SaveHandle, SaveResult, SaveState};
use crate::security::Security;
use crate::traits::{DesignStore, NoSecurity, SecurityStore};
use crate::transform::{AccessSummary, Transform};

#[derive(Clone, Debug, Error)]
pub enum AccessError {
    #[error("failed reading design document: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync>),

    #[error("pending operations do not apply to the stored design: {0}")]
    Replay(OperationError),

    #[error("access state lock is poisoned")]
    LockPoisoned,
}

impl From<AccessError> for SaveError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Fetch(err) => SaveError::Store(err),
            AccessError::Replay(err) => SaveError::Replay(err),
            AccessError::LockPoisoned => SaveError::LockPoisoned,
        }
    }
}

struct Inner<S, M> {
    config: Config,
    store: S,
    security: M,
    events: broadcast::Sender<AccessEvent>,
    transform: Mutex<Transform>,
    state: Mutex<SaveState>,
}

/// An access design persisted in a [`DesignStore`].
///
/// Cloning gives another handle to the same instance, see [`AccessDesign::fork`] for an
/// independent copy.
pub struct AccessDesign<S, M = NoSecurity> {
    inner: Arc<Inner<S, M>>,
}

impl<S, M> Clone for AccessDesign<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, M> Debug for AccessDesign<S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessDesign")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<S, M> AccessDesign<S, M>
where
    S: DesignStore + Send + Sync + 'static,
    M: SecurityStore + Send + Sync + 'static,
{
    /// Instance starting from the default design, without reading the store.
    pub fn new(store: S, security: M, config: Config) -> Self {
        Self::with_design(store, security, config, Design::default())
    }

    pub fn with_design(store: S, security: M, config: Config, design: Design) -> Self {
        let events = event::channel();
        let transform = Transform::with_events(design, events.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                security,
                events,
                transform: Mutex::new(transform),
                state: Mutex::new(SaveState::default()),
            }),
        }
    }

    /// Instance starting from the design currently stored.
    pub async fn open(store: S, security: M, config: Config) -> Result<Self, AccessError> {
        let access = Self::new(store, security, config);
        access.fetch().await?;
        Ok(access)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_remote(&self) -> bool {
        self.inner.store.is_remote()
    }

    /// Reloads the design from the store and replays pending operations on top.
    ///
    /// A missing design document is not an error, the default design is used instead. Pending
    /// operations which do not apply to the stored design stay queued and are reported with
    /// [`AccessError::Replay`], use [`Transform::discard`] to give up on them.
    pub async fn fetch(&self) -> Result<(), AccessError> {
        let stored = self
            .inner
            .store
            .get(self.inner.config.design_id())
            .await
            .map_err(|err| AccessError::Fetch(Arc::new(err)))?;

        let design = match stored {
            Some(document) => Design::parse(&document),
            None => {
                debug!(id = self.inner.config.design_id(), "no design document yet");
                Design::default()
            }
        };

        self.transform()?.reset(design).map_err(AccessError::Replay)
    }

    /// Locks the local design for reading and changing it.
    ///
    /// The lock must not be held across `.await` points.
    pub fn transform(&self) -> Result<MutexGuard<'_, Transform>, AccessError> {
        self.inner
            .transform
            .lock()
            .map_err(|_| AccessError::LockPoisoned)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccessEvent> {
        self.inner.events.subscribe()
    }

    pub fn get_level(&self, user: &UserContext) -> Result<Option<String>, AccessError> {
        Ok(self.transform()?.get_level(user).map(str::to_string))
    }

    pub fn has_level(&self, user: &UserContext, level: &str) -> Result<bool, AccessError> {
        Ok(self.transform()?.has_level(user, level))
    }

    pub fn levels(&self) -> Result<Vec<Level>, AccessError> {
        Ok(self.transform()?.levels().to_vec())
    }

    pub fn is_private(&self) -> Result<bool, AccessError> {
        Ok(self.transform()?.is_private())
    }

    pub fn is_public(&self) -> Result<bool, AccessError> {
        Ok(self.transform()?.is_public())
    }

    pub fn to_json(&self) -> Result<AccessSummary, AccessError> {
        Ok(self.transform()?.to_json())
    }

    /// The persisted form of the local design, including unsaved changes.
    pub fn to_design(&self) -> Result<Value, AccessError> {
        Ok(self.transform()?.to_design())
    }

    /// Independent instance over the same stores, starting from the local design.
    ///
    /// Unsaved changes are part of the new instance's design but are not pending there.
    pub fn fork(&self) -> Result<Self, AccessError>
    where
        S: Clone,
        M: Clone,
    {
        let design = self.transform()?.design().clone();
        Ok(Self::with_design(
            self.inner.store.clone(),
            self.inner.security.clone(),
            self.inner.config.clone(),
            design,
        ))
    }

    /// Returns `true` while pending operations are being written.
    pub fn saving(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.is_flushing())
            .unwrap_or(false)
    }

    /// Writes all pending operations to the store now.
    ///
    /// Joins the running save if there is one. Operations pushed while a save runs are written by
    /// the next one. Must be called from within a tokio runtime.
    pub fn save(&self) -> SaveHandle {
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(_) => return SaveHandle::settled(Err(SaveError::LockPoisoned)),
        };

        let handle = state.defer();
        if !state.begin_flush() {
            trace!("join running save");
            return handle;
        }
        drop(state);

        let access = self.clone();
        tokio::spawn(async move {
            let result = access.flush().await;
            access.finish(result);
        });

        handle
    }

    /// Saves after `delay` unless a save is started earlier.
    ///
    /// All calls until the save started share one timer and one outcome. Must be called from
    /// within a tokio runtime.
    pub fn delayed_save(&self, delay: Duration) -> SaveHandle {
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(_) => return SaveHandle::settled(Err(SaveError::LockPoisoned)),
        };

        let handle = state.defer();
        if state.needs_timer() {
            trace!(?delay, "arm save timer");
            let access = self.clone();
            state.arm(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                access.save();
            }));
        }

        handle
    }

    /// Saves after the delay configured with [`Config::with_save_delay`].
    pub fn schedule_save(&self) -> SaveHandle {
        self.delayed_save(self.inner.config.save_delay())
    }

    fn finish(&self, result: SaveResult) {
        let event = match &result {
            Ok(()) => AccessEvent::Saved,
            Err(err) => AccessEvent::SaveFailed(err.to_string()),
        };
        let _ = self.inner.events.send(event);

        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(result);
    }

    async fn flush(&self) -> SaveResult {
        let operations = self.transform()?.begin_save();
        if operations.is_empty() {
            trace!("no pending operations to save");
            return Ok(());
        }

        debug!(
            count = operations.len(),
            id = self.inner.config.design_id(),
            "save access design"
        );
        let _ = self.inner.events.send(AccessEvent::Saving);

        if let Err(err) = self.commit(&operations).await {
            warn!(%err, count = operations.len(), "saving access design failed");
            if self.transform()?.requeue().is_err() {
                debug!("requeued operations do not apply to the local design");
            }
            return Err(err);
        }

        Ok(())
    }

    async fn commit(&self, operations: &[Operation]) -> SaveResult {
        let remote = self.inner.store.is_remote();
        let security = if remote {
            self.inner
                .security
                .fetch()
                .await
                .map_err(SaveError::security)?
        } else {
            Security::default()
        };

        let mut committed: Option<(Design, Security)> = None;
        let mut failure: Option<OperationError> = None;

        let written = self
            .inner
            .store
            .upsert(self.inner.config.design_id(), |stored| {
                let mut design = stored.map(Design::parse).unwrap_or_default();
                let mut next_security = security.clone();

                if let Err(err) =
                    operation::apply_all(Some(&mut next_security), &mut design, operations)
                {
                    failure = Some(err);
                    committed = None;
                    return None;
                }

                let compiled = design.compile();
                failure = None;
                committed = Some((design, next_security));

                if stored == Some(&compiled) {
                    None
                } else {
                    Some(compiled)
                }
            })
            .await
            .map_err(SaveError::store)?;

        if let Some(err) = failure {
            return Err(err.into());
        }

        let Some((design, next_security)) = committed else {
            return Err(SaveError::NotApplied);
        };

        if written {
            debug!(id = self.inner.config.design_id(), "design document written");
        } else {
            debug!(
                id = self.inner.config.design_id(),
                "design document unchanged, nothing written"
            );
        }

        if remote && next_security != security {
            self.inner
                .security
                .persist(&next_security)
                .await
                .map_err(SaveError::security)?;
            debug!("security document written");
        }

        if self.transform()?.commit(design).is_err() {
            debug!("operations pushed while saving do not apply to the saved design");
        }

        Ok(())
    }
}

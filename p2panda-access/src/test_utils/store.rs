// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{RwLock, watch};

use crate::security::Security;
use crate::traits::{DesignStore, SecurityStore};

#[derive(Clone, Debug, Error)]
pub enum MemoryStoreError {
    #[error("simulated read failure")]
    ReadFailed,

    #[error("simulated write failure")]
    WriteFailed,
}

#[derive(Debug, Default)]
struct MemoryDesignStoreInner {
    documents: HashMap<String, Value>,
    fail_reads: usize,
    fail_writes: usize,
    conflicts: usize,
    writes: usize,
}

/// Document store keeping designs in memory.
///
/// Failures and write conflicts can be injected, and writes can be held back to observe a save
/// while it is running.
#[derive(Clone, Debug)]
pub struct MemoryDesignStore {
    remote: bool,
    inner: Arc<RwLock<MemoryDesignStoreInner>>,
    gate: Arc<watch::Sender<bool>>,
}

impl MemoryDesignStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            remote: false,
            inner: Arc::new(RwLock::new(MemoryDesignStoreInner::default())),
            gate: Arc::new(gate),
        }
    }

    /// Store which enforces access itself, making saves keep the security document in sync.
    pub fn remote() -> Self {
        Self {
            remote: true,
            ..Self::new()
        }
    }

    pub async fn document(&self, id: &str) -> Option<Value> {
        let inner = self.inner.read().await;
        inner.documents.get(id).cloned()
    }

    pub async fn insert(&self, id: &str, document: Value) {
        let mut inner = self.inner.write().await;
        inner.documents.insert(id.to_string(), document);
    }

    /// Number of documents written so far.
    pub async fn writes(&self) -> usize {
        self.inner.read().await.writes
    }

    pub async fn fail_next_reads(&self, count: usize) {
        self.inner.write().await.fail_reads = count;
    }

    pub async fn fail_next_writes(&self, count: usize) {
        self.inner.write().await.fail_writes = count;
    }

    /// Makes the next writes run into `count` conflicts before succeeding.
    pub async fn conflict_next_writes(&self, count: usize) {
        self.inner.write().await.conflicts = count;
    }

    /// Blocks writes until [`MemoryDesignStore::release_writes`] is called.
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }
}

impl Default for MemoryDesignStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DesignStore for MemoryDesignStore {
    type Error = MemoryStoreError;

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, Self::Error> {
        let mut inner = self.inner.write().await;
        if inner.fail_reads > 0 {
            inner.fail_reads -= 1;
            return Err(MemoryStoreError::ReadFailed);
        }
        Ok(inner.documents.get(id).cloned())
    }

    async fn upsert<F>(&self, id: &str, mut diff: F) -> Result<bool, Self::Error>
    where
        F: FnMut(Option<&Value>) -> Option<Value> + Send,
    {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut inner = self.inner.write().await;

        // Someone else wrote in between, the diff is computed again on the new revision.
        while inner.conflicts > 0 {
            inner.conflicts -= 1;
            let _ = diff(inner.documents.get(id));
        }

        let next = diff(inner.documents.get(id));

        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(MemoryStoreError::WriteFailed);
        }

        let Some(next) = next else {
            return Ok(false);
        };

        inner.documents.insert(id.to_string(), next);
        inner.writes += 1;
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct MemorySecurityStoreInner {
    security: Security,
    fail_fetches: usize,
    fail_persists: usize,
    persisted: usize,
}

/// Security document kept in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySecurityStore {
    inner: Arc<RwLock<MemorySecurityStoreInner>>,
}

impl MemorySecurityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn security(&self) -> Security {
        self.inner.read().await.security.clone()
    }

    pub async fn set_security(&self, security: Security) {
        self.inner.write().await.security = security;
    }

    /// Number of times the security document was written.
    pub async fn persisted(&self) -> usize {
        self.inner.read().await.persisted
    }

    pub async fn fail_next_fetches(&self, count: usize) {
        self.inner.write().await.fail_fetches = count;
    }

    pub async fn fail_next_persists(&self, count: usize) {
        self.inner.write().await.fail_persists = count;
    }
}

impl SecurityStore for MemorySecurityStore {
    type Error = MemoryStoreError;

    async fn fetch(&self) -> Result<Security, Self::Error> {
        let mut inner = self.inner.write().await;
        if inner.fail_fetches > 0 {
            inner.fail_fetches -= 1;
            return Err(MemoryStoreError::ReadFailed);
        }
        Ok(inner.security.clone())
    }

    async fn persist(&self, security: &Security) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        if inner.fail_persists > 0 {
            inner.fail_persists -= 1;
            return Err(MemoryStoreError::WriteFailed);
        }
        inner.security = security.clone();
        inner.persisted += 1;
        Ok(())
    }
}

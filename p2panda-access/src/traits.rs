// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the stores an access design is persisted in.
use serde_json::Value;

use crate::security::Security;

/// Document store holding the persisted design.
pub trait DesignStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns `true` when the store enforces access itself.
    ///
    /// Only then does the security document need to mirror the members of a private design.
    fn is_remote(&self) -> bool;

    /// Returns the document stored under `id`, or `None` if there is none.
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Value>, Self::Error>> + Send;

    /// Read-modify-write of the document stored under `id`.
    ///
    /// `diff` receives the currently stored document and returns the document to write, or `None`
    /// if nothing needs to be written. On write conflicts implementations may read again and call
    /// `diff` another time, so it must not assume it is called exactly once.
    ///
    /// Returns `true` when a document was written.
    fn upsert<F>(
        &self,
        id: &str,
        diff: F,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send
    where
        F: FnMut(Option<&Value>) -> Option<Value> + Send;
}

/// Store of the security document listing who may access the database at all.
pub trait SecurityStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch(&self) -> impl Future<Output = Result<Security, Self::Error>> + Send;

    fn persist(&self, security: &Security) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Security store for databases which do not enforce access themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSecurity;

impl SecurityStore for NoSecurity {
    type Error = std::convert::Infallible;

    async fn fetch(&self) -> Result<Security, Self::Error> {
        Ok(Security::default())
    }

    async fn persist(&self, _security: &Security) -> Result<(), Self::Error> {
        Ok(())
    }
}

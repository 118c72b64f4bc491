// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory stores and helpers for testing access designs.
mod store;

pub use store::{MemoryDesignStore, MemorySecurityStore, MemoryStoreError};

use crate::Config;
use crate::engine::AccessDesign;

pub type TestAccess = AccessDesign<MemoryDesignStore, MemorySecurityStore>;

/// Access design over fresh in-memory stores.
pub fn test_access(remote: bool) -> (TestAccess, MemoryDesignStore, MemorySecurityStore) {
    let store = if remote {
        MemoryDesignStore::remote()
    } else {
        MemoryDesignStore::new()
    };
    let security = MemorySecurityStore::new();
    let access = AccessDesign::new(store.clone(), security.clone(), Config::default());
    (access, store, security)
}

/// Installs a log subscriber when `RUST_LOG` is set.
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

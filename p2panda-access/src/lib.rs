// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered access levels for a document store.
//!
//! A design holds a list of levels, lowest first, each granting access to a set of user names
//! and roles. A user's level is the highest level listing them. Checking for a level passes for
//! members of that level or of any level above it.
//!
//! Designs can be private, in which case stores enforcing access themselves only let members of
//! any level in.
//!
//! Designs are changed through operations which are applied locally right away and saved to the
//! store in batches, see [`AccessDesign`].
//!
//! ```
//! use p2panda_access::{Transform, UserContext};
//!
//! let mut transform = Transform::default();
//! transform
//!     .add_levels(["reader", "editor", "admin"], None)?
//!     .set_name_level("alice", Some("admin"))?
//!     .set_role_level("staff", Some("reader"))?;
//!
//! let alice = UserContext::from("alice");
//! assert_eq!(transform.get_level(&alice), Some("admin"));
//! assert!(transform.has_level(&alice, "editor"));
//!
//! let bob = UserContext::new("bob").with_roles(["staff"]);
//! assert!(!transform.has_level(&bob, "editor"));
//! # Ok::<(), p2panda_access::TransformError>(())
//! ```
pub mod access;
pub mod config;
pub mod design;
mod engine;
pub mod event;
pub mod operation;
mod save;
pub mod security;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;
mod transform;

pub use access::{UserContext, get_level, has_access, has_level};
pub use config::{Config, DEFAULT_DESIGN_ID};
pub use design::{Design, Level};
pub use engine::{AccessDesign, AccessError};
pub use event::AccessEvent;
pub use operation::{Action, Operation, OperationError, Target};
pub use save::{SaveError, SaveHandle, SaveResult};
pub use security::{List, Security, SecurityLevel};
pub use traits::{DesignStore, NoSecurity, SecurityStore};
pub use transform::{AccessSummary, Transform, TransformError};

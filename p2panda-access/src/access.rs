// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluate which access level a user holds.
//!
//! Levels are ordered from lowest (first) to highest (last) rank. Membership is explicit per
//! level: holding a higher level does not imply membership in any lower one.
use serde::{Deserialize, Serialize};

use crate::design::Level;
use crate::security::SecurityLevel;

/// The identity of a user: an optional name and the roles it holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub name: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserContext {
    pub fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            roles: Vec::new(),
        }
    }

    /// A user without a name, identified only through its roles.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_roles<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&str> for UserContext {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for UserContext {
    fn from(name: String) -> Self {
        Self {
            name: Some(name),
            roles: Vec::new(),
        }
    }
}

/// Returns `true` when the user's name is listed or any of its roles is.
pub fn has_access(security: &SecurityLevel, user: &UserContext) -> bool {
    if let Some(name) = &user.name {
        if security.names.contains(name) {
            return true;
        }
    }

    user.roles.iter().any(|role| security.roles.contains(role))
}

/// Returns the name of the highest level the user is an explicit member of.
pub fn get_level<'a>(levels: &'a [Level], user: &UserContext) -> Option<&'a str> {
    levels
        .iter()
        .rev()
        .find(|level| has_access(&level.security, user))
        .map(|level| level.name.as_str())
}

/// Returns `true` when the user is a member of the level called `threshold` or of any level
/// ranked above it.
///
/// Unknown threshold names never grant access.
pub fn has_level(levels: &[Level], user: &UserContext, threshold: &str) -> bool {
    levels
        .iter()
        .skip_while(|level| level.name != threshold)
        .any(|level| has_access(&level.security, user))
}

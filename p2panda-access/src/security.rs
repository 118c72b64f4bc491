// SPDX-License-Identifier: MIT OR Apache-2.0

//! Membership lists of user names and roles.
//!
//! A [`SecurityLevel`] is attached to every access level and is also the building block of the
//! [`Security`] document, the store-enforced list of everyone who may open the database at all.
use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Selects one of the two lists held by a [`SecurityLevel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum List {
    Names,
    Roles,
}

impl List {
    pub fn as_str(&self) -> &'static str {
        match self {
            List::Names => "names",
            List::Roles => "roles",
        }
    }
}

impl Display for List {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for List {
    type Err = InvalidListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "names" => Ok(List::Names),
            "roles" => Ok(List::Roles),
            other => Err(InvalidListError(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("expected 'names' or 'roles' for list name, got '{0}'")]
pub struct InvalidListError(pub String);

/// Set of user names and roles granted something.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLevel {
    #[serde(default)]
    pub names: BTreeSet<String>,

    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl SecurityLevel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a persisted `{ names, roles }` object, ignoring everything which is not a string.
    pub fn from_value(value: &Value) -> Self {
        let read = |key: &str| -> BTreeSet<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            names: read("names"),
            roles: read("roles"),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "names": self.names,
            "roles": self.roles,
        })
    }

    pub fn list(&self, list: List) -> &BTreeSet<String> {
        match list {
            List::Names => &self.names,
            List::Roles => &self.roles,
        }
    }

    pub fn list_mut(&mut self, list: List) -> &mut BTreeSet<String> {
        match list {
            List::Names => &mut self.names,
            List::Roles => &mut self.roles,
        }
    }

    /// Returns `true` when the item was not already part of the list.
    pub fn add(&mut self, list: List, item: &str) -> bool {
        self.list_mut(list).insert(item.to_string())
    }

    /// Returns `true` when the item was part of the list.
    pub fn remove(&mut self, list: List, item: &str) -> bool {
        self.list_mut(list).remove(item)
    }

    pub fn contains(&self, list: List, item: &str) -> bool {
        self.list(list).contains(item)
    }

    /// Adds every name and role of `other` to this level.
    pub fn merge(&mut self, other: &SecurityLevel) {
        self.names.extend(other.names.iter().cloned());
        self.roles.extend(other.roles.iter().cloned());
    }

    pub fn remove_all(&mut self) {
        self.names.clear();
        self.roles.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.roles.is_empty()
    }
}

/// The security document of a database.
///
/// Stores which enforce access themselves only let `admins` and `members` open the database. This
/// crate never touches `admins`, it is carried along so persisting the document does not drop it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    #[serde(default)]
    pub admins: SecurityLevel,

    #[serde(default)]
    pub members: SecurityLevel,
}

impl Security {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> Self {
        Self {
            admins: value
                .get("admins")
                .map(SecurityLevel::from_value)
                .unwrap_or_default(),
            members: value
                .get("members")
                .map(SecurityLevel::from_value)
                .unwrap_or_default(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "admins": self.admins.to_value(),
            "members": self.members.to_value(),
        })
    }
}

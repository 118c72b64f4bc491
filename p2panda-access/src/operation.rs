// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operations on an access design and the interpreter applying them.
//!
//! Operations are idempotent: applying one twice equals applying it once, and replaying a
//! sequence on a design which already reflects it converges to the same design. This is what
//! allows the operation log to replay pending operations after any replacement of the design,
//! including after a failed save.
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::design::{Design, Level};
use crate::security::{List, Security};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("no level '{before}' exists to put level before")]
    MissingLevel { before: String },

    #[error("no level '{level}' exists to change members")]
    MissingMemberLevel { level: String },

    #[error("expected 'add' or 'remove' for operation, got '{0}'")]
    InvalidAction(String),

    #[error("unknown operation type '{0}'")]
    InvalidTarget(String),

    #[error("malformed '{target}' operation: {reason}")]
    InvalidPayload { target: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Remove,
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Remove => "remove",
        };

        write!(f, "{}", s)
    }
}

impl FromStr for Action {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "add" => Ok(Action::Add),
            "remove" => Ok(Action::Remove),
            _ => Err(OperationError::InvalidAction(s.to_string())),
        }
    }
}

/// Place a level at a position, or drop it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChange {
    pub name: String,

    /// Level to insert in front of, appended as the highest level when missing.
    #[serde(default)]
    pub before: Option<String>,
}

/// Move a name or role to a level, or out of all levels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberChange {
    pub list: List,
    pub item: String,
    #[serde(default)]
    pub level: Option<String>,
}

/// Set or delete a named script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptChange {
    pub name: String,
    #[serde(default)]
    pub script: Option<String>,
}

/// What an operation is about, together with its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Target {
    Private,
    Level(LevelChange),
    Member(MemberChange),
    Filter(ScriptChange),
    Validate(ScriptChange),
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Target::Private => "private",
            Target::Level(_) => "level",
            Target::Member(_) => "member",
            Target::Filter(_) => "filter",
            Target::Validate(_) => "validate",
        }
    }
}

/// A single mutation of an access design.
///
/// Serialized as `{ "op": "add", "type": "level", "value": { .. } }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "op")]
    pub action: Action,

    #[serde(flatten)]
    pub target: Target,
}

impl Operation {
    pub fn new(action: Action, target: Target) -> Self {
        Self { action, target }
    }

    /// Builds an operation from loosely typed parts, validating action, type and payload.
    pub fn from_parts(action: &str, target: &str, value: Value) -> Result<Self, OperationError> {
        let action = action.parse::<Action>()?;

        let invalid = |err: serde_json::Error| OperationError::InvalidPayload {
            target: target.to_string(),
            reason: err.to_string(),
        };

        let target = match target {
            "private" => Target::Private,
            "level" => Target::Level(serde_json::from_value(value).map_err(invalid)?),
            "member" => Target::Member(serde_json::from_value(value).map_err(invalid)?),
            "filter" => Target::Filter(serde_json::from_value(value).map_err(invalid)?),
            "validate" => Target::Validate(serde_json::from_value(value).map_err(invalid)?),
            other => return Err(OperationError::InvalidTarget(other.to_string())),
        };

        Ok(Self::new(action, target))
    }
}

/// Applies an operation to a design and, when given, the security document mirroring its members.
///
/// Fails without changing anything when the operation refers to a level which does not exist.
pub fn apply(
    security: Option<&mut Security>,
    design: &mut Design,
    operation: &Operation,
) -> Result<(), OperationError> {
    trace!(action = %operation.action, target = operation.target.name(), "apply operation");

    match (&operation.target, operation.action) {
        (Target::Private, Action::Add) => private::add(security, design),
        (Target::Private, Action::Remove) => private::remove(security, design),
        (Target::Level(change), Action::Add) => level::add(design, change)?,
        (Target::Level(change), Action::Remove) => level::remove(design, change),
        (Target::Member(change), action) => member(action, security, design, change)?,
        (Target::Filter(change), Action::Add) => {
            design
                .filters
                .insert(change.name.clone(), change.script.clone());
        }
        (Target::Filter(change), Action::Remove) => {
            design.filters.remove(&change.name);
        }
        (Target::Validate(change), Action::Add) => {
            design
                .validators
                .insert(change.name.clone(), change.script.clone());
        }
        (Target::Validate(change), Action::Remove) => {
            design.validators.remove(&change.name);
        }
    }

    Ok(())
}

/// Applies operations in order, stopping at the first failure.
pub fn apply_all(
    mut security: Option<&mut Security>,
    design: &mut Design,
    operations: &[Operation],
) -> Result<(), OperationError> {
    for operation in operations {
        apply(security.as_deref_mut(), design, operation)?;
    }
    Ok(())
}

mod private {
    use crate::design::Design;
    use crate::security::Security;

    /// Going private lets every level member into the database.
    pub fn add(security: Option<&mut Security>, design: &mut Design) {
        design.private = true;
        if let Some(security) = security {
            for level in &design.levels {
                security.members.merge(&level.security);
            }
        }
    }

    /// Going public clears the security document.
    pub fn remove(security: Option<&mut Security>, design: &mut Design) {
        design.private = false;
        if let Some(security) = security {
            security.members.remove_all();
        }
    }
}

mod level {
    use super::{Design, Level, LevelChange, OperationError};

    pub fn add(design: &mut Design, change: &LevelChange) -> Result<(), OperationError> {
        if let Some(before) = &change.before {
            if before == &change.name || design.level_position(before).is_none() {
                return Err(OperationError::MissingLevel {
                    before: before.clone(),
                });
            }
        }

        let level = match design.level_position(&change.name) {
            Some(index) => design.levels.remove(index),
            None => Level::new(&change.name),
        };

        let index = match &change.before {
            Some(before) => design
                .level_position(before)
                .unwrap_or(design.levels.len()),
            None => design.levels.len(),
        };

        design.levels.insert(index, level);
        Ok(())
    }

    pub fn remove(design: &mut Design, change: &LevelChange) {
        if let Some(index) = design.level_position(&change.name) {
            design.levels.remove(index);
        }
    }
}

/// Members are part of at most one level per list, so they get detached from all levels first.
fn member(
    action: Action,
    security: Option<&mut Security>,
    design: &mut Design,
    change: &MemberChange,
) -> Result<(), OperationError> {
    let target = match action {
        Action::Add => {
            let position = change
                .level
                .as_deref()
                .and_then(|name| design.level_position(name));

            match position {
                Some(index) => Some(index),
                None => {
                    return Err(OperationError::MissingMemberLevel {
                        level: change.level.clone().unwrap_or_default(),
                    });
                }
            }
        }
        Action::Remove => None,
    };

    for level in design.levels.iter_mut() {
        level.security.remove(change.list, &change.item);
    }

    if let Some(index) = target {
        design.levels[index]
            .security
            .add(change.list, &change.item);
    }

    if design.private {
        if let Some(security) = security {
            match action {
                Action::Add => security.members.add(change.list, &change.item),
                Action::Remove => security.members.remove(change.list, &change.item),
            };
        }
    }

    Ok(())
}

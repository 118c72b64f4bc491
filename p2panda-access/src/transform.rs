// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queue of pending operations applied to a local design.
//!
//! Every pushed operation is applied to the local design right away, so reads reflect it before
//! anything was saved. The queue is the source of truth for local changes: whenever the base
//! design gets replaced (after fetching or saving), the local design is rebuilt from the new base
//! and the whole queue. Rebuilding never removes operations from the queue.
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::access::{UserContext, get_level, has_level};
use crate::design::{Design, Level};
use crate::event::{self, AccessEvent};
use crate::operation::{
    Action, LevelChange, MemberChange, Operation, OperationError, ScriptChange, Target, apply,
};
use crate::security::{InvalidListError, List};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("expecting non-empty string for level name")]
    InvalidLevelName,

    #[error("expecting non-empty string for {0} name")]
    InvalidScriptName(&'static str),

    #[error("expecting non-empty string for member")]
    InvalidMember,

    #[error(transparent)]
    InvalidList(#[from] InvalidListError),

    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Summary of the levels of a design.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessSummary {
    pub private: bool,
    pub levels: Vec<Level>,
}

/// A local design together with the operations not yet saved.
///
/// The local design is always the base design, as last read from or written to the store, with
/// the operations of a running save and all pending operations applied on top.
#[derive(Debug)]
pub struct Transform {
    base: Design,
    design: Design,
    saving: Vec<Operation>,
    operations: Vec<Operation>,
    events: broadcast::Sender<AccessEvent>,
}

impl Transform {
    pub fn new(design: Design) -> Self {
        Self::with_events(design, event::channel())
    }

    pub(crate) fn with_events(design: Design, events: broadcast::Sender<AccessEvent>) -> Self {
        Self {
            base: design.clone(),
            design,
            saving: Vec::new(),
            operations: Vec::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccessEvent> {
        self.events.subscribe()
    }

    /// The local design, including all changes not saved yet.
    pub fn design(&self) -> &Design {
        &self.design
    }

    /// The design as last read from or written to the store.
    pub fn base(&self) -> &Design {
        &self.base
    }

    /// Operations applied locally but not saved yet, in the order they were pushed.
    ///
    /// Operations of a running save are not part of it.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Replaces the base design and applies all pending operations on top of it.
    ///
    /// Pending operations are kept even when they do not apply to the new design, see
    /// [`Transform::replay`].
    pub fn reset(&mut self, design: Design) -> Result<(), OperationError> {
        self.base = design;
        self.replay()
    }

    /// Parses a persisted design document and resets to it.
    pub fn set_design(&mut self, document: &Value) -> Result<&mut Self, TransformError> {
        self.reset(Design::parse(document))?;
        Ok(self)
    }

    /// Queues an operation and applies it to the local design.
    ///
    /// Operations which can't be applied are not queued.
    pub fn push(&mut self, operation: Operation) -> Result<&mut Self, TransformError> {
        self.operations.push(operation.clone());
        let _ = self.events.send(AccessEvent::Applying(operation.clone()));

        if let Err(err) = apply(None, &mut self.design, &operation) {
            self.operations.pop();
            return Err(err.into());
        }

        let _ = self.events.send(AccessEvent::Applied(operation));
        Ok(self)
    }

    /// Queues an operation given as loosely typed parts, see [`Operation::from_parts`].
    pub fn push_raw(
        &mut self,
        action: &str,
        target: &str,
        value: Value,
    ) -> Result<&mut Self, TransformError> {
        let operation = Operation::from_parts(action, target, value)?;
        self.push(operation)
    }

    /// Rebuilds the local design from the base design and all queued operations.
    ///
    /// Nothing is removed from the queue. Operations which do not apply to the base design, for
    /// example because it lacks a level they refer to, are left out of the local design and the
    /// first of their errors is returned. They stay queued until [`Transform::discard`] drops them.
    pub fn replay(&mut self) -> Result<(), OperationError> {
        let mut design = self.base.clone();
        let mut failure = None;

        for operation in self.saving.iter().chain(&self.operations) {
            if let Err(err) = apply(None, &mut design, operation) {
                warn!(%err, "pending operation does not apply to design");
                failure.get_or_insert(err);
            }
        }

        self.design = design;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops all pending operations and returns them.
    pub fn discard(&mut self) -> Vec<Operation> {
        let operations = std::mem::take(&mut self.operations);
        debug!(count = operations.len(), "discard pending operations");

        if self.replay().is_err() {
            debug!("operations of the running save do not apply to the design");
        }
        operations
    }

    /// Hands all pending operations to a starting save.
    pub(crate) fn begin_save(&mut self) -> Vec<Operation> {
        self.saving.append(&mut self.operations);
        self.saving.clone()
    }

    /// Adopts the design written by the running save as the new base.
    pub(crate) fn commit(&mut self, design: Design) -> Result<(), OperationError> {
        self.saving.clear();
        self.reset(design)
    }

    /// Puts the operations of a failed save back in front of the queue.
    pub(crate) fn requeue(&mut self) -> Result<(), OperationError> {
        debug!(count = self.saving.len(), "requeue operations");
        let mut operations = std::mem::take(&mut self.saving);
        operations.append(&mut self.operations);
        self.operations = operations;
        self.replay()
    }

    /// Adds a level or moves an existing one.
    ///
    /// The level is placed in front of `before`, or appended as the highest level when no `before`
    /// is given. Fails when `before` names a level which does not exist.
    pub fn add_level(
        &mut self,
        name: &str,
        before: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        validate_level_name(name)?;

        self.push(Operation::new(
            Action::Add,
            Target::Level(LevelChange {
                name: name.to_string(),
                before: before.filter(|before| !before.is_empty()).map(str::to_string),
            }),
        ))
    }

    /// Adds or moves several levels, each placed in front of `before`.
    pub fn add_levels<I, N>(
        &mut self,
        names: I,
        before: Option<&str>,
    ) -> Result<&mut Self, TransformError>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        for name in names {
            self.add_level(name.as_ref(), before)?;
        }
        Ok(self)
    }

    pub fn remove_level(&mut self, name: &str) -> Result<&mut Self, TransformError> {
        validate_level_name(name)?;

        self.push(Operation::new(
            Action::Remove,
            Target::Level(LevelChange {
                name: name.to_string(),
                before: None,
            }),
        ))
    }

    pub fn remove_levels<I, N>(&mut self, names: I) -> Result<&mut Self, TransformError>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        for name in names {
            self.remove_level(name.as_ref())?;
        }
        Ok(self)
    }

    /// Moves a name or role to a level, or removes it from all levels when `level` is `None`.
    ///
    /// `list` must be `"names"` or `"roles"`.
    pub fn set_level(
        &mut self,
        list: &str,
        item: &str,
        level: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        let list = list.parse::<List>()?;
        self.set_member(list, item, level)
    }

    /// Moves several names or roles to the same level.
    pub fn set_levels<I, T>(
        &mut self,
        list: &str,
        items: I,
        level: Option<&str>,
    ) -> Result<&mut Self, TransformError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let list = list.parse::<List>()?;
        for item in items {
            self.set_member(list, item.as_ref(), level)?;
        }
        Ok(self)
    }

    /// Moves every name or role of the mapping to its level.
    pub fn set_level_map<I, T, L>(
        &mut self,
        list: &str,
        items: I,
    ) -> Result<&mut Self, TransformError>
    where
        I: IntoIterator<Item = (T, Option<L>)>,
        T: AsRef<str>,
        L: AsRef<str>,
    {
        let list = list.parse::<List>()?;
        for (item, level) in items {
            let level = level.as_ref().map(|level| level.as_ref());
            self.set_member(list, item.as_ref(), level)?;
        }
        Ok(self)
    }

    pub fn set_name_level(
        &mut self,
        name: &str,
        level: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        self.set_member(List::Names, name, level)
    }

    pub fn set_role_level(
        &mut self,
        role: &str,
        level: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        self.set_member(List::Roles, role, level)
    }

    fn set_member(
        &mut self,
        list: List,
        item: &str,
        level: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        if item.is_empty() {
            return Err(TransformError::InvalidMember);
        }

        let level = level.filter(|level| !level.is_empty());
        let action = if level.is_some() {
            Action::Add
        } else {
            Action::Remove
        };

        self.push(Operation::new(
            action,
            Target::Member(MemberChange {
                list,
                item: item.to_string(),
                level: level.map(str::to_string),
            }),
        ))
    }

    pub fn set_private(&mut self) -> Result<&mut Self, TransformError> {
        self.push(Operation::new(Action::Add, Target::Private))
    }

    pub fn set_public(&mut self) -> Result<&mut Self, TransformError> {
        self.push(Operation::new(Action::Remove, Target::Private))
    }

    /// Sets a filter script, or removes it when `script` is `None` or empty.
    pub fn set_filter(
        &mut self,
        name: &str,
        script: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        if name.is_empty() {
            return Err(TransformError::InvalidScriptName("filter"));
        }

        let (action, change) = script_change(name, script);
        self.push(Operation::new(action, Target::Filter(change)))
    }

    /// Sets a validation script, or removes it when `script` is `None` or empty.
    pub fn set_validator(
        &mut self,
        name: &str,
        script: Option<&str>,
    ) -> Result<&mut Self, TransformError> {
        if name.is_empty() {
            return Err(TransformError::InvalidScriptName("validation"));
        }

        let (action, change) = script_change(name, script);
        self.push(Operation::new(action, Target::Validate(change)))
    }

    pub fn get_level(&self, user: &UserContext) -> Option<&str> {
        get_level(&self.design.levels, user)
    }

    pub fn has_level(&self, user: &UserContext, level: &str) -> bool {
        has_level(&self.design.levels, user, level)
    }

    pub fn levels(&self) -> &[Level] {
        &self.design.levels
    }

    pub fn is_private(&self) -> bool {
        self.design.private
    }

    pub fn is_public(&self) -> bool {
        !self.design.private
    }

    pub fn filter(&self, name: &str) -> Option<&str> {
        self.design.filters.get(name).and_then(Option::as_deref)
    }

    pub fn validator(&self, name: &str) -> Option<&str> {
        self.design.validators.get(name).and_then(Option::as_deref)
    }

    pub fn to_json(&self) -> AccessSummary {
        AccessSummary {
            private: self.design.private,
            levels: self.design.levels.clone(),
        }
    }

    /// The persisted form of the local design.
    pub fn to_design(&self) -> Value {
        self.design.compile()
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(Design::default())
    }
}

fn validate_level_name(name: &str) -> Result<(), TransformError> {
    if name.is_empty() {
        Err(TransformError::InvalidLevelName)
    } else {
        Ok(())
    }
}

fn script_change(name: &str, script: Option<&str>) -> (Action, ScriptChange) {
    match script.filter(|script| !script.is_empty()) {
        Some(script) => (
            Action::Add,
            ScriptChange {
                name: name.to_string(),
                script: Some(script.to_string()),
            },
        ),
        None => (
            Action::Remove,
            ScriptChange {
                name: name.to_string(),
                script: None,
            },
        ),
    }
}

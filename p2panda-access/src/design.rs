// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory representation of an access design document and its persisted shape.
//!
//! The persisted document is executed by the backing store, so levels and validators are written
//! as script modules. Scripts are opaque to this crate: they are wrapped into the envelope the
//! store expects when compiling and unwrapped again when parsing, never interpreted.
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::security::SecurityLevel;

/// Language the store executes design scripts with.
pub const DEFAULT_LANGUAGE: &str = "javascript";

const LEVELS_SECTION: &str = "levels";

const EXPORTS_PREFIX: &str = "module.exports = ";

/// Keys of the persisted document owned by [`Design`], everything else is carried verbatim.
const DESIGN_KEYS: [&str; 6] = [
    "language",
    "private",
    "levels",
    "filters",
    "validators",
    "validate_doc_update",
];

/// Helpers shipped next to the level list so store-side validators can evaluate levels too.
const LEVELS_LIBRARY: &str = r#"function hasAccess(sec, userCtx) {
  userCtx = userCtx || {};
  if (sec && Array.isArray(sec.names) && sec.names.indexOf(userCtx.name) !== -1) return true;
  if (sec && Array.isArray(sec.roles) && Array.isArray(userCtx.roles)) {
    for (var i = 0; i < userCtx.roles.length; i++) {
      if (sec.roles.indexOf(userCtx.roles[i]) !== -1) return true;
    }
  }
  return false;
}
function getLevel(levels, userCtx) {
  if (typeof userCtx === "string") userCtx = { name: userCtx };
  for (var i = levels.length - 1; i >= 0; i--) {
    if (hasAccess(levels[i].sec, userCtx)) return levels[i].name;
  }
  return null;
}
function hasLevel(levels, userCtx, level) {
  if (typeof userCtx === "string") userCtx = { name: userCtx };
  var found = false;
  return levels.some(function(lvl) {
    if (lvl.name === level) found = true;
    return found && hasAccess(lvl.sec, userCtx);
  });
}
"#;

/// A named rank with its own explicit members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub name: String,

    #[serde(rename = "sec", default)]
    pub security: SecurityLevel,
}

impl Level {
    pub fn new(name: &str) -> Self {
        Self::with_security(name, SecurityLevel::new())
    }

    pub fn with_security(name: &str, security: SecurityLevel) -> Self {
        Self {
            name: name.to_string(),
            security,
        }
    }

    /// Reads a persisted level, returns `None` for entries without a name.
    pub fn from_value(value: &Value) -> Option<Self> {
        let name = value.get("name").and_then(Value::as_str)?;
        if name.is_empty() {
            return None;
        }

        let security = value
            .get("sec")
            .map(SecurityLevel::from_value)
            .unwrap_or_default();

        Some(Self::with_security(name, security))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "sec": self.security.to_value(),
        })
    }
}

/// Access configuration of a database.
#[derive(Clone, Debug, PartialEq)]
pub struct Design {
    pub language: String,

    /// Only level members may open the database when set.
    pub private: bool,

    /// Levels ordered from lowest to highest rank.
    pub levels: Vec<Level>,

    pub filters: BTreeMap<String, Option<String>>,

    pub validators: BTreeMap<String, Option<String>>,

    /// Fields of the persisted document this crate does not manage (`_id`, `_rev`, ..).
    pub extra: Map<String, Value>,
}

impl Default for Design {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            private: false,
            levels: Vec::new(),
            filters: BTreeMap::new(),
            validators: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl Design {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a persisted design document, applying defaults for everything missing or malformed.
    pub fn parse(document: &Value) -> Self {
        let Some(object) = document.as_object() else {
            return Self::default();
        };

        let extra = object
            .iter()
            .filter(|(key, _)| !DESIGN_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            language: object
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_LANGUAGE)
                .to_string(),
            private: object
                .get("private")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            levels: parse_levels(object.get("levels")),
            filters: parse_scripts(object.get("filters"), |script| script.to_string()),
            validators: parse_scripts(object.get("validators"), unexportify),
            extra,
        }
    }

    /// Writes the persisted design document.
    ///
    /// Empty filter and validator sections are left out entirely.
    pub fn compile(&self) -> Value {
        let mut document = self.extra.clone();

        document.insert("language".into(), Value::String(self.language.clone()));
        document.insert("private".into(), Value::Bool(self.private));
        document.insert(
            "levels".into(),
            Value::String(levels_module(&self.levels)),
        );

        if !self.filters.is_empty() {
            document.insert(
                "filters".into(),
                compile_scripts(&self.filters, |script| script.to_string()),
            );
        }

        if !self.validators.is_empty() {
            document.insert(
                "validators".into(),
                compile_scripts(&self.validators, exportify),
            );
            document.insert(
                "validate_doc_update".into(),
                Value::String(validate_doc_update(&self.validators)),
            );
        }

        Value::Object(document)
    }

    pub fn level(&self, name: &str) -> Option<&Level> {
        self.levels.iter().find(|level| level.name == name)
    }

    pub(crate) fn level_position(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|level| level.name == name)
    }
}

fn prefix(section: &str) -> String {
    format!("/*>>>>>>{}>>>>>>*/", section.to_uppercase())
}

fn postfix(section: &str) -> String {
    format!("/*<<<<<<{}<<<<<<*/", section.to_uppercase())
}

fn wrap(section: &str, content: &str) -> String {
    format!("{}{}{}", prefix(section), content, postfix(section))
}

/// Returns the content between the markers of `section`.
fn extract<'a>(source: &'a str, section: &str) -> Option<&'a str> {
    let prefix = prefix(section);
    let start = source.find(&prefix)? + prefix.len();
    let end = source[start..].find(&postfix(section))? + start;
    Some(&source[start..end])
}

fn exportify(script: &str) -> String {
    format!("{EXPORTS_PREFIX}{script};")
}

fn unexportify(script: &str) -> String {
    let script = script.strip_prefix(EXPORTS_PREFIX).unwrap_or(script);
    script.strip_suffix(';').unwrap_or(script).to_string()
}

fn parse_levels(value: Option<&Value>) -> Vec<Level> {
    let embedded;
    let items: &[Value] = match value {
        Some(Value::Array(items)) => items,
        Some(Value::String(source)) => {
            embedded = extract(source, LEVELS_SECTION)
                .and_then(|json| serde_json::from_str::<Value>(json).ok());
            match &embedded {
                Some(Value::Array(items)) => items,
                _ => &[],
            }
        }
        _ => &[],
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(Level::from_value)
        .filter(|level| seen.insert(level.name.clone()))
        .collect()
}

fn levels_module(levels: &[Level]) -> String {
    let list = Value::Array(levels.iter().map(Level::to_value).collect());

    let mut source = String::from(LEVELS_LIBRARY);
    source.push_str(&format!(
        "var levels = exports.levels = {};\n",
        wrap(LEVELS_SECTION, &list.to_string())
    ));
    source.push_str("exports.getLevel = getLevel.bind(null, levels);\n");
    source.push_str("exports.hasLevel = hasLevel.bind(null, levels);\n");
    source
}

fn parse_scripts<F>(value: Option<&Value>, unwrap: F) -> BTreeMap<String, Option<String>>
where
    F: Fn(&str) -> String,
{
    let Some(Value::Object(scripts)) = value else {
        return BTreeMap::new();
    };

    scripts
        .iter()
        .map(|(name, script)| (name.clone(), script.as_str().map(&unwrap)))
        .collect()
}

fn compile_scripts<F>(scripts: &BTreeMap<String, Option<String>>, wrap: F) -> Value
where
    F: Fn(&str) -> String,
{
    Value::Object(
        scripts
            .iter()
            .map(|(name, script)| {
                let value = match script {
                    Some(script) => Value::String(wrap(script)),
                    None => Value::Null,
                };
                (name.clone(), value)
            })
            .collect(),
    )
}

/// Validation entry point running every named validator module in turn.
fn validate_doc_update(validators: &BTreeMap<String, Option<String>>) -> String {
    let names = Value::Array(
        validators
            .keys()
            .map(|name| Value::String(name.clone()))
            .collect(),
    );

    format!(
        "function(newDoc, oldDoc, userCtx, secObj) {{\n  var list = {names};\n  for (var i = 0; i < list.length; i++) {{\n    require(\"validators/\" + list[i]).apply(this, arguments);\n  }}\n}}"
    )
}

use crate::transport::TransportFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub const DATA_QUALITY_APPROXIMATE: &str = "approximate";

/// Outcome of one remote execution, classified once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The snippet ran; carries the bound `result`, the captured output
    /// envelope, or the bare success marker.
    Success(Value),
    /// The snippet ran and raised inside the remote runtime.
    StructuredError { message: String, kind: String },
    /// The remote call exited cleanly but the last line was not JSON.
    RawOutput(String),
    Transport(TransportFailure),
}

impl ExecutionOutcome {
    pub fn error_type(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Success(_) | ExecutionOutcome::RawOutput(_) => None,
            ExecutionOutcome::StructuredError { kind, .. } => Some(kind.as_str()),
            ExecutionOutcome::Transport(failure) => Some(failure.kind()),
        }
    }

    /// Render the caller-visible envelope: always an object with `success`,
    /// and `error` + `error_type` on failure.
    pub fn into_response(self) -> Value {
        match self {
            ExecutionOutcome::Success(value) => json!({ "success": true, "result": value }),
            ExecutionOutcome::RawOutput(text) => {
                json!({ "success": true, "output": text, "raw": true })
            }
            ExecutionOutcome::StructuredError { message, kind } => json!({
                "success": false,
                "error": message,
                "error_type": kind,
                "hint": "Use 'env' to reach models, e.g. result = env['res.partner'].search_count([])",
            }),
            ExecutionOutcome::Transport(failure) => failure.into_response(),
        }
    }
}

/// Error envelope for failures that never reached the remote side.
pub fn error_response(message: impl Into<String>, error_type: &str) -> Value {
    json!({
        "success": false,
        "error": message.into(),
        "error_type": error_type,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecoratorRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, alias = "args")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub string: Option<String>,
    /// `None` when the declaration sets it from a non-literal expression.
    #[serde(default = "not_required")]
    pub required: Option<bool>,
    #[serde(default = "stored")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
}

fn not_required() -> Option<bool> {
    Some(false)
}

fn stored() -> Option<bool> {
    Some(true)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelIndexEntry {
    #[serde(rename = "class")]
    pub class_name: String,
    pub module: String,
    #[serde(rename = "file")]
    pub file_path: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
    #[serde(default)]
    pub delegates: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDescriptor>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub decorators: BTreeMap<String, Vec<DecoratorRecord>>,
}

impl ModelIndexEntry {
    /// Fold a later declaration of the same model into this entry. Scalars
    /// from a primary declaration (one carrying `_name`) replace ours; maps
    /// and lists are extended with the later value winning per key.
    pub fn merge(&mut self, later: ModelIndexEntry, later_is_primary: bool) {
        if later_is_primary {
            self.class_name = later.class_name;
            self.module = later.module;
            self.file_path = later.file_path;
        }
        if later.description.is_some() {
            self.description = later.description;
        }
        for parent in later.inherits {
            if !self.inherits.contains(&parent) {
                self.inherits.push(parent);
            }
        }
        self.delegates.extend(later.delegates);
        self.fields.extend(later.fields);
        for method in later.methods {
            if !self.methods.contains(&method) {
                self.methods.push(method);
            }
        }
        self.decorators.extend(later.decorators);
    }
}

/// Model identity -> entry, as produced by one indexing pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelIndex {
    #[serde(default)]
    pub models: BTreeMap<String, ModelIndexEntry>,
}

impl ModelIndex {
    pub fn insert(&mut self, name: String, entry: ModelIndexEntry, primary: bool) {
        match self.models.get_mut(&name) {
            Some(existing) => existing.merge(entry, primary),
            None => {
                self.models.insert(name, entry);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelIndexEntry> {
        self.models.get(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Stamp an fs-backed payload with its provenance.
pub fn mark_approximate(mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.entry("mode_used").or_insert_with(|| json!("fs"));
        map.entry("data_quality")
            .or_insert_with(|| json!(DATA_QUALITY_APPROXIMATE));
    }
    payload
}

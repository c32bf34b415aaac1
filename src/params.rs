//! Typed parameters of the named query methods and their JSON Schemas.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

pub const METHOD_LIST: &[&str] = &[
    "execute",
    "model_info",
    "search_models",
    "search_decorators",
    "search_count",
    "search_records",
];

const METHOD_ALIASES: &[(&str, &str)] = &[("execute_code", "execute")];

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// Snippet to run; assign to `result` to return a value.
    pub code: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ModelInfoParams {
    /// Technical model name, e.g. `sale.order`.
    #[serde(alias = "model")]
    pub model_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchModelsParams {
    /// Case-insensitive substring matched against names and descriptions.
    pub pattern: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchDecoratorsParams {
    /// One of depends, constrains, onchange, model_create_multi.
    pub decorator: String,
}

/// Shared by `search_count` and `search_records`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecordQueryParams {
    #[serde(alias = "model")]
    pub model_name: String,
    /// Search domain as nested lists, e.g. `[["state", "=", "sale"]]`.
    #[serde(default = "empty_domain")]
    pub domain: Value,
}

fn empty_domain() -> Value {
    json!([])
}

/// Paging keys accepted next to every method's own parameters. Values may
/// also arrive as numeric strings, so they are read leniently elsewhere.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct PageParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    /// Takes precedence over page/page_size when positive.
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Case-insensitive substring filter over the listed items.
    pub filter: Option<String>,
}

pub fn canonical_method(method: &str) -> &str {
    METHOD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == method)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(method)
}

fn schema_value<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    let raw = serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}));
    simplify_schema(raw)
}

/// Simplified JSON Schema for a method's parameters, paging keys included.
pub fn method_param_schema(method: &str) -> Value {
    let mut schema = match canonical_method(method) {
        "execute" => schema_value::<ExecuteParams>(),
        "model_info" => schema_value::<ModelInfoParams>(),
        "search_models" => schema_value::<SearchModelsParams>(),
        "search_decorators" => schema_value::<SearchDecoratorsParams>(),
        "search_count" | "search_records" => schema_value::<RecordQueryParams>(),
        _ => return json!({"type": "object"}),
    };
    let paging = schema_value::<PageParams>();
    if let (Some(Value::Object(own)), Some(Value::Object(extra))) = (
        schema.get_mut("properties"),
        paging.get("properties").cloned(),
    ) {
        own.extend(extra);
    }
    schema
}

pub fn method_list() -> Value {
    let methods: Vec<Value> = METHOD_LIST
        .iter()
        .map(|name| json!({ "name": name, "params": method_param_schema(name) }))
        .collect();
    let aliases: serde_json::Map<String, Value> = METHOD_ALIASES
        .iter()
        .map(|(alias, canonical)| (alias.to_string(), json!(canonical)))
        .collect();
    json!({ "methods": methods, "aliases": aliases })
}

fn simplify_schema(mut schema: Value) -> Value {
    strip_noise(&mut schema);
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("definitions");
        obj.remove("title");
    }
    schema
}

fn strip_noise(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                strip_noise(child);
            }
            let is_integer = match map.get("type") {
                Some(Value::String(kind)) => kind == "integer",
                Some(Value::Array(kinds)) => kinds.iter().any(|kind| kind == "integer"),
                _ => false,
            };
            if is_integer {
                map.remove("format");
                map.remove("minimum");
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_noise),
        _ => {}
    }
}

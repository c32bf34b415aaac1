//! Query answers over a model index, plus the renderers the live path reuses
//! so both backends return the same shapes.

use crate::model::{ModelIndex, ModelIndexEntry, error_response, mark_approximate};
use crate::shape::{PaginationWindow, paginate};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

pub const MODEL_INFO_PAGE_SIZE: usize = 25;
pub const METHOD_SAMPLE_SIZE: usize = 20;
pub const DECORATOR_TYPES: &[&str] = &["depends", "constrains", "onchange", "model_create_multi"];

/// Model metadata in backend-neutral form.
#[derive(Debug, Clone, Default)]
pub struct ModelSummary {
    pub name: String,
    pub details: Map<String, Value>,
    pub fields: BTreeMap<String, Value>,
    pub methods: Vec<String>,
}

impl ModelSummary {
    pub fn from_entry(name: &str, entry: &ModelIndexEntry) -> Self {
        let mut details = Map::new();
        details.insert("class".to_string(), json!(entry.class_name));
        details.insert("module".to_string(), json!(entry.module));
        details.insert("file".to_string(), json!(entry.file_path));
        details.insert(
            "description".to_string(),
            json!(entry.description.clone().unwrap_or_default()),
        );
        details.insert("inherits".to_string(), json!(entry.inherits));
        details.insert("delegates".to_string(), json!(entry.delegates));
        let fields = entry
            .fields
            .iter()
            .map(|(field, descriptor)| (field.clone(), json!(descriptor)))
            .collect();
        Self {
            name: name.to_string(),
            details,
            fields,
            methods: entry.methods.clone(),
        }
    }
}

/// Fields paged by name, methods sampled.
pub fn render_model_info(summary: ModelSummary, window: &PaginationWindow) -> Value {
    let total_fields = summary.fields.len();
    let field_rows: Vec<Value> = summary
        .fields
        .into_iter()
        .map(|(name, descriptor)| {
            let mut row = Map::new();
            row.insert("name".to_string(), json!(name));
            if let Value::Object(descriptor) = descriptor {
                row.extend(descriptor);
            }
            Value::Object(row)
        })
        .collect();
    let page = paginate(field_rows, window, &["name", "type", "string"]);
    let displayed = page.items.len();

    let mut methods = summary.methods;
    methods.sort();
    let total_methods = methods.len();
    methods.truncate(METHOD_SAMPLE_SIZE);

    let mut response = Map::new();
    response.insert("success".to_string(), json!(true));
    response.insert("name".to_string(), json!(summary.name));
    response.extend(summary.details);
    response.insert("total_field_count".to_string(), json!(total_fields));
    response.insert("displayed_field_count".to_string(), json!(displayed));
    response.insert(
        "fields".to_string(),
        json!({ "items": page.items, "pagination": page.pagination() }),
    );
    response.insert("methods_sample".to_string(), json!(methods));
    response.insert("total_method_count".to_string(), json!(total_methods));
    Value::Object(response)
}

/// Candidate row for model search: `{name, description, ...}`.
pub fn rank_models(pattern: &str, candidates: Vec<Value>) -> Vec<Value> {
    let needle = pattern.to_lowercase();
    let mut ranked: Vec<(u8, String, Value)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let name = candidate.get("name")?.as_str()?.to_string();
            let description = candidate
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let (priority, match_type) = if name == pattern {
                (1, "exact")
            } else if name.to_lowercase().contains(&needle) {
                (2, "partial")
            } else if !description.is_empty() && description.to_lowercase().contains(&needle) {
                (3, "description")
            } else {
                return None;
            };
            let mut row = match candidate {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            if description.is_empty() {
                row.insert("description".to_string(), json!(name));
            }
            row.insert("match_type".to_string(), json!(match_type));
            row.insert("priority".to_string(), json!(priority));
            Some((priority, name, Value::Object(row)))
        })
        .collect();
    ranked.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    ranked.into_iter().map(|(_, _, row)| row).collect()
}

pub fn render_search_models(
    pattern: &str,
    total_models: usize,
    ranked: Vec<Value>,
    window: &PaginationWindow,
) -> Value {
    let page = paginate(ranked, window, &["name", "description"]);
    json!({
        "success": true,
        "pattern": pattern,
        "total_models": total_models,
        "matches": { "items": page.items, "pagination": page.pagination() },
    })
}

/// `rows` are `{model, description, methods: [{method, arguments}]}`.
pub fn render_search_decorators(decorator: &str, rows: Vec<Value>, window: &PaginationWindow) -> Value {
    let page = paginate(rows, window, &["model", "description"]);
    json!({
        "success": true,
        "decorator": decorator,
        "results": { "items": page.items, "pagination": page.pagination() },
    })
}

pub fn model_info(index: &ModelIndex, model: &str, window: &PaginationWindow) -> Value {
    let response = match index.get(model) {
        Some(entry) => render_model_info(ModelSummary::from_entry(model, entry), window),
        None => error_response(format!("Model {model} not found (fs)"), "ModelNotFound"),
    };
    mark_approximate(response)
}

pub fn search_models(index: &ModelIndex, pattern: &str, window: &PaginationWindow) -> Value {
    let candidates = index
        .models
        .iter()
        .map(|(name, entry)| {
            json!({
                "name": name,
                "description": entry.description.clone().unwrap_or_default(),
                "module": entry.module,
            })
        })
        .collect();
    let ranked = rank_models(pattern, candidates);
    mark_approximate(render_search_models(pattern, index.len(), ranked, window))
}

pub fn search_decorators(index: &ModelIndex, decorator: &str, window: &PaginationWindow) -> Value {
    let rows = index
        .models
        .iter()
        .filter_map(|(name, entry)| {
            let methods: Vec<Value> = entry
                .decorators
                .iter()
                .filter_map(|(method, records)| {
                    records
                        .iter()
                        .find(|record| record.kind == decorator)
                        .map(|record| json!({ "method": method, "arguments": record.arguments }))
                })
                .collect();
            (!methods.is_empty()).then(|| {
                json!({
                    "model": name,
                    "description": entry.description.clone().unwrap_or_default(),
                    "methods": methods,
                })
            })
        })
        .collect();
    mark_approximate(render_search_decorators(decorator, rows, window))
}

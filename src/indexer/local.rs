//! In-process model extraction over a local checkout.
//!
//! Mirrors the embedded scan program declaration for declaration, using
//! tree-sitter instead of the interpreter's own parser. Files are only ever
//! read and parsed.

use crate::model::{DecoratorRecord, FieldDescriptor, ModelIndex, ModelIndexEntry};
use crate::pylit;
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use log::debug;
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Parser};

const MODEL_BASES: &[&str] = &["Model", "TransientModel", "AbstractModel"];
const DECORATOR_TYPES: &[&str] = &["depends", "constrains", "onchange", "model_create_multi"];
const MANIFESTS: &[&str] = &["__manifest__.py", "__openerp__.py"];

/// One class declaration resolved to the model it defines or extends.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    /// True when the class introduces the model (`_name` not also inherited).
    pub primary: bool,
    pub entry: ModelIndexEntry,
}

pub struct ModelExtractor {
    parser: Parser,
}

impl ModelExtractor {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let language = tree_sitter_python::LANGUAGE;
        parser.set_language(&language.into())?;
        Ok(Self { parser })
    }

    /// Declarations in `source`, in file order. A file that does not parse
    /// cleanly yields nothing.
    pub fn extract(&mut self, source: &str, file_path: &str, module: &str) -> Result<Vec<Declaration>> {
        let tree = self
            .parser
            .parse(source, None)
            .with_context(|| format!("parse {file_path}"))?;
        let root = tree.root_node();
        if root.has_error() {
            debug!("odoo-lens: skipping {file_path}: syntax error");
            return Ok(Vec::new());
        }

        let mut declarations = Vec::new();
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            let class = match child.kind() {
                "class_definition" => child,
                "decorated_definition" => match child.child_by_field_name("definition") {
                    Some(def) if def.kind() == "class_definition" => def,
                    _ => continue,
                },
                _ => continue,
            };
            if !has_model_base(class, source) {
                continue;
            }
            if let Some(declaration) = scan_class(class, source, file_path, module) {
                declarations.push(declaration);
            }
        }
        Ok(declarations)
    }
}

/// Build a model index from local roots, merging declarations in path order.
pub fn index_roots(roots: &[PathBuf]) -> Result<ModelIndex> {
    let mut extractor = ModelExtractor::new()?;
    let mut index = ModelIndex::default();
    for root in roots {
        if !root.is_dir() {
            debug!("odoo-lens: skipping missing root {}", root.display());
            continue;
        }
        for path in candidate_files(root) {
            let source = match fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    debug!("odoo-lens: skipping {}: {err}", path.display());
                    continue;
                }
            };
            let file_path = path.to_string_lossy().to_string();
            let module = module_of(&path);
            for declaration in extractor.extract(&source, &file_path, &module)? {
                index.insert(declaration.name, declaration.entry, declaration.primary);
            }
        }
    }
    Ok(index)
}

/// Python files under a `models` directory and outside any `tests`
/// directory, sorted by path string.
pub fn candidate_files(root: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            if !is_dir || entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            name != "tests" && !name.starts_with('.')
        })
        .build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("odoo-lens: walk error: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "py"))
        .filter(|path| {
            let Some(parent) = path.parent() else {
                return false;
            };
            let parts: Vec<_> = parent.components().map(|c| c.as_os_str()).collect();
            parts.iter().any(|part| *part == "models") && !parts.iter().any(|part| *part == "tests")
        })
        .collect();
    files.sort_by_key(|path| path.to_string_lossy().to_string());
    files
}

/// Addon name: nearest ancestor holding a manifest, else the directory
/// right after the last `addons` component.
pub fn module_of(path: &Path) -> String {
    if let Some(parent) = path.parent() {
        for dir in parent.ancestors() {
            if MANIFESTS.iter().any(|name| dir.join(name).is_file()) {
                if let Some(name) = dir.file_name() {
                    return name.to_string_lossy().to_string();
                }
            }
        }
    }
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if let Some(position) = parts.iter().rposition(|part| part == "addons") {
        if position + 1 < parts.len() - 1 {
            return parts[position + 1].clone();
        }
    }
    "unknown".to_string()
}

fn has_model_base(class: Node<'_>, source: &str) -> bool {
    let Some(bases) = class.child_by_field_name("superclasses") else {
        return false;
    };
    let mut cursor = bases.walk();
    bases.named_children(&mut cursor).any(|base| match base.kind() {
        "attribute" => {
            let object = base.child_by_field_name("object");
            let attr = base.child_by_field_name("attribute");
            match (object, attr) {
                (Some(object), Some(attr)) => {
                    object.kind() == "identifier"
                        && node_text(object, source) == "models"
                        && MODEL_BASES.contains(&node_text(attr, source).as_str())
                }
                _ => false,
            }
        }
        "identifier" => MODEL_BASES.contains(&node_text(base, source).as_str()),
        _ => false,
    })
}

fn scan_class(class: Node<'_>, source: &str, file_path: &str, module: &str) -> Option<Declaration> {
    let mut entry = ModelIndexEntry {
        class_name: class
            .child_by_field_name("name")
            .map(|n| node_text(n, source))
            .unwrap_or_default(),
        module: module.to_string(),
        file_path: file_path.to_string(),
        ..Default::default()
    };
    let mut name: Option<String> = None;

    let body = class.child_by_field_name("body")?;
    let mut cursor = body.walk();
    for stmt in body.named_children(&mut cursor) {
        match stmt.kind() {
            "expression_statement" => {
                let Some(assignment) = stmt.named_child(0).filter(|n| n.kind() == "assignment") else {
                    continue;
                };
                scan_assignment(assignment, source, &mut entry, &mut name);
            }
            "function_definition" => record_method(stmt, &[], source, &mut entry),
            "decorated_definition" => {
                let Some(def) = stmt
                    .child_by_field_name("definition")
                    .filter(|d| d.kind() == "function_definition")
                else {
                    continue;
                };
                let mut dec_cursor = stmt.walk();
                let decorators: Vec<Node<'_>> = stmt
                    .named_children(&mut dec_cursor)
                    .filter(|child| child.kind() == "decorator")
                    .collect();
                record_method(def, &decorators, source, &mut entry);
            }
            _ => {}
        }
    }

    match name {
        Some(name) => {
            let primary = !entry.inherits.contains(&name);
            Some(Declaration {
                name,
                primary,
                entry,
            })
        }
        None => {
            let name = entry.inherits.first()?.clone();
            Some(Declaration {
                name,
                primary: false,
                entry,
            })
        }
    }
}

fn scan_assignment(
    assignment: Node<'_>,
    source: &str,
    entry: &mut ModelIndexEntry,
    name: &mut Option<String>,
) {
    let (Some(left), Some(right)) = (
        assignment.child_by_field_name("left"),
        assignment.child_by_field_name("right"),
    ) else {
        return;
    };
    // Annotated assignments are not class attributes the ORM reads.
    if left.kind() != "identifier" || assignment.child_by_field_name("type").is_some() {
        return;
    }
    let target = node_text(left, source);
    match target.as_str() {
        "_name" => {
            if let Some(value) = text(right, source).filter(|value| !value.is_empty()) {
                *name = Some(value);
            }
        }
        "_description" => entry.description = text(right, source),
        "_inherit" => entry.inherits = text_list(right, source),
        "_inherits" => entry.delegates = text_map(right, source),
        _ => {
            if right.kind() != "call" {
                return;
            }
            if let Some(kind) = field_type(right, source) {
                let descriptor = field_descriptor(&kind, right, source);
                entry.fields.insert(target, descriptor);
            }
        }
    }
}

fn record_method(def: Node<'_>, decorators: &[Node<'_>], source: &str, entry: &mut ModelIndexEntry) {
    let Some(name) = def.child_by_field_name("name").map(|n| node_text(n, source)) else {
        return;
    };
    if !entry.methods.contains(&name) {
        entry.methods.push(name.clone());
    }
    let records: Vec<DecoratorRecord> = decorators
        .iter()
        .filter_map(|decorator| decorator_record(*decorator, source))
        .collect();
    if !records.is_empty() {
        entry.decorators.insert(name, records);
    }
}

fn decorator_record(decorator: Node<'_>, source: &str) -> Option<DecoratorRecord> {
    let expr = decorator.named_child(0)?;
    let (target, call) = if expr.kind() == "call" {
        (expr.child_by_field_name("function")?, Some(expr))
    } else {
        (expr, None)
    };
    if target.kind() != "attribute" {
        return None;
    }
    let object = target.child_by_field_name("object")?;
    let attr = node_text(target.child_by_field_name("attribute")?, source);
    if object.kind() != "identifier"
        || node_text(object, source) != "api"
        || !DECORATOR_TYPES.contains(&attr.as_str())
    {
        return None;
    }
    let arguments = call
        .map(|call| {
            parse_call_arguments(call, source)
                .positional
                .into_iter()
                .filter_map(|arg| text(arg, source))
                .collect()
        })
        .unwrap_or_default();
    Some(DecoratorRecord {
        kind: attr,
        arguments,
    })
}

fn field_type(call: Node<'_>, source: &str) -> Option<String> {
    let function = call.child_by_field_name("function")?;
    if function.kind() != "attribute" {
        return None;
    }
    let object = function.child_by_field_name("object")?;
    if object.kind() != "identifier" || node_text(object, source) != "fields" {
        return None;
    }
    let attr = node_text(function.child_by_field_name("attribute")?, source);
    attr.chars()
        .next()
        .is_some_and(char::is_uppercase)
        .then(|| attr.to_lowercase())
}

/// Positional index of each descriptor slot for a field constructor.
fn positional_slot(kind: &str, slot: &str) -> Option<usize> {
    match (kind, slot) {
        ("many2one", "relation") => Some(0),
        ("many2one", "string") => Some(1),
        ("one2many", "relation") => Some(0),
        ("one2many", "inverse_name") => Some(1),
        ("one2many", "string") => Some(2),
        ("many2many", "relation") => Some(0),
        ("many2many", "string") => Some(4),
        ("selection" | "reference", "selection") => Some(0),
        ("selection" | "reference", "string") => Some(1),
        ("many2one" | "one2many" | "many2many" | "selection" | "reference", _) => None,
        (_, "string") => Some(0),
        _ => None,
    }
}

fn field_descriptor(kind: &str, call: Node<'_>, source: &str) -> FieldDescriptor {
    let args = parse_call_arguments(call, source);
    let keyword = |name: &str| {
        args.keywords
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    };
    let argument = |slot: &str, keyword_name: &str| {
        keyword(keyword_name).or_else(|| {
            positional_slot(kind, slot).and_then(|index| args.positional.get(index).copied())
        })
    };

    // A flag given as anything but a literal stays unresolved.
    let flag = |name: &str, default: bool| match keyword(name) {
        Some(node) => literal(node, source).map(|value| truthy(&value)),
        None => Some(default),
    };
    let computed = keyword("compute").is_some() || keyword("related").is_some();
    let relational = matches!(kind, "many2one" | "one2many" | "many2many");
    let selection = if matches!(kind, "selection" | "reference") {
        argument("selection", "selection").and_then(|node| literal(node, source))
    } else {
        None
    };

    FieldDescriptor {
        kind: kind.to_string(),
        string: argument("string", "string").and_then(|node| text(node, source)),
        required: flag("required", false),
        store: flag("store", !computed),
        relation: relational
            .then(|| argument("relation", "comodel_name").and_then(|node| text(node, source)))
            .flatten(),
        inverse_name: (kind == "one2many")
            .then(|| argument("inverse_name", "inverse_name").and_then(|node| text(node, source)))
            .flatten(),
        selection,
        compute: keyword("compute").and_then(|node| text(node, source)),
        related: keyword("related").and_then(|node| text(node, source)),
    }
}

struct CallArgs<'a> {
    positional: Vec<Node<'a>>,
    keywords: Vec<(String, Node<'a>)>,
}

fn parse_call_arguments<'a>(node: Node<'a>, source: &str) -> CallArgs<'a> {
    let mut positional = Vec::new();
    let mut keywords = Vec::new();
    let Some(args) = node.child_by_field_name("arguments") else {
        return CallArgs {
            positional,
            keywords,
        };
    };
    let mut cursor = args.walk();
    for child in args.named_children(&mut cursor) {
        match child.kind() {
            "comment" => {}
            "keyword_argument" => {
                if let (Some(name_node), Some(value_node)) = (
                    child.child_by_field_name("name"),
                    child.child_by_field_name("value"),
                ) {
                    keywords.push((node_text(name_node, source), value_node));
                }
            }
            _ => positional.push(child),
        }
    }
    CallArgs {
        positional,
        keywords,
    }
}

/// Literal value of an expression, or `None` when it is not a plain
/// literal. Containers resolve only when every element does.
fn literal(node: Node<'_>, source: &str) -> Option<Value> {
    match node.kind() {
        "string" => string_value(node, source).map(Value::String),
        "concatenated_string" => {
            let mut cursor = node.walk();
            node.named_children(&mut cursor)
                .filter(|child| child.kind() == "string")
                .map(|child| string_value(child, source))
                .collect::<Option<String>>()
                .map(Value::String)
        }
        "integer" => {
            let raw = node_text(node, source).replace('_', "");
            raw.parse::<i64>().ok().map(Value::from)
        }
        "float" => {
            let raw = node_text(node, source).replace('_', "");
            raw.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "none" => Some(Value::Null),
        "list" | "tuple" => {
            let mut cursor = node.walk();
            node.named_children(&mut cursor)
                .filter(|child| child.kind() != "comment")
                .map(|child| literal(child, source))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array)
        }
        "parenthesized_expression" => node.named_child(0).and_then(|inner| literal(inner, source)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn text(node: Node<'_>, source: &str) -> Option<String> {
    match literal(node, source)? {
        Value::String(value) => Some(value),
        _ => None,
    }
}

fn text_list(node: Node<'_>, source: &str) -> Vec<String> {
    if matches!(node.kind(), "list" | "tuple") {
        let mut cursor = node.walk();
        return node
            .named_children(&mut cursor)
            .filter_map(|child| text(child, source))
            .collect();
    }
    text(node, source).into_iter().collect()
}

fn text_map(node: Node<'_>, source: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if node.kind() != "dictionary" {
        return out;
    }
    let mut cursor = node.walk();
    for pair in node.named_children(&mut cursor) {
        if pair.kind() != "pair" {
            continue;
        }
        let key = pair.child_by_field_name("key").and_then(|k| text(k, source));
        let value = pair.child_by_field_name("value").and_then(|v| text(v, source));
        if let (Some(key), Some(value)) = (key, value) {
            out.insert(key, value);
        }
    }
    out
}

/// Value of a plain or raw string literal. Interpolated and byte strings do
/// not resolve.
fn string_value(node: Node<'_>, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    if node
        .named_children(&mut cursor)
        .any(|child| child.kind() == "interpolation")
    {
        return None;
    }
    let raw = node_text(node, source);
    let (prefix, body) = pylit::split_literal(&raw)?;
    if prefix.contains('f') || prefix.contains('b') {
        return None;
    }
    if prefix.contains('r') {
        Some(body.to_string())
    } else {
        Some(pylit::unescape(body))
    }
}

fn node_text(node: Node<'_>, source: &str) -> String {
    let start = node.start_byte();
    let end = node.end_byte();
    source.get(start..end).unwrap_or("").trim().to_string()
}

//! Static snippet policy.
//!
//! A snippet is parsed once with tree-sitter-python and walked depth-first in
//! source order. Nothing is executed. The first violation found is the one
//! reported by [`Policy::validate`]; [`Policy::violations`] keeps walking and
//! returns all of them for diagnostics.

use crate::pylit;
use log::warn;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;
use tree_sitter::{Node, Parser};

pub const MAX_SNIPPET_CHARS: usize = 10_000;
pub const MAX_LOOP_DEPTH: usize = 3;

const ALLOWED_MODULES: &[&str] = &[
    "datetime",
    "json",
    "re",
    "math",
    "collections",
    "itertools",
    "functools",
    "operator",
    "decimal",
];

/// Top-level packages of the target application itself.
const DOMAIN_PACKAGES: &[&str] = &["odoo"];

const DANGEROUS_IMPORTS: &[&str] = &[
    "os",
    "subprocess",
    "sys",
    "shutil",
    "pathlib",
    "socket",
    "urllib",
    "requests",
    "http",
    "ftplib",
    "smtplib",
    "tempfile",
    "__builtin__",
    "builtins",
    "importlib",
    "ctypes",
    "pickle",
    "marshal",
    "multiprocessing",
    "pty",
    "signal",
    "code",
    "codeop",
    "runpy",
];

const DANGEROUS_CALLS: &[&str] = &[
    "eval",
    "exec",
    "execfile",
    "compile",
    "__import__",
    "open",
    "file",
    "input",
    "raw_input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
];

/// Names that are rejected even when only referenced, since binding them to
/// another name would sidestep the call check.
const DANGEROUS_REFERENCES: &[&str] = &["eval", "exec", "execfile", "__import__"];

const DANGEROUS_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__bases__",
    "__mro__",
    "__subclasses__",
    "__globals__",
    "__code__",
    "__closure__",
    "__builtins__",
    "__dict__",
    "__func__",
    "__self__",
    "__module__",
    "__name__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__loader__",
    "__spec__",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "gi_frame",
    "tb_frame",
];

const OBFUSCATION_CALLS: &[&str] = &[
    "chr",
    "unichr",
    "encodebytes",
    "decodebytes",
    "fromhex",
    "unhexlify",
    "a2b_base64",
    "b2a_base64",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyRule {
    CodeTooLong,
    SyntaxError,
    DisallowedImport,
    DangerousCall,
    DangerousAttribute,
    PathTraversal,
    Obfuscation,
    LoopDepth,
    UnboundedWhile,
    PrivateDefinition,
}

impl PolicyRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRule::CodeTooLong => "CodeTooLong",
            PolicyRule::SyntaxError => "SyntaxError",
            PolicyRule::DisallowedImport => "DisallowedImport",
            PolicyRule::DangerousCall => "DangerousCall",
            PolicyRule::DangerousAttribute => "DangerousAttribute",
            PolicyRule::PathTraversal => "PathTraversal",
            PolicyRule::Obfuscation => "Obfuscation",
            PolicyRule::LoopDepth => "LoopDepth",
            PolicyRule::UnboundedWhile => "UnboundedWhile",
            PolicyRule::PrivateDefinition => "PrivateDefinition",
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{rule}: {detail}")]
pub struct PolicyViolation {
    pub rule: PolicyRule,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl PolicyViolation {
    fn new(rule: PolicyRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
            line: None,
        }
    }

    fn at(rule: PolicyRule, node: Node<'_>, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
            line: Some(node.start_position().row + 1),
        }
    }

    pub fn into_response(self) -> Value {
        json!({
            "success": false,
            "error": self.detail,
            "error_type": "PolicyViolation",
            "rule": self.rule,
            "line": self.line,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    allowed_modules: BTreeSet<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_modules: ALLOWED_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

struct Frame<'t> {
    node: Node<'t>,
    loop_depth: usize,
    top_level: bool,
    scope: Scope,
}

/// Enclosing constructs that make `return`, `yield`, `break` and
/// `continue` legal.
#[derive(Clone, Copy, Default)]
struct Scope {
    in_function: bool,
    in_loop: bool,
}

impl Scope {
    fn enter(self, node: Node<'_>) -> Self {
        match node.kind() {
            "function_definition" | "async_function_definition" | "lambda" => Self {
                in_function: true,
                in_loop: false,
            },
            "class_definition" => Self::default(),
            "for_statement" | "while_statement" => Self {
                in_loop: true,
                ..self
            },
            _ => self,
        }
    }
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow one more top-level module. Modules on the dangerous list stay
    /// rejected.
    pub fn allow_module(mut self, module: &str) -> Self {
        self.allowed_modules.insert(module.to_string());
        self
    }

    pub fn validate(&self, snippet: &str) -> Result<(), PolicyViolation> {
        match self.check(snippet, true).into_iter().next() {
            Some(violation) => {
                warn!(
                    "odoo-lens: Security: snippet rejected by {}: {}",
                    violation.rule, violation.detail
                );
                Err(violation)
            }
            None => Ok(()),
        }
    }

    pub fn violations(&self, snippet: &str) -> Vec<PolicyViolation> {
        self.check(snippet, false)
    }

    fn check(&self, snippet: &str, first_only: bool) -> Vec<PolicyViolation> {
        let length = snippet.chars().count();
        if length > MAX_SNIPPET_CHARS {
            return vec![PolicyViolation::new(
                PolicyRule::CodeTooLong,
                format!(
                    "code is {length} characters, maximum is {MAX_SNIPPET_CHARS}"
                ),
            )];
        }

        let mut parser = Parser::new();
        if let Err(err) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            return vec![PolicyViolation::new(
                PolicyRule::SyntaxError,
                format!("python grammar unavailable: {err}"),
            )];
        }
        let Some(tree) = parser.parse(snippet, None) else {
            return vec![PolicyViolation::new(
                PolicyRule::SyntaxError,
                "code could not be parsed",
            )];
        };
        let root = tree.root_node();
        if root.has_error() {
            return vec![syntax_violation(root)];
        }

        let mut found = Vec::new();
        let mut stack = vec![Frame {
            node: root,
            loop_depth: 0,
            top_level: false,
            scope: Scope::default(),
        }];
        while let Some(frame) = stack.pop() {
            let node = frame.node;
            let mut loop_depth = frame.loop_depth;
            if let Some(violation) =
                self.check_node(node, snippet, &mut loop_depth, frame.top_level, frame.scope)
            {
                found.push(violation);
                if first_only {
                    return found;
                }
            }

            let children_top_level = node.kind() == "module"
                || (frame.top_level && node.kind() == "decorated_definition");
            let scope = frame.scope.enter(node);
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
            for child in children.into_iter().rev() {
                stack.push(Frame {
                    node: child,
                    loop_depth,
                    top_level: children_top_level,
                    scope,
                });
            }
        }
        found
    }

    fn check_node(
        &self,
        node: Node<'_>,
        source: &str,
        loop_depth: &mut usize,
        top_level: bool,
        scope: Scope,
    ) -> Option<PolicyViolation> {
        match node.kind() {
            "print_statement" => Some(PolicyViolation::at(
                PolicyRule::SyntaxError,
                node,
                "print statement is Python 2 syntax",
            )),
            "return_statement" | "yield" if !scope.in_function => {
                let keyword = if node.kind() == "yield" { "yield" } else { "return" };
                Some(PolicyViolation::at(
                    PolicyRule::SyntaxError,
                    node,
                    format!("'{keyword}' outside function"),
                ))
            }
            "break_statement" | "continue_statement" if !scope.in_loop => {
                let keyword = node_text(node, source).trim();
                Some(PolicyViolation::at(
                    PolicyRule::SyntaxError,
                    node,
                    format!("'{keyword}' outside loop"),
                ))
            }
            "import_statement" => {
                let mut cursor = node.walk();
                for name in node.children_by_field_name("name", &mut cursor) {
                    let module = match name.kind() {
                        "aliased_import" => name
                            .child_by_field_name("name")
                            .map(|inner| node_text(inner, source))
                            .unwrap_or_default(),
                        _ => node_text(name, source),
                    };
                    if let Some(violation) = self.check_import(name, module) {
                        return Some(violation);
                    }
                }
                None
            }
            "import_from_statement" => {
                let module = node.child_by_field_name("module_name")?;
                if module.kind() == "relative_import" {
                    return Some(PolicyViolation::at(
                        PolicyRule::DisallowedImport,
                        node,
                        format!(
                            "relative import from '{}' is not allowed",
                            node_text(module, source)
                        ),
                    ));
                }
                self.check_import(node, node_text(module, source))
            }
            "future_import_statement" => self.check_import(node, "__future__"),
            "call" => check_call(node, source),
            "exec_statement" => Some(PolicyViolation::at(
                PolicyRule::DangerousCall,
                node,
                "exec statement is not allowed",
            )),
            "attribute" => {
                let attr = node.child_by_field_name("attribute")?;
                let name = node_text(attr, source);
                DANGEROUS_ATTRIBUTES.contains(&name).then(|| {
                    PolicyViolation::at(
                        PolicyRule::DangerousAttribute,
                        node,
                        format!("access to attribute '{name}' is not allowed"),
                    )
                })
            }
            "identifier" => check_identifier(node, source),
            "string" => check_string_literal(node, source),
            "concatenated_string" => {
                let mut cursor = node.walk();
                let joined: String = node
                    .named_children(&mut cursor)
                    .filter(|part| part.kind() == "string")
                    .map(|part| pylit::literal_value(node_text(part, source)))
                    .collect();
                check_literal_value(node, &joined, "concatenated string")
            }
            "for_statement" | "while_statement" => {
                *loop_depth += 1;
                if *loop_depth > MAX_LOOP_DEPTH {
                    return Some(PolicyViolation::at(
                        PolicyRule::LoopDepth,
                        node,
                        format!("nested loops exceed maximum depth of {MAX_LOOP_DEPTH}"),
                    ));
                }
                if node.kind() == "while_statement" {
                    let has_break = node
                        .child_by_field_name("body")
                        .is_some_and(contains_break);
                    if !has_break {
                        return Some(PolicyViolation::at(
                            PolicyRule::UnboundedWhile,
                            node,
                            "while loop needs a reachable break",
                        ));
                    }
                }
                None
            }
            "function_definition" | "async_function_definition" if top_level => {
                let name = node_text(node.child_by_field_name("name")?, source);
                let dunder = name.len() > 4 && name.starts_with("__") && name.ends_with("__");
                (name.starts_with('_') && !dunder).then(|| {
                    PolicyViolation::at(
                        PolicyRule::PrivateDefinition,
                        node,
                        format!("definition of private function '{name}' is not allowed"),
                    )
                })
            }
            _ => None,
        }
    }

    fn check_import(&self, node: Node<'_>, module: &str) -> Option<PolicyViolation> {
        let top = module.split('.').next().unwrap_or(module).trim();
        if DANGEROUS_IMPORTS.contains(&top) {
            return Some(PolicyViolation::at(
                PolicyRule::DisallowedImport,
                node,
                format!("import of dangerous module '{top}' is not allowed"),
            ));
        }
        if self.allowed_modules.contains(top) || DOMAIN_PACKAGES.contains(&top) {
            return None;
        }
        Some(PolicyViolation::at(
            PolicyRule::DisallowedImport,
            node,
            format!("import of module '{top}' is not allowed"),
        ))
    }
}

fn check_call(node: Node<'_>, source: &str) -> Option<PolicyViolation> {
    let function = node.child_by_field_name("function")?;
    let (name, is_method) = match function.kind() {
        "identifier" => (node_text(function, source), false),
        "attribute" => (
            node_text(function.child_by_field_name("attribute")?, source),
            true,
        ),
        _ => return None,
    };
    if DANGEROUS_CALLS.contains(&name) {
        let what = if is_method { "method" } else { "function" };
        return Some(PolicyViolation::at(
            PolicyRule::DangerousCall,
            node,
            format!("call to {what} '{name}' is not allowed"),
        ));
    }
    if is_obfuscation_call(name) {
        return Some(PolicyViolation::at(
            PolicyRule::Obfuscation,
            node,
            format!("call to '{name}' looks like obfuscation"),
        ));
    }
    None
}

fn is_obfuscation_call(name: &str) -> bool {
    OBFUSCATION_CALLS.contains(&name)
        || ["b64", "b32", "b16", "b85", "a85"]
            .iter()
            .any(|marker| name.contains(marker))
}

fn check_identifier(node: Node<'_>, source: &str) -> Option<PolicyViolation> {
    let name = node_text(node, source);
    if let Some(parent) = node.parent() {
        let is_field = |field: &str| {
            parent
                .child_by_field_name(field)
                .is_some_and(|child| child.id() == node.id())
        };
        // Attribute names are handled on the attribute node; keyword names
        // are just labels.
        if parent.kind() == "attribute" && is_field("attribute") {
            return None;
        }
        if parent.kind() == "keyword_argument" && is_field("name") {
            return None;
        }
    }
    if DANGEROUS_ATTRIBUTES.contains(&name) {
        return Some(PolicyViolation::at(
            PolicyRule::DangerousAttribute,
            node,
            format!("reference to '{name}' is not allowed"),
        ));
    }
    if DANGEROUS_REFERENCES.contains(&name) {
        return Some(PolicyViolation::at(
            PolicyRule::DangerousCall,
            node,
            format!("reference to '{name}' is not allowed"),
        ));
    }
    None
}

fn check_string_literal(node: Node<'_>, source: &str) -> Option<PolicyViolation> {
    let raw = node_text(node, source);
    if raw.contains("../") || raw.contains("..\\") {
        return Some(PolicyViolation::at(
            PolicyRule::PathTraversal,
            node,
            "string literal contains a parent-directory traversal",
        ));
    }
    if has_hex_escape(raw) {
        return Some(PolicyViolation::at(
            PolicyRule::Obfuscation,
            node,
            "string literal contains hex escape sequences",
        ));
    }
    check_literal_value(node, &pylit::literal_value(raw), "string literal")
}

/// Checks on the decoded value, so octal or named escapes and implicit
/// concatenation cannot hide a traversal or an attribute name.
fn check_literal_value(node: Node<'_>, value: &str, what: &str) -> Option<PolicyViolation> {
    if value.contains("../") || value.contains("..\\") {
        return Some(PolicyViolation::at(
            PolicyRule::PathTraversal,
            node,
            format!("{what} contains a parent-directory traversal"),
        ));
    }
    DANGEROUS_ATTRIBUTES.contains(&value).then(|| {
        PolicyViolation::at(
            PolicyRule::DangerousAttribute,
            node,
            format!("string naming attribute '{value}' is not allowed"),
        )
    })
}

fn has_hex_escape(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.windows(4).any(|w| {
        w[0] == b'\\' && w[1] == b'x' && w[2].is_ascii_hexdigit() && w[3].is_ascii_hexdigit()
    })
}

fn contains_break(body: Node<'_>) -> bool {
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        if node.kind() == "break_statement" {
            return true;
        }
        let mut cursor = node.walk();
        stack.extend(node.named_children(&mut cursor));
    }
    false
}

fn syntax_violation(root: Node<'_>) -> PolicyViolation {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            return PolicyViolation::at(
                PolicyRule::SyntaxError,
                node,
                format!(
                    "invalid syntax at line {}, column {}",
                    pos.row + 1,
                    pos.column + 1
                ),
            );
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    PolicyViolation::new(PolicyRule::SyntaxError, "invalid syntax")
}

fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    source.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

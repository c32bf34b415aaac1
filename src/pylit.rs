//! Python literal rendering for generated snippets.

use anyhow::{Result, bail};
use serde_json::Value;

/// Quote `text` as a Python string literal. JSON string syntax is a subset
/// of Python's and never produces `\x` escapes.
pub fn string(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Render a JSON value as the equivalent Python expression.
pub fn value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => string(text),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(self::value).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(key, item)| format!("{}: {}", string(key), self::value(item)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}

/// Render a search domain. Lists of three items become tuples so the ORM
/// sees `('name', '=', 'x')`; `&`, `|` and `!` operators pass through.
pub fn domain(domain: &Value) -> Result<String> {
    let Value::Array(terms) = domain else {
        bail!("domain must be a list");
    };
    let mut rendered = Vec::with_capacity(terms.len());
    for term in terms {
        match term {
            Value::String(op) if matches!(op.as_str(), "&" | "|" | "!") => {
                rendered.push(string(op));
            }
            Value::Array(parts) if parts.len() == 3 => {
                let Some(field) = parts[0].as_str() else {
                    bail!("domain term field must be a string: {term}");
                };
                let Some(operator) = parts[1].as_str() else {
                    bail!("domain term operator must be a string: {term}");
                };
                rendered.push(format!(
                    "({}, {}, {})",
                    string(field),
                    string(operator),
                    value(&parts[2])
                ));
            }
            other => bail!("invalid domain term: {other}"),
        }
    }
    Ok(format!("[{}]", rendered.join(", ")))
}

/// Model names are dotted identifiers: `sale.order`, `res.partner`.
pub fn is_model_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            part.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic())
                && part.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        })
}

pub fn is_identifier(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Split a Python string literal into its lowercased prefix (`r`, `b`,
/// `f`, ...) and the text between the quotes.
pub fn split_literal(raw: &str) -> Option<(String, &str)> {
    let raw = raw.trim();
    let start = raw.find(['"', '\''])?;
    let (prefix, rest) = raw.split_at(start);
    if !prefix.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return None;
    }
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if rest.len() >= quote.len() * 2 && rest.starts_with(quote) && rest.ends_with(quote) {
            let body = &rest[quote.len()..rest.len() - quote.len()];
            return Some((prefix.to_ascii_lowercase(), body));
        }
    }
    None
}

/// The value a literal evaluates to, escapes resolved unless it is raw.
/// Text that is not a literal comes back unchanged.
pub fn literal_value(raw: &str) -> String {
    match split_literal(raw) {
        Some((prefix, body)) if prefix.contains('r') => body.to_string(),
        Some((_, body)) => unescape(body),
        None => raw.to_string(),
    }
}

/// Resolve backslash escapes of a non-raw literal body: single-character,
/// octal, `\x`, `\u`, `\U` and `\N{...}`. Named characters outside a small
/// punctuation table become U+FFFD.
pub fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'v' => out.push('\u{0b}'),
            '\\' | '\'' | '"' => out.push(next),
            '\n' => {}
            '0'..='7' => {
                let mut code = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|digit| digit.to_digit(8)) {
                        Some(digit) => {
                            code = code * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let mut digits = String::new();
                while digits.len() < width {
                    match chars.peek() {
                        Some(digit) if digit.is_ascii_hexdigit() => {
                            digits.push(*digit);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                let decoded = (digits.len() == width)
                    .then(|| u32::from_str_radix(&digits, 16).ok())
                    .flatten()
                    .and_then(char::from_u32);
                match decoded {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push('\\');
                        out.push(next);
                        out.push_str(&digits);
                    }
                }
            }
            'N' if chars.peek() == Some(&'{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|ch| *ch != '}').collect();
                out.push(named_char(&name));
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

fn named_char(name: &str) -> char {
    match name.trim().to_ascii_uppercase().as_str() {
        "FULL STOP" | "PERIOD" => '.',
        "SOLIDUS" | "SLASH" => '/',
        "REVERSE SOLIDUS" | "BACKSLASH" => '\\',
        "LOW LINE" => '_',
        "SPACE" => ' ',
        _ => char::REPLACEMENT_CHARACTER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_python_values() {
        assert_eq!(
            value(&json!({"a": [1, true, null], "b": "x\"y"})),
            r#"{"a": [1, True, None], "b": "x\"y"}"#
        );
    }

    #[test]
    fn renders_domains_with_tuples() {
        let rendered = domain(&json!(["|", ["name", "ilike", "acme"], ["id", "in", [1, 2]]]))
            .unwrap();
        assert_eq!(
            rendered,
            r#"["|", ("name", "ilike", "acme"), ("id", "in", [1, 2])]"#
        );
        assert!(domain(&json!({"name": "x"})).is_err());
        assert!(domain(&json!([["name", "="]])).is_err());
    }

    #[test]
    fn model_name_validation() {
        assert!(is_model_name("sale.order"));
        assert!(is_model_name("x_custom.model_2"));
        assert!(!is_model_name("sale..order"));
        assert!(!is_model_name("sale.order'];import os"));
        assert!(!is_model_name("_private"));
        assert!(!is_model_name(""));
    }

    #[test]
    fn literal_values_resolve_escapes() {
        assert_eq!(literal_value(r"'\056\056/etc'"), "../etc");
        assert_eq!(literal_value(r"'.\U0000002e/'"), "../");
        assert_eq!(literal_value(r"'\N{FULL STOP}\N{full stop}\N{SOLIDUS}'"), "../");
        assert_eq!(literal_value(r"'\x5f\x5fclass__'"), "__class__");
        assert_eq!(literal_value(r"r'\056'"), r"\056");
        assert_eq!(literal_value(r#""""a\tb""""#), "a\tb");
        assert_eq!(literal_value(r"'\q'"), r"\q");
        assert_eq!(split_literal("Rb'x'"), Some(("rb".to_string(), "x")));
        assert_eq!(split_literal("name"), None);
    }
}

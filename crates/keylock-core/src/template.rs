//! Lock key templates.
//!
//! A template is a `:`-separated key in which exactly one segment is an
//! expression starting with `#`, for example `user:#user.userId:password`.
//! The expression names a call argument and may walk into it with `.field`
//! and `[index]` accessors. Every other segment is copied verbatim.

use serde_json::Value;

use crate::binding::ParameterBinding;
use crate::error::LockError;

pub const KEY_SEPARATOR: char = ':';
pub const EXPRESSION_MARKER: char = '#';

/// A template split around its dynamic segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    prefix: String,
    expression: String,
    suffix: String,
}

impl KeyTemplate {
    /// Parse a template, requiring exactly one dynamic segment.
    pub fn parse(template: &str) -> Result<Self, LockError> {
        let segments: Vec<&str> = template.split(KEY_SEPARATOR).collect();

        let mut dynamic = segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.starts_with(EXPRESSION_MARKER));

        let (index, expression) = dynamic.next().ok_or_else(|| {
            LockError::InvalidExpression(format!("no dynamic segment in '{}'", template))
        })?;

        if dynamic.next().is_some() {
            return Err(LockError::InvalidExpression(format!(
                "more than one dynamic segment in '{}'",
                template
            )));
        }

        let separator = KEY_SEPARATOR.to_string();
        Ok(Self {
            prefix: segments[..index].join(&separator),
            expression: expression.to_string(),
            suffix: segments[index + 1..].join(&separator),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Evaluate the dynamic segment and reassemble the concrete key.
    pub fn render(&self, binding: &ParameterBinding) -> Result<String, LockError> {
        let value = evaluate(&self.expression, binding)?;

        let mut key = String::with_capacity(self.prefix.len() + value.len() + self.suffix.len() + 2);
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&value);
        if !self.suffix.is_empty() {
            key.push(KEY_SEPARATOR);
            key.push_str(&self.suffix);
        }
        Ok(key)
    }
}

/// Resolve one template against a binding.
pub fn resolve(template: &str, binding: &ParameterBinding) -> Result<String, LockError> {
    KeyTemplate::parse(template)?.render(binding)
}

/// Resolve several templates, keeping their order.
pub fn resolve_all<S: AsRef<str>>(
    templates: &[S],
    binding: &ParameterBinding,
) -> Result<Vec<String>, LockError> {
    templates
        .iter()
        .map(|template| resolve(template.as_ref(), binding))
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Accessor<'a> {
    Field(&'a str),
    Index(usize),
}

fn evaluate(expression: &str, binding: &ParameterBinding) -> Result<String, LockError> {
    let (variable, accessors) = parse_expression(expression)?;

    let mut current = binding.get(variable).ok_or_else(|| {
        LockError::InvalidExpression(format!(
            "unknown variable '{}' in '{}'",
            variable, expression
        ))
    })?;

    for accessor in &accessors {
        current = match (accessor, current) {
            (Accessor::Field(name), Value::Object(map)) => map.get(*name),
            (Accessor::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        }
        .ok_or_else(|| {
            LockError::InvalidExpression(format!(
                "cannot access {} in '{}'",
                describe(accessor),
                expression
            ))
        })?;
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(LockError::InvalidExpression(format!(
            "'{}' evaluated to null",
            expression
        ))),
        Value::Array(_) | Value::Object(_) => Err(LockError::InvalidExpression(format!(
            "'{}' does not evaluate to a scalar",
            expression
        ))),
    }
}

fn describe(accessor: &Accessor<'_>) -> String {
    match accessor {
        Accessor::Field(name) => format!("field '{}'", name),
        Accessor::Index(i) => format!("index [{}]", i),
    }
}

fn parse_expression(expression: &str) -> Result<(&str, Vec<Accessor<'_>>), LockError> {
    let invalid = |reason: &str| {
        LockError::InvalidExpression(format!("{} in '{}'", reason, expression))
    };

    let body = expression
        .strip_prefix(EXPRESSION_MARKER)
        .ok_or_else(|| invalid("missing '#' marker"))?;

    let (variable, mut rest) = take_identifier(body);
    if variable.is_empty() {
        return Err(invalid("missing variable name"));
    }

    let mut accessors = Vec::new();
    while let Some(c) = rest.chars().next() {
        match c {
            '.' => {
                let (field, tail) = take_identifier(&rest[1..]);
                if field.is_empty() {
                    return Err(invalid("missing field name after '.'"));
                }
                accessors.push(Accessor::Field(field));
                rest = tail;
            }
            '[' => {
                let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let index = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("index is not a non-negative integer"))?;
                accessors.push(Accessor::Index(index));
                rest = &rest[close + 1..];
            }
            _ => return Err(invalid(&format!("unexpected character '{}'", c))),
        }
    }

    Ok((variable, accessors))
}

fn take_identifier(input: &str) -> (&str, &str) {
    let end = input
        .char_indices()
        .find(|(i, c)| {
            !(c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit()))
        })
        .map(|(i, _)| i)
        .unwrap_or(input.len());
    input.split_at(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Invocation;
    use serde_json::json;

    fn binding(pairs: &[(&str, Value)]) -> ParameterBinding {
        let names: Vec<String> = pairs.iter().map(|(n, _)| n.to_string()).collect();
        let values: Vec<Value> = pairs.iter().map(|(_, v)| v.clone()).collect();
        ParameterBinding::new(Some(&names), &values).unwrap()
    }

    #[test]
    fn test_nested_field_between_literals() {
        let b = binding(&[("u", json!({"id": 42}))]);
        assert_eq!(resolve("user:#u.id:active", &b).unwrap(), "user:42:active");
    }

    #[test]
    fn test_dynamic_segment_only() {
        let b = binding(&[("lock", json!("abc"))]);
        assert_eq!(resolve("#lock", &b).unwrap(), "abc");
    }

    #[test]
    fn test_leading_and_trailing_dynamic_segment() {
        let b = binding(&[("user", json!({"userId": "u-1"}))]);
        assert_eq!(
            resolve("#user.userId:password", &b).unwrap(),
            "u-1:password"
        );
        assert_eq!(resolve("key:#user.userId", &b).unwrap(), "key:u-1");
    }

    #[test]
    fn test_multi_segment_literals_are_kept() {
        let b = binding(&[("id", json!(9))]);
        assert_eq!(resolve("app:orders:#id:a:b", &b).unwrap(), "app:orders:9:a:b");
    }

    #[test]
    fn test_no_dynamic_segment_fails_regardless_of_binding() {
        let b = binding(&[("id", json!(1))]);
        assert!(matches!(
            resolve("user:id:active", &b),
            Err(LockError::InvalidExpression(_))
        ));
        let empty = ParameterBinding::from_invocation(&Invocation::new()).unwrap();
        assert!(matches!(
            resolve("plain", &empty),
            Err(LockError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_two_dynamic_segments_are_rejected() {
        let b = binding(&[("a", json!(1)), ("b", json!(2))]);
        assert!(matches!(
            resolve("#a:#b", &b),
            Err(LockError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_unknown_variable_and_field() {
        let b = binding(&[("user", json!({"id": 1}))]);
        assert!(matches!(
            resolve("k:#nobody", &b),
            Err(LockError::InvalidExpression(_))
        ));
        assert!(matches!(
            resolve("k:#user.name", &b),
            Err(LockError::InvalidExpression(_))
        ));
        assert!(matches!(
            resolve("k:#user.id.deeper", &b),
            Err(LockError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_non_scalar_values_are_rejected() {
        let b = binding(&[("user", json!({"id": null, "tags": ["x"]}))]);
        assert!(matches!(
            resolve("k:#user.id", &b),
            Err(LockError::InvalidExpression(_))
        ));
        assert!(matches!(
            resolve("k:#user", &b),
            Err(LockError::InvalidExpression(_))
        ));
        assert_eq!(resolve("k:#user.tags[0]", &b).unwrap(), "k:x");
    }

    #[test]
    fn test_scalar_coercion() {
        let b = binding(&[("flag", json!(true)), ("ratio", json!(1.5))]);
        assert_eq!(resolve("#flag", &b).unwrap(), "true");
        assert_eq!(resolve("#ratio", &b).unwrap(), "1.5");
    }

    #[test]
    fn test_malformed_expressions() {
        let b = binding(&[("a", json!({"b": [1]}))]);
        for template in ["#", "k:#.b", "#a.", "#a[0", "#a.b[x]", "#a-b"] {
            assert!(
                matches!(resolve(template, &b), Err(LockError::InvalidExpression(_))),
                "expected failure for {}",
                template
            );
        }
    }

    #[test]
    fn test_resolve_all_preserves_order() {
        let b = binding(&[("a", json!("x")), ("b", json!("y"))]);
        assert_eq!(resolve_all(&["#a", "#b"], &b).unwrap(), vec!["x", "y"]);
        assert_eq!(resolve_all(&["#b", "#a"], &b).unwrap(), vec!["y", "x"]);
    }

    #[test]
    fn test_parse_splits_around_expression() {
        let t = KeyTemplate::parse("tenant:#user.tenantId:passwordchange").unwrap();
        assert_eq!(t.prefix(), "tenant");
        assert_eq!(t.expression(), "#user.tenantId");
        assert_eq!(t.suffix(), "passwordchange");
    }
}

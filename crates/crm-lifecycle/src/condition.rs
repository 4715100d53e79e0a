//! Condition language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! Conditions ::= Condition ( '&&' Condition )*
//! Condition  ::= Field Operator Literal
//! Field      ::= identifier ( '.' identifier )*
//! Operator   ::= '=' | '==' | '!=' | '>' | '>=' | '<' | '<='
//!              | 'eq' | 'neq' | 'gt' | 'gte' | 'lt' | 'lte'
//! Literal    ::= QuotedString | Number | Boolean | 'null' | BareWord
//! ```
//!
//! Evaluation fails closed: a field that is absent (or `null`) never
//! satisfies a condition, and values of different kinds never order.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crm_types::{CrmError, FieldMap, FieldValue};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
        }
    }
}

impl std::str::FromStr for Operator {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "eq" | "=" | "==" => Ok(Operator::Eq),
            "neq" | "ne" | "!=" => Ok(Operator::Neq),
            "gt" | ">" => Ok(Operator::Gt),
            "gte" | "ge" | ">=" => Ok(Operator::Gte),
            "lt" | "<" => Ok(Operator::Lt),
            "lte" | "le" | "<=" => Ok(Operator::Lte),
            other => Err(make_error(&format!("unknown operator '{other}'"))),
        }
    }
}

/// A single comparison: `field op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: FieldValue,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Reject conditions whose field name is not a dotted identifier.
    pub fn validate(&self) -> Result<(), CrmError> {
        validate_field(&self.field)
    }

    /// Evaluate against a contact's field map.
    pub fn matches(&self, fields: &FieldMap) -> bool {
        evaluate(fields.get(&self.field), self.operator, &self.value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            FieldValue::Text(s) => write!(f, "{} {} \"{}\"", self.field, self.operator.symbol(), s),
            other => write!(f, "{} {} {}", self.field, self.operator.symbol(), other),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate one comparison.
///
/// Returns `false` when `actual` is absent or `null`, for every operator.
/// Ordering operators additionally require both sides to be numbers or both
/// to be strings.
pub fn evaluate(actual: Option<&FieldValue>, operator: Operator, expected: &FieldValue) -> bool {
    let actual = match actual {
        Some(v) if !v.is_null() => v,
        _ => return false,
    };
    match operator {
        Operator::Eq => actual == expected,
        Operator::Neq => actual != expected,
        Operator::Gt => actual.partial_cmp_value(expected) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            actual.partial_cmp_value(expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => actual.partial_cmp_value(expected) == Some(Ordering::Less),
        Operator::Lte => matches!(
            actual.partial_cmp_value(expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// [`evaluate`] with the operator given by name. Unknown operators evaluate
/// to `false`.
pub fn evaluate_raw(actual: Option<&FieldValue>, operator: &str, expected: &FieldValue) -> bool {
    match operator.parse::<Operator>() {
        Ok(op) => evaluate(actual, op, expected),
        Err(_) => false,
    }
}

/// Evaluate every condition; all must hold. Stops at the first failure.
/// An empty list holds trivially.
pub fn all_hold(conditions: &[Condition], fields: &FieldMap) -> bool {
    conditions.iter().all(|c| {
        let ok = c.matches(fields);
        if !ok {
            tracing::debug!(condition = %c, "Condition not met");
        }
        ok
    })
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a rule string into its conditions.
///
/// An empty or whitespace-only input produces no conditions.
pub fn parse_conditions(input: &str) -> Result<Vec<Condition>, CrmError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split("&&")
        .map(|part| parse_condition(part.trim()))
        .collect()
}

/// Parse a single `field op value` comparison.
pub fn parse_condition(input: &str) -> Result<Condition, CrmError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty condition"));
    }

    let (field, operator, raw_value) = match find_symbol_operator(input) {
        Some((pos, operator, len)) => (
            input[..pos].trim(),
            operator,
            input[pos + len..].trim(),
        ),
        None => split_word_operator(input)?,
    };

    if field.is_empty() {
        return Err(make_error("missing field before operator"));
    }
    validate_field(field)?;

    if raw_value.is_empty() {
        return Err(make_error(&format!(
            "missing value after operator in '{input}'"
        )));
    }

    Ok(Condition {
        field: field.to_string(),
        operator,
        value: parse_literal(raw_value),
    })
}

fn find_symbol_operator(input: &str) -> Option<(usize, Operator, usize)> {
    // Scan for a comparison symbol, skipping quoted regions.
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if next == Some(b'=') => return Some((i, Operator::Neq, 2)),
            b'>' if next == Some(b'=') => return Some((i, Operator::Gte, 2)),
            b'<' if next == Some(b'=') => return Some((i, Operator::Lte, 2)),
            b'=' if next == Some(b'=') => return Some((i, Operator::Eq, 2)),
            b'=' => return Some((i, Operator::Eq, 1)),
            b'>' => return Some((i, Operator::Gt, 1)),
            b'<' => return Some((i, Operator::Lt, 1)),
            _ => i += 1,
        }
    }
    None
}

fn split_word_operator(input: &str) -> Result<(&str, Operator, &str), CrmError> {
    let mut parts = input.splitn(3, char::is_whitespace);
    let field = parts.next().unwrap_or_default();
    let op = parts.next().unwrap_or_default();
    let value = parts.next().unwrap_or_default().trim();
    if op.is_empty() {
        return Err(make_error(&format!("no operator found in '{input}'")));
    }
    Ok((field, op.parse()?, value))
}

fn parse_literal(raw: &str) -> FieldValue {
    let bytes = raw.as_bytes();
    if raw.len() >= 2
        && ((bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\''))
    {
        return FieldValue::Text(raw[1..raw.len() - 1].to_string());
    }
    match raw {
        "true" => FieldValue::Bool(true),
        "false" => FieldValue::Bool(false),
        "null" => FieldValue::Null,
        _ => raw
            .parse::<f64>()
            .map_or_else(|_| FieldValue::Text(raw.to_string()), FieldValue::Number),
    }
}

fn validate_field(field: &str) -> Result<(), CrmError> {
    if field.is_empty() {
        return Err(make_error("empty field name"));
    }
    for seg in field.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid field segment: '{seg}'")));
        }
    }
    Ok(())
}

fn make_error(msg: &str) -> CrmError {
    CrmError::Configuration(format!("condition parse error: {msg}"))
}

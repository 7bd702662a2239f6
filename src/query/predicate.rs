//! Filter predicates shared by scans and REM-SQL WHERE clauses.
//!
//! A predicate evaluates against an entity's fields (system fields first,
//! then properties). The store pushes equality/in/range conjuncts on
//! indexed fields down to the secondary index and applies the rest in
//! memory.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::entity::Entity;

/// Sort order for scans and SELECT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// Ascending (the default).
    Asc,
    /// Descending.
    Desc,
}

impl Order {
    /// The REM-SQL keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A filter expression over entity fields.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// `field = value`
    Eq(String, Value),
    /// `field != value`
    Ne(String, Value),
    /// `field > value`
    Gt(String, Value),
    /// `field >= value`
    Gte(String, Value),
    /// `field < value`
    Lt(String, Value),
    /// `field <= value`
    Lte(String, Value),
    /// `field IN (v1, v2, ...)`
    In(String, Vec<Value>),
    /// `field CONTAINS 'substring'` (strings only)
    Contains(String, String),
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluates the predicate against an entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::Eq(field, value) => entity.field(field).as_ref() == Some(value),
            Self::Ne(field, value) => entity.field(field).as_ref() != Some(value),
            Self::Gt(field, value) => {
                compare(entity.field(field).as_ref(), value) == Some(Ordering::Greater)
            }
            Self::Gte(field, value) => matches!(
                compare(entity.field(field).as_ref(), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(field, value) => {
                compare(entity.field(field).as_ref(), value) == Some(Ordering::Less)
            }
            Self::Lte(field, value) => matches!(
                compare(entity.field(field).as_ref(), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In(field, values) => entity
                .field(field)
                .map_or(false, |v| values.contains(&v)),
            Self::Contains(field, needle) => entity
                .field(field)
                .and_then(|v| v.as_str().map(|s| s.contains(needle.as_str())))
                .unwrap_or(false),
            Self::And(predicates) => predicates.iter().all(|p| p.matches(entity)),
            Self::Or(predicates) => predicates.iter().any(|p| p.matches(entity)),
            Self::Not(predicate) => !predicate.matches(entity),
        }
    }

    /// Every field the predicate references.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Eq(f, _)
            | Self::Ne(f, _)
            | Self::Gt(f, _)
            | Self::Gte(f, _)
            | Self::Lt(f, _)
            | Self::Lte(f, _)
            | Self::In(f, _)
            | Self::Contains(f, _) => out.push(f),
            Self::And(ps) | Self::Or(ps) => {
                for p in ps {
                    p.collect_fields(out);
                }
            }
            Self::Not(p) => p.collect_fields(out),
        }
    }

    /// The top-level conjuncts: `And` flattens, anything else is itself.
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Self::And(ps) => ps.iter().flat_map(|p| p.conjuncts()).collect(),
            other => vec![other],
        }
    }
}

/// Compares two JSON values for ordering predicates.
///
/// Numbers compare numerically across integer/float representations;
/// strings lexicographically. Mixed types and containers do not compare.
pub fn compare(left: Option<&Value>, right: &Value) -> Option<Ordering> {
    let left = left?;
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn fmt_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

impl fmt::Display for Predicate {
    /// Renders the canonical REM-SQL form, parenthesizing compounds so the
    /// output reparses to the same tree.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(field, value) => write!(f, "{} = {}", field, fmt_value(value)),
            Self::Ne(field, value) => write!(f, "{} != {}", field, fmt_value(value)),
            Self::Gt(field, value) => write!(f, "{} > {}", field, fmt_value(value)),
            Self::Gte(field, value) => write!(f, "{} >= {}", field, fmt_value(value)),
            Self::Lt(field, value) => write!(f, "{} < {}", field, fmt_value(value)),
            Self::Lte(field, value) => write!(f, "{} <= {}", field, fmt_value(value)),
            Self::In(field, values) => {
                let rendered: Vec<String> = values.iter().map(fmt_value).collect();
                write!(f, "{} IN ({})", field, rendered.join(", "))
            }
            Self::Contains(field, needle) => {
                write!(f, "{} CONTAINS '{}'", field, needle.replace('\'', "''"))
            }
            Self::And(predicates) => {
                let rendered: Vec<String> =
                    predicates.iter().map(|p| format!("({})", p)).collect();
                write!(f, "{}", rendered.join(" AND "))
            }
            Self::Or(predicates) => {
                let rendered: Vec<String> =
                    predicates.iter().map(|p| format!("({})", p)).collect();
                write!(f, "{}", rendered.join(" OR "))
            }
            Self::Not(predicate) => write!(f, "NOT ({})", predicate),
        }
    }
}

//! Query builder: typed plan parameters → canonical REM-SQL.
//!
//! The planner describes *what* to query as a JSON parameter object; the
//! builder renders the concrete query string. Because rendering goes
//! through the [`Statement`] AST, `parse(build(params))` always equals the
//! AST the builder produced.
//!
//! Parameter shapes per query type:
//!
//! ```text
//! LOOKUP    {"keys": ["k1", "k2"]}
//! SEARCH    {"query_text": "...", "schema": "...", "top_k": 10,
//!            "filters": {"field": value, ...}}
//! HYBRID    same as SEARCH
//! TRAVERSE  {"start_key": "...", "depth": 2, "direction": "out",
//!            "edge_type": "rel"}
//! SQL       {"schema": "...", "fields": ["a", "b"],
//!            "where": {"field": value, ...}, "order_by": "field",
//!            "order": "asc" | "desc", "limit": 10, "offset": 0}
//! ```

use serde_json::Value;

use crate::entity::Direction;
use crate::error::{QueryError, Result};
use crate::query::plan::QueryType;
use crate::query::predicate::{Order, Predicate};
use crate::query::sql::{SelectFields, Statement};

/// Renders plan parameters into a [`Statement`].
pub fn build_statement(query_type: QueryType, parameters: &Value) -> Result<Statement> {
    match query_type {
        QueryType::Lookup => build_lookup(parameters),
        QueryType::Search | QueryType::Hybrid => build_search(parameters),
        QueryType::Traverse => build_traverse(parameters),
        QueryType::Sql => build_select(parameters),
    }
}

/// Renders plan parameters into the canonical REM-SQL string.
pub fn build_query_string(query_type: QueryType, parameters: &Value) -> Result<String> {
    Ok(build_statement(query_type, parameters)?.to_string())
}

fn build_lookup(parameters: &Value) -> Result<Statement> {
    let keys = parameters
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("keys"))?;
    let keys: Vec<String> = keys
        .iter()
        .map(|k| match k {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    if keys.is_empty() {
        return Err(missing("keys").into());
    }
    Ok(Statement::Lookup { keys })
}

fn build_search(parameters: &Value) -> Result<Statement> {
    let text = parameters
        .get("query_text")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("query_text"))?;
    let schema = parameters
        .get("schema")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("schema"))?;
    let limit = parameters
        .get("top_k")
        .and_then(Value::as_u64)
        .map(|v| v as usize);
    let predicate = filters_predicate(parameters.get("filters"));

    Ok(Statement::Search {
        text: text.to_string(),
        schema: schema.to_string(),
        predicate,
        limit,
    })
}

fn build_traverse(parameters: &Value) -> Result<Statement> {
    let start = parameters
        .get("start_key")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("start_key"))?;
    let depth = parameters
        .get("depth")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;
    let direction = parameters
        .get("direction")
        .and_then(Value::as_str)
        .and_then(Direction::parse)
        .unwrap_or(Direction::Out);
    let rel_type = parameters
        .get("edge_type")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Statement::Traverse {
        start: start.to_string(),
        depth,
        direction,
        rel_type,
    })
}

fn build_select(parameters: &Value) -> Result<Statement> {
    let schema = parameters
        .get("schema")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("schema"))?;
    let fields = match parameters.get("fields").and_then(Value::as_array) {
        Some(fields) if !fields.is_empty() => SelectFields::Some(
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => SelectFields::All,
    };
    let predicate = filters_predicate(parameters.get("where"));
    let order_by = parameters
        .get("order_by")
        .and_then(Value::as_str)
        .map(|field| {
            let order = match parameters.get("order").and_then(Value::as_str) {
                Some(o) if o.eq_ignore_ascii_case("desc") => Order::Desc,
                _ => Order::Asc,
            };
            (field.to_string(), order)
        });
    let limit = parameters
        .get("limit")
        .and_then(Value::as_u64)
        .map(|v| v as usize);
    let offset = parameters
        .get("offset")
        .and_then(Value::as_u64)
        .map(|v| v as usize);

    Ok(Statement::Select {
        fields,
        schema: schema.to_string(),
        predicate,
        order_by,
        limit,
        offset,
    })
}

/// `{"field": value, ...}` → conjunction of equalities.
///
/// serde_json maps iterate in sorted key order, so the rendered WHERE
/// clause is deterministic.
fn filters_predicate(filters: Option<&Value>) -> Option<Predicate> {
    let map = filters?.as_object()?;
    let mut terms: Vec<Predicate> = map
        .iter()
        .map(|(field, value)| Predicate::Eq(field.clone(), value.clone()))
        .collect();
    match terms.len() {
        0 => None,
        1 => Some(terms.pop().unwrap()),
        _ => Some(Predicate::And(terms)),
    }
}

fn missing(field: &str) -> QueryError {
    QueryError::plan_validation(format!("parameters missing '{}'", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_roundtrip(query_type: QueryType, parameters: Value) -> String {
        let statement = build_statement(query_type, &parameters).unwrap();
        let rendered = statement.to_string();
        let reparsed = Statement::parse(&rendered).unwrap();
        assert_eq!(reparsed, statement, "round trip failed for '{}'", rendered);
        rendered
    }

    #[test]
    fn test_build_lookup() {
        let rendered = assert_roundtrip(QueryType::Lookup, json!({"keys": ["a", "b"]}));
        assert_eq!(rendered, "LOOKUP 'a', 'b'");
    }

    #[test]
    fn test_build_lookup_requires_keys() {
        assert!(build_statement(QueryType::Lookup, &json!({})).is_err());
        assert!(build_statement(QueryType::Lookup, &json!({"keys": []})).is_err());
    }

    #[test]
    fn test_build_search() {
        let rendered = assert_roundtrip(
            QueryType::Search,
            json!({"query_text": "python basics", "schema": "resources", "top_k": 3}),
        );
        assert_eq!(rendered, "SEARCH 'python basics' IN resources LIMIT 3");
    }

    #[test]
    fn test_build_hybrid_with_filters() {
        let rendered = assert_roundtrip(
            QueryType::Hybrid,
            json!({
                "query_text": "python basics",
                "schema": "resources",
                "top_k": 3,
                "filters": {"category": "tutorial"}
            }),
        );
        assert_eq!(
            rendered,
            "SEARCH 'python basics' IN resources WHERE category = 'tutorial' LIMIT 3"
        );
    }

    #[test]
    fn test_build_traverse_defaults() {
        let rendered = assert_roundtrip(QueryType::Traverse, json!({"start_key": "bob"}));
        assert_eq!(rendered, "TRAVERSE FROM 'bob' DEPTH 1 DIRECTION out");
    }

    #[test]
    fn test_build_traverse_full() {
        let rendered = assert_roundtrip(
            QueryType::Traverse,
            json!({"start_key": "bob", "depth": 3, "direction": "both", "edge_type": "knows"}),
        );
        assert_eq!(
            rendered,
            "TRAVERSE FROM 'bob' DEPTH 3 DIRECTION both TYPE 'knows'"
        );
    }

    #[test]
    fn test_build_select() {
        let rendered = assert_roundtrip(
            QueryType::Sql,
            json!({
                "schema": "resources",
                "fields": ["name", "category"],
                "where": {"category": "tutorial"},
                "order_by": "name",
                "limit": 5
            }),
        );
        assert_eq!(
            rendered,
            "SELECT name, category FROM resources WHERE category = 'tutorial' ORDER BY name ASC LIMIT 5"
        );
    }

    #[test]
    fn test_build_select_star_desc() {
        let rendered = assert_roundtrip(
            QueryType::Sql,
            json!({"schema": "resources", "order_by": "created_at", "order": "desc"}),
        );
        assert_eq!(rendered, "SELECT * FROM resources ORDER BY created_at DESC");
    }

    #[test]
    fn test_multiple_filters_sorted_and_deterministic() {
        let rendered = assert_roundtrip(
            QueryType::Search,
            json!({
                "query_text": "q",
                "schema": "r",
                "filters": {"b": 2, "a": 1}
            }),
        );
        // serde_json object keys iterate sorted
        assert_eq!(rendered, "SEARCH 'q' IN r WHERE (a = 1) AND (b = 2)");
    }
}

//! Query executor: REM-SQL statements and multi-stage plans.
//!
//! The executor parses REM-SQL to the AST and dispatches to the engine
//! components: key-index lookups, secondary-index scans, HNSW search,
//! graph traversal and prefix scans. HYBRID queries run the vector search
//! first and intersect candidates with the WHERE clause's posting lists.
//!
//! Failure semantics:
//! - Validation errors (predicate on a non-indexed field, unknown schema,
//!   dimension mismatch) are fatal to the current stage and feed
//!   fallbacks registered with the `error` trigger.
//! - Transient storage errors retry once inside the stage.
//! - Oversized limits truncate silently to [`MAX_LIMIT`].

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::entity::Entity;
use crate::error::{NotFoundError, QueryError, RemDbError, Result};
use crate::graph;
use crate::query::plan::{
    ExecutionMode, FallbackTrigger, QueryPlan, QueryResult, QueryType,
};
use crate::query::predicate::Predicate;
use crate::query::sql::{SelectFields, Statement};
use crate::store::{EntityStore, ScanOptions};
use crate::types::EntityId;

/// Hard cap on result set sizes; anything larger truncates silently.
pub const MAX_LIMIT: usize = 10_000;

/// Result budget for SEARCH without an explicit LIMIT.
const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Adaptive plans treat a best score under this as a miss.
const ADAPTIVE_SCORE_THRESHOLD: f32 = 0.35;

/// Fields every entity carries regardless of schema; allowed in WHERE
/// clauses alongside the declared indexed fields.
const SYSTEM_FIELDS: &[&str] = &["id", "schema", "created_at", "modified_at"];

/// Executes statements and plans against one store.
pub struct Executor<'a> {
    store: &'a EntityStore,
}

impl<'a> Executor<'a> {
    /// Creates an executor over a store.
    pub fn new(store: &'a EntityStore) -> Self {
        Self { store }
    }

    /// Parses and executes one REM-SQL statement.
    #[instrument(skip(self))]
    pub fn sql(&self, query: &str) -> Result<Vec<Value>> {
        let statement = Statement::parse(query)?;
        self.execute_statement(&statement)
    }

    /// Executes a parsed statement, retrying once on a transient storage
    /// failure.
    pub fn execute_statement(&self, statement: &Statement) -> Result<Vec<Value>> {
        match self.dispatch(statement) {
            Err(e) if e.is_storage() => {
                warn!(error = %e, "Storage error mid-stage; retrying once");
                self.dispatch(statement)
            }
            other => other,
        }
    }

    fn dispatch(&self, statement: &Statement) -> Result<Vec<Value>> {
        match statement {
            Statement::Lookup { keys } => self.run_lookup(keys),
            Statement::Search {
                text,
                schema,
                predicate,
                limit,
            } => self.run_search(text, schema, predicate.as_ref(), *limit),
            Statement::Traverse {
                start,
                depth,
                direction,
                rel_type,
            } => self.run_traverse(start, *depth, *direction, rel_type.as_deref()),
            Statement::Select {
                fields,
                schema,
                predicate,
                order_by,
                limit,
                offset,
            } => self.run_select(
                fields,
                schema,
                predicate.as_ref(),
                order_by.clone(),
                *limit,
                *offset,
            ),
        }
    }

    fn run_lookup(&self, keys: &[String]) -> Result<Vec<Value>> {
        let entities = self.store.lookup_keys(keys)?;
        Ok(entities
            .into_iter()
            .filter(|e| !e.is_deleted())
            .map(|e| e.to_value())
            .collect())
    }

    fn run_search(
        &self,
        text: &str,
        schema: &str,
        predicate: Option<&Predicate>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let definition = self.store.get_schema(schema)?;
        if let Some(predicate) = predicate {
            validate_predicate(&definition, predicate)?;
        }
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_LIMIT);

        let results = self.store.search_text(text, schema, limit, predicate)?;
        Ok(results
            .into_iter()
            .map(|(entity, score)| {
                let mut row = entity.to_value();
                if let Value::Object(map) = &mut row {
                    map.insert("score".to_string(), Value::from(score as f64));
                }
                row
            })
            .collect())
    }

    fn run_traverse(
        &self,
        start: &str,
        depth: usize,
        direction: crate::entity::Direction,
        rel_type: Option<&str>,
    ) -> Result<Vec<Value>> {
        let start_id = self.resolve_start(start)?;
        let traversal = graph::traverse(self.store, start_id, depth, direction, rel_type)?;

        let mut rows = Vec::with_capacity(traversal.ids.len());
        for id in traversal.ids {
            if let Some(entity) = self.store.get(id)? {
                rows.push(entity.to_value());
            }
        }
        Ok(rows)
    }

    /// TRAVERSE needs a resolved start id; names go through the key index.
    fn resolve_start(&self, start: &str) -> Result<EntityId> {
        if let Ok(id) = start.parse::<EntityId>() {
            return Ok(id);
        }
        let matches = self.store.lookup_keys(&[start.to_string()])?;
        matches
            .into_iter()
            .find(|e| !e.is_deleted())
            .map(|e| e.id)
            .ok_or_else(|| NotFoundError::entity(start).into())
    }

    fn run_select(
        &self,
        fields: &SelectFields,
        schema: &str,
        predicate: Option<&Predicate>,
        order_by: Option<(String, crate::query::predicate::Order)>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Value>> {
        let definition = self.store.get_schema(schema)?;
        if let Some(predicate) = predicate {
            validate_predicate(&definition, predicate)?;
        }

        let options = ScanOptions {
            predicate: predicate.cloned(),
            order_by,
            limit: Some(limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT)),
            offset,
            include_deleted: false,
        };
        let entities = self.store.scan(schema, &options)?;

        Ok(entities
            .into_iter()
            .map(|entity| project(&entity, fields))
            .collect())
    }

    // =========================================================================
    // Plan Execution
    // =========================================================================

    /// Executes a validated plan, following fallbacks on their triggers.
    #[instrument(skip_all, fields(query_type = ?plan.query_type, mode = ?plan.execution_mode))]
    pub fn execute_plan(&self, plan: &QueryPlan) -> Result<QueryResult> {
        plan.validate()?;
        let started = Instant::now();

        let mut stages = 0usize;
        let mut stage_results: Vec<usize> = Vec::new();
        let mut fallback_used = false;
        let mut executed_query = plan.primary_query.query_string.clone();

        let mut state = self.run_stage(&plan.primary_query.query_string);
        stages += 1;
        stage_results.push(state.row_count());

        if plan.execution_mode != ExecutionMode::SinglePass {
            for fallback in &plan.fallback_queries {
                let Some(active) = state.active_trigger(plan.execution_mode) else {
                    break;
                };
                if fallback.trigger != active {
                    continue;
                }
                debug!(
                    trigger = ?active,
                    query = %fallback.query.query_string,
                    "Fallback stage triggered"
                );
                state = self.run_stage(&fallback.query.query_string);
                stages += 1;
                stage_results.push(state.row_count());
                executed_query = fallback.query.query_string.clone();
                fallback_used = true;
            }
        }

        let results = match state {
            StageState::Rows(rows) => rows,
            StageState::Failed(error) => return Err(error),
        };

        Ok(QueryResult {
            results,
            query: executed_query,
            query_type: plan.query_type,
            confidence: plan.confidence,
            stages,
            stage_results,
            total_time_ms: started.elapsed().as_millis() as u64,
            execution_mode: plan.execution_mode,
            reasoning: Some(plan.reasoning.clone()),
            fallback_used,
        })
    }

    fn run_stage(&self, query: &str) -> StageState {
        match self.sql(query) {
            Ok(rows) => StageState::Rows(rows),
            Err(error) => StageState::Failed(error),
        }
    }
}

/// Outcome of one executed stage.
enum StageState {
    Rows(Vec<Value>),
    Failed(RemDbError),
}

impl StageState {
    fn row_count(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Failed(_) => 0,
        }
    }

    /// Which fallback trigger the current state fires, if any.
    fn active_trigger(&self, mode: ExecutionMode) -> Option<FallbackTrigger> {
        match self {
            Self::Failed(_) => Some(FallbackTrigger::Error),
            Self::Rows(rows) if rows.is_empty() => Some(FallbackTrigger::NoResults),
            Self::Rows(rows) if mode == ExecutionMode::Adaptive => {
                let best = rows
                    .iter()
                    .filter_map(|r| r.get("score").and_then(Value::as_f64))
                    .fold(f64::NEG_INFINITY, f64::max);
                if best.is_finite() && best < ADAPTIVE_SCORE_THRESHOLD as f64 {
                    Some(FallbackTrigger::LowConfidence)
                } else {
                    None
                }
            }
            Self::Rows(_) => None,
        }
    }
}

/// Rejects predicates over fields the schema does not index.
fn validate_predicate(
    definition: &crate::schema::SchemaDefinition,
    predicate: &Predicate,
) -> Result<()> {
    for field in predicate.fields() {
        if !definition.is_indexed(field) && !SYSTEM_FIELDS.contains(&field) {
            return Err(QueryError::NonIndexedPredicate {
                field: field.to_string(),
                schema: definition.short_name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Applies a SELECT projection to an entity.
fn project(entity: &Entity, fields: &SelectFields) -> Value {
    match fields {
        SelectFields::All => entity.to_value(),
        SelectFields::Some(fields) => {
            let mut row = serde_json::Map::new();
            for field in fields {
                row.insert(
                    field.clone(),
                    entity.field(field).unwrap_or(Value::Null),
                );
            }
            Value::Object(row)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::query::plan::{PlannedQuery, QueryDialect, QueryMetadata};
    use serde_json::{json, Map};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn seeded_store(dir: &tempfile::TempDir) -> Arc<EntityStore> {
        let store =
            EntityStore::open(dir.path().join("test.db"), Config::for_tenant("t1")).unwrap();
        store
            .insert_with_embedding(
                "resources",
                record(json!({
                    "name": "Python for Beginners",
                    "category": "tutorial",
                    "content": "python basics for new programmers"
                })),
            )
            .unwrap();
        store
            .insert_with_embedding(
                "resources",
                record(json!({
                    "name": "Rust Deep Dive",
                    "category": "reference",
                    "content": "rust systems programming internals"
                })),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_select_with_indexed_predicate() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let rows = executor
            .sql("SELECT * FROM resources WHERE category = 'tutorial'")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["properties"]["name"], json!("Python for Beginners"));
    }

    #[test]
    fn test_select_projection() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let rows = executor
            .sql("SELECT name, category FROM resources ORDER BY name ASC")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            json!({"name": "Python for Beginners", "category": "tutorial"})
        );
        // Projection keeps only the requested fields
        assert!(rows[0].get("properties").is_none());
    }

    #[test]
    fn test_select_rejects_non_indexed_predicate() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let err = executor
            .sql("SELECT * FROM resources WHERE content = 'x'")
            .unwrap_err();
        assert!(err.to_string().contains("non-indexed"));
    }

    #[test]
    fn test_select_allows_system_fields() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let rows = executor
            .sql("SELECT * FROM resources WHERE created_at > 0")
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_unknown_schema_fails() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);
        assert!(executor.sql("SELECT * FROM nothing").is_err());
    }

    #[test]
    fn test_search_rows_carry_scores() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let rows = executor
            .sql("SEARCH 'python basics' IN resources LIMIT 2")
            .unwrap();
        assert!(!rows.is_empty());
        let mut last = f64::INFINITY;
        for row in &rows {
            let score = row["score"].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&score));
            assert!(score <= last, "scores must be non-increasing");
            last = score;
        }
        assert_eq!(rows[0]["properties"]["name"], json!("Python for Beginners"));
    }

    #[test]
    fn test_hybrid_search_with_where() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let rows = executor
            .sql("SEARCH 'python basics' IN resources WHERE category = 'tutorial' LIMIT 3")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["properties"]["category"], json!("tutorial"));

        // The filter excludes every candidate
        let rows = executor
            .sql("SEARCH 'python basics' IN resources WHERE category = 'missing' LIMIT 3")
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_lookup_by_uuid() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let all = executor.sql("SELECT * FROM resources").unwrap();
        let id = all[0]["id"].as_str().unwrap().to_string();

        let rows = executor.sql(&format!("LOOKUP '{}'", id)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(id));

        assert!(executor.sql("LOOKUP 'no-such-key'").unwrap().is_empty());
    }

    #[test]
    fn test_traverse_statement() {
        let dir = tempdir().unwrap();
        let store =
            EntityStore::open(dir.path().join("test.db"), Config::for_tenant("t1")).unwrap();
        let ids = store
            .upsert(
                "entities",
                vec![record(json!({"name": "a"})), record(json!({"name": "b"}))],
            )
            .unwrap();
        store.add_edge(ids[0], ids[1], "X", Map::new()).unwrap();

        let executor = Executor::new(&store);
        let rows = executor
            .sql(&format!(
                "TRAVERSE FROM '{}' DEPTH 2 DIRECTION out TYPE 'X'",
                ids[0]
            ))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(ids[0].to_string()));
        assert_eq!(rows[1]["id"], json!(ids[1].to_string()));
    }

    fn plan_with_fallback(
        primary: &str,
        fallback_query: &str,
        trigger: FallbackTrigger,
        mode: ExecutionMode,
    ) -> QueryPlan {
        QueryPlan {
            query_type: QueryType::Lookup,
            confidence: 0.7,
            primary_query: PlannedQuery {
                dialect: QueryDialect::RemSql,
                query_string: primary.to_string(),
                parameters: Value::Null,
            },
            fallback_queries: vec![crate::query::plan::FallbackQuery {
                query: PlannedQuery {
                    dialect: QueryDialect::RemSql,
                    query_string: fallback_query.to_string(),
                    parameters: Value::Null,
                },
                trigger,
                confidence: 0.5,
                reasoning: "test fallback".to_string(),
            }],
            execution_mode: mode,
            schema_hints: vec![],
            reasoning: "test".to_string(),
            explanation: None,
            next_steps: vec![],
            metadata: QueryMetadata::default(),
        }
    }

    #[test]
    fn test_plan_fallback_on_no_results() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let plan = plan_with_fallback(
            "LOOKUP 'missing-key'",
            "SELECT * FROM resources WHERE category = 'tutorial'",
            FallbackTrigger::NoResults,
            ExecutionMode::MultiStage,
        );
        let result = executor.execute_plan(&plan).unwrap();
        assert!(result.fallback_used);
        assert_eq!(result.stages, 2);
        assert_eq!(result.stage_results, vec![0, 1]);
        assert_eq!(result.results.len(), 1);
    }

    #[test]
    fn test_plan_fallback_on_error() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let plan = plan_with_fallback(
            "SELECT * FROM schema_that_does_not_exist",
            "SELECT * FROM resources",
            FallbackTrigger::Error,
            ExecutionMode::MultiStage,
        );
        let result = executor.execute_plan(&plan).unwrap();
        assert!(result.fallback_used);
        assert_eq!(result.results.len(), 2);
    }

    #[test]
    fn test_plan_error_without_matching_fallback_propagates() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let plan = plan_with_fallback(
            "SELECT * FROM schema_that_does_not_exist",
            "SELECT * FROM resources",
            FallbackTrigger::NoResults,
            ExecutionMode::MultiStage,
        );
        assert!(executor.execute_plan(&plan).is_err());
    }

    #[test]
    fn test_single_pass_ignores_fallbacks() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let plan = plan_with_fallback(
            "LOOKUP 'missing-key'",
            "SELECT * FROM resources",
            FallbackTrigger::NoResults,
            ExecutionMode::SinglePass,
        );
        let result = executor.execute_plan(&plan).unwrap();
        assert!(!result.fallback_used);
        assert_eq!(result.stages, 1);
        assert!(result.results.is_empty());
    }

    #[test]
    fn test_plan_successful_primary_skips_fallbacks() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let executor = Executor::new(&store);

        let plan = plan_with_fallback(
            "SELECT * FROM resources WHERE category = 'tutorial'",
            "LOOKUP 'anything'",
            FallbackTrigger::NoResults,
            ExecutionMode::MultiStage,
        );
        let result = executor.execute_plan(&plan).unwrap();
        assert!(!result.fallback_used);
        assert_eq!(result.stages, 1);
        assert_eq!(result.stage_results, vec![1]);
    }
}

//! Typed query plans: the contract between the planner and the executor.
//!
//! A [`QueryPlan`] describes how a natural-language query should execute:
//! the primary query, ordered fallbacks with trigger conditions, and
//! execution metadata. Plans produced by an LLM are untrusted input and
//! must pass [`QueryPlan::validate`] before execution; the validation
//! enforces the structural rules, most importantly that low-confidence
//! plans carry an explanation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueryError, Result};

/// Types of queries the database executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Key-based entity lookup across schemas.
    Lookup,
    /// Semantic vector search.
    Search,
    /// REM-SQL SELECT.
    Sql,
    /// Graph traversal.
    Traverse,
    /// Vector search intersected with indexed predicates.
    Hybrid,
}

/// Query execution strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Execute the primary query only.
    SinglePass,
    /// Try the primary, then fallbacks on their triggers.
    MultiStage,
    /// Like multi-stage, but low scores also count as a miss.
    Adaptive,
}

/// Conditions that trigger fallback query execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTrigger {
    /// Primary query returned an empty result set.
    NoResults,
    /// Primary query failed.
    Error,
    /// Result confidence under the adaptive threshold.
    LowConfidence,
}

/// SQL dialect of a planned query string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryDialect {
    /// Extended dialect: LOOKUP, SEARCH, TRAVERSE, SELECT.
    RemSql,
    /// Plain SELECT subset.
    StandardSql,
}

/// Individual query specification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuery {
    /// Dialect the query string is written in.
    pub dialect: QueryDialect,
    /// The query to execute.
    pub query_string: String,
    /// Typed parameters the builder rendered the string from.
    #[serde(default)]
    pub parameters: Value,
}

/// Fallback query with its trigger condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackQuery {
    /// The fallback query to execute.
    pub query: PlannedQuery,
    /// Condition that activates this fallback.
    pub trigger: FallbackTrigger,
    /// Confidence in this fallback.
    pub confidence: f32,
    /// Why this fallback is appropriate.
    pub reasoning: String,
}

/// Additional metadata about query execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Expected number of result rows, if estimable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
    /// Expected execution time in milliseconds, if estimable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_ms: Option<u64>,
    /// Whether the query needs embedding generation.
    #[serde(default)]
    pub requires_embedding: bool,
    /// Whether the query can be answered from indexes.
    #[serde(default)]
    pub uses_index: bool,
    /// Schemas that will be searched, in priority order.
    #[serde(default)]
    pub schemas_searched: Vec<String>,
}

/// Complete query execution plan with fallback strategies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Primary query type.
    pub query_type: QueryType,

    /// Confidence in query correctness, in `[0, 1]`.
    pub confidence: f32,

    /// Main query to execute first.
    pub primary_query: PlannedQuery,

    /// Ordered fallback queries if the primary misses.
    #[serde(default)]
    pub fallback_queries: Vec<FallbackQuery>,

    /// How to execute this plan.
    pub execution_mode: ExecutionMode,

    /// Suggested schemas to search, in priority order.
    #[serde(default)]
    pub schema_hints: Vec<String>,

    /// Explanation of the planning decisions.
    pub reasoning: String,

    /// Required when `confidence < 0.6`: why the query is ambiguous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,

    /// Suggestions if the query fails or returns nothing.
    #[serde(default)]
    pub next_steps: Vec<String>,

    /// Execution metadata.
    #[serde(default)]
    pub metadata: QueryMetadata,
}

/// Confidence below which a plan must explain its ambiguity.
pub const EXPLANATION_THRESHOLD: f32 = 0.6;

impl QueryPlan {
    /// Validates the structural rules of a plan.
    ///
    /// Plans from an LLM are deserialized then validated here before the
    /// executor touches them.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(QueryError::plan_validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            ))
            .into());
        }
        if self.confidence < EXPLANATION_THRESHOLD
            && self.explanation.as_deref().map_or(true, str::is_empty)
        {
            return Err(QueryError::plan_validation(format!(
                "explanation required for low confidence ({:.2})",
                self.confidence
            ))
            .into());
        }
        if self.primary_query.query_string.trim().is_empty() {
            return Err(QueryError::plan_validation("empty primary query").into());
        }
        for fallback in &self.fallback_queries {
            if !(0.0..=1.0).contains(&fallback.confidence) {
                return Err(QueryError::plan_validation(format!(
                    "fallback confidence {} outside [0, 1]",
                    fallback.confidence
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Result of query plan execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result rows (entity JSON; SEARCH rows carry a `score`).
    pub results: Vec<Value>,

    /// The query string that produced the results.
    pub query: String,

    /// Type of query executed.
    pub query_type: QueryType,

    /// Plan confidence.
    pub confidence: f32,

    /// Number of stages executed.
    pub stages: usize,

    /// Result counts per stage.
    pub stage_results: Vec<usize>,

    /// Total execution time in milliseconds.
    pub total_time_ms: u64,

    /// Execution mode used.
    pub execution_mode: ExecutionMode,

    /// Explanation of the results, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Whether a fallback query produced the results.
    pub fallback_used: bool,
}

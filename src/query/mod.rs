//! Query layer: plans, REM-SQL, building, planning and execution.
//!
//! The flow for a natural-language query:
//!
//! ```text
//! NL text ──planner──▶ QueryPlan ──builder──▶ REM-SQL string
//!                          │                       │
//!                          └──────executor◀────parser (AST)
//! ```
//!
//! Plans carry their typed parameters next to the rendered query string,
//! and rendering always goes through the AST, so
//! `parse(build(plan.parameters))` reproduces the same AST.

pub mod builder;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod predicate;
pub mod sql;

pub use builder::{build_query_string, build_statement};
pub use executor::Executor;
pub use plan::{
    ExecutionMode, FallbackQuery, FallbackTrigger, PlannedQuery, QueryDialect, QueryMetadata,
    QueryPlan, QueryResult, QueryType,
};
pub use planner::{plan_query, plan_query_with_model};
pub use predicate::{Order, Predicate};
pub use sql::{SelectFields, Statement};

//! # dsr-conditions
//!
//! Recursive boolean condition evaluator for the privacy request engine.
//!
//! Conditions are expression trees: a leaf compares one dotted-path field of
//! a data structure against an expected value with a comparison operator, and
//! a group combines child conditions with AND/OR. Evaluation is pure and
//! stateless; every call allocates a fresh [`EvaluationResult`] tree that
//! records, per node, why the rule matched or did not. That tree is the audit
//! trail consumed by callers that gate automated decisions.

pub mod evaluate;
pub mod schema;

pub use evaluate::{
    evaluate_rule, ConditionData, ConditionEvaluationError, EvaluationResult, GroupResult,
    LeafResult, RecordFieldError, StructuredRecord,
};
pub use schema::{Condition, ConditionGroup, ConditionLeaf, GroupOperator, Operator};

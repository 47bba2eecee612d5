//! Condition evaluation.
//!
//! [`evaluate_rule`] walks a condition tree against a [`ConditionData`] source
//! and produces both the boolean outcome and a mirrored [`EvaluationResult`]
//! tree recording the outcome at every node.
//!
//! Operator application is total: a type mismatch between the operator's
//! domain and the resolved value (a numeric comparison against a string, a
//! list operator against a scalar) evaluates to `false`, never to an error.
//! Errors only arise from field resolution against a structured record whose
//! accessor fails for a reason other than "not found"; those are wrapped in
//! [`ConditionEvaluationError`] with the underlying cause preserved. The
//! closed [`Operator`] and [`GroupOperator`] enums make an unrecognized
//! operator unrepresentable, so that failure mode cannot occur at runtime.

use crate::schema::{Condition, ConditionGroup, ConditionLeaf, GroupOperator, Operator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error raised by a [`StructuredRecord`] field accessor.
#[derive(Error, Debug)]
pub enum RecordFieldError {
    /// The record has no field at this path. Recoverable: the evaluator
    /// falls back to generic mapping access over [`StructuredRecord::as_mapping`].
    #[error("field not found: {0}")]
    NotFound(String),

    /// The accessor itself failed. Not recoverable; propagated to the caller.
    #[error("record access failed: {0}")]
    Access(String),
}

/// Error produced when condition evaluation cannot complete.
#[derive(Error, Debug)]
pub enum ConditionEvaluationError {
    /// Field resolution against a structured record failed.
    #[error("failed to resolve field '{field_address}'")]
    FieldResolution {
        field_address: String,
        #[source]
        source: RecordFieldError,
    },
}

/// A domain object that exposes structured field-path lookup.
///
/// Implementors resolve a full dotted path in one call; a miss is reported
/// as [`RecordFieldError::NotFound`], which makes the evaluator retry via
/// plain mapping access over [`StructuredRecord::as_mapping`].
pub trait StructuredRecord {
    /// Resolves the dotted path to a value, or `Ok(None)` when the path walks
    /// off the data (a legitimate miss, not an error).
    fn get_field(&self, path: &str) -> Result<Option<Value>, RecordFieldError>;

    /// Generic mapping view of the record, used as the fallback lookup target.
    fn as_mapping(&self) -> Value;
}

/// The data a condition tree is evaluated against.
///
/// Two explicit variants replace duck-typed accessor probing: a plain JSON
/// mapping walked segment by segment, or a domain object with its own
/// field-path accessor.
pub enum ConditionData<'a> {
    /// Arbitrary nested data; fields resolve by key lookup per path segment.
    Mapping(&'a Value),
    /// Domain object with a structured accessor, falling back to mapping access.
    Record(&'a dyn StructuredRecord),
}

/// Outcome recorded for a single leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafResult {
    /// Field the leaf addressed.
    pub field_address: String,
    /// Operator that was applied.
    pub operator: Operator,
    /// Expected operand, if the leaf carried one.
    pub expected: Option<Value>,
    /// Value resolved from the data, if any.
    pub actual: Option<Value>,
    /// Whether the leaf matched.
    pub matched: bool,
}

/// Outcome recorded for a group, including every child's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResult {
    /// Logical operator the group combined its children with.
    pub logical_operator: GroupOperator,
    /// Whether the group matched.
    pub matched: bool,
    /// One result per child, in evaluation order.
    pub results: Vec<EvaluationResult>,
}

/// Audit-trail tree mirroring the evaluated condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationResult {
    Leaf(LeafResult),
    Group(GroupResult),
}

impl EvaluationResult {
    /// Boolean outcome at this node.
    pub fn matched(&self) -> bool {
        match self {
            EvaluationResult::Leaf(leaf) => leaf.matched,
            EvaluationResult::Group(group) => group.matched,
        }
    }
}

/// Evaluates a condition tree against the data, returning the boolean outcome
/// together with the full per-node result tree.
///
/// Groups evaluate every child even when the logical combination is already
/// decided, so the result tree always covers the whole condition.
pub fn evaluate_rule(
    node: &Condition,
    data: &ConditionData<'_>,
) -> Result<(bool, EvaluationResult), ConditionEvaluationError> {
    match node {
        Condition::Leaf(leaf) => evaluate_leaf(leaf, data),
        Condition::Group(group) => evaluate_group(group, data),
    }
}

fn evaluate_leaf(
    leaf: &ConditionLeaf,
    data: &ConditionData<'_>,
) -> Result<(bool, EvaluationResult), ConditionEvaluationError> {
    let actual = resolve_field(data, &leaf.field_address)?;
    let matched = apply_operator(leaf.operator, actual.as_ref(), leaf.value.as_ref());

    let result = EvaluationResult::Leaf(LeafResult {
        field_address: leaf.field_address.clone(),
        operator: leaf.operator,
        expected: leaf.value.clone(),
        actual,
        matched,
    });
    Ok((matched, result))
}

fn evaluate_group(
    group: &ConditionGroup,
    data: &ConditionData<'_>,
) -> Result<(bool, EvaluationResult), ConditionEvaluationError> {
    let mut outcomes = Vec::with_capacity(group.conditions.len());
    let mut results = Vec::with_capacity(group.conditions.len());

    for child in &group.conditions {
        let (matched, result) = evaluate_rule(child, data)?;
        outcomes.push(matched);
        results.push(result);
    }

    let matched = match group.logical_operator {
        GroupOperator::And => outcomes.iter().all(|m| *m),
        GroupOperator::Or => outcomes.iter().any(|m| *m),
    };

    let result = EvaluationResult::Group(GroupResult {
        logical_operator: group.logical_operator,
        matched,
        results,
    });
    Ok((matched, result))
}

/// Resolves a dotted field address against the data source.
///
/// The empty address returns the root structure. Misses resolve to `None`,
/// not errors; only a structured accessor's non-recoverable failure
/// propagates.
fn resolve_field(
    data: &ConditionData<'_>,
    field_address: &str,
) -> Result<Option<Value>, ConditionEvaluationError> {
    match data {
        ConditionData::Mapping(root) => Ok(resolve_in_mapping(root, field_address)),
        ConditionData::Record(record) => match record.get_field(field_address) {
            Ok(value) => Ok(value),
            Err(RecordFieldError::NotFound(_)) => {
                Ok(resolve_in_mapping(&record.as_mapping(), field_address))
            }
            Err(source @ RecordFieldError::Access(_)) => {
                Err(ConditionEvaluationError::FieldResolution {
                    field_address: field_address.to_string(),
                    source,
                })
            }
        },
    }
}

fn resolve_in_mapping(root: &Value, field_address: &str) -> Option<Value> {
    if field_address.is_empty() {
        return Some(root.clone());
    }

    let mut current = root;
    for segment in field_address.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return None,
            },
            _ => return None,
        }
    }
    Some(current.clone())
}

/// Applies an operator to the resolved value. Total: type mismatches with the
/// operator's domain evaluate to `false`.
fn apply_operator(operator: Operator, actual: Option<&Value>, expected: Option<&Value>) -> bool {
    let null = Value::Null;
    let actual_or_null = actual.unwrap_or(&null);
    let expected_or_null = expected.unwrap_or(&null);

    match operator {
        Operator::Exists => !actual_or_null.is_null(),
        Operator::NotExists => actual_or_null.is_null(),
        Operator::Eq => actual_or_null == expected_or_null,
        Operator::Gt => compare_ordered(actual_or_null, expected_or_null, |o| o.is_gt()),
        Operator::Gte => compare_ordered(actual_or_null, expected_or_null, |o| o.is_ge()),
        Operator::Lt => compare_ordered(actual_or_null, expected_or_null, |o| o.is_lt()),
        Operator::StartsWith => match (actual_or_null.as_str(), expected_or_null.as_str()) {
            (Some(a), Some(e)) => a.starts_with(e),
            _ => false,
        },
        Operator::EndsWith => match (actual_or_null.as_str(), expected_or_null.as_str()) {
            (Some(a), Some(e)) => a.ends_with(e),
            _ => false,
        },
        Operator::Contains => match (actual_or_null.as_str(), expected_or_null.as_str()) {
            (Some(a), Some(e)) => a.contains(e),
            _ => false,
        },
        Operator::ListContains => match actual_or_null.as_array() {
            Some(items) => items.contains(expected_or_null),
            None => false,
        },
        Operator::NotInList => match expected_or_null.as_array() {
            Some(items) => !items.contains(actual_or_null),
            None => false,
        },
        Operator::ListIntersects => match (actual_or_null.as_array(), expected_or_null.as_array())
        {
            (Some(a), Some(e)) => a.iter().any(|item| e.contains(item)),
            _ => false,
        },
        Operator::ListSubset => match (actual_or_null.as_array(), expected_or_null.as_array()) {
            (Some(a), Some(e)) => a.iter().all(|item| e.contains(item)),
            _ => false,
        },
        Operator::ListSuperset => match (actual_or_null.as_array(), expected_or_null.as_array()) {
            (Some(a), Some(e)) => e.iter().all(|item| a.contains(item)),
            _ => false,
        },
        Operator::ListDisjoint => match (actual_or_null.as_array(), expected_or_null.as_array()) {
            (Some(a), Some(e)) => !a.iter().any(|item| e.contains(item)),
            _ => false,
        },
    }
}

/// Ordering comparison over same-typed numbers or strings; anything else is
/// non-comparable and yields `false`.
fn compare_ordered(
    actual: &Value,
    expected: &Value,
    check: fn(std::cmp::Ordering) -> bool,
) -> bool {
    if let (Some(a), Some(e)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&e).map(check).unwrap_or(false);
    }
    if let (Some(a), Some(e)) = (actual.as_str(), expected.as_str()) {
        return check(a.cmp(e));
    }
    false
}

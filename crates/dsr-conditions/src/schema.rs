//! Condition tree schema.
//!
//! A condition is either a [`ConditionLeaf`] (one field, one operator, one
//! expected value) or a [`ConditionGroup`] combining child conditions with a
//! logical operator. Groups nest to arbitrary depth.

use serde::{Deserialize, Serialize};

/// Comparison operators available on condition leaves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// A non-null value is present at the field address.
    Exists,
    /// No value (or an explicit null) is present at the field address.
    NotExists,
    /// Field value equals the expected value.
    Eq,
    /// Field value is strictly greater than the expected value.
    Gt,
    /// Field value is greater than or equal to the expected value.
    Gte,
    /// Field value is strictly less than the expected value.
    Lt,
    /// String field starts with the expected string.
    StartsWith,
    /// String field ends with the expected string.
    EndsWith,
    /// String field contains the expected string.
    Contains,
    /// List field contains the expected value as an element.
    ListContains,
    /// Field value is not an element of the expected list.
    NotInList,
    /// List field shares at least one element with the expected list.
    ListIntersects,
    /// List field is a subset of the expected list.
    ListSubset,
    /// List field is a superset of the expected list.
    ListSuperset,
    /// List field shares no elements with the expected list.
    ListDisjoint,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operator::Exists => "exists",
            Operator::NotExists => "not_exists",
            Operator::Eq => "eq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Contains => "contains",
            Operator::ListContains => "list_contains",
            Operator::NotInList => "not_in_list",
            Operator::ListIntersects => "list_intersects",
            Operator::ListSubset => "list_subset",
            Operator::ListSuperset => "list_superset",
            Operator::ListDisjoint => "list_disjoint",
        };
        write!(f, "{}", name)
    }
}

/// Logical operator for combining the children of a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupOperator {
    /// Every child must evaluate true.
    And,
    /// At least one child must evaluate true.
    Or,
}

impl std::fmt::Display for GroupOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupOperator::And => write!(f, "and"),
            GroupOperator::Or => write!(f, "or"),
        }
    }
}

/// A single comparison against one field of the evaluated data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionLeaf {
    /// Dotted path locating the field, e.g. `"user.billing.plan"`.
    /// The empty string addresses the root structure itself.
    pub field_address: String,
    /// Comparison to apply.
    pub operator: Operator,
    /// Expected operand. Ignored by `exists`/`not_exists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl ConditionLeaf {
    /// Creates a leaf with an expected value.
    pub fn new(
        field_address: impl Into<String>,
        operator: Operator,
        value: serde_json::Value,
    ) -> Self {
        Self {
            field_address: field_address.into(),
            operator,
            value: Some(value),
        }
    }

    /// Creates a leaf with no operand, for `exists`/`not_exists`.
    pub fn unary(field_address: impl Into<String>, operator: Operator) -> Self {
        Self {
            field_address: field_address.into(),
            operator,
            value: None,
        }
    }
}

/// An ordered group of conditions combined with a logical operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionGroup {
    /// How child results combine.
    pub logical_operator: GroupOperator,
    /// Child conditions, evaluated in order.
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// Creates an AND group.
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            logical_operator: GroupOperator::And,
            conditions,
        }
    }

    /// Creates an OR group.
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            logical_operator: GroupOperator::Or,
            conditions,
        }
    }
}

/// A node in the condition tree: either a leaf or a nested group.
///
/// Serialized untagged; a group is recognized by its `logical_operator`
/// field, a leaf by its `field_address`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Leaf(ConditionLeaf),
}

impl From<ConditionLeaf> for Condition {
    fn from(leaf: ConditionLeaf) -> Self {
        Condition::Leaf(leaf)
    }
}

impl From<ConditionGroup> for Condition {
    fn from(group: ConditionGroup) -> Self {
        Condition::Group(group)
    }
}

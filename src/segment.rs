//! Segment condition trees.
//!
//! A segment's `conditions` is a recursive AND/OR tree of comparison leaves.
//! Saving a segment compiles the tree into a [`Predicate`] against the
//! configured [`AttributeSchema`]; compilation is where unknown fields and
//! bad operator/value combinations are rejected, so evaluating a stored
//! segment later cannot fail on configuration.
//!
//! Text comparisons are case-sensitive unless a leaf sets `ignore_case`.
//! Negated operators (`not_equal`, `not_contains`, `not_blank`) are the exact
//! complement of their positive form, so a user without the attribute matches
//! `not_equal`.

use async_stream::try_stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{Segment, UserRecord};
use crate::store::Store;
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn and(conditions: Vec<ConditionNode>) -> Self {
        Self {
            operator: LogicalOperator::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<ConditionNode>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            conditions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(ConditionLeaf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Set,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Set => "set",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Blank,
    NotBlank,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    InRange,
}

impl ComparisonOperator {
    fn is_negated(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::NotEqual
                | ComparisonOperator::NotContains
                | ComparisonOperator::NotBlank
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLeaf {
    pub field: String,
    pub field_type: FieldType,
    pub operator: ComparisonOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_case: bool,
}

impl ConditionLeaf {
    pub fn new(
        field: impl Into<String>,
        field_type: FieldType,
        operator: ComparisonOperator,
        value: Option<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            field_type,
            operator,
            value,
            ignore_case: false,
        }
    }
}

impl From<ConditionLeaf> for ConditionNode {
    fn from(leaf: ConditionLeaf) -> Self {
        ConditionNode::Leaf(leaf)
    }
}

impl From<ConditionGroup> for ConditionNode {
    fn from(group: ConditionGroup) -> Self {
        ConditionNode::Group(group)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentConfigError {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{field}' is declared as {declared} but the schema says {expected}")]
    FieldTypeMismatch {
        field: String,
        declared: FieldType,
        expected: FieldType,
    },

    #[error("operator {operator:?} is not supported for {field_type} field '{field}'")]
    UnsupportedOperator {
        field: String,
        field_type: FieldType,
        operator: ComparisonOperator,
    },

    #[error("operator {operator:?} on field '{field}' requires a value")]
    MissingValue {
        field: String,
        operator: ComparisonOperator,
    },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("range for field '{0}' has low > high")]
    InvertedRange(String),
}

/// Known user attributes and their types.
#[derive(Debug, Clone, Default)]
pub struct AttributeSchema {
    fields: HashMap<String, FieldType>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    /// Parses `name:type` pairs separated by commas, e.g. `plan:text,age:number`.
    pub fn parse(fields: &str) -> std::result::Result<Self, String> {
        let mut schema = Self::new();
        for entry in fields.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, kind) = entry
                .split_once(':')
                .ok_or_else(|| format!("expected name:type, got '{}'", entry))?;
            let field_type = match kind.trim() {
                "text" => FieldType::Text,
                "number" => FieldType::Number,
                "date" => FieldType::Date,
                "set" => FieldType::Set,
                other => return Err(format!("unknown field type '{}'", other)),
            };
            schema = schema.with_field(name.trim(), field_type);
        }
        Ok(schema)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Number(f64),
    Date(OffsetDateTime),
}

/// Typed test against a single attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldTest {
    Text {
        op: TextOp,
        value: String,
        ignore_case: bool,
    },
    // missing, null or ""
    TextBlank,
    Order {
        op: OrderOp,
        bound: Bound,
    },
    Range {
        low: Bound,
        high: Bound,
    },
    // missing or null
    Missing,
    SetMember(Value),
    // missing, null or []
    SetEmpty,
}

/// Compiled, validated form of a condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    Tenant(Uuid),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Test { field: String, test: FieldTest },
}

impl Predicate {
    pub fn matches(&self, user: &UserRecord) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Tenant(id) => user.tenant_id == Some(*id),
            Predicate::All(children) => children.iter().all(|p| p.matches(user)),
            Predicate::Any(children) => children.iter().any(|p| p.matches(user)),
            Predicate::Not(inner) => !inner.matches(user),
            Predicate::Test { field, test } => test.matches(user.attributes.get(field)),
        }
    }
}

impl FieldTest {
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            FieldTest::Text {
                op,
                value: expected,
                ignore_case,
            } => {
                let Some(actual) = value.and_then(Value::as_str) else {
                    return false;
                };
                if *ignore_case {
                    text_matches(*op, &actual.to_lowercase(), &expected.to_lowercase())
                } else {
                    text_matches(*op, actual, expected)
                }
            }
            FieldTest::TextBlank => match value {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            },
            FieldTest::Order { op, bound } => match read_bound(value, bound) {
                Some(actual) => match op {
                    OrderOp::Eq => actual == *bound,
                    OrderOp::Gt => actual > *bound,
                    OrderOp::Gte => actual >= *bound,
                    OrderOp::Lt => actual < *bound,
                    OrderOp::Lte => actual <= *bound,
                },
                None => false,
            },
            FieldTest::Range { low, high } => match read_bound(value, low) {
                Some(actual) => actual >= *low && actual <= *high,
                None => false,
            },
            FieldTest::Missing => matches!(value, None | Some(Value::Null)),
            FieldTest::SetMember(expected) => value
                .and_then(Value::as_array)
                .map(|items| items.iter().any(|item| json_eq(item, expected)))
                .unwrap_or(false),
            FieldTest::SetEmpty => match value {
                None | Some(Value::Null) => true,
                Some(Value::Array(items)) => items.is_empty(),
                Some(_) => false,
            },
        }
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Bound::Number(a), Bound::Number(b)) => a.partial_cmp(b),
            (Bound::Date(a), Bound::Date(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

fn text_matches(op: TextOp, actual: &str, expected: &str) -> bool {
    match op {
        TextOp::Equals => actual == expected,
        TextOp::Contains => actual.contains(expected),
        TextOp::StartsWith => actual.starts_with(expected),
        TextOp::EndsWith => actual.ends_with(expected),
    }
}

// Reads the attribute as the same kind of bound it is compared against
fn read_bound(value: Option<&Value>, like: &Bound) -> Option<Bound> {
    let value = value?;
    match like {
        Bound::Number(_) => value.as_f64().map(Bound::Number),
        Bound::Date(_) => value.as_str().and_then(parse_date).map(Bound::Date),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_date(raw: &str) -> Option<OffsetDateTime> {
    if raw.len() == 10 {
        return OffsetDateTime::parse(&format!("{}T00:00:00Z", raw), &Rfc3339).ok();
    }
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

/// Compiles a condition tree without tenant scoping.
pub fn compile(
    group: &ConditionGroup,
    schema: &AttributeSchema,
) -> std::result::Result<Predicate, SegmentConfigError> {
    // An empty group is a vacuous match regardless of its operator
    if group.conditions.is_empty() {
        return Ok(Predicate::True);
    }

    let mut children = Vec::with_capacity(group.conditions.len());
    for node in &group.conditions {
        let child = match node {
            ConditionNode::Group(inner) => compile(inner, schema)?,
            ConditionNode::Leaf(leaf) => compile_leaf(leaf, schema)?,
        };
        children.push(child);
    }

    if children.len() == 1 {
        return Ok(children.remove(0));
    }

    Ok(match group.operator {
        LogicalOperator::And => Predicate::All(children),
        LogicalOperator::Or => Predicate::Any(children),
    })
}

fn compile_leaf(
    leaf: &ConditionLeaf,
    schema: &AttributeSchema,
) -> std::result::Result<Predicate, SegmentConfigError> {
    use ComparisonOperator as Op;

    let expected = schema
        .field_type(&leaf.field)
        .ok_or_else(|| SegmentConfigError::UnknownField(leaf.field.clone()))?;
    if expected != leaf.field_type {
        return Err(SegmentConfigError::FieldTypeMismatch {
            field: leaf.field.clone(),
            declared: leaf.field_type,
            expected,
        });
    }

    let unsupported = || SegmentConfigError::UnsupportedOperator {
        field: leaf.field.clone(),
        field_type: leaf.field_type,
        operator: leaf.operator,
    };

    let test = match leaf.field_type {
        FieldType::Text => match leaf.operator {
            Op::Blank | Op::NotBlank => FieldTest::TextBlank,
            Op::Equals | Op::NotEqual => text_test(leaf, TextOp::Equals)?,
            Op::Contains | Op::NotContains => text_test(leaf, TextOp::Contains)?,
            Op::StartsWith => text_test(leaf, TextOp::StartsWith)?,
            Op::EndsWith => text_test(leaf, TextOp::EndsWith)?,
            _ => return Err(unsupported()),
        },
        FieldType::Number | FieldType::Date => match leaf.operator {
            Op::Blank | Op::NotBlank => FieldTest::Missing,
            Op::Equals | Op::NotEqual => order_test(leaf, OrderOp::Eq)?,
            Op::GreaterThan => order_test(leaf, OrderOp::Gt)?,
            Op::GreaterThanOrEqual => order_test(leaf, OrderOp::Gte)?,
            Op::LessThan => order_test(leaf, OrderOp::Lt)?,
            Op::LessThanOrEqual => order_test(leaf, OrderOp::Lte)?,
            Op::InRange => range_test(leaf)?,
            _ => return Err(unsupported()),
        },
        FieldType::Set => match leaf.operator {
            Op::Blank | Op::NotBlank => FieldTest::SetEmpty,
            Op::Equals | Op::NotEqual | Op::Contains | Op::NotContains => {
                let value = required_value(leaf)?;
                if !(value.is_string() || value.is_number() || value.is_boolean()) {
                    return Err(SegmentConfigError::InvalidValue {
                        field: leaf.field.clone(),
                        reason: "set membership needs a scalar value".to_string(),
                    });
                }
                FieldTest::SetMember(value.clone())
            }
            _ => return Err(unsupported()),
        },
    };

    let predicate = Predicate::Test {
        field: leaf.field.clone(),
        test,
    };
    if leaf.operator.is_negated() {
        Ok(Predicate::Not(Box::new(predicate)))
    } else {
        Ok(predicate)
    }
}

fn required_value(leaf: &ConditionLeaf) -> std::result::Result<&Value, SegmentConfigError> {
    match &leaf.value {
        Some(Value::Null) | None => Err(SegmentConfigError::MissingValue {
            field: leaf.field.clone(),
            operator: leaf.operator,
        }),
        Some(value) => Ok(value),
    }
}

fn text_test(leaf: &ConditionLeaf, op: TextOp) -> std::result::Result<FieldTest, SegmentConfigError> {
    let value = required_value(leaf)?
        .as_str()
        .ok_or_else(|| SegmentConfigError::InvalidValue {
            field: leaf.field.clone(),
            reason: "expected a string".to_string(),
        })?;
    Ok(FieldTest::Text {
        op,
        value: value.to_string(),
        ignore_case: leaf.ignore_case,
    })
}

fn order_test(leaf: &ConditionLeaf, op: OrderOp) -> std::result::Result<FieldTest, SegmentConfigError> {
    let bound = parse_bound(leaf, required_value(leaf)?)?;
    Ok(FieldTest::Order { op, bound })
}

fn range_test(leaf: &ConditionLeaf) -> std::result::Result<FieldTest, SegmentConfigError> {
    let pair = required_value(leaf)?
        .as_array()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| SegmentConfigError::InvalidValue {
            field: leaf.field.clone(),
            reason: "in_range expects [low, high]".to_string(),
        })?;
    let low = parse_bound(leaf, &pair[0])?;
    let high = parse_bound(leaf, &pair[1])?;
    if low > high {
        return Err(SegmentConfigError::InvertedRange(leaf.field.clone()));
    }
    Ok(FieldTest::Range { low, high })
}

fn parse_bound(leaf: &ConditionLeaf, value: &Value) -> std::result::Result<Bound, SegmentConfigError> {
    let invalid = |reason: &str| SegmentConfigError::InvalidValue {
        field: leaf.field.clone(),
        reason: reason.to_string(),
    };
    match leaf.field_type {
        FieldType::Number => value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|n: &f64| n.is_finite())
            .map(Bound::Number)
            .ok_or_else(|| invalid("expected a number")),
        FieldType::Date => value
            .as_str()
            .and_then(parse_date)
            .map(Bound::Date)
            .ok_or_else(|| invalid("expected an RFC 3339 date")),
        _ => Err(invalid("ordering needs a number or date field")),
    }
}

/// Evaluates segments against the user attribute store.
pub struct SegmentEngine<S> {
    store: Arc<S>,
    schema: Arc<AttributeSchema>,
    page_size: i64,
}

impl<S> SegmentEngine<S>
where
    S: Store + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, schema: Arc<AttributeSchema>) -> Self {
        Self {
            store,
            schema,
            page_size: 500,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Compiles `conditions` and prepends the tenant filter, if any.
    pub fn evaluate(
        &self,
        conditions: &ConditionGroup,
        scope: TenantContext,
    ) -> std::result::Result<Predicate, SegmentConfigError> {
        let compiled = compile(conditions, &self.schema)?;
        Ok(match scope {
            TenantContext::Global => compiled,
            TenantContext::Tenant(id) => Predicate::All(vec![Predicate::Tenant(id), compiled]),
        })
    }

    /// Save-time check of a condition tree against the attribute schema.
    pub fn validate(&self, conditions: &ConditionGroup) -> std::result::Result<(), SegmentConfigError> {
        compile(conditions, &self.schema).map(|_| ())
    }

    pub async fn create_segment(
        &self,
        ctx: TenantContext,
        name: &str,
        conditions: &ConditionGroup,
    ) -> Result<Segment> {
        // Rejected before anything is persisted
        self.validate(conditions)?;
        let segment = self.store.insert_segment(ctx, name, conditions).await?;
        info!(segment_id = %segment.id, name = %segment.name, "Segment created");
        Ok(segment)
    }

    pub async fn update_conditions(
        &self,
        ctx: TenantContext,
        segment_id: Uuid,
        conditions: &ConditionGroup,
    ) -> Result<Segment> {
        self.validate(conditions)?;
        self.store
            .update_segment_conditions(ctx, segment_id, conditions)
            .await?
            .ok_or(DispatchError::NotFound("segment"))
    }

    pub async fn match_count(&self, segment: &Segment) -> Result<i64> {
        let predicate = self.evaluate(&segment.conditions, TenantContext::for_row(segment.tenant_id))?;
        self.store.count_matching_users(&predicate).await
    }

    /// Lazily pages through matching user ids in id order.
    ///
    /// Every call starts a fresh evaluation, so the stream can be restarted
    /// by calling this again.
    pub fn matching_user_ids<'a>(
        &'a self,
        segment: &'a Segment,
    ) -> impl Stream<Item = Result<Uuid>> + Send + 'a {
        try_stream! {
            let predicate = self
                .evaluate(&segment.conditions, TenantContext::for_row(segment.tenant_id))
                .map_err(DispatchError::from)?;
            let mut after: Option<Uuid> = None;
            loop {
                let page = self
                    .store
                    .matching_user_ids(&predicate, after, self.page_size)
                    .await?;
                let exhausted = (page.len() as i64) < self.page_size;
                after = page.last().copied();
                for id in page {
                    yield id;
                }
                if exhausted || after.is_none() {
                    break;
                }
            }
        }
    }

    /// Recomputes the match count and stores it together with its timestamp.
    pub async fn refresh_cached_count(&self, segment: &Segment) -> Result<Segment> {
        let count = self.match_count(segment).await?;
        let refreshed = self
            .store
            .set_segment_count(segment.id, count, OffsetDateTime::now_utc())
            .await?
            .ok_or(DispatchError::NotFound("segment"))?;
        debug!(segment_id = %segment.id, count, "Refreshed cached segment count");
        Ok(refreshed)
    }
}

//! # Mesh Core
//!
//! Core types for TupleMesh, a distributed CRUD router in front of a
//! horizontally-partitioned tuple store.
//!
//! This crate provides the fundamental building blocks:
//! - [`BucketId`] and [`PartitionId`] - Type-safe routing identifiers
//! - [`Value`] - Schema-flexible field values
//! - [`Tuple`] - An ordered array of values, one row of a space
//! - [`Condition`] - A single filter predicate for reads
//! - [`UpdateOp`] - A single field mutation for update/upsert

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// =============================================================================
// Identifiers (Newtypes for type safety)
// =============================================================================

/// The routing key of a tuple, computed from its sharding key.
///
/// Buckets form a fixed-size virtual key space that the partition map
/// assigns to physical partitions. Uses a newtype pattern to prevent
/// mixing bucket ids up with other integer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BucketId(pub u32);

impl BucketId {
    /// Creates a new BucketId from a u32.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl From<u32> for BucketId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A unique identifier for one physical partition of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Creates a new PartitionId from a u32.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl From<u32> for PartitionId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// =============================================================================
// Values
// =============================================================================

/// A field value stored in a tuple.
///
/// Supports the primitive types of the wire format:
/// - Null, Bool, Int, Float, Str
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// Null/missing value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    Str(String),
}

impl Value {
    /// Returns true if the value is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Attempts to get the value as a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to get the value as an i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to get the value as an f64.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Attempts to get the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

// =============================================================================
// Value Comparison
// =============================================================================

/// Compares two values for ordering purposes (index keys, merge order).
///
/// Returns `Ordering::Equal` for incompatible types.
/// Null values sort before non-null values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        // Null handling
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less, // Nulls sort first
        (_, Value::Null) => Ordering::Greater,

        // Same-type comparisons
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),

        // Cross-type numeric comparisons
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),

        // Incompatible types are equal
        _ => Ordering::Equal,
    }
}

/// Compares two composite keys field by field.
///
/// Shorter keys compare equal to longer keys on their common prefix,
/// which makes partial key bounds match every extension of the prefix.
pub fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match compare_values(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Checks if two values are equal.
///
/// Handles cross-type numeric comparisons (Int vs Float).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => (a - b).abs() < f64::EPSILON,
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
            ((*a as f64) - b).abs() < f64::EPSILON
        }
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => false,
    }
}

// =============================================================================
// Tuples
// =============================================================================

/// One row of a space: an ordered array of values.
///
/// One schema-designated slot holds the routing bucket id; the router
/// injects it on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    /// Creates a tuple from a value vector.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the tuple has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value at a field position.
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.0.get(position)
    }

    /// Overwrites the value at an existing field position.
    ///
    /// Returns false if the position is out of range.
    pub fn set(&mut self, position: usize, value: Value) -> bool {
        match self.0.get_mut(position) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Inserts a value at a position, shifting later fields right.
    pub fn insert(&mut self, position: usize, value: Value) {
        self.0.insert(position, value);
    }

    /// Returns the underlying values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Consumes the tuple and returns its values.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Extracts the values at the given positions, in order.
    pub fn project(&self, positions: &[usize]) -> Option<Vec<Value>> {
        positions.iter().map(|&p| self.0.get(p).cloned()).collect()
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

/// Builds a tuple from anything convertible to values.
///
/// ```
/// use mesh_core::{tuple, Value};
///
/// let t = tuple![1i64, "alice", 30i64];
/// assert_eq!(t.get(1), Some(&Value::from("alice")));
/// ```
#[macro_export]
macro_rules! tuple {
    ($($v:expr),* $(,)?) => {
        $crate::Tuple::new(vec![$($crate::Value::from($v)),*])
    };
}

// =============================================================================
// Conditions
// =============================================================================

/// Comparison operator of a read condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOp {
    /// `=`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl fmt::Display for ConditionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionOp::Eq => "=",
            ConditionOp::Gt => ">",
            ConditionOp::Ge => ">=",
            ConditionOp::Lt => "<",
            ConditionOp::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// A single filter predicate: `field <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Comparison operator.
    pub op: ConditionOp,
    /// Field name the condition applies to.
    pub field: String,
    /// Right-hand-side value.
    pub value: Value,
}

impl Condition {
    /// Creates a condition.
    pub fn new(op: ConditionOp, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op,
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field = value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(ConditionOp::Eq, field, value)
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(ConditionOp::Gt, field, value)
    }

    /// `field >= value`
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(ConditionOp::Ge, field, value)
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(ConditionOp::Lt, field, value)
    }

    /// `field <= value`
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(ConditionOp::Le, field, value)
    }

    /// Evaluates the condition against a candidate field value.
    pub fn matches(&self, candidate: &Value) -> bool {
        match self.op {
            ConditionOp::Eq => values_equal(candidate, &self.value),
            ConditionOp::Gt => compare_values(candidate, &self.value) == Ordering::Greater,
            ConditionOp::Ge => compare_values(candidate, &self.value) != Ordering::Less,
            ConditionOp::Lt => compare_values(candidate, &self.value) == Ordering::Less,
            ConditionOp::Le => compare_values(candidate, &self.value) != Ordering::Greater,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.value)
    }
}

// =============================================================================
// Update Operations
// =============================================================================

/// Errors raised when applying an update operation to a tuple.
#[derive(Debug, Clone, Error)]
pub enum UpdateError {
    /// Arithmetic update against a non-numeric field value.
    #[error("cannot apply arithmetic update to non-numeric value in field `{field}`")]
    NotNumeric { field: String },
}

/// A single field mutation used by `update` and `upsert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOp {
    /// `field = value`
    Assign { field: String, value: Value },
    /// `field += value` (numeric)
    Add { field: String, value: Value },
    /// `field -= value` (numeric)
    Sub { field: String, value: Value },
}

impl UpdateOp {
    /// Creates an assignment op.
    pub fn assign(field: impl Into<String>, value: impl Into<Value>) -> Self {
        UpdateOp::Assign {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates an addition op.
    pub fn add(field: impl Into<String>, value: impl Into<Value>) -> Self {
        UpdateOp::Add {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates a subtraction op.
    pub fn sub(field: impl Into<String>, value: impl Into<Value>) -> Self {
        UpdateOp::Sub {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Returns the name of the field the op mutates.
    pub fn field(&self) -> &str {
        match self {
            UpdateOp::Assign { field, .. }
            | UpdateOp::Add { field, .. }
            | UpdateOp::Sub { field, .. } => field,
        }
    }

    /// Applies the op to the value at `position` of `tuple`.
    pub fn apply(&self, tuple: &mut Tuple, position: usize) -> Result<(), UpdateError> {
        let current = tuple.get(position).cloned().unwrap_or(Value::Null);
        let next = match self {
            UpdateOp::Assign { value, .. } => value.clone(),
            UpdateOp::Add { field, value } => arith(&current, value, field, |a, b| a + b)?,
            UpdateOp::Sub { field, value } => arith(&current, value, field, |a, b| a - b)?,
        };
        tuple.set(position, next);
        Ok(())
    }
}

fn arith(
    current: &Value,
    operand: &Value,
    field: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, UpdateError> {
    match (current, operand) {
        (Value::Int(a), Value::Int(b)) => {
            let r = f(*a as f64, *b as f64);
            Ok(Value::Int(r as i64))
        }
        (a, b) => {
            let (x, y) = match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err(UpdateError::NotNumeric {
                        field: field.to_string(),
                    })
                }
            };
            Ok(Value::Float(f(x, y)))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

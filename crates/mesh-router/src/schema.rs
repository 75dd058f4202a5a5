//! Space schemas and the process-local schema cache.
//!
//! A space schema describes the ordered, named, typed fields of a
//! collection, its primary key order, its secondary indexes and the
//! dedicated bucket field. Schemas are fetched from cluster metadata,
//! cached per process, and invalidated when a partition reports the
//! cached version is stale.

use crate::error::{RouterError, StorageError};
use crate::storage::{StorageBackend, PRIMARY_INDEX};
use dashmap::DashMap;
use mesh_core::{Tuple, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Field type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Any value accepted.
    Any,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    Str,
}

/// One named, typed field of a space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Whether null is accepted.
    pub nullable: bool,
}

impl FieldDef {
    /// Creates a non-nullable field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    /// Marks the field nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A secondary index over one or more fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Ordered field names forming the index key.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexDef {
    /// Creates a non-unique ordered index.
    pub fn new(name: impl Into<String>, fields: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(String::from).collect(),
            unique: false,
        }
    }
}

/// Schema of one space: ordered fields, primary key, secondary indexes,
/// the bucket field, and a version acting as the schema fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceSchema {
    /// Space name.
    pub name: String,
    /// Ordered field definitions. Tuple arity must match.
    pub fields: Vec<FieldDef>,
    /// Ordered primary-key field names.
    pub primary_key: Vec<String>,
    /// Secondary indexes.
    pub indexes: Vec<IndexDef>,
    /// Name of the field holding the routing bucket id.
    pub bucket_field: String,
    /// Schema fingerprint; bumped on every schema change.
    pub version: u64,
}

impl SpaceSchema {
    /// Returns the position of a field by name.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns the position of the bucket field, if the schema has one.
    pub fn bucket_position(&self) -> Option<usize> {
        self.field_position(&self.bucket_field)
    }

    /// Resolves a list of field names to positions.
    pub fn positions_of(&self, names: &[String]) -> Result<Vec<usize>, RouterError> {
        names
            .iter()
            .map(|n| {
                self.field_position(n).ok_or_else(|| {
                    RouterError::Validation(format!(
                        "space `{}` has no field `{}`",
                        self.name, n
                    ))
                })
            })
            .collect()
    }

    /// Positions of the primary-key fields, in key order.
    pub fn primary_key_positions(&self) -> Result<Vec<usize>, RouterError> {
        self.positions_of(&self.primary_key)
    }

    /// Returns the key fields of an index by name; the primary key for
    /// [`PRIMARY_INDEX`].
    pub fn index_fields(&self, index: &str) -> Option<&[String]> {
        if index == PRIMARY_INDEX {
            return Some(&self.primary_key);
        }
        self.indexes
            .iter()
            .find(|i| i.name == index)
            .map(|i| i.fields.as_slice())
    }

    /// Extracts the named key values from a tuple.
    pub fn extract_key(&self, tuple: &Tuple, fields: &[String]) -> Result<Vec<Value>, RouterError> {
        let positions = self.positions_of(fields)?;
        tuple.project(&positions).ok_or_else(|| {
            RouterError::Validation(format!(
                "tuple has {} fields, space `{}` key needs position {}",
                tuple.len(),
                self.name,
                positions.iter().max().copied().unwrap_or(0)
            ))
        })
    }

    /// Flattens a named record into a tuple in schema field order.
    ///
    /// Absent fields become null; the bucket field may be omitted. Nested
    /// arrays and objects are rejected.
    pub fn tuple_from_object(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Tuple, RouterError> {
        for key in object.keys() {
            if self.field_position(key).is_none() {
                return Err(RouterError::Validation(format!(
                    "space `{}` has no field `{}`",
                    self.name, key
                )));
            }
        }
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match object.get(&field.name) {
                None | Some(serde_json::Value::Null) => Value::Null,
                Some(serde_json::Value::Bool(b)) => Value::Bool(*b),
                Some(serde_json::Value::Number(n)) => {
                    if let Some(i) = n.as_i64() {
                        Value::Int(i)
                    } else if let Some(f) = n.as_f64() {
                        Value::Float(f)
                    } else {
                        return Err(RouterError::Validation(format!(
                            "field `{}`: unrepresentable number",
                            field.name
                        )));
                    }
                }
                Some(serde_json::Value::String(s)) => Value::Str(s.clone()),
                Some(other) => {
                    return Err(RouterError::Validation(format!(
                        "field `{}`: unsupported value {}",
                        field.name, other
                    )));
                }
            };
            values.push(value);
        }
        Ok(Tuple::new(values))
    }

    /// Renders a tuple as a named record in schema field order.
    pub fn object_from_tuple(&self, tuple: &Tuple) -> serde_json::Map<String, serde_json::Value> {
        let mut object = serde_json::Map::new();
        for (i, field) in self.fields.iter().enumerate() {
            let value = match tuple.get(i) {
                None | Some(Value::Null) => serde_json::Value::Null,
                Some(Value::Bool(b)) => serde_json::Value::Bool(*b),
                Some(Value::Int(n)) => serde_json::Value::Number((*n).into()),
                Some(Value::Float(f)) => serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
                Some(Value::Str(s)) => serde_json::Value::String(s.clone()),
            };
            object.insert(field.name.clone(), value);
        }
        object
    }
}

/// Projects rows down to the requested fields, in requested order.
///
/// Merge and pagination always run on full tuples; this is the
/// post-processing step that strips them.
pub fn cut_rows(
    rows: Vec<Tuple>,
    schema: &SpaceSchema,
    fields: &[String],
) -> Result<Vec<Tuple>, RouterError> {
    let positions = schema.positions_of(fields)?;
    rows.into_iter()
        .map(|row| {
            row.project(&positions).map(Tuple::new).ok_or_else(|| {
                RouterError::Validation(format!(
                    "row of space `{}` is too short for projection",
                    schema.name
                ))
            })
        })
        .collect()
}

/// Projects rows into named records carrying only the requested fields.
pub fn cut_objects(
    rows: &[Tuple],
    schema: &SpaceSchema,
    fields: &[String],
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, RouterError> {
    schema.positions_of(fields)?;
    Ok(rows
        .iter()
        .map(|row| {
            let mut full = schema.object_from_tuple(row);
            let mut cut = serde_json::Map::new();
            for field in fields {
                if let Some(v) = full.remove(field) {
                    cut.insert(field.clone(), v);
                }
            }
            cut
        })
        .collect())
}

/// Process-local cache of space schemas, keyed by space name.
///
/// Entries are fetched on first use and dropped by [`SchemaCache::invalidate`]
/// when a partition reports the cached version is stale. The cache is owned
/// by the router instance, not a hidden singleton, so invalidation is
/// independently testable.
#[derive(Debug, Default)]
pub struct SchemaCache {
    spaces: DashMap<String, Arc<SpaceSchema>>,
}

impl SchemaCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached schema, fetching it from cluster metadata on miss.
    pub async fn get<B: StorageBackend>(
        &self,
        backend: &B,
        space: &str,
        timeout: Duration,
    ) -> Result<Arc<SpaceSchema>, RouterError> {
        if let Some(schema) = self.spaces.get(space) {
            return Ok(Arc::clone(&schema));
        }
        let schema = match backend.fetch_schema(space, timeout).await {
            Ok(schema) => Arc::new(schema),
            Err(StorageError::SpaceNotFound { space }) => {
                return Err(RouterError::UnknownSpace { space })
            }
            Err(e) => return Err(RouterError::MetadataFetch {
                message: e.to_string(),
            }),
        };
        self.spaces.insert(space.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Drops the cached entry for one space.
    pub fn invalidate(&self, space: &str) {
        self.spaces.remove(space);
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.spaces.clear();
    }

    /// Number of cached schemas.
    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

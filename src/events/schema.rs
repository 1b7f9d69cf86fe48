//! # Event schemas and the validator gating the bus.
//!
//! Every event name published on the [`Bus`](crate::Bus) must have exactly one
//! registered [`Schema`]. A schema lists the required payload fields with their
//! [`FieldShape`] and states whether a [`CorrelationKey`] is mandatory.
//!
//! [`Validator::validate`] is pure: it never mutates the payload and never
//! touches the subscription table.
//!
//! ## Example
//! ```rust
//! use pipevisor::{FieldShape, Schema, Validator, ValidationError};
//! use serde_json::{Map, json};
//!
//! let mut validator = Validator::new();
//! validator
//!     .register("Ping", Schema::new().field("count", FieldShape::Integer))
//!     .unwrap();
//!
//! let mut payload = Map::new();
//! payload.insert("count".into(), json!("three"));
//! let err = validator.validate("Ping", &payload, None).unwrap_err();
//! assert!(matches!(err, ValidationError::SchemaMismatch { .. }));
//! ```

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use super::event::{CorrelationKey, Payload};
use crate::error::ValidationError;

/// Expected shape of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldShape {
    /// JSON string.
    String,
    /// JSON number without fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Any value, including `null`; only presence is checked.
    Any,
}

impl FieldShape {
    /// True when `value` has this shape.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldShape::String => value.is_string(),
            FieldShape::Integer => value.is_i64() || value.is_u64(),
            FieldShape::Number => value.is_number(),
            FieldShape::Bool => value.is_boolean(),
            FieldShape::Array => value.is_array(),
            FieldShape::Object => value.is_object(),
            FieldShape::Any => true,
        }
    }
}

impl fmt::Display for FieldShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldShape::String => "a string",
            FieldShape::Integer => "an integer",
            FieldShape::Number => "a number",
            FieldShape::Bool => "a boolean",
            FieldShape::Array => "an array",
            FieldShape::Object => "an object",
            FieldShape::Any => "present",
        };
        f.write_str(s)
    }
}

/// Required fields of one event name.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, FieldShape)>,
    correlated: bool,
}

impl Schema {
    /// Empty schema: no required field, no correlation key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    pub fn field(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.fields.push((name.into(), shape));
        self
    }

    /// Requires a correlation key on every event of this name.
    pub fn correlated(mut self) -> Self {
        self.correlated = true;
        self
    }

    /// Required fields in declaration order.
    pub fn fields(&self) -> &[(String, FieldShape)] {
        &self.fields
    }

    /// True when a correlation key is required.
    pub fn is_correlated(&self) -> bool {
        self.correlated
    }
}

/// Registry of schemas, one per event name.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    schemas: HashMap<String, Schema>,
}

impl Validator {
    /// Creates an empty validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `schema` under `name`.
    ///
    /// Fails with [`ValidationError::DuplicateSchema`] if `name` is already taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: Schema,
    ) -> Result<&mut Self, ValidationError> {
        let name = name.into();
        if self.schemas.contains_key(&name) {
            return Err(ValidationError::DuplicateSchema { event: name });
        }
        self.schemas.insert(name, schema);
        Ok(self)
    }

    /// True when a schema exists for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Schema registered for `name`.
    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    /// Checks `payload` against the schema registered for `name`.
    ///
    /// Returns the payload unchanged on success. Fields are checked in
    /// declaration order; the first offending field is reported.
    pub fn validate<'p>(
        &self,
        name: &str,
        payload: &'p Payload,
        correlation_key: Option<&CorrelationKey>,
    ) -> Result<&'p Payload, ValidationError> {
        let schema = self
            .schemas
            .get(name)
            .ok_or_else(|| ValidationError::UnknownEventName {
                event: name.to_string(),
            })?;

        for (field, shape) in &schema.fields {
            let ok = payload.get(field).is_some_and(|v| shape.matches(v));
            if !ok {
                return Err(ValidationError::SchemaMismatch {
                    event: name.to_string(),
                    field: field.clone(),
                    expected: *shape,
                });
            }
        }

        if schema.correlated && correlation_key.is_none() {
            return Err(ValidationError::MissingCorrelationKey {
                event: name.to_string(),
            });
        }
        Ok(payload)
    }
}

/// Builds a validator from `(name, schema)` pairs; a repeated name keeps the last schema.
impl<N: Into<String>> FromIterator<(N, Schema)> for Validator {
    fn from_iter<I: IntoIterator<Item = (N, Schema)>>(iter: I) -> Self {
        Self {
            schemas: iter.into_iter().map(|(name, schema)| (name.into(), schema)).collect(),
        }
    }
}

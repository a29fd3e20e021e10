//! Operation contracts.
//!
//! The engine never looks inside an operation. It moves [`OperationSpec`]
//! records around, and relies on an [`OperationFactory`] to turn specs into
//! executable operations and on a [`Playback`] to apply them to the live
//! document.

use crate::{MemberId, PlaybackError, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the operation type.
pub const OPTYPE_FIELD: &str = "optype";
/// Field holding the id of the member that created the operation.
pub const MEMBER_ID_FIELD: &str = "memberid";
/// Field holding the local application time, in milliseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Serialized form of one document mutation.
///
/// A plain JSON object. Only `optype`, `memberid` and `timestamp` have a
/// meaning at this layer; everything else belongs to the operation type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationSpec(Map<String, Value>);

impl OperationSpec {
    /// Create a spec with the given type and creator.
    pub fn new(optype: impl Into<String>, member_id: impl Into<MemberId>) -> Self {
        let mut fields = Map::new();
        fields.insert(OPTYPE_FIELD.into(), Value::String(optype.into()));
        fields.insert(MEMBER_ID_FIELD.into(), Value::String(member_id.into()));
        Self(fields)
    }

    /// Wrap an existing JSON object.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value, if it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// The operation type, or an empty string if the spec has none.
    pub fn optype(&self) -> &str {
        self.0
            .get(OPTYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The member that created the operation.
    pub fn member_id(&self) -> Option<&str> {
        self.0.get(MEMBER_ID_FIELD).and_then(Value::as_str)
    }

    /// Local application time, if stamped.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.0.get(TIMESTAMP_FIELD).and_then(Value::as_u64)
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.0.insert(TIMESTAMP_FIELD.into(), Value::from(timestamp));
    }

    /// Get a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a non-negative integer field.
    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.0
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
    }

    /// Get a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Set a field, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// An executable document mutation.
pub trait Operation {
    /// Serialize to a spec that the factory can turn back into an equal
    /// operation.
    fn spec(&self) -> OperationSpec;

    /// Whether the operation modifies document content, as opposed to
    /// session bookkeeping such as members or cursors.
    fn is_edit(&self) -> bool;
}

/// Creates operations from specs.
pub trait OperationFactory {
    type Op: Operation;

    /// Returns `None` for an unknown or invalid spec.
    fn create(&self, spec: &OperationSpec) -> Option<Self::Op>;
}

/// Applies operations to the live document.
pub trait Playback<O> {
    fn play(&mut self, op: &O) -> Result<(), PlaybackError>;
}

impl<O, F> Playback<O> for F
where
    F: FnMut(&O) -> Result<(), PlaybackError>,
{
    fn play(&mut self, op: &O) -> Result<(), PlaybackError> {
        self(op)
    }
}

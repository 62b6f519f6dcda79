//! Payload schema for staged objects.
//!
//! Staging moves objects between environments with different databases, so
//! numeric ids differ on each side. A staged object payload lists the
//! fields of the object plus every field that references another object.
//! Before sending, the staging manager rewrites each reference to the id
//! the target environment knows.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A foreign-key style reference from one staged object to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Field of the referencing object that holds the id.
    pub field: String,
    /// Object type of the referenced object.
    pub object_type: String,
    /// Id of the referenced object in the source environment.
    pub source_id: i64,
}

/// Field values of an object plus its outgoing references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPayload {
    /// Source-environment id of the object itself, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
    /// Field values.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    /// References that must be translated before the object is applied.
    #[serde(default)]
    pub references: Vec<ObjectReference>,
}

impl ObjectPayload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source id.
    pub fn with_source_id(mut self, id: i64) -> Self {
        self.source_id = Some(id);
        self
    }

    /// Sets a field value.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Adds a reference and stores the source id in the field.
    pub fn with_reference(
        mut self,
        field: impl Into<String>,
        object_type: impl Into<String>,
        source_id: i64,
    ) -> Self {
        let field = field.into();
        self.fields.insert(field.clone(), serde_json::Value::from(source_id));
        self.references.push(ObjectReference {
            field,
            object_type: object_type.into(),
            source_id,
        });
        self
    }

    /// Replaces each referenced field with the id returned by `translate`.
    ///
    /// Stops at the first reference `translate` cannot resolve and returns
    /// it; the payload is left partially rewritten in that case.
    pub fn rewrite_references<F>(&mut self, mut translate: F) -> Result<(), ObjectReference>
    where
        F: FnMut(&ObjectReference) -> Option<i64>,
    {
        for reference in &self.references {
            let target_id = translate(reference).ok_or_else(|| reference.clone())?;
            self.fields
                .insert(reference.field.clone(), serde_json::Value::from(target_id));
        }
        Ok(())
    }

    /// Encodes as JSON bytes.
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::invalid_payload(format!("object payload: {e}")))
    }
}

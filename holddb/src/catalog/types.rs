use crate::sql::StorageType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Surrogate key of a collection. Assigned by the catalog, never reused.
pub type CollectionId = i64;

/// Natural key of a collection, usable before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        CollectionSpec {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Spec in the default (empty) namespace.
    pub fn named(name: impl Into<String>) -> Self {
        CollectionSpec::new(name, "")
    }

    /// Physical table backing this collection. Namespaced collections are
    /// prefixed so equal names in different namespaces get distinct tables.
    pub fn table_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}__{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

/// The fixed set of scalar field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Int,
    Float,
    String,
    Boolean,
    #[serde(rename = "ID")]
    Id,
}

impl ScalarType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Int" => Some(ScalarType::Int),
            "Float" => Some(ScalarType::Float),
            "String" => Some(ScalarType::String),
            "Boolean" => Some(ScalarType::Boolean),
            "ID" => Some(ScalarType::Id),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::Int => "Int",
            ScalarType::Float => "Float",
            ScalarType::String => "String",
            ScalarType::Boolean => "Boolean",
            ScalarType::Id => "ID",
        }
    }

    pub fn storage_type(self) -> StorageType {
        match self {
            ScalarType::String => StorageType::Text,
            ScalarType::Boolean | ScalarType::Int | ScalarType::Id => StorageType::Integer,
            ScalarType::Float => StorageType::Real,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field of a collection: either a scalar column or a reference column
/// holding the id of a row in another collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionField {
    pub name: String,
    /// Scalar type tag, or the referenced type's name for reference fields.
    #[serde(rename = "type")]
    pub field_type: String,
    /// 0 for scalar fields, otherwise the referenced collection id.
    #[serde(rename = "ref", default)]
    pub reference: CollectionId,
    #[serde(default)]
    pub is_list: bool,
}

impl CollectionField {
    pub fn scalar(name: impl Into<String>, scalar: ScalarType, is_list: bool) -> Self {
        CollectionField {
            name: name.into(),
            field_type: scalar.as_str().to_string(),
            reference: 0,
            is_list,
        }
    }

    pub fn reference(
        name: impl Into<String>,
        type_name: impl Into<String>,
        reference: CollectionId,
        is_list: bool,
    ) -> Self {
        CollectionField {
            name: name.into(),
            field_type: type_name.into(),
            reference,
            is_list,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.reference != 0
    }

    pub fn scalar_type(&self) -> Option<ScalarType> {
        if self.is_reference() {
            None
        } else {
            ScalarType::from_name(&self.field_type)
        }
    }

    /// Column type in the record store. Reference columns hold row ids.
    pub fn storage_type(&self) -> StorageType {
        match self.scalar_type() {
            Some(scalar) => scalar.storage_type(),
            None if self.is_reference() => StorageType::Integer,
            None => StorageType::Text,
        }
    }
}

/// A catalog entry: a logical type plus the physical table backing it.
///
/// `fields` may be a subset of the collection's fields when the collection was
/// loaded through one of the batched field lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub table: String,
    pub fields: BTreeMap<String, CollectionField>,
}

impl Collection {
    /// A not-yet-inserted collection (id 0) for `spec`.
    pub fn new(spec: &CollectionSpec, version: impl Into<String>) -> Self {
        Collection {
            id: 0,
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            version: version.into(),
            table: spec.table_name(),
            fields: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> CollectionSpec {
        CollectionSpec::new(self.name.clone(), self.namespace.clone())
    }

    pub fn add_field(&mut self, field: CollectionField) {
        self.fields.insert(field.name.clone(), field);
    }

    /// Fold the fields of `other` (same collection, possibly a different
    /// subset) into `self`.
    pub fn merge_fields(&mut self, other: Collection) {
        self.fields.extend(other.fields);
    }
}

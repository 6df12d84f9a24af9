// ABOUTME: Target table schema model - ordered column specs with optional remote provenance
// ABOUTME: Derives createable/updateable field sets and enforces unique column names

use super::field::ObjectFieldDescriptor;
use super::types::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a column's remote value is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldResolution {
    /// Value lives directly on the object.
    Plain,
    /// Foreign key into another object; typed after that object's id field.
    Reference {
        target_object: String,
        target_field: String,
    },
    /// Read-only formula `relationship.field` pulled from a related object.
    Calculated {
        relationship: String,
        target_object: String,
        target_field: String,
    },
}

/// Remote provenance of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSource {
    pub object: String,
    pub descriptor: ObjectFieldDescriptor,
    pub resolution: FieldResolution,
    pub effective_type: FieldType,
    pub can_create: bool,
    pub can_update: bool,
}

impl FieldSource {
    /// Remote field name in its original casing.
    pub fn remote_name(&self) -> &str {
        &self.descriptor.name
    }

    /// Key under which an outbound value must be nested, if it does not
    /// belong to the object itself.
    pub fn nested_under(&self) -> Option<&str> {
        match &self.resolution {
            FieldResolution::Calculated { relationship, .. } => Some(relationship.as_str()),
            _ => None,
        }
    }
}

/// One column of a target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: String,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub default_sequence: bool,
    #[serde(default)]
    pub default_now: bool,
    #[serde(default)]
    pub create_index: bool,
    #[serde(default)]
    pub create_unique_index: bool,
    #[serde(default)]
    pub source: Option<FieldSource>,
}

impl ColumnSpec {
    pub fn local(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            column_type: column_type.into(),
            not_null: false,
            primary_key: false,
            default_sequence: false,
            default_now: false,
            create_index: false,
            create_unique_index: false,
            source: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.source.is_some()
    }

    pub fn can_create(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.can_create)
    }

    pub fn can_update(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.can_update)
    }
}

/// A column every synchronized table carries, declared once in configuration.
///
/// Remote common fields (`Id`, `SystemModstamp`, ...) are resolved against the
/// describe output like configured fields; local ones (`_sync_status`, ...)
/// become columns directly and need a `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub default_sequence: bool,
    #[serde(default)]
    pub default_now: bool,
    #[serde(default)]
    pub create_index: bool,
    #[serde(default)]
    pub create_unique_index: bool,
}

impl CommonField {
    pub fn remote(name: &str) -> Self {
        Self::base(name, None)
    }

    fn base(name: &str, column_type: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            column_type: column_type.map(str::to_string),
            remote: column_type.is_none(),
            not_null: false,
            primary_key: false,
            default_sequence: false,
            default_now: false,
            create_index: false,
            create_unique_index: false,
        }
    }

    /// Column spec for a non-remote common field.
    pub fn to_local_column(&self) -> ColumnSpec {
        ColumnSpec {
            not_null: self.not_null,
            primary_key: self.primary_key,
            default_sequence: self.default_sequence,
            default_now: self.default_now,
            create_index: self.create_index,
            create_unique_index: self.create_unique_index,
            ..ColumnSpec::local(&self.name, self.column_type.clone().unwrap_or_default())
        }
    }
}

pub const SYNC_ID: &str = "_sync_id";
pub const SYNC_STATUS: &str = "_sync_status";
pub const SYNC_MESSAGE: &str = "_sync_message";
pub const SYNC_UPDATE_TIMESTAMP: &str = "_sync_update_timestamp";

/// Common fields used when configuration does not declare any.
pub fn default_common_fields() -> Vec<CommonField> {
    vec![
        CommonField {
            not_null: true,
            primary_key: true,
            default_sequence: true,
            ..CommonField::base(SYNC_ID, Some("integer"))
        },
        CommonField {
            create_index: true,
            ..CommonField::base(SYNC_STATUS, Some("varchar(20)"))
        },
        CommonField::base(SYNC_MESSAGE, Some("text")),
        CommonField {
            default_now: true,
            ..CommonField::base(SYNC_UPDATE_TIMESTAMP, Some("timestamp"))
        },
        CommonField::remote("Id"),
        CommonField::remote("IsDeleted"),
        CommonField::remote("CreatedDate"),
        CommonField::remote("SystemModstamp"),
    ]
}

/// Ordered, name-unique column list for one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub object: String,
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    /// Build a schema, keeping the first column for every repeated name.
    pub fn new(object: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        let object = object.into();
        let mut seen = HashSet::new();
        let columns = columns
            .into_iter()
            .filter(|c| seen.insert(c.name.clone()))
            .collect();
        Self {
            table: object.to_lowercase(),
            object,
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        let name = name.to_lowercase();
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn remote_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.is_remote())
    }

    pub fn createable_columns(&self) -> Vec<&ColumnSpec> {
        self.columns.iter().filter(|c| c.can_create()).collect()
    }

    pub fn updateable_columns(&self) -> Vec<&ColumnSpec> {
        self.columns.iter().filter(|c| c.can_update()).collect()
    }
}

// ABOUTME: Field type mapper - translates remote field types into PostgreSQL column types
// ABOUTME: Total mapping: unknown remote types pass through unchanged

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a remote field as reported by the describe API.
///
/// Unknown types are kept verbatim in [`FieldType::Other`] so new remote
/// types degrade gracefully instead of failing reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    Id,
    Reference,
    String,
    Textarea,
    Picklist,
    Multipicklist,
    Combobox,
    Phone,
    Url,
    Boolean,
    Int,
    Double,
    Currency,
    Percent,
    Date,
    Datetime,
    Email,
    Other(std::string::String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Id => "id",
            FieldType::Reference => "reference",
            FieldType::String => "string",
            FieldType::Textarea => "textarea",
            FieldType::Picklist => "picklist",
            FieldType::Multipicklist => "multipicklist",
            FieldType::Combobox => "combobox",
            FieldType::Phone => "phone",
            FieldType::Url => "url",
            FieldType::Boolean => "boolean",
            FieldType::Int => "int",
            FieldType::Double => "double",
            FieldType::Currency => "currency",
            FieldType::Percent => "percent",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Email => "email",
            FieldType::Other(other) => other.as_str(),
        }
    }

    /// Whether values of this type are sent to the remote as JSON numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Int | FieldType::Double | FieldType::Currency | FieldType::Percent
        )
    }
}

impl From<std::string::String> for FieldType {
    fn from(value: std::string::String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "id" => FieldType::Id,
            "reference" => FieldType::Reference,
            "string" => FieldType::String,
            "textarea" => FieldType::Textarea,
            "picklist" => FieldType::Picklist,
            "multipicklist" => FieldType::Multipicklist,
            "combobox" => FieldType::Combobox,
            "phone" => FieldType::Phone,
            "url" => FieldType::Url,
            "boolean" => FieldType::Boolean,
            "int" => FieldType::Int,
            "double" => FieldType::Double,
            "currency" => FieldType::Currency,
            "percent" => FieldType::Percent,
            "date" => FieldType::Date,
            "datetime" => FieldType::Datetime,
            "email" => FieldType::Email,
            _ => FieldType::Other(value),
        }
    }
}

impl From<&str> for FieldType {
    fn from(value: &str) -> Self {
        FieldType::from(value.to_string())
    }
}

impl From<FieldType> for std::string::String {
    fn from(value: FieldType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a remote field type to the PostgreSQL column type used in the staging table.
pub fn map_type(declared: &FieldType) -> String {
    match declared {
        FieldType::Id | FieldType::Reference => "varchar(18)".to_string(),
        FieldType::String
        | FieldType::Textarea
        | FieldType::Picklist
        | FieldType::Multipicklist
        | FieldType::Combobox
        | FieldType::Phone
        | FieldType::Url => "text".to_string(),
        FieldType::Boolean => "boolean".to_string(),
        FieldType::Int => "integer".to_string(),
        FieldType::Double | FieldType::Currency | FieldType::Percent => {
            "double precision".to_string()
        }
        FieldType::Date => "date".to_string(),
        FieldType::Datetime => "timestamp".to_string(),
        FieldType::Email => "varchar(255)".to_string(),
        FieldType::Other(other) => other.clone(),
    }
}

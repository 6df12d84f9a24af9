// ABOUTME: Remote field descriptors as returned by the describe API
// ABOUTME: Case-insensitive lookup over an object's fields and formula parsing helpers

use super::types::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata for one field of a remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub declared_type: FieldType,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default)]
    pub createable: bool,
    #[serde(default)]
    pub updateable: bool,
    #[serde(default)]
    pub calculated: bool,
    #[serde(default)]
    pub calculated_formula: Option<String>,
    #[serde(default)]
    pub reference_to: Vec<String>,
    #[serde(default)]
    pub relationship_name: Option<String>,
}

impl ObjectFieldDescriptor {
    /// Build a plain descriptor with every capability switched off.
    pub fn new(name: impl Into<String>, declared_type: FieldType) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            declared_type,
            unique: false,
            filterable: false,
            sortable: false,
            createable: false,
            updateable: false,
            calculated: false,
            calculated_formula: None,
            reference_to: Vec::new(),
            relationship_name: None,
        }
    }

    /// First object this field points at, for reference fields.
    pub fn reference_target(&self) -> Option<&str> {
        if self.declared_type != FieldType::Reference {
            return None;
        }
        self.reference_to.first().map(String::as_str)
    }

    pub fn is_calculated(&self) -> bool {
        self.calculated
            || self
                .calculated_formula
                .as_deref()
                .is_some_and(|f| !f.trim().is_empty())
    }

    pub fn column_name(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Split a formula of the form `Relationship.Field` into its two halves.
///
/// Anything else (arithmetic, functions, deeper paths) is not resolvable
/// and returns `None`.
pub fn parse_related_formula(formula: &str) -> Option<(String, String)> {
    let formula = formula.trim();
    let (relationship, field) = formula.split_once('.')?;
    let is_ident = |s: &str| {
        !s.is_empty()
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    };
    if is_ident(relationship) && is_ident(field) {
        Some((relationship.to_string(), field.to_string()))
    } else {
        None
    }
}

/// Custom relationship names end in `__r`; the object they point at ends in `__c`.
pub fn relationship_object(relationship: &str) -> String {
    match relationship.strip_suffix("__r") {
        Some(base) => format!("{}__c", base),
        None => relationship.to_string(),
    }
}

/// All fields of one remote object, indexed by lower-cased name.
#[derive(Debug, Clone)]
pub struct ObjectDescribe {
    object: String,
    fields: Vec<ObjectFieldDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ObjectDescribe {
    pub fn new(object: impl Into<String>, fields: Vec<ObjectFieldDescriptor>) -> Self {
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.to_lowercase(), i))
            .collect();
        Self {
            object: object.into(),
            fields,
            by_name,
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn fields(&self) -> &[ObjectFieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&ObjectFieldDescriptor> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|&i| &self.fields[i])
    }

    /// The record identifier field (`Id`, or whatever field declares type `id`).
    pub fn id_field(&self) -> Option<&ObjectFieldDescriptor> {
        self.field("id")
            .or_else(|| self.fields.iter().find(|f| f.declared_type == FieldType::Id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_deserializes_from_describe_json() {
        let json = r#"{
            "name": "AccountId",
            "type": "reference",
            "unique": false,
            "filterable": true,
            "sortable": true,
            "createable": true,
            "updateable": true,
            "calculated": false,
            "calculatedFormula": null,
            "referenceTo": ["Account"],
            "relationshipName": "Account",
            "label": "Account ID",
            "length": 18
        }"#;

        let descriptor: ObjectFieldDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.name, "AccountId");
        assert_eq!(descriptor.label, "Account ID");
        assert_eq!(descriptor.declared_type, FieldType::Reference);
        assert_eq!(descriptor.reference_target(), Some("Account"));
        assert_eq!(descriptor.relationship_name.as_deref(), Some("Account"));
        assert!(!descriptor.is_calculated());
        assert_eq!(descriptor.column_name(), "accountid");
    }

    #[test]
    fn test_parse_related_formula() {
        assert_eq!(
            parse_related_formula("Account.Name"),
            Some(("Account".to_string(), "Name".to_string()))
        );
        assert_eq!(
            parse_related_formula(" Owner__r.Region__c "),
            Some(("Owner__r".to_string(), "Region__c".to_string()))
        );
        assert_eq!(parse_related_formula("Amount * 2"), None);
        assert_eq!(parse_related_formula("Account.Owner.Name"), None);
        assert_eq!(parse_related_formula("TODAY()"), None);
    }

    #[test]
    fn test_relationship_object_rewrites_custom_suffix() {
        assert_eq!(relationship_object("Invoice__r"), "Invoice__c");
        assert_eq!(relationship_object("Account"), "Account");
    }

    #[test]
    fn test_describe_lookup_is_case_insensitive() {
        let describe = ObjectDescribe::new(
            "Widget",
            vec![
                ObjectFieldDescriptor::new("Id", FieldType::Id),
                ObjectFieldDescriptor::new("Price__c", FieldType::Currency),
            ],
        );

        assert_eq!(describe.field("price__C").unwrap().name, "Price__c");
        assert_eq!(describe.id_field().unwrap().name, "Id");
        assert!(describe.field("Missing").is_none());
    }
}

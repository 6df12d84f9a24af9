// ABOUTME: Schema reconciler - derives a TableSchema from remote describe output
// ABOUTME: Resolves reference and calculated fields through a per-run describe cache

use super::field::{parse_related_formula, relationship_object, ObjectDescribe, ObjectFieldDescriptor};
use super::table::{ColumnSpec, CommonField, FieldResolution, FieldSource, TableSchema};
use super::types::{map_type, FieldType};
use crate::error::{Result, SyncError};
use crate::remote::MetadataApi;
use crate::utils::validate_column_type;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Per-object overrides applied on top of the describe output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectRules {
    /// Fields dropped even when configured or listed as common.
    pub exclude: Vec<String>,
    /// Fields kept but never sent back to the remote.
    pub read_only: Vec<String>,
}

impl ObjectRules {
    fn is_excluded(&self, field: &str) -> bool {
        self.exclude.iter().any(|e| e.eq_ignore_ascii_case(field))
    }

    fn is_read_only(&self, field: &str) -> bool {
        self.read_only.iter().any(|e| e.eq_ignore_ascii_case(field))
    }
}

/// Builds table schemas for one reconciliation pass.
///
/// Describe calls are cached for the lifetime of the reconciler, so related
/// objects referenced by several fields are fetched once.
pub struct SchemaReconciler<'a> {
    metadata: &'a dyn MetadataApi,
    cache: HashMap<String, Arc<ObjectDescribe>>,
}

struct Resolved {
    resolution: FieldResolution,
    effective_type: FieldType,
    can_create: bool,
    can_update: bool,
}

impl<'a> SchemaReconciler<'a> {
    pub fn new(metadata: &'a dyn MetadataApi) -> Self {
        Self {
            metadata,
            cache: HashMap::new(),
        }
    }

    async fn describe(&mut self, object: &str) -> Result<Arc<ObjectDescribe>> {
        let key = object.to_lowercase();
        if let Some(describe) = self.cache.get(&key) {
            return Ok(describe.clone());
        }

        debug!("Describing {}", object);
        let fields = self.metadata.describe(object).await?;
        let describe = Arc::new(ObjectDescribe::new(object, fields));
        self.cache.insert(key, describe.clone());
        Ok(describe)
    }

    /// Derive the target schema for `object`.
    ///
    /// Order: store-managed common fields, remote common fields, configured
    /// fields. The first column with a given name wins.
    pub async fn reconcile(
        &mut self,
        object: &str,
        configured_fields: &[String],
        common_fields: &[CommonField],
        rules: &ObjectRules,
    ) -> Result<TableSchema> {
        let describe = self.describe(object).await?;

        let mut columns: Vec<ColumnSpec> = Vec::new();
        for common in common_fields.iter().filter(|c| !c.remote) {
            let column = common.to_local_column();
            validate_column_type(&column.column_type)?;
            columns.push(column);
        }

        let mut wanted: Vec<(String, Option<&CommonField>)> = Vec::new();
        let mut seen = HashSet::new();
        let remote_commons = common_fields.iter().filter(|c| c.remote);
        for (name, common) in remote_commons
            .map(|c| (c.name.clone(), Some(c)))
            .chain(configured_fields.iter().map(|f| (f.clone(), None)))
        {
            if rules.is_excluded(&name) {
                debug!("Skipping {}.{}: excluded for this object", object, name);
                continue;
            }
            if seen.insert(name.to_lowercase()) {
                wanted.push((name, common));
            }
        }

        for (name, common) in wanted {
            let descriptor = describe.field(&name).ok_or_else(|| {
                SyncError::configuration(format!("Field {} not found in {}", name, object))
            })?;
            let resolved = self.resolve(object, descriptor).await?;
            let read_only = rules.is_read_only(&name);

            let column_type = map_type(&resolved.effective_type);
            validate_column_type(&column_type)?;

            let unique = descriptor.unique || descriptor.name.eq_ignore_ascii_case("id");
            let mut column = ColumnSpec {
                create_unique_index: unique,
                create_index: !unique && (descriptor.filterable || descriptor.sortable),
                source: Some(FieldSource {
                    object: object.to_string(),
                    descriptor: descriptor.clone(),
                    resolution: resolved.resolution,
                    effective_type: resolved.effective_type,
                    can_create: resolved.can_create && !read_only,
                    can_update: resolved.can_update && !read_only,
                }),
                ..ColumnSpec::local(&descriptor.name, column_type)
            };
            if let Some(common) = common {
                column.not_null |= common.not_null;
                column.create_index |= common.create_index;
                column.create_unique_index |= common.create_unique_index;
            }
            columns.push(column);
        }

        let schema = TableSchema::new(object, columns);
        debug!(
            "Reconciled {} into {} column(s)",
            object,
            schema.columns.len()
        );
        Ok(schema)
    }

    async fn resolve(&mut self, object: &str, descriptor: &ObjectFieldDescriptor) -> Result<Resolved> {
        if descriptor.is_calculated() {
            let formula = descriptor.calculated_formula.as_deref().unwrap_or_default();
            let Some((relationship, field)) = parse_related_formula(formula) else {
                // Arbitrary formulas stay readable but can never be written.
                return Ok(Resolved {
                    resolution: FieldResolution::Plain,
                    effective_type: descriptor.declared_type.clone(),
                    can_create: false,
                    can_update: false,
                });
            };

            let target_object = relationship_object(&relationship);
            let target = self.describe(&target_object).await?;
            let related = target.field(&field).ok_or_else(|| {
                SyncError::configuration(format!(
                    "Field {} not found in {} (formula of {}.{})",
                    field, target_object, object, descriptor.name
                ))
            })?;

            return Ok(Resolved {
                effective_type: related.declared_type.clone(),
                resolution: FieldResolution::Calculated {
                    relationship,
                    target_field: related.name.clone(),
                    target_object,
                },
                can_create: false,
                can_update: false,
            });
        }

        if let Some(target_object) = descriptor.reference_target() {
            let target = self.describe(target_object).await?;
            let id_field = target.id_field().ok_or_else(|| {
                SyncError::configuration(format!(
                    "{} has no id field (referenced by {}.{})",
                    target_object, object, descriptor.name
                ))
            })?;

            // The foreign key itself is written on this object, so capability
            // comes from the referencing field, not the target's id.
            return Ok(Resolved {
                effective_type: id_field.declared_type.clone(),
                resolution: FieldResolution::Reference {
                    target_object: target_object.to_string(),
                    target_field: id_field.name.clone(),
                },
                can_create: descriptor.createable,
                can_update: descriptor.updateable,
            });
        }

        Ok(Resolved {
            resolution: FieldResolution::Plain,
            effective_type: descriptor.declared_type.clone(),
            can_create: descriptor.createable,
            can_update: descriptor.updateable,
        })
    }
}

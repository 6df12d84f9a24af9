// ABOUTME: Schema module - remote field metadata, target table model and additive DDL
// ABOUTME: Reconciliation turns describe output plus configuration into a TableSchema

pub mod ddl;
pub mod field;
pub mod reconciler;
pub mod table;
pub mod types;

pub use ddl::{apply_schema, plan_schema, DdlStatement, LiveTable};
pub use field::{ObjectDescribe, ObjectFieldDescriptor};
pub use reconciler::{ObjectRules, SchemaReconciler};
pub use table::{ColumnSpec, CommonField, FieldResolution, FieldSource, TableSchema};
pub use types::{map_type, FieldType};

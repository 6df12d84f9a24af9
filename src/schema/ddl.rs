// ABOUTME: Additive DDL planning - diffs a TableSchema against the live table
// ABOUTME: Plans are pure; apply_schema executes them through the target store

use super::table::{ColumnSpec, TableSchema};
use crate::error::Result;
use crate::postgres::TargetStore;
use crate::utils::{qualified, quote_ident, quote_literal, truncate_identifier};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// What currently exists in the target store for one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveTable {
    pub schema_exists: bool,
    /// Column name to `format_type` rendering. Empty when the table is absent.
    pub columns: HashMap<String, String>,
    pub indexes: HashSet<String>,
    pub sequences: HashSet<String>,
    pub triggers: HashSet<String>,
}

impl LiveTable {
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// One idempotent, additive DDL operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    CreateSchema {
        schema: String,
    },
    CreateSequence {
        schema: String,
        sequence: String,
    },
    CreateTable {
        schema: String,
        table: String,
        columns: Vec<ColumnSpec>,
    },
    AddColumn {
        schema: String,
        table: String,
        column: ColumnSpec,
    },
    CreateIndex {
        schema: String,
        table: String,
        index: String,
        column: String,
        unique: bool,
    },
    /// Re-stamp `column` with the current time on every insert or update.
    CreateTouchTrigger {
        schema: String,
        table: String,
        column: String,
        trigger: String,
    },
}

impl DdlStatement {
    /// Table this statement alters, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            DdlStatement::CreateSchema { .. } | DdlStatement::CreateSequence { .. } => None,
            DdlStatement::CreateTable { table, .. }
            | DdlStatement::AddColumn { table, .. }
            | DdlStatement::CreateIndex { table, .. }
            | DdlStatement::CreateTouchTrigger { table, .. } => Some(table),
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            DdlStatement::CreateSchema { schema } => {
                format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema))
            }
            DdlStatement::CreateSequence { schema, sequence } => {
                format!("CREATE SEQUENCE IF NOT EXISTS {}", qualified(schema, sequence))
            }
            DdlStatement::CreateTable {
                schema,
                table,
                columns,
            } => {
                let defs: Vec<String> = columns
                    .iter()
                    .map(|c| column_definition(schema, table, c, true))
                    .collect();
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    qualified(schema, table),
                    defs.join(", ")
                )
            }
            DdlStatement::AddColumn {
                schema,
                table,
                column,
            } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                qualified(schema, table),
                column_definition(schema, table, column, false)
            ),
            DdlStatement::CreateIndex {
                schema,
                table,
                index,
                column,
                unique,
            } => format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                quote_ident(index),
                qualified(schema, table),
                quote_ident(column)
            ),
            DdlStatement::CreateTouchTrigger {
                schema,
                table,
                column,
                trigger,
            } => {
                let function = qualified(schema, &touch_function_name(table, column));
                format!(
                    "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$\n\
                     BEGIN\n  NEW.{col} = NOW();\n  RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql;\n\
                     DROP TRIGGER IF EXISTS {trg} ON {tbl};\n\
                     CREATE TRIGGER {trg} BEFORE INSERT OR UPDATE ON {tbl} \
                     FOR EACH ROW EXECUTE FUNCTION {function}()",
                    function = function,
                    col = quote_ident(column),
                    trg = quote_ident(trigger),
                    tbl = qualified(schema, table),
                )
            }
        }
    }
}

pub fn sequence_name(table: &str, column: &str) -> String {
    truncate_identifier(&format!("{}_{}_seq", table, column))
}

pub fn index_name(table: &str, column: &str) -> String {
    truncate_identifier(&format!("idx_{}_{}_idx", table, column))
}

pub fn trigger_name(table: &str, column: &str) -> String {
    truncate_identifier(&format!("{}_{}_touch", table, column))
}

fn touch_function_name(table: &str, column: &str) -> String {
    truncate_identifier(&format!("{}_{}_touch_fn", table, column))
}

fn column_definition(schema: &str, table: &str, column: &ColumnSpec, new_table: bool) -> String {
    let mut def = format!("{} {}", quote_ident(&column.name), column.column_type);
    let has_default = column.default_sequence || column.default_now;

    if column.default_sequence {
        let seq = qualified(schema, &sequence_name(table, &column.name));
        def.push_str(&format!(" DEFAULT nextval({}::regclass)", quote_literal(&seq)));
    } else if column.default_now {
        def.push_str(" DEFAULT NOW()");
    }
    // Existing rows would violate NOT NULL on a new column without a default.
    if column.not_null && (new_table || has_default) {
        def.push_str(" NOT NULL");
    }
    if column.primary_key && new_table {
        def.push_str(" PRIMARY KEY");
    }
    def
}

/// Compute the DDL needed to bring the live table up to `schema`.
///
/// Never drops or retypes anything: existing columns are left alone even
/// when their type differs.
pub fn plan_schema(pg_schema: &str, schema: &TableSchema, live: &LiveTable) -> Vec<DdlStatement> {
    let table = &schema.table;
    let mut plan = Vec::new();

    if !live.schema_exists {
        plan.push(DdlStatement::CreateSchema {
            schema: pg_schema.to_string(),
        });
    }

    for column in schema.columns.iter().filter(|c| c.default_sequence) {
        let sequence = sequence_name(table, &column.name);
        if !live.sequences.contains(&sequence) {
            plan.push(DdlStatement::CreateSequence {
                schema: pg_schema.to_string(),
                sequence,
            });
        }
    }

    if !live.exists() {
        plan.push(DdlStatement::CreateTable {
            schema: pg_schema.to_string(),
            table: table.clone(),
            columns: schema.columns.clone(),
        });
    } else {
        for column in &schema.columns {
            if !live.columns.contains_key(&column.name) {
                plan.push(DdlStatement::AddColumn {
                    schema: pg_schema.to_string(),
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    for column in &schema.columns {
        if !(column.create_index || column.create_unique_index) || column.primary_key {
            continue;
        }
        let index = index_name(table, &column.name);
        if !live.indexes.contains(&index) {
            plan.push(DdlStatement::CreateIndex {
                schema: pg_schema.to_string(),
                table: table.clone(),
                index,
                column: column.name.clone(),
                unique: column.create_unique_index,
            });
        }
    }

    for column in schema.columns.iter().filter(|c| c.default_now) {
        let trigger = trigger_name(table, &column.name);
        if !live.triggers.contains(&trigger) {
            plan.push(DdlStatement::CreateTouchTrigger {
                schema: pg_schema.to_string(),
                table: table.clone(),
                column: column.name.clone(),
                trigger,
            });
        }
    }

    plan
}

/// Inspect the live table, plan the missing DDL and execute it in order.
///
/// Returns the statements that were executed; an empty list means the
/// table already matched.
pub async fn apply_schema(store: &dyn TargetStore, schema: &TableSchema) -> Result<Vec<DdlStatement>> {
    let live = store.inspect_table(&schema.table).await?;
    let plan = plan_schema(store.schema_name(), schema, &live);

    if plan.is_empty() {
        debug!("Table {} is up to date", schema.table);
        return Ok(plan);
    }

    info!(
        "Applying {} DDL statement(s) to {}.{}",
        plan.len(),
        store.schema_name(),
        schema.table
    );
    for statement in &plan {
        debug!("DDL: {}", statement.to_sql());
        store.execute_ddl(statement).await?;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::table::default_common_fields;
    use crate::test_utils::MemoryStore;

    fn widget_schema() -> TableSchema {
        let mut columns: Vec<ColumnSpec> = default_common_fields()
            .iter()
            .filter(|c| !c.remote)
            .map(|c| c.to_local_column())
            .collect();
        columns.push(ColumnSpec {
            create_unique_index: true,
            ..ColumnSpec::local("id", "varchar(18)")
        });
        columns.push(ColumnSpec {
            create_index: true,
            ..ColumnSpec::local("name", "text")
        });
        TableSchema::new("Widget", columns)
    }

    #[test]
    fn test_plan_for_missing_table() {
        let plan = plan_schema("salesforce", &widget_schema(), &LiveTable::default());

        assert!(matches!(plan[0], DdlStatement::CreateSchema { .. }));
        assert!(matches!(
            &plan[1],
            DdlStatement::CreateSequence { sequence, .. } if sequence == "widget__sync_id_seq"
        ));
        assert!(matches!(plan[2], DdlStatement::CreateTable { .. }));

        let indexes: Vec<_> = plan
            .iter()
            .filter_map(|s| match s {
                DdlStatement::CreateIndex { column, unique, .. } => Some((column.as_str(), *unique)),
                _ => None,
            })
            .collect();
        assert_eq!(
            indexes,
            vec![("_sync_status", false), ("id", true), ("name", false)]
        );

        assert!(matches!(
            plan.last().unwrap(),
            DdlStatement::CreateTouchTrigger { column, .. } if column == "_sync_update_timestamp"
        ));
    }

    #[test]
    fn test_plan_only_adds_missing_columns() {
        let schema = widget_schema();
        let mut live = LiveTable {
            schema_exists: true,
            ..Default::default()
        };
        for column in &schema.columns {
            if column.name != "name" {
                live.columns.insert(column.name.clone(), column.column_type.clone());
            }
        }
        // A retyped column is left alone.
        live.columns.insert("id".into(), "text".into());
        live.sequences.insert(sequence_name("widget", "_sync_id"));
        for c in ["_sync_status", "id", "name"] {
            live.indexes.insert(index_name("widget", c));
        }
        live.triggers
            .insert(trigger_name("widget", "_sync_update_timestamp"));

        let plan = plan_schema("salesforce", &schema, &live);
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            DdlStatement::AddColumn { column, .. } => assert_eq!(column.name, "name"),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_create_table_sql() {
        let schema = widget_schema();
        let sql = DdlStatement::CreateTable {
            schema: "salesforce".into(),
            table: schema.table.clone(),
            columns: schema.columns.clone(),
        }
        .to_sql();

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"salesforce\".\"widget\""));
        assert!(sql.contains(
            "\"_sync_id\" integer DEFAULT nextval('\"salesforce\".\"widget__sync_id_seq\"'::regclass) NOT NULL PRIMARY KEY"
        ));
        assert!(sql.contains("\"_sync_update_timestamp\" timestamp DEFAULT NOW()"));
        assert!(sql.contains("\"name\" text"));
    }

    #[test]
    fn test_add_column_skips_not_null_without_default() {
        let column = ColumnSpec {
            not_null: true,
            ..ColumnSpec::local("code", "text")
        };
        let sql = DdlStatement::AddColumn {
            schema: "salesforce".into(),
            table: "widget".into(),
            column,
        }
        .to_sql();
        assert_eq!(
            sql,
            "ALTER TABLE \"salesforce\".\"widget\" ADD COLUMN IF NOT EXISTS \"code\" text"
        );
    }

    #[test]
    fn test_index_and_trigger_sql() {
        let sql = DdlStatement::CreateIndex {
            schema: "salesforce".into(),
            table: "widget".into(),
            index: index_name("widget", "id"),
            column: "id".into(),
            unique: true,
        }
        .to_sql();
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_widget_id_idx\" ON \"salesforce\".\"widget\" (\"id\")"
        );

        let trigger = DdlStatement::CreateTouchTrigger {
            schema: "salesforce".into(),
            table: "widget".into(),
            column: "_sync_update_timestamp".into(),
            trigger: trigger_name("widget", "_sync_update_timestamp"),
        }
        .to_sql();
        assert!(trigger.contains("NEW.\"_sync_update_timestamp\" = NOW()"));
        assert!(trigger.contains("DROP TRIGGER IF EXISTS \"widget__sync_update_timestamp_touch\""));
        assert!(trigger.contains("BEFORE INSERT OR UPDATE ON \"salesforce\".\"widget\""));
    }

    #[tokio::test]
    async fn test_apply_schema_twice_is_a_no_op() {
        let store = MemoryStore::new("salesforce");
        let schema = widget_schema();

        let first = apply_schema(&store, &schema).await.unwrap();
        assert!(!first.is_empty());

        let second = apply_schema(&store, &schema).await.unwrap();
        assert!(second.is_empty(), "second run planned {:?}", second);
        assert_eq!(store.ddl_log().len(), first.len());
    }

    #[tokio::test]
    async fn test_apply_schema_evolves_additively() {
        let store = MemoryStore::new("salesforce");
        apply_schema(&store, &widget_schema()).await.unwrap();

        let mut evolved = widget_schema();
        evolved.columns.push(ColumnSpec::local("price", "double precision"));
        let plan = apply_schema(&store, &evolved).await.unwrap();

        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], DdlStatement::AddColumn { column, .. } if column.name == "price"));
        assert!(store.table_columns("widget").contains(&"price".to_string()));
    }
}

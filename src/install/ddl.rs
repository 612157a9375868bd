//! DDL text for the database artifacts pgriver installs.
//!
//! Everything here is idempotent: functions and views use CREATE OR
//! REPLACE, triggers are guarded by existence checks, so re-running setup
//! is a no-op.

use itertools::Itertools;

use crate::render::{RenderedSql, quote_ident, quote_literal};
use crate::settings::NOTIFY_CHANNEL;
use crate::tree::{TableRef, Tree};

pub const KEYS_VIEW: &str = "pgriver_keys";
pub const NOTIFY_FUNCTION: &str = "pgriver_notify";

pub fn notify_trigger_name(table: &str) -> String {
    format!("{table}_notify")
}

pub fn truncate_trigger_name(table: &str) -> String {
    format!("{table}_truncate")
}

/// Helper view exposing primary- and foreign-key column names per table,
/// read by the notification function to keep payloads down to key columns.
fn create_keys_view(schema: &str) -> RenderedSql {
    RenderedSql::new(format!(
        r#"CREATE OR REPLACE VIEW {schema_ident}.{view} AS
SELECT
    c.relname AS table_name,
    ARRAY(
        SELECT a.attname::text
        FROM pg_constraint con
        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = ANY(con.conkey)
        WHERE con.conrelid = c.oid AND con.contype = 'p'
        ORDER BY array_position(con.conkey, a.attnum)
    ) AS primary_keys,
    ARRAY(
        SELECT DISTINCT a.attname::text
        FROM pg_constraint con
        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = ANY(con.conkey)
        WHERE con.conrelid = c.oid AND con.contype = 'f'
    ) AS foreign_keys
FROM pg_class c
JOIN pg_namespace n ON c.relnamespace = n.oid
WHERE n.nspname = {schema_literal}
  AND c.relkind = 'r'"#,
        schema_ident = quote_ident(schema),
        view = quote_ident(KEYS_VIEW),
        schema_literal = quote_literal(schema),
    ))
}

/// One notification function per schema, shared by every row and truncate
/// trigger. Payloads carry key columns only; the synthesizer re-reads the
/// current row state, so full images are never needed on the channel.
fn create_notify_function(schema: &str) -> RenderedSql {
    RenderedSql::new(format!(
        r#"CREATE OR REPLACE FUNCTION {schema_ident}.{function}() RETURNS trigger AS $body$
DECLARE
    key_columns text[];
    old_row jsonb;
    new_row jsonb;
BEGIN
    IF TG_OP <> 'TRUNCATE' THEN
        SELECT primary_keys || foreign_keys INTO key_columns
        FROM {schema_ident}.{view}
        WHERE table_name = TG_TABLE_NAME;

        IF TG_OP IN ('UPDATE', 'DELETE') THEN
            SELECT jsonb_object_agg(key, value) INTO old_row
            FROM jsonb_each(to_jsonb(OLD))
            WHERE key = ANY(key_columns);
        END IF;
        IF TG_OP IN ('INSERT', 'UPDATE') THEN
            SELECT jsonb_object_agg(key, value) INTO new_row
            FROM jsonb_each(to_jsonb(NEW))
            WHERE key = ANY(key_columns);
        END IF;
    END IF;

    PERFORM pg_notify(
        {channel},
        jsonb_build_object(
            'tg_op', TG_OP,
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'old', old_row,
            'new', new_row
        )::text
    );
    RETURN NULL;
END;
$body$ LANGUAGE plpgsql"#,
        schema_ident = quote_ident(schema),
        function = quote_ident(NOTIFY_FUNCTION),
        view = quote_ident(KEYS_VIEW),
        channel = quote_literal(NOTIFY_CHANNEL),
    ))
}

fn create_trigger(table: &TableRef, truncate: bool) -> RenderedSql {
    let (name, events, scope) = if truncate {
        (truncate_trigger_name(&table.table), "TRUNCATE", "STATEMENT")
    } else {
        (
            notify_trigger_name(&table.table),
            "INSERT OR UPDATE OR DELETE",
            "ROW",
        )
    };

    RenderedSql::new(format!(
        r#"DO $guard$
BEGIN
    IF NOT EXISTS (
        SELECT 1
        FROM pg_trigger t
        JOIN pg_class c ON t.tgrelid = c.oid
        JOIN pg_namespace n ON c.relnamespace = n.oid
        WHERE t.tgname = {trigger_literal}
          AND c.relname = {table_literal}
          AND n.nspname = {schema_literal}
    ) THEN
        CREATE TRIGGER {trigger_ident}
        AFTER {events} ON {schema_ident}.{table_ident}
        FOR EACH {scope} EXECUTE FUNCTION {schema_ident}.{function}();
    END IF;
END
$guard$"#,
        trigger_literal = quote_literal(&name),
        table_literal = quote_literal(&table.table),
        schema_literal = quote_literal(&table.schema),
        trigger_ident = quote_ident(&name),
        schema_ident = quote_ident(&table.schema),
        table_ident = quote_ident(&table.table),
        function = quote_ident(NOTIFY_FUNCTION),
    ))
}

fn drop_trigger(table: &TableRef, truncate: bool) -> RenderedSql {
    let name = if truncate {
        truncate_trigger_name(&table.table)
    } else {
        notify_trigger_name(&table.table)
    };
    RenderedSql::destructive(format!(
        "DROP TRIGGER IF EXISTS {} ON {}.{}",
        quote_ident(&name),
        quote_ident(&table.schema),
        quote_ident(&table.table),
    ))
}

/// All DDL for setup, in dependency order: views and functions first, then
/// per-table triggers. The replication slot is managed separately because
/// it needs runtime checks, not plain DDL.
pub fn setup_statements(tree: &Tree) -> Vec<RenderedSql> {
    let tables = tree.tables();
    let schemas: Vec<&str> = tables
        .iter()
        .map(|t| t.schema.as_str())
        .unique()
        .collect();

    let mut statements = Vec::new();
    for schema in schemas {
        statements.push(create_keys_view(schema));
        statements.push(create_notify_function(schema));
    }
    for table in &tables {
        statements.push(create_trigger(table, false));
        statements.push(create_trigger(table, true));
    }
    statements
}

/// Teardown in reverse order: triggers, then functions and views.
pub fn teardown_statements(tree: &Tree) -> Vec<RenderedSql> {
    let tables = tree.tables();
    let schemas: Vec<&str> = tables
        .iter()
        .map(|t| t.schema.as_str())
        .unique()
        .collect();

    let mut statements = Vec::new();
    for table in &tables {
        statements.push(drop_trigger(table, false));
        statements.push(drop_trigger(table, true));
    }
    for schema in schemas {
        statements.push(RenderedSql::destructive(format!(
            "DROP FUNCTION IF EXISTS {}.{}()",
            quote_ident(schema),
            quote_ident(NOTIFY_FUNCTION),
        )));
        statements.push(RenderedSql::destructive(format!(
            "DROP VIEW IF EXISTS {}.{}",
            quote_ident(schema),
            quote_ident(KEYS_VIEW),
        )));
    }
    statements
}

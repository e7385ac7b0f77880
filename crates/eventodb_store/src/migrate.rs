//! Two-level, forward-only migration machinery.
//!
//! Every backend ships two embedded migration sets: metadata migrations for
//! the shared registry area, applied once per process start, and namespace
//! migrations applied to each namespace's data area at create/open time.
//! Each namespace tracks its own highest applied version, so a namespace
//! created today gets the latest schema directly while an old one advances
//! incrementally on its next open.
//!
//! Migrations are idempotent (`IF NOT EXISTS` / `CREATE OR REPLACE` all the
//! way down) and there is no down path; corrections are new migrations.

use eventodb::Result;

/// Placeholder substituted with the (quoted) schema name when a SQL
/// migration is applied to a namespace.
pub const SCHEMA_TOKEN: &str = "{{SCHEMA_NAME}}";

/// One embedded SQL migration.
#[derive(Clone, Copy, Debug)]
pub struct SqlMigration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// One embedded migration over a sled tree.
#[derive(Clone, Copy)]
pub struct KvMigration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&sled::Tree) -> Result<()>,
}

/// Substitutes `{{SCHEMA_NAME}}` in a templated migration.
pub fn render(sql: &str, schema: &str) -> String {
    sql.replace(SCHEMA_TOKEN, schema)
}

/// Highest version in a migration set (0 for an empty set).
pub fn latest_sql_version(set: &[SqlMigration]) -> u32 {
    set.iter().map(|m| m.version).max().unwrap_or(0)
}

pub fn latest_kv_version(set: &[KvMigration]) -> u32 {
    set.iter().map(|m| m.version).max().unwrap_or(0)
}

/// The migrations in `set` strictly above `applied`, in version order.
pub fn pending_sql(set: &[SqlMigration], applied: u32) -> Vec<SqlMigration> {
    let mut pending: Vec<_> = set.iter().copied().filter(|m| m.version > applied).collect();
    pending.sort_by_key(|m| m.version);
    pending
}

pub fn pending_kv(set: &[KvMigration], applied: u32) -> Vec<KvMigration> {
    let mut pending: Vec<_> = set.iter().copied().filter(|m| m.version > applied).collect();
    pending.sort_by_key(|m| m.version);
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    const SET: &[SqlMigration] = &[
        SqlMigration { version: 2, name: "two", sql: "select 2" },
        SqlMigration { version: 1, name: "one", sql: "select 1" },
        SqlMigration { version: 3, name: "three", sql: "select 3" },
    ];

    #[test]
    fn pending_is_ordered_and_exclusive_of_applied() {
        let pending = pending_sql(SET, 1);
        let versions: Vec<_> = pending.iter().map(|m| m.version).collect();
        assert_eq!(versions, [2, 3]);

        assert!(pending_sql(SET, 3).is_empty());
        assert_eq!(latest_sql_version(SET), 3);
    }

    #[test]
    fn render_substitutes_every_occurrence() {
        let sql = "create table {{SCHEMA_NAME}}.t (); alter table {{SCHEMA_NAME}}.t owner to x";
        let rendered = render(sql, "\"eventodb_a\"");
        assert!(!rendered.contains(SCHEMA_TOKEN));
        assert_eq!(rendered.matches("\"eventodb_a\"").count(), 2);
    }
}

//! Relational Index
//!
//! Searchable projection of service descriptors plus the config ledger.
//! Rows are keyed by (service, zone) and are never removed, only flagged.

pub mod sqlite;

pub use sqlite::{SqlIndex, SqlIndexConfig};

/// Largest page a search may request
pub const MAX_SEARCH_LIMIT: i64 = 5000;

/// Schema, applied with `CREATE ... IF NOT EXISTS` on connect
pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status INTEGER NOT NULL DEFAULT 0,
        service TEXT NOT NULL,
        zone TEXT NOT NULL,
        typ TEXT NOT NULL DEFAULT '',
        proto TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        content_hash TEXT NOT NULL DEFAULT '',
        hash_status INTEGER NOT NULL DEFAULT 0,
        create_time TEXT NOT NULL,
        modify_time TEXT NOT NULL,
        UNIQUE (service, zone)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_services_modify_time ON services(modify_time)",
    r#"
    CREATE TABLE IF NOT EXISTS configs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status INTEGER NOT NULL DEFAULT 0,
        tag TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL UNIQUE,
        value TEXT NOT NULL,
        create_time TEXT NOT NULL,
        modify_time TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config_histories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL,
        app_id INTEGER NOT NULL DEFAULT 0,
        remark TEXT NOT NULL DEFAULT '',
        value TEXT NOT NULL,
        create_time TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_config_histories_name ON config_histories(name)",
    r#"
    CREATE TABLE IF NOT EXISTS app_config_states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id INTEGER NOT NULL,
        app_node TEXT NOT NULL DEFAULT '',
        config_name TEXT NOT NULL,
        version INTEGER NOT NULL,
        create_time TEXT NOT NULL,
        modify_time TEXT NOT NULL,
        UNIQUE (app_id, app_node, config_name)
    )
    "#,
];

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern
pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

//! Built-in engine schema migrations, applied once and tracked in
//! `direktiv_migrations`.

use super::runner::Migration;

const ENGINE_SQL: &str = include_str!("../../migrations/0000_direktiv_engine.sql");

/// All built-in migrations in application order.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_direktiv_engine", ENGINE_SQL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_migrations() {
        let migrations = builtin_migrations();
        assert_eq!(migrations[0].name, "0000_direktiv_engine");
        assert!(!migrations[0].sql.is_empty());
    }

    #[test]
    fn test_schema_contains_tables() {
        let sql = &builtin_migrations()[0].sql;
        for table in [
            "direktiv_namespaces",
            "direktiv_workflows",
            "direktiv_refs",
            "direktiv_revisions",
            "direktiv_routes",
            "direktiv_instances",
            "direktiv_runtimes",
            "direktiv_instance_messages",
            "direktiv_event_listeners",
            "direktiv_variables",
            "direktiv_instance_logs",
        ] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing {}",
                table
            );
        }
    }
}

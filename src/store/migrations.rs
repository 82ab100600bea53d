use anyhow::{bail, Context, Result};
use rusqlite::Connection;

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Brings a cache database to the current schema. An empty database gets the
/// whole schema in one transaction; anything else must already be current.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    match version {
        CURRENT_SCHEMA_VERSION => Ok(()),
        0 => create_schema(conn),
        newer if newer > CURRENT_SCHEMA_VERSION => bail!(
            "cache database version ({newer}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        ),
        unknown => bail!("unknown cache database version: {unknown}"),
    }
}

fn create_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    tx.execute_batch(include_str!("schemas/schema_v1.sql"))
        .context("failed to execute schema_v1.sql")?;
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit schema")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'cache_entries'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
            .unwrap();
        assert!(run_migrations(&mut conn).is_err());
    }

    #[test]
    fn failed_schema_leaves_database_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE cache_entries (id INTEGER)").unwrap();

        assert!(run_migrations(&mut conn).is_err());
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 0);
    }
}

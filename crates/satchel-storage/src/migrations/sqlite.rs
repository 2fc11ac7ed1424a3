//! Embedded-backend migration procedures.
//!
//! Each step creates the release's side tables and backfills them from
//! existing `items` / `items_tags` rows; projected tags are then removed
//! from the common tags table so reads do not see them twice.

use rusqlite::Connection;

use super::SqliteMigration;
use crate::error::DbResult;
use crate::registry::{CONNECTION_REC_V1, CRED_EX_V20_REC, NormalizedSpec};

/// Resolves the procedure for one adjacent step, if registered.
pub(crate) fn migration_for(from: &str, to: &str) -> Option<SqliteMigration> {
    match (from, to) {
        ("release_0", "release_0_1") => Some(migrate_0_to_0_1),
        ("release_0_1", "release_0_2") => Some(migrate_0_1_to_0_2),
        _ => None,
    }
}

fn migrate_0_to_0_1(conn: &Connection) -> DbResult<()> {
    create_and_backfill(conn, &CONNECTION_REC_V1, CONNECTION_REC_V1.columns)
}

fn migrate_0_1_to_0_2(conn: &Connection) -> DbResult<()> {
    // Extend the connection table with the protocol column and move the
    // matching tags over.
    conn.execute_batch(
        "ALTER TABLE connection_rec ADD COLUMN connection_protocol TEXT",
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS ix_connection_rec_connection_protocol \
         ON connection_rec (connection_protocol)",
    )?;
    conn.execute_batch(
        "UPDATE connection_rec SET connection_protocol = \
            (SELECT value FROM items_tags \
             WHERE item_id = connection_rec.item_id AND name = 'connection_protocol' \
             ORDER BY id DESC LIMIT 1)",
    )?;
    conn.execute_batch(
        "DELETE FROM items_tags WHERE name = 'connection_protocol' \
         AND item_id IN (SELECT item_id FROM connection_rec)",
    )?;

    create_and_backfill(conn, &CRED_EX_V20_REC, CRED_EX_V20_REC.columns)
}

/// Creates a side table and backfills it from the tags of its category's
/// existing items.
fn create_and_backfill(
    conn: &Connection,
    spec: &NormalizedSpec,
    columns: &[&str],
) -> DbResult<()> {
    for sql in spec.sqlite_ddl() {
        conn.execute_batch(&sql)?;
    }

    let table = spec.table;
    let category = spec.category;
    let column_list = columns.join(", ");
    let selects: Vec<String> = columns
        .iter()
        .map(|column| {
            format!(
                "(SELECT value FROM items_tags \
                 WHERE item_id = i.id AND name = '{column}' \
                 ORDER BY id DESC LIMIT 1)"
            )
        })
        .collect();
    conn.execute_batch(&format!(
        "INSERT INTO {table} (item_id, profile_id, {column_list}) \
         SELECT i.id, i.profile_id, {} FROM items i \
         WHERE i.category = '{category}' \
         AND NOT EXISTS (SELECT 1 FROM {table} t WHERE t.item_id = i.id)",
        selects.join(", ")
    ))?;

    let name_list: Vec<String> = columns.iter().map(|c| format!("'{c}'")).collect();
    conn.execute_batch(&format!(
        "DELETE FROM items_tags WHERE name IN ({}) \
         AND item_id IN (SELECT id FROM items WHERE category = '{category}')",
        name_list.join(", ")
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::config::create_core_schema;
    use rusqlite::params;

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        create_core_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO profiles (name, profile_key) VALUES ('p', NULL)",
            [],
        )
        .unwrap();
        let profile_id: i64 = conn
            .query_row("SELECT id FROM profiles WHERE name = 'p'", [], |r| r.get(0))
            .unwrap();
        conn.execute(
            "INSERT INTO items (profile_id, kind, category, name, value) \
             VALUES (?, 0, 'connection', 'conn1', '{}')",
            params![profile_id],
        )
        .unwrap();
        let item_id = conn.last_insert_rowid();
        for (name, value) in [
            ("state", "active"),
            ("their_did", "did:ex:1"),
            ("custom", "kept"),
        ] {
            conn.execute(
                "INSERT INTO items_tags (item_id, name, value) VALUES (?, ?, ?)",
                params![item_id, name, value],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn backfill_moves_projected_tags() {
        let conn = seeded_conn();
        migrate_0_to_0_1(&conn).unwrap();

        let (state, their_did): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT state, their_did FROM connection_rec",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(state.as_deref(), Some("active"));
        assert_eq!(their_did.as_deref(), Some("did:ex:1"));

        // Only the unprojected tag stays behind.
        let remaining: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM items_tags ORDER BY name").unwrap();
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            rows
        };
        assert_eq!(remaining, vec!["custom"]);
    }

    #[test]
    fn second_step_extends_connection_and_adds_cred_ex() {
        let conn = seeded_conn();
        migrate_0_to_0_1(&conn).unwrap();
        conn.execute(
            "INSERT INTO items_tags (item_id, name, value) \
             SELECT item_id, 'connection_protocol', 'didexchange/1.1' FROM connection_rec",
            [],
        )
        .unwrap();

        migrate_0_1_to_0_2(&conn).unwrap();
        let protocol: Option<String> = conn
            .query_row(
                "SELECT connection_protocol FROM connection_rec",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(protocol.as_deref(), Some("didexchange/1.1"));
        let cred_ex_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM cred_ex_v20_rec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(cred_ex_rows, 0);
    }

    #[test]
    fn backfill_is_idempotent_per_item() {
        let conn = seeded_conn();
        migrate_0_to_0_1(&conn).unwrap();
        create_and_backfill(&conn, &CONNECTION_REC_V1, CONNECTION_REC_V1.columns).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM connection_rec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}

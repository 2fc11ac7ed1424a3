//! Per-category CRUD handlers for the embedded backend.
//!
//! All handlers run on a blocking worker against a borrowed connection.
//! The default handler stores the value verbatim in `items` and every tag
//! as a row in `items_tags`. A normalized handler additionally projects
//! the tags named by its [`NormalizedSpec`] into typed columns of the
//! category's side table; unprojected tags still land in `items_tags`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};

use satchel_core::{Entry, EntryTag};
use satchel_query::{SqlDialect, TagQuery, TagSqlEncoder};

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult, sqlite_unique_violation};
use crate::registry::{self, NormalizedSpec};
use crate::traits::validate_order_by;

/// Predicate excluding expired rows from every read.
const NOT_EXPIRED: &str = "(expiry IS NULL OR expiry > CURRENT_TIMESTAMP)";

impl std::fmt::Debug for dyn SqliteCategoryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCategoryHandler").finish()
    }
}

/// Per-category operations over an embedded-backend connection.
pub trait SqliteCategoryHandler: Send + Sync {
    /// Inserts a new item with its tags.
    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()>;

    /// Replaces an item's value and tags in full.
    #[allow(clippy::too_many_arguments)]
    fn replace(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()>;

    /// Removes one item.
    fn remove(&self, conn: &Connection, profile_id: i64, category: &str, name: &str)
    -> DbResult<()>;

    /// Removes all matching items, returning the count.
    fn remove_all(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64>;

    /// Fetches one item by name.
    #[allow(clippy::too_many_arguments)]
    fn fetch(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
        tag_filter: Option<&TagQuery>,
        for_update: bool,
    ) -> DbResult<Option<Entry>>;

    /// Fetches all matching items.
    #[allow(clippy::too_many_arguments)]
    fn fetch_all(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        limit: Option<i64>,
        for_update: bool,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>>;

    /// Counts matching items.
    fn count(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64>;

    /// One page of an offset scan.
    #[allow(clippy::too_many_arguments)]
    fn scan_page(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        offset: i64,
        limit: i64,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>>;

    /// One page of a keyset scan, ordered by item id ascending.
    fn scan_keyset_page(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        last_id: i64,
        limit: i64,
    ) -> DbResult<Vec<Entry>>;
}

/// Item handler over the common tables, optionally projecting tags into a
/// normalized side table.
pub struct SqliteItemHandler {
    normalized: Option<&'static NormalizedSpec>,
}

static DEFAULT_HANDLER: SqliteItemHandler = SqliteItemHandler { normalized: None };

static NORMALIZED_HANDLERS: Lazy<
    HashMap<&'static str, HashMap<&'static str, SqliteItemHandler>>,
> = Lazy::new(|| {
    let mut releases = HashMap::new();
    for &release in registry::RELEASE_ORDER {
        let mut handlers = HashMap::new();
        for spec in registry::get_release(release).expect("known release") {
            handlers.insert(
                spec.category,
                SqliteItemHandler {
                    normalized: Some(spec),
                },
            );
        }
        releases.insert(release, handlers);
    }
    releases
});

/// Resolves the handler for a category at a release. Unknown categories
/// fall back to the default handler; unknown releases fail with
/// `UnsupportedVersion`.
pub fn handler_for(release: &str, category: &str) -> DbResult<&'static dyn SqliteCategoryHandler> {
    let handlers = NORMALIZED_HANDLERS.get(release).ok_or_else(|| {
        DatabaseError::new(
            DatabaseErrorCode::UnsupportedVersion,
            format!("release number '{release}' not found"),
        )
    })?;
    Ok(handlers
        .get(category)
        .map(|h| h as &dyn SqliteCategoryHandler)
        .unwrap_or(&DEFAULT_HANDLER))
}

/// Converts a relative expiry into the stored timestamp text.
pub(crate) fn expiry_timestamp(expiry_ms: Option<i64>) -> Option<String> {
    expiry_ms.map(|ms| {
        (chrono::Utc::now() + chrono::Duration::milliseconds(ms))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
}

impl SqliteItemHandler {
    fn encode_filter(&self, tag_filter: Option<&TagQuery>) -> (Option<String>, Vec<String>) {
        let Some(query) = tag_filter else {
            return (None, Vec::new());
        };
        let normalized = self
            .normalized
            .map(|spec| spec.normalized_columns(spec.table.to_string()));
        let mut encoder = TagSqlEncoder::new(SqlDialect::Sqlite, "items", "items_tags");
        if let Some(columns) = normalized.as_ref() {
            encoder = encoder.with_normalized(columns);
        }
        let (sql, args) = encoder.encode(query);
        (Some(sql), args)
    }

    /// Splits tags into projected (side-table) and plain (`items_tags`)
    /// sets. Without a descriptor everything is plain.
    fn split_tags<'t>(&self, tags: &'t [EntryTag]) -> (Vec<&'t EntryTag>, Vec<&'t EntryTag>) {
        match self.normalized {
            None => (Vec::new(), tags.iter().collect()),
            Some(spec) => tags
                .iter()
                .partition(|tag| spec.columns.contains(&tag.name.as_str())),
        }
    }

    fn write_tags(
        &self,
        conn: &Connection,
        item_id: i64,
        profile_id: i64,
        tags: &[EntryTag],
    ) -> DbResult<()> {
        let (projected, plain) = self.split_tags(tags);
        for tag in plain {
            conn.execute(
                "INSERT INTO items_tags (item_id, name, value) VALUES (?, ?, ?)",
                params![item_id, tag.name, tag.value],
            )?;
        }
        if let Some(spec) = self.normalized {
            let mut columns = String::from("item_id, profile_id");
            let mut placeholders = String::from("?, ?");
            let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(item_id), Box::new(profile_id)];
            for column in spec.columns {
                // Last occurrence wins when a projected tag repeats.
                if let Some(tag) = projected.iter().rev().find(|t| t.name == *column) {
                    columns.push_str(", ");
                    columns.push_str(column);
                    placeholders.push_str(", ?");
                    values.push(Box::new(tag.value.clone()));
                }
            }
            let sql = format!(
                "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                spec.table
            );
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            conn.execute(&sql, refs.as_slice())?;
        }
        Ok(())
    }

    fn clear_tags(&self, conn: &Connection, item_id: i64) -> DbResult<()> {
        conn.execute("DELETE FROM items_tags WHERE item_id = ?", [item_id])?;
        if let Some(spec) = self.normalized {
            conn.execute(
                &format!("DELETE FROM {} WHERE item_id = ?", spec.table),
                [item_id],
            )?;
        }
        Ok(())
    }

    fn load_entry_tags(&self, conn: &Connection, item_id: i64) -> DbResult<Vec<EntryTag>> {
        let mut tags = Vec::new();
        if let Some(spec) = self.normalized {
            let sql = format!(
                "SELECT {} FROM {} WHERE item_id = ?",
                spec.columns.join(", "),
                spec.table
            );
            let row: Option<Vec<Option<String>>> = conn
                .query_row(&sql, [item_id], |row| {
                    (0..spec.columns.len())
                        .map(|i| row.get::<_, Option<String>>(i))
                        .collect()
                })
                .optional()?;
            if let Some(values) = row {
                for (column, value) in spec.columns.iter().zip(values) {
                    if let Some(value) = value {
                        tags.push(EntryTag::new(*column, value));
                    }
                }
            }
        }
        let mut stmt =
            conn.prepare("SELECT name, value FROM items_tags WHERE item_id = ? ORDER BY id")?;
        let rows = stmt.query_map([item_id], |row| {
            Ok(EntryTag {
                name: row.get(0)?,
                value: row.get(1)?,
            })
        })?;
        for row in rows {
            tags.push(row?);
        }
        Ok(tags)
    }

    /// Shared SELECT used by fetch_all and the scan pages.
    #[allow(clippy::too_many_arguments)]
    fn select_entries(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        order_by: Option<&str>,
        descending: bool,
        limit: Option<i64>,
        offset: Option<i64>,
        after_id: Option<i64>,
    ) -> DbResult<Vec<Entry>> {
        let order_col = validate_order_by(order_by)?;
        let direction = if descending { "DESC" } else { "ASC" };
        let (filter_sql, filter_args) = self.encode_filter(tag_filter);

        let mut sql = format!(
            "SELECT id, name, value FROM items \
             WHERE profile_id = ? AND category = ? AND {NOT_EXPIRED}"
        );
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(profile_id), Box::new(category.to_string())];
        if let Some(after_id) = after_id {
            sql.push_str(" AND id > ?");
            values.push(Box::new(after_id));
        }
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
            for arg in filter_args {
                values.push(Box::new(arg));
            }
        }
        sql.push_str(&format!(" ORDER BY {order_col} {direction}"));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(refs.as_slice(), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        drop(stmt);

        let mut entries = Vec::with_capacity(items.len());
        for (id, name, value) in items {
            let tags = self.load_entry_tags(conn, id)?;
            entries.push(Entry::new(id, category, name, value, tags));
        }
        Ok(entries)
    }
}

impl SqliteCategoryHandler for SqliteItemHandler {
    fn insert(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()> {
        let expiry = expiry_timestamp(expiry_ms);
        let inserted = conn.execute(
            "INSERT INTO items (profile_id, kind, category, name, value, expiry) \
             VALUES (?, 0, ?, ?, ?, ?)",
            params![profile_id, category, name, value, expiry],
        );
        if let Err(err) = inserted {
            if sqlite_unique_violation(&err) {
                return Err(DatabaseError::with_cause(
                    DatabaseErrorCode::DuplicateItemEntry,
                    format!("duplicate item '{name}' in category '{category}'"),
                    err,
                ));
            }
            return Err(err.into());
        }
        let item_id = conn.last_insert_rowid();
        self.write_tags(conn, item_id, profile_id, tags)
    }

    fn replace(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()> {
        let expiry = expiry_timestamp(expiry_ms);
        let changed = conn.execute(
            "UPDATE items SET value = ?, expiry = ? \
             WHERE profile_id = ? AND category = ? AND name = ?",
            params![value, expiry, profile_id, category, name],
        )?;
        if changed == 0 {
            return Err(DatabaseError::new(
                DatabaseErrorCode::RecordNotFound,
                format!("item '{name}' not found in category '{category}'"),
            ));
        }
        let item_id: i64 = conn.query_row(
            "SELECT id FROM items WHERE profile_id = ? AND category = ? AND name = ?",
            params![profile_id, category, name],
            |row| row.get(0),
        )?;
        self.clear_tags(conn, item_id)?;
        self.write_tags(conn, item_id, profile_id, tags)
    }

    fn remove(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
    ) -> DbResult<()> {
        let removed = conn.execute(
            "DELETE FROM items WHERE profile_id = ? AND category = ? AND name = ?",
            params![profile_id, category, name],
        )?;
        if removed == 0 {
            return Err(DatabaseError::new(
                DatabaseErrorCode::RecordNotFound,
                format!("item '{name}' not found in category '{category}'"),
            ));
        }
        Ok(())
    }

    fn remove_all(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64> {
        let (filter_sql, filter_args) = self.encode_filter(tag_filter);
        let mut sql = String::from("DELETE FROM items WHERE profile_id = ? AND category = ?");
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(profile_id), Box::new(category.to_string())];
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
            for arg in filter_args {
                values.push(Box::new(arg));
            }
        }
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let removed = conn.execute(&sql, refs.as_slice())?;
        Ok(removed as u64)
    }

    fn fetch(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        name: &str,
        tag_filter: Option<&TagQuery>,
        _for_update: bool,
    ) -> DbResult<Option<Entry>> {
        // The embedded engine locks at database scope; FOR UPDATE has no
        // per-row equivalent here.
        let (filter_sql, filter_args) = self.encode_filter(tag_filter);
        let mut sql = format!(
            "SELECT id, value FROM items \
             WHERE profile_id = ? AND category = ? AND name = ? AND {NOT_EXPIRED}"
        );
        let mut values: Vec<Box<dyn ToSql>> = vec![
            Box::new(profile_id),
            Box::new(category.to_string()),
            Box::new(name.to_string()),
        ];
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
            for arg in filter_args {
                values.push(Box::new(arg));
            }
        }
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let row: Option<(i64, String)> = conn
            .query_row(&sql, refs.as_slice(), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, value)) => {
                let tags = self.load_entry_tags(conn, id)?;
                Ok(Some(Entry::new(id, category, name, value, tags)))
            }
        }
    }

    fn fetch_all(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        limit: Option<i64>,
        _for_update: bool,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>> {
        self.select_entries(
            conn, profile_id, category, tag_filter, order_by, descending, limit, None, None,
        )
    }

    fn count(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64> {
        let (filter_sql, filter_args) = self.encode_filter(tag_filter);
        let mut sql = format!(
            "SELECT COUNT(*) FROM items \
             WHERE profile_id = ? AND category = ? AND {NOT_EXPIRED}"
        );
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(profile_id), Box::new(category.to_string())];
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
            for arg in filter_args {
                values.push(Box::new(arg));
            }
        }
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let count: i64 = conn.query_row(&sql, refs.as_slice(), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn scan_page(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        offset: i64,
        limit: i64,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>> {
        self.select_entries(
            conn,
            profile_id,
            category,
            tag_filter,
            order_by,
            descending,
            Some(limit),
            Some(offset),
            None,
        )
    }

    fn scan_keyset_page(
        &self,
        conn: &Connection,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        last_id: i64,
        limit: i64,
    ) -> DbResult<Vec<Entry>> {
        self.select_entries(
            conn,
            profile_id,
            category,
            tag_filter,
            Some("id"),
            false,
            Some(limit),
            None,
            Some(last_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::config::create_core_schema;
    use satchel_query::query_from_str;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        create_core_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO profiles (name, profile_key) VALUES ('p', NULL)",
            [],
        )
        .unwrap();
        conn
    }

    fn profile_id(conn: &Connection) -> i64 {
        conn.query_row("SELECT id FROM profiles WHERE name = 'p'", [], |r| r.get(0))
            .unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> Vec<EntryTag> {
        pairs.iter().map(|(n, v)| EntryTag::new(*n, *v)).collect()
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        handler
            .insert(
                &conn,
                pid,
                "people",
                "person1",
                r#"{"name":"Alice"}"#,
                &tags(&[("attr::person.status", "active")]),
                None,
            )
            .unwrap();

        let entry = handler
            .fetch(&conn, pid, "people", "person1", None, false)
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, r#"{"name":"Alice"}"#);
        assert_eq!(entry.tag_value("attr::person.status"), Some("active"));
    }

    #[test]
    fn duplicate_insert_is_rejected_and_original_survives() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        handler
            .insert(&conn, pid, "people", "person1", "v1", &[], None)
            .unwrap();
        let err = handler
            .insert(&conn, pid, "people", "person1", "v2", &[], None)
            .unwrap_err();
        assert_eq!(err.code(), Some(DatabaseErrorCode::DuplicateItemEntry));

        let entry = handler
            .fetch(&conn, pid, "people", "person1", None, false)
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, "v1");
    }

    #[test]
    fn replace_is_total_over_tags() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        handler
            .insert(
                &conn,
                pid,
                "people",
                "person1",
                "v1",
                &tags(&[("a", "1"), ("b", "2")]),
                None,
            )
            .unwrap();
        handler
            .replace(&conn, pid, "people", "person1", "v2", &tags(&[("c", "3")]), None)
            .unwrap();

        let entry = handler
            .fetch(&conn, pid, "people", "person1", None, false)
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, "v2");
        assert_eq!(entry.tags, tags(&[("c", "3")]));
    }

    #[test]
    fn replace_missing_item_is_not_found() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        let err = handler
            .replace(&conn, pid, "people", "ghost", "v", &[], None)
            .unwrap_err();
        assert_eq!(err.code(), Some(DatabaseErrorCode::RecordNotFound));
    }

    #[test]
    fn remove_cascades_to_exactly_its_tags() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        handler
            .insert(&conn, pid, "people", "a", "v", &tags(&[("t", "1")]), None)
            .unwrap();
        handler
            .insert(&conn, pid, "people", "b", "v", &tags(&[("t", "2")]), None)
            .unwrap();

        handler.remove(&conn, pid, "people", "a").unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM items_tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(
            handler
                .remove(&conn, pid, "people", "a")
                .unwrap_err()
                .code(),
            Some(DatabaseErrorCode::RecordNotFound)
        );
    }

    #[test]
    fn remove_all_returns_match_count() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        for (name, status) in [("a", "active"), ("b", "inactive"), ("c", "inactive")] {
            handler
                .insert(&conn, pid, "people", name, "v", &tags(&[("status", status)]), None)
                .unwrap();
        }
        let filter = query_from_str(r#"{"status": "inactive"}"#).unwrap();
        let removed = handler
            .remove_all(&conn, pid, "people", Some(&filter))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(handler.count(&conn, pid, "people", None).unwrap(), 1);
    }

    #[test]
    fn expired_items_are_invisible() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "cache").unwrap();
        handler
            .insert(&conn, pid, "cache", "gone", "v", &[], Some(-60_000))
            .unwrap();
        handler
            .insert(&conn, pid, "cache", "kept", "v", &[], Some(60_000))
            .unwrap();
        assert!(handler.fetch(&conn, pid, "cache", "gone", None, false).unwrap().is_none());
        assert!(handler.fetch(&conn, pid, "cache", "kept", None, false).unwrap().is_some());
        assert_eq!(handler.count(&conn, pid, "cache", None).unwrap(), 1);
    }

    #[test]
    fn scan_pages_are_ordered_and_windowed() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        let handler = handler_for("release_0", "people").unwrap();
        for name in ["p1", "p2", "p3"] {
            handler
                .insert(&conn, pid, "people", name, "v", &tags(&[("s", "x")]), None)
                .unwrap();
        }
        let filter = query_from_str(r#"{"s": "x"}"#).unwrap();
        let page = handler
            .scan_page(&conn, pid, "people", Some(&filter), 1, 1, None, false)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "p2");

        let first = handler
            .scan_keyset_page(&conn, pid, "people", None, 0, 2)
            .unwrap();
        assert_eq!(first.len(), 2);
        let rest = handler
            .scan_keyset_page(&conn, pid, "people", None, first[1].id, 2)
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "p3");
    }

    #[test]
    fn normalized_handler_projects_tags() {
        let conn = test_conn();
        let pid = profile_id(&conn);
        for sql in registry::CONNECTION_REC_V1.sqlite_ddl() {
            conn.execute_batch(&sql).unwrap();
        }
        let handler = handler_for("release_0_1", "connection").unwrap();
        handler
            .insert(
                &conn,
                pid,
                "connection",
                "conn1",
                r#"{"their_label":"Bob"}"#,
                &tags(&[("state", "active"), ("their_did", "did:ex:1"), ("custom", "x")]),
                None,
            )
            .unwrap();

        // Projected tags live in the side table, not items_tags.
        let state: String = conn
            .query_row("SELECT state FROM connection_rec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "active");
        let plain: i64 = conn
            .query_row("SELECT COUNT(*) FROM items_tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(plain, 1);

        // Reads reassemble the full tag set and filters hit the columns.
        let filter = query_from_str(r#"{"state": "active", "custom": "x"}"#).unwrap();
        let entry = handler
            .fetch(&conn, pid, "connection", "conn1", Some(&filter), false)
            .unwrap()
            .unwrap();
        assert_eq!(entry.tag_value("state"), Some("active"));
        assert_eq!(entry.tag_value("custom"), Some("x"));
        assert_eq!(entry.tag_value("their_did"), Some("did:ex:1"));
    }

    #[test]
    fn unknown_release_is_unsupported() {
        let err = handler_for("release_9", "people").unwrap_err();
        assert_eq!(err.code(), Some(DatabaseErrorCode::UnsupportedVersion));
    }
}

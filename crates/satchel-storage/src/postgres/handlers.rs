//! Per-category CRUD handlers for the server backend.
//!
//! Same contract as the embedded handlers, but async against a
//! `tokio_postgres` client, with `$n` placeholders and every object name
//! qualified through the [`SchemaContext`]. `FOR UPDATE` is honored when
//! the session holds a transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio_postgres::Client;
use tokio_postgres::types::ToSql;

use satchel_core::{Entry, EntryTag};
use satchel_query::{SqlDialect, TagQuery, TagSqlEncoder};

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::postgres::schema::SchemaContext;
use crate::registry::{self, NormalizedSpec};
use crate::traits::validate_order_by;

/// Predicate excluding expired rows from every read.
const NOT_EXPIRED: &str = "(expiry IS NULL OR expiry > CURRENT_TIMESTAMP)";

/// Per-category operations over a server-backend client.
#[async_trait]
pub trait PgCategoryHandler: Send + Sync {
    /// Inserts a new item with its tags.
    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()>;

    /// Replaces an item's value and tags in full.
    #[allow(clippy::too_many_arguments)]
    async fn replace(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()>;

    /// Removes one item.
    async fn remove(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
    ) -> DbResult<()>;

    /// Removes all matching items, returning the count.
    async fn remove_all(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64>;

    /// Fetches one item by name.
    #[allow(clippy::too_many_arguments)]
    async fn fetch(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
        tag_filter: Option<&TagQuery>,
        for_update: bool,
    ) -> DbResult<Option<Entry>>;

    /// Fetches all matching items.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_all(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        limit: Option<i64>,
        for_update: bool,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>>;

    /// Counts matching items.
    async fn count(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64>;

    /// One page of an offset scan.
    #[allow(clippy::too_many_arguments)]
    async fn scan_page(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        offset: i64,
        limit: i64,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>>;

    /// One page of a keyset scan, ordered by item id ascending.
    #[allow(clippy::too_many_arguments)]
    async fn scan_keyset_page(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        last_id: i64,
        limit: i64,
    ) -> DbResult<Vec<Entry>>;
}

/// Item handler over the common tables, optionally projecting tags into a
/// normalized side table.
pub struct PgItemHandler {
    normalized: Option<&'static NormalizedSpec>,
}

static DEFAULT_HANDLER: PgItemHandler = PgItemHandler { normalized: None };

static NORMALIZED_HANDLERS: Lazy<HashMap<&'static str, HashMap<&'static str, PgItemHandler>>> =
    Lazy::new(|| {
        let mut releases = HashMap::new();
        for &release in registry::RELEASE_ORDER {
            let mut handlers = HashMap::new();
            for spec in registry::get_release(release).expect("known release") {
                handlers.insert(
                    spec.category,
                    PgItemHandler {
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
pub fn handler_for(release: &str, category: &str) -> DbResult<&'static dyn PgCategoryHandler> {
    let handlers = NORMALIZED_HANDLERS.get(release).ok_or_else(|| {
        DatabaseError::new(
            DatabaseErrorCode::UnsupportedVersion,
            format!("release number '{release}' not found"),
        )
    })?;
    Ok(handlers
        .get(category)
        .map(|h| h as &dyn PgCategoryHandler)
        .unwrap_or(&DEFAULT_HANDLER))
}

/// Converts a relative expiry into an absolute timestamp.
pub(crate) fn expiry_timestamp(expiry_ms: Option<i64>) -> Option<DateTime<Utc>> {
    expiry_ms.map(|ms| Utc::now() + chrono::Duration::milliseconds(ms))
}

impl PgItemHandler {
    fn encode_filter(
        &self,
        schema: &SchemaContext,
        tag_filter: Option<&TagQuery>,
        start_index: usize,
    ) -> (Option<String>, Vec<String>) {
        let Some(query) = tag_filter else {
            return (None, Vec::new());
        };
        let items_table = schema.qualify("items");
        let tags_table = schema.qualify("items_tags");
        let normalized = self
            .normalized
            .map(|spec| spec.normalized_columns(schema.qualify(spec.table)));
        let mut encoder = TagSqlEncoder::new(SqlDialect::Postgres, &items_table, &tags_table)
            .with_start_index(start_index);
        if let Some(columns) = normalized.as_ref() {
            encoder = encoder.with_normalized(columns);
        }
        let (sql, args) = encoder.encode(query);
        (Some(sql), args)
    }

    fn split_tags<'t>(&self, tags: &'t [EntryTag]) -> (Vec<&'t EntryTag>, Vec<&'t EntryTag>) {
        match self.normalized {
            None => (Vec::new(), tags.iter().collect()),
            Some(spec) => tags
                .iter()
                .partition(|tag| spec.columns.contains(&tag.name.as_str())),
        }
    }

    async fn write_tags(
        &self,
        client: &Client,
        schema: &SchemaContext,
        item_id: i64,
        profile_id: i64,
        tags: &[EntryTag],
    ) -> DbResult<()> {
        let (projected, plain) = self.split_tags(tags);
        let tag_insert = format!(
            "INSERT INTO {} (item_id, name, value) VALUES ($1, $2, $3)",
            schema.qualify("items_tags")
        );
        for tag in plain {
            client
                .execute(&tag_insert, &[&item_id, &tag.name, &tag.value])
                .await?;
        }
        if let Some(spec) = self.normalized {
            let mut columns = String::from("item_id, profile_id");
            let mut placeholders = String::from("$1, $2");
            let mut values: Vec<&(dyn ToSql + Sync)> = vec![&item_id, &profile_id];
            let mut index = 3;
            for column in spec.columns {
                if let Some(tag) = projected.iter().rev().find(|t| t.name == *column) {
                    columns.push_str(", ");
                    columns.push_str(column);
                    placeholders.push_str(&format!(", ${index}"));
                    index += 1;
                    values.push(&tag.value);
                }
            }
            let sql = format!(
                "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                schema.qualify(spec.table)
            );
            client.execute(&sql, &values).await?;
        }
        Ok(())
    }

    async fn clear_tags(
        &self,
        client: &Client,
        schema: &SchemaContext,
        item_id: i64,
    ) -> DbResult<()> {
        client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE item_id = $1",
                    schema.qualify("items_tags")
                ),
                &[&item_id],
            )
            .await?;
        if let Some(spec) = self.normalized {
            client
                .execute(
                    &format!(
                        "DELETE FROM {} WHERE item_id = $1",
                        schema.qualify(spec.table)
                    ),
                    &[&item_id],
                )
                .await?;
        }
        Ok(())
    }

    async fn load_entry_tags(
        &self,
        client: &Client,
        schema: &SchemaContext,
        item_id: i64,
    ) -> DbResult<Vec<EntryTag>> {
        let mut tags = Vec::new();
        if let Some(spec) = self.normalized {
            let sql = format!(
                "SELECT {} FROM {} WHERE item_id = $1",
                spec.columns.join(", "),
                schema.qualify(spec.table)
            );
            if let Some(row) = client.query_opt(&sql, &[&item_id]).await? {
                for (i, column) in spec.columns.iter().enumerate() {
                    if let Some(value) = row.get::<_, Option<String>>(i) {
                        tags.push(EntryTag::new(*column, value));
                    }
                }
            }
        }
        let rows = client
            .query(
                &format!(
                    "SELECT name, value FROM {} WHERE item_id = $1 ORDER BY id",
                    schema.qualify("items_tags")
                ),
                &[&item_id],
            )
            .await?;
        for row in rows {
            tags.push(EntryTag {
                name: row.get(0),
                value: row.get(1),
            });
        }
        Ok(tags)
    }

    /// Shared SELECT used by fetch_all and the scan pages.
    #[allow(clippy::too_many_arguments)]
    async fn select_entries(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        order_by: Option<&str>,
        descending: bool,
        limit: Option<i64>,
        offset: Option<i64>,
        after_id: Option<i64>,
        for_update: bool,
    ) -> DbResult<Vec<Entry>> {
        let order_col = validate_order_by(order_by)?;
        let direction = if descending { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT id, name, value FROM {} \
             WHERE profile_id = $1 AND category = $2 AND {NOT_EXPIRED}",
            schema.qualify("items")
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&profile_id, &category];
        if let Some(after_id) = after_id.as_ref() {
            sql.push_str(&format!(" AND id > ${}", params.len() + 1));
            params.push(after_id);
        }
        let (filter_sql, filter_args) =
            self.encode_filter(schema, tag_filter, params.len() + 1);
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
        }
        for arg in &filter_args {
            params.push(arg);
        }
        sql.push_str(&format!(" ORDER BY {order_col} {direction}"));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        if for_update {
            sql.push_str(" FOR UPDATE");
        }

        let rows = client.query(&sql, &params).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get(0);
            let name: String = row.get(1);
            let value: String = row.get(2);
            let tags = self.load_entry_tags(client, schema, id).await?;
            entries.push(Entry::new(id, category, name, value, tags));
        }
        Ok(entries)
    }
}

#[async_trait]
impl PgCategoryHandler for PgItemHandler {
    async fn insert(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()> {
        let expiry = expiry_timestamp(expiry_ms);
        let sql = format!(
            "INSERT INTO {} (profile_id, kind, category, name, value, expiry) \
             VALUES ($1, 0, $2, $3, $4, $5) ON CONFLICT DO NOTHING RETURNING id",
            schema.qualify("items")
        );
        let row = client
            .query_opt(&sql, &[&profile_id, &category, &name, &value, &expiry])
            .await?;
        let item_id: i64 = row
            .ok_or_else(|| {
                DatabaseError::new(
                    DatabaseErrorCode::DuplicateItemEntry,
                    format!("duplicate item '{name}' in category '{category}'"),
                )
            })?
            .get(0);
        self.write_tags(client, schema, item_id, profile_id, tags).await
    }

    async fn replace(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()> {
        let expiry = expiry_timestamp(expiry_ms);
        let updated = client
            .execute(
                &format!(
                    "UPDATE {} SET value = $1, expiry = $2 \
                     WHERE profile_id = $3 AND category = $4 AND name = $5",
                    schema.qualify("items")
                ),
                &[&value, &expiry, &profile_id, &category, &name],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::new(
                DatabaseErrorCode::RecordNotFound,
                format!("item '{name}' not found in category '{category}'"),
            ));
        }
        let row = client
            .query_one(
                &format!(
                    "SELECT id FROM {} WHERE profile_id = $1 AND category = $2 AND name = $3",
                    schema.qualify("items")
                ),
                &[&profile_id, &category, &name],
            )
            .await?;
        let item_id: i64 = row.get(0);
        self.clear_tags(client, schema, item_id).await?;
        self.write_tags(client, schema, item_id, profile_id, tags).await
    }

    async fn remove(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
    ) -> DbResult<()> {
        let removed = client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE profile_id = $1 AND category = $2 AND name = $3",
                    schema.qualify("items")
                ),
                &[&profile_id, &category, &name],
            )
            .await?;
        if removed == 0 {
            return Err(DatabaseError::new(
                DatabaseErrorCode::RecordNotFound,
                format!("item '{name}' not found in category '{category}'"),
            ));
        }
        Ok(())
    }

    async fn remove_all(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64> {
        let mut sql = format!(
            "DELETE FROM {} WHERE profile_id = $1 AND category = $2",
            schema.qualify("items")
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&profile_id, &category];
        let (filter_sql, filter_args) = self.encode_filter(schema, tag_filter, 3);
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
        }
        for arg in &filter_args {
            params.push(arg);
        }
        Ok(client.execute(&sql, &params).await?)
    }

    async fn fetch(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        name: &str,
        tag_filter: Option<&TagQuery>,
        for_update: bool,
    ) -> DbResult<Option<Entry>> {
        let mut sql = format!(
            "SELECT id, value FROM {} \
             WHERE profile_id = $1 AND category = $2 AND name = $3 AND {NOT_EXPIRED}",
            schema.qualify("items")
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&profile_id, &category, &name];
        let (filter_sql, filter_args) = self.encode_filter(schema, tag_filter, 4);
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
        }
        for arg in &filter_args {
            params.push(arg);
        }
        if for_update {
            sql.push_str(" FOR UPDATE");
        }
        let Some(row) = client.query_opt(&sql, &params).await? else {
            return Ok(None);
        };
        let id: i64 = row.get(0);
        let value: String = row.get(1);
        let tags = self.load_entry_tags(client, schema, id).await?;
        Ok(Some(Entry::new(id, category, name, value, tags)))
    }

    async fn fetch_all(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        limit: Option<i64>,
        for_update: bool,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>> {
        self.select_entries(
            client, schema, profile_id, category, tag_filter, order_by, descending, limit,
            None, None, for_update,
        )
        .await
    }

    async fn count(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
    ) -> DbResult<u64> {
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} \
             WHERE profile_id = $1 AND category = $2 AND {NOT_EXPIRED}",
            schema.qualify("items")
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&profile_id, &category];
        let (filter_sql, filter_args) = self.encode_filter(schema, tag_filter, 3);
        if let Some(filter) = filter_sql {
            sql.push_str(" AND ");
            sql.push_str(&filter);
        }
        for arg in &filter_args {
            params.push(arg);
        }
        let row = client.query_one(&sql, &params).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn scan_page(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        offset: i64,
        limit: i64,
        order_by: Option<&str>,
        descending: bool,
    ) -> DbResult<Vec<Entry>> {
        self.select_entries(
            client,
            schema,
            profile_id,
            category,
            tag_filter,
            order_by,
            descending,
            Some(limit),
            Some(offset),
            None,
            false,
        )
        .await
    }

    async fn scan_keyset_page(
        &self,
        client: &Client,
        schema: &SchemaContext,
        profile_id: i64,
        category: &str,
        tag_filter: Option<&TagQuery>,
        last_id: i64,
        limit: i64,
    ) -> DbResult<Vec<Entry>> {
        self.select_entries(
            client,
            schema,
            profile_id,
            category,
            tag_filter,
            Some("id"),
            false,
            Some(limit),
            None,
            Some(last_id),
            false,
        )
        .await
    }
}

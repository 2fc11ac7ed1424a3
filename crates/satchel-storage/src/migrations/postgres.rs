//! Server-backend migration procedures.
//!
//! Mirrors the embedded procedures with schema-qualified object names.

use tokio_postgres::Client;

use super::{PgMigration, PgMigrationFut};
use crate::error::DbResult;
use crate::postgres::schema::SchemaContext;
use crate::registry::{CONNECTION_REC_V1, CRED_EX_V20_REC, NormalizedSpec};

/// Resolves the procedure for one adjacent step, if registered.
pub(crate) fn migration_for(from: &str, to: &str) -> Option<PgMigration> {
    match (from, to) {
        ("release_0", "release_0_1") => Some(migrate_0_to_0_1),
        ("release_0_1", "release_0_2") => Some(migrate_0_1_to_0_2),
        _ => None,
    }
}

fn migrate_0_to_0_1<'a>(client: &'a Client, schema: &'a SchemaContext) -> PgMigrationFut<'a> {
    Box::pin(async move {
        create_and_backfill(client, schema, &CONNECTION_REC_V1, CONNECTION_REC_V1.columns).await
    })
}

fn migrate_0_1_to_0_2<'a>(client: &'a Client, schema: &'a SchemaContext) -> PgMigrationFut<'a> {
    Box::pin(async move {
        let connection_rec = schema.qualify("connection_rec");
        let items_tags = schema.qualify("items_tags");
        client
            .batch_execute(&format!(
                "ALTER TABLE {connection_rec} ADD COLUMN IF NOT EXISTS connection_protocol TEXT"
            ))
            .await?;
        client
            .batch_execute(&format!(
                "CREATE INDEX IF NOT EXISTS ix_connection_rec_connection_protocol \
                 ON {connection_rec} (connection_protocol)"
            ))
            .await?;
        client
            .batch_execute(&format!(
                "UPDATE {connection_rec} SET connection_protocol = \
                    (SELECT value FROM {items_tags} \
                     WHERE item_id = {connection_rec}.item_id \
                     AND name = 'connection_protocol' \
                     ORDER BY id DESC LIMIT 1)"
            ))
            .await?;
        client
            .batch_execute(&format!(
                "DELETE FROM {items_tags} WHERE name = 'connection_protocol' \
                 AND item_id IN (SELECT item_id FROM {connection_rec})"
            ))
            .await?;

        create_and_backfill(client, schema, &CRED_EX_V20_REC, CRED_EX_V20_REC.columns).await
    })
}

/// Creates a side table and backfills it from the tags of its category's
/// existing items.
async fn create_and_backfill(
    client: &Client,
    schema: &SchemaContext,
    spec: &NormalizedSpec,
    columns: &[&str],
) -> DbResult<()> {
    for sql in spec.postgres_ddl(schema.schema_name()) {
        client.batch_execute(&sql).await?;
    }

    let table = schema.qualify(spec.table);
    let items = schema.qualify("items");
    let items_tags = schema.qualify("items_tags");
    let category = spec.category;
    let column_list = columns.join(", ");
    let selects: Vec<String> = columns
        .iter()
        .map(|column| {
            format!(
                "(SELECT value FROM {items_tags} \
                 WHERE item_id = i.id AND name = '{column}' \
                 ORDER BY id DESC LIMIT 1)"
            )
        })
        .collect();
    client
        .batch_execute(&format!(
            "INSERT INTO {table} (item_id, profile_id, {column_list}) \
             SELECT i.id, i.profile_id, {} FROM {items} i \
             WHERE i.category = '{category}' \
             AND NOT EXISTS (SELECT 1 FROM {table} t WHERE t.item_id = i.id)",
            selects.join(", ")
        ))
        .await?;

    let name_list: Vec<String> = columns.iter().map(|c| format!("'{c}'")).collect();
    client
        .batch_execute(&format!(
            "DELETE FROM {items_tags} WHERE name IN ({}) \
             AND item_id IN (SELECT id FROM {items} WHERE category = '{category}')",
            name_list.join(", ")
        ))
        .await?;
    Ok(())
}

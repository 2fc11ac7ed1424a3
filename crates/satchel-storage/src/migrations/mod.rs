//! Forward schema migrations.
//!
//! Migrations are named by `(from_release, to_release, backend)` and
//! registered in static per-backend tables. Applying walks
//! `RELEASE_ORDER` over each adjacent pair: a missing procedure warns and
//! continues, a failing procedure aborts with `ProvisionError` carrying
//! the cause. Only forward paths are valid; everything else fails with
//! `UnsupportedVersion`. There is no automatic rollback.

pub mod postgres;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::postgres::schema::SchemaContext;
use crate::registry::{RELEASE_ORDER, release_index};

/// A single embedded-backend migration procedure.
pub type SqliteMigration = fn(&rusqlite::Connection) -> DbResult<()>;

/// Future returned by a server-backend migration procedure.
pub type PgMigrationFut<'a> = Pin<Box<dyn Future<Output = DbResult<()>> + Send + 'a>>;

/// A single server-backend migration procedure.
pub type PgMigration =
    for<'a> fn(&'a tokio_postgres::Client, &'a SchemaContext) -> PgMigrationFut<'a>;

/// Resolves the adjacent release pairs between `from` and `to`.
///
/// Fails with `UnsupportedVersion` unless `to` strictly follows `from` in
/// `RELEASE_ORDER`; downward and same-release migrations are rejected.
pub fn migration_steps(
    from: &str,
    to: &str,
) -> DbResult<Vec<(&'static str, &'static str)>> {
    let (Some(from_idx), Some(to_idx)) = (release_index(from), release_index(to)) else {
        return Err(invalid_path(from, to));
    };
    if to_idx <= from_idx {
        return Err(invalid_path(from, to));
    }
    Ok((from_idx..to_idx)
        .map(|i| (RELEASE_ORDER[i], RELEASE_ORDER[i + 1]))
        .collect())
}

fn invalid_path(from: &str, to: &str) -> DatabaseError {
    DatabaseError::new(
        DatabaseErrorCode::UnsupportedVersion,
        format!("invalid migration path from '{from}' to '{to}'"),
    )
}

/// Walks the embedded-backend migrations from `from` up to `to`.
pub fn apply_sqlite_migrations(
    conn: &rusqlite::Connection,
    from: &str,
    to: &str,
) -> DbResult<()> {
    for (step_from, step_to) in migration_steps(from, to)? {
        match sqlite::migration_for(step_from, step_to) {
            None => warn!(
                from = step_from,
                to = step_to,
                "no sqlite migration procedure registered, skipping"
            ),
            Some(migrate) => {
                migrate(conn).map_err(|err| {
                    DatabaseError::with_cause(
                        DatabaseErrorCode::ProvisionError,
                        format!("sqlite migration failed from {step_from} to {step_to}"),
                        err,
                    )
                })?;
                info!(from = step_from, to = step_to, "applied sqlite migration");
            }
        }
    }
    Ok(())
}

/// Walks the server-backend migrations from `from` up to `to`.
pub async fn apply_postgres_migrations(
    client: &tokio_postgres::Client,
    schema: &SchemaContext,
    from: &str,
    to: &str,
) -> DbResult<()> {
    for (step_from, step_to) in migration_steps(from, to)? {
        match postgres::migration_for(step_from, step_to) {
            None => warn!(
                from = step_from,
                to = step_to,
                "no postgres migration procedure registered, skipping"
            ),
            Some(migrate) => {
                migrate(client, schema).await.map_err(|err| {
                    DatabaseError::with_cause(
                        DatabaseErrorCode::ProvisionError,
                        format!("postgres migration failed from {step_from} to {step_to}"),
                        err,
                    )
                })?;
                info!(from = step_from, to = step_to, "applied postgres migration");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_paths_decompose_into_adjacent_pairs() {
        assert_eq!(
            migration_steps("release_0", "release_0_2").unwrap(),
            vec![("release_0", "release_0_1"), ("release_0_1", "release_0_2")]
        );
        assert_eq!(
            migration_steps("release_0_1", "release_0_2").unwrap(),
            vec![("release_0_1", "release_0_2")]
        );
    }

    #[test]
    fn non_forward_paths_are_unsupported() {
        for (from, to) in [
            ("release_0_2", "release_0"),
            ("release_0_1", "release_0_1"),
            ("release_0_1", "release_0"),
            ("release_9", "release_0_1"),
            ("release_0", "release_9"),
        ] {
            let err = migration_steps(from, to).unwrap_err();
            assert_eq!(
                err.code(),
                Some(DatabaseErrorCode::UnsupportedVersion),
                "{from} -> {to}"
            );
        }
    }
}

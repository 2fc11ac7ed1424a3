//! Category and release registry.
//!
//! A release names a schema version and the set of categories it
//! normalizes. `release_0` is the generic release: no per-category
//! objects, every category routed to the default handler. Later releases
//! carry [`NormalizedSpec`] descriptors from which each backend renders
//! its DDL, its drop statements, and the query projection.
//!
//! The registry is a static table; there is no runtime loading. Unknown
//! releases fail with `UnsupportedVersion`, unknown categories fall back
//! to the default handler at the dispatch sites.

use satchel_query::NormalizedColumns;

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};

/// Linearly ordered release identifiers. Migrations walk adjacent pairs.
pub const RELEASE_ORDER: &[&str] = &["release_0", "release_0_1", "release_0_2"];

/// The generic release.
pub const RELEASE_0: &str = "release_0";

/// Position of a release in [`RELEASE_ORDER`].
pub fn release_index(release: &str) -> Option<usize> {
    RELEASE_ORDER.iter().position(|r| *r == release)
}

/// Kind of a schema object named by a structured drop statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    /// A table (dropping it takes its indexes with it).
    Table,
    /// A standalone index.
    Index,
}

/// A schema object to drop, as `(kind, bare identifier)`. The backend
/// renders the actual DDL, qualifying the identifier as needed.
#[derive(Debug, Clone, Copy)]
pub struct DropObject {
    /// Object kind.
    pub kind: DropKind,
    /// Unqualified object name.
    pub name: &'static str,
}

/// Descriptor of a normalized category.
///
/// The projected tag names double as column names in the side table; all
/// columns are nullable text. The canonical value blob stays in `items`.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedSpec {
    /// Category this descriptor normalizes.
    pub category: &'static str,
    /// Side table holding the projected columns.
    pub table: &'static str,
    /// Tag names materialized as typed columns.
    pub columns: &'static [&'static str],
}

impl NormalizedSpec {
    /// Query-lowering projection for this category.
    ///
    /// `qualified_table` is the side table name as the backend references
    /// it (schema-qualified on the server backend).
    pub fn normalized_columns(&self, qualified_table: String) -> NormalizedColumns {
        NormalizedColumns {
            table: qualified_table,
            columns: self.columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Create-DDL for the embedded backend.
    pub fn sqlite_ddl(&self) -> Vec<String> {
        let table = self.table;
        let mut column_defs = String::new();
        for column in self.columns {
            column_defs.push_str(&format!("    {column} TEXT,\n"));
        }
        let mut ddl = vec![format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20   id INTEGER PRIMARY KEY,\n\
             \x20   item_id INTEGER NOT NULL,\n\
             \x20   profile_id INTEGER NOT NULL,\n\
             {column_defs}\
             \x20   FOREIGN KEY (item_id) REFERENCES items (id) \
             ON DELETE CASCADE ON UPDATE CASCADE\n)"
        )];
        ddl.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_{table}_item_id ON {table} (item_id)"
        ));
        for column in self.columns {
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS ix_{table}_{column} ON {table} ({column})"
            ));
        }
        ddl
    }

    /// Create-DDL for the server backend, qualified with `schema`.
    pub fn postgres_ddl(&self, schema: &str) -> Vec<String> {
        let table = self.table;
        let mut column_defs = String::new();
        for column in self.columns {
            column_defs.push_str(&format!("    {column} TEXT,\n"));
        }
        let mut ddl = vec![format!(
            "CREATE TABLE IF NOT EXISTS {schema}.{table} (\n\
             \x20   id BIGSERIAL PRIMARY KEY,\n\
             \x20   item_id BIGINT NOT NULL,\n\
             \x20   profile_id BIGINT NOT NULL,\n\
             {column_defs}\
             \x20   FOREIGN KEY (item_id) REFERENCES {schema}.items (id) \
             ON DELETE CASCADE ON UPDATE CASCADE\n)"
        )];
        ddl.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_{table}_item_id ON {schema}.{table} (item_id)"
        ));
        for column in self.columns {
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS ix_{table}_{column} ON {schema}.{table} ({column})"
            ));
        }
        ddl
    }

    /// Structured drop statements for this category's objects.
    pub fn drop_objects(&self) -> Vec<DropObject> {
        vec![DropObject {
            kind: DropKind::Table,
            name: self.table,
        }]
    }
}

/// Connection records, first normalized in `release_0_1`.
pub const CONNECTION_REC_V1: NormalizedSpec = NormalizedSpec {
    category: "connection",
    table: "connection_rec",
    columns: &[
        "state",
        "my_did",
        "their_did",
        "their_role",
        "invitation_key",
        "invitation_msg_id",
        "request_id",
        "alias",
    ],
};

/// Connection records as of `release_0_2`: `release_0_1` columns plus the
/// negotiated protocol.
pub const CONNECTION_REC_V2: NormalizedSpec = NormalizedSpec {
    category: "connection",
    table: "connection_rec",
    columns: &[
        "state",
        "my_did",
        "their_did",
        "their_role",
        "invitation_key",
        "invitation_msg_id",
        "request_id",
        "alias",
        "connection_protocol",
    ],
};

/// Credential-exchange records, normalized in `release_0_2`.
pub const CRED_EX_V20_REC: NormalizedSpec = NormalizedSpec {
    category: "cred_ex_v20",
    table: "cred_ex_v20_rec",
    columns: &["state", "thread_id", "connection_id"],
};

const RELEASE_0_SPECS: &[NormalizedSpec] = &[];
const RELEASE_0_1_SPECS: &[NormalizedSpec] = &[CONNECTION_REC_V1];
const RELEASE_0_2_SPECS: &[NormalizedSpec] = &[CONNECTION_REC_V2, CRED_EX_V20_REC];

/// Returns the normalized-category descriptors of a release, in registry
/// order. Fails with `UnsupportedVersion` for unknown releases.
pub fn get_release(release: &str) -> DbResult<&'static [NormalizedSpec]> {
    match release {
        "release_0" => Ok(RELEASE_0_SPECS),
        "release_0_1" => Ok(RELEASE_0_1_SPECS),
        "release_0_2" => Ok(RELEASE_0_2_SPECS),
        other => Err(DatabaseError::new(
            DatabaseErrorCode::UnsupportedVersion,
            format!("release number '{other}' not found, expected one of {RELEASE_ORDER:?}"),
        )),
    }
}

/// Returns the descriptor for a category at a release, when normalized.
pub fn normalized_for(release: &str, category: &str) -> DbResult<Option<&'static NormalizedSpec>> {
    Ok(get_release(release)?
        .iter()
        .find(|spec| spec.category == category))
}

//! Per-tenant object-name qualification.
//!
//! The server backend namespaces every store object under a schema
//! derived from the connection identity. Every object-name reference in
//! DDL and DML goes through [`SchemaContext::qualify`]; nothing else in
//! the backend concatenates schema names.

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};

/// Object-name qualifier for one tenant's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaContext {
    schema: String,
}

impl SchemaContext {
    /// Derives the schema from the connecting user name; `public` when
    /// the URI carries no user. Names are restricted to identifier-safe
    /// characters since they are interpolated into DDL.
    pub fn new(username: Option<&str>) -> DbResult<Self> {
        let schema = match username {
            None | Some("") => "public".to_string(),
            Some(name) => {
                let lowered = name.to_ascii_lowercase();
                if !is_safe_identifier(&lowered) {
                    return Err(DatabaseError::new(
                        DatabaseErrorCode::ConnectionError,
                        format!("user name '{name}' is not usable as a schema name"),
                    ));
                }
                lowered
            }
        };
        Ok(Self { schema })
    }

    /// The bare schema name.
    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    /// Qualifies an object name with the schema.
    pub fn qualify(&self, object: &str) -> String {
        format!("{}.{object}", self.schema)
    }
}

impl std::fmt::Display for SchemaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.schema)
    }
}

/// Identifier check for names that end up in SQL text unquoted.
pub(crate) fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

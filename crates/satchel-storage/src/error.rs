//! Backend-layer errors and their translation to the caller-facing kind.
//!
//! Backends raise a [`DatabaseError`]; the store translates it to a
//! [`StoreError`] at the facade boundary. The original backend message is
//! always preserved as the attached cause.

use satchel_core::{StoreError, StoreErrorKind};

/// Classification of a backend-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseErrorCode {
    /// The store does not exist at the given location.
    DatabaseNotFound,
    /// The stored or requested schema release is not supported.
    UnsupportedVersion,
    /// The `default_profile` config row is missing.
    DefaultProfileNotFound,
    /// The requested profile does not exist.
    ProfileNotFound,
    /// A profile with that name already exists.
    ProfileAlreadyExists,
    /// No connection became available within the acquire timeout, or the
    /// active-session cap was reached.
    ConnectionPoolExhausted,
    /// The store is not encrypted (rekey on a plaintext store).
    DatabaseNotEncrypted,
    /// Establishing or validating a connection failed.
    ConnectionError,
    /// A query failed or its inputs were malformed.
    QueryError,
    /// Provisioning or migrating the store failed.
    ProvisionError,
    /// An item with the same `(profile, category, name)` already exists.
    DuplicateItemEntry,
    /// The targeted record does not exist.
    RecordNotFound,
    /// The backend account lacks the required privileges.
    PermissionError,
    /// The operation is not supported by this backend.
    UnsupportedOperation,
}

impl DatabaseErrorCode {
    /// Short identifier used in log output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DatabaseNotFound => "DatabaseNotFound",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::DefaultProfileNotFound => "DefaultProfileNotFound",
            Self::ProfileNotFound => "ProfileNotFound",
            Self::ProfileAlreadyExists => "ProfileAlreadyExists",
            Self::ConnectionPoolExhausted => "ConnectionPoolExhausted",
            Self::DatabaseNotEncrypted => "DatabaseNotEncrypted",
            Self::ConnectionError => "ConnectionError",
            Self::QueryError => "QueryError",
            Self::ProvisionError => "ProvisionError",
            Self::DuplicateItemEntry => "DuplicateItemEntry",
            Self::RecordNotFound => "RecordNotFound",
            Self::PermissionError => "PermissionError",
            Self::UnsupportedOperation => "UnsupportedOperation",
        }
    }
}

impl std::fmt::Display for DatabaseErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised inside a backend.
///
/// `Code` carries an explicit classification; the native variants wrap
/// engine errors that have not been classified at the raise site and are
/// classified during translation instead.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// A classified backend failure.
    #[error("{code}: {message}")]
    Code {
        /// Classification of the failure.
        code: DatabaseErrorCode,
        /// Human-readable description.
        message: String,
        /// Underlying engine message, when available.
        cause: Option<String>,
    },

    /// A raw SQLite engine error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A raw PostgreSQL client error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Convenience alias used throughout the storage crate.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

impl DatabaseError {
    /// Creates a classified error.
    pub fn new(code: DatabaseErrorCode, message: impl Into<String>) -> Self {
        Self::Code {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Creates a classified error with the originating engine message.
    pub fn with_cause(
        code: DatabaseErrorCode,
        message: impl Into<String>,
        cause: impl ToString,
    ) -> Self {
        Self::Code {
            code,
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }

    /// Returns the classification, if this error carries one.
    pub fn code(&self) -> Option<DatabaseErrorCode> {
        match self {
            Self::Code { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Returns `true` for a SQLite uniqueness violation (unique or primary
/// key constraint).
pub(crate) fn sqlite_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Returns `true` for a PostgreSQL uniqueness violation.
pub(crate) fn postgres_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Code {
                code,
                message,
                cause,
            } => {
                let kind = match code {
                    DatabaseErrorCode::DatabaseNotFound
                    | DatabaseErrorCode::ProfileNotFound
                    | DatabaseErrorCode::DefaultProfileNotFound
                    | DatabaseErrorCode::RecordNotFound => StoreErrorKind::NotFound,
                    DatabaseErrorCode::UnsupportedVersion
                    | DatabaseErrorCode::UnsupportedOperation => StoreErrorKind::Unsupported,
                    DatabaseErrorCode::DuplicateItemEntry
                    | DatabaseErrorCode::ProfileAlreadyExists => StoreErrorKind::Duplicate,
                    DatabaseErrorCode::DatabaseNotEncrypted => StoreErrorKind::Encryption,
                    DatabaseErrorCode::ConnectionPoolExhausted
                    | DatabaseErrorCode::ConnectionError
                    | DatabaseErrorCode::QueryError
                    | DatabaseErrorCode::ProvisionError
                    | DatabaseErrorCode::PermissionError => StoreErrorKind::Unexpected,
                };
                let mut store_err = StoreError::new(kind, message);
                store_err.cause = cause;
                store_err
            }
            DatabaseError::Sqlite(e) => {
                let kind = if sqlite_unique_violation(&e) {
                    StoreErrorKind::Duplicate
                } else {
                    StoreErrorKind::Backend
                };
                StoreError::new(kind, "database operation failed").with_cause(e.to_string())
            }
            DatabaseError::Postgres(e) => {
                let kind = if postgres_unique_violation(&e) {
                    StoreErrorKind::Duplicate
                } else {
                    StoreErrorKind::Backend
                };
                StoreError::new(kind, "database operation failed").with_cause(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(code: DatabaseErrorCode) -> StoreErrorKind {
        StoreError::from(DatabaseError::new(code, "x")).kind
    }

    #[test]
    fn not_found_family_translates() {
        assert_eq!(kind_of(DatabaseErrorCode::DatabaseNotFound), StoreErrorKind::NotFound);
        assert_eq!(kind_of(DatabaseErrorCode::ProfileNotFound), StoreErrorKind::NotFound);
        assert_eq!(
            kind_of(DatabaseErrorCode::DefaultProfileNotFound),
            StoreErrorKind::NotFound
        );
        assert_eq!(kind_of(DatabaseErrorCode::RecordNotFound), StoreErrorKind::NotFound);
    }

    #[test]
    fn unsupported_family_translates() {
        assert_eq!(
            kind_of(DatabaseErrorCode::UnsupportedVersion),
            StoreErrorKind::Unsupported
        );
        assert_eq!(
            kind_of(DatabaseErrorCode::UnsupportedOperation),
            StoreErrorKind::Unsupported
        );
    }

    #[test]
    fn duplicate_family_translates() {
        assert_eq!(
            kind_of(DatabaseErrorCode::DuplicateItemEntry),
            StoreErrorKind::Duplicate
        );
        assert_eq!(
            kind_of(DatabaseErrorCode::ProfileAlreadyExists),
            StoreErrorKind::Duplicate
        );
    }

    #[test]
    fn encryption_translates() {
        assert_eq!(
            kind_of(DatabaseErrorCode::DatabaseNotEncrypted),
            StoreErrorKind::Encryption
        );
    }

    #[test]
    fn remainder_translates_to_unexpected() {
        assert_eq!(
            kind_of(DatabaseErrorCode::ConnectionPoolExhausted),
            StoreErrorKind::Unexpected
        );
        assert_eq!(kind_of(DatabaseErrorCode::QueryError), StoreErrorKind::Unexpected);
        assert_eq!(
            kind_of(DatabaseErrorCode::PermissionError),
            StoreErrorKind::Unexpected
        );
    }

    #[test]
    fn cause_is_preserved() {
        let err = DatabaseError::with_cause(
            DatabaseErrorCode::QueryError,
            "failed to fetch item",
            "disk I/O error",
        );
        let store_err = StoreError::from(err);
        assert_eq!(store_err.cause.as_deref(), Some("disk I/O error"));
    }

    #[test]
    fn native_sqlite_error_translates_to_backend() {
        let native = rusqlite::Error::SqliteSingleThreadedMode;
        let store_err = StoreError::from(DatabaseError::from(native));
        assert_eq!(store_err.kind, StoreErrorKind::Backend);
        assert!(store_err.cause.is_some());
    }
}

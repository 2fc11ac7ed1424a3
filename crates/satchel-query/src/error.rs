//! Query parse and lowering errors.

/// Errors raised while parsing or lowering a tag query.
#[derive(Debug, thiserror::Error)]
pub enum QueryParseError {
    /// The filter was not valid JSON.
    #[error("invalid query JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The top level of a query must be a JSON object.
    #[error("query must be a JSON object, got {found}")]
    NotAnObject {
        /// JSON type that was found instead.
        found: &'static str,
    },

    /// An operator keyword was not recognized.
    #[error("unknown query operator: {operator}")]
    UnknownOperator {
        /// The offending `$`-prefixed key.
        operator: String,
    },

    /// A scalar (string) was required but something else was supplied.
    #[error("expected a string value for '{key}'")]
    ExpectedScalar {
        /// The key whose value was malformed.
        key: String,
    },

    /// A list was required but something else was supplied.
    #[error("expected a list value for '{key}'")]
    ExpectedList {
        /// The key whose value was malformed.
        key: String,
    },

    /// `$exist` requires at least one tag name.
    #[error("$exist requires at least one tag name")]
    EmptyExist,
}

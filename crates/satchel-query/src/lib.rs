//! Tag query language for the satchel store.
//!
//! A tag filter arrives as WQL JSON (`{"attr::x": "y", "$or": [...]}`),
//! is parsed once at the boundary into the closed [`TagQuery`] AST, and is
//! lowered to a backend SQL fragment plus bind values. User input never
//! reaches SQL text; only placeholders do.

pub mod ast;
pub mod error;
pub mod parse;
pub mod sql;

pub use ast::TagQuery;
pub use error::QueryParseError;
pub use parse::{query_from_json, query_from_str};
pub use sql::{NormalizedColumns, SqlDialect, TagSqlEncoder};

//! The closed tag-query AST.

/// A boolean tag filter over the tags of an item.
///
/// Leaf comparators name a tag and constrain its value; combinators
/// compose sub-queries. The set of variants is closed: backends match
/// exhaustively when lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    /// Tag present with exactly this value.
    Eq(String, String),
    /// Tag present with a value other than this one.
    Neq(String, String),
    /// Tag present with a value greater than this one.
    Gt(String, String),
    /// Tag present with a value greater than or equal to this one.
    Gte(String, String),
    /// Tag present with a value less than this one.
    Lt(String, String),
    /// Tag present with a value less than or equal to this one.
    Lte(String, String),
    /// Tag present with a value matching the SQL LIKE pattern.
    Like(String, String),
    /// Tag present with a value in the given set.
    In(String, Vec<String>),
    /// Every listed tag is present, regardless of value.
    Exist(Vec<String>),
    /// All children match. `And([])` matches everything.
    And(Vec<TagQuery>),
    /// Any child matches. `Or([])` matches nothing.
    Or(Vec<TagQuery>),
    /// The child does not match.
    Not(Box<TagQuery>),
}

impl TagQuery {
    /// Convenience constructor for equality on a tag.
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq(name.into(), value.into())
    }

    /// Wraps a query in negation.
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }
}

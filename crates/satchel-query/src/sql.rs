//! Lowering tag queries to SQL.
//!
//! Each leaf comparator becomes an `EXISTS` subquery against the tags
//! table, correlated on the item id; combinators compose with `AND` /
//! `OR` / `NOT`. Bind values are collected in lowering order and emitted
//! as placeholders, never interpolated.
//!
//! When a category is normalized, projected tag names are routed to the
//! category's side table instead, comparing the typed column directly.

use crate::ast::TagQuery;

/// Placeholder style of the target engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// `?` positional placeholders.
    Sqlite,
    /// `$1`-style numbered placeholders.
    Postgres,
}

impl SqlDialect {
    /// Renders the placeholder for the 1-based bind position `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${index}"),
        }
    }
}

/// Projection map for a normalized category.
///
/// `columns` lists the tag names materialized as typed columns on
/// `table`; every other tag name falls through to the common tags table.
/// Tag names double as column names.
#[derive(Debug, Clone)]
pub struct NormalizedColumns {
    /// Side table holding the projected columns (possibly schema-qualified).
    pub table: String,
    /// Projected tag names.
    pub columns: Vec<String>,
}

impl NormalizedColumns {
    /// Returns the column for `tag` when it is projected.
    pub fn column_for(&self, tag: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.as_str() == tag)
            .map(String::as_str)
    }
}

/// Lowers a [`TagQuery`] to a SQL condition plus bind values.
///
/// The produced fragment is a boolean expression suitable for appending
/// to a WHERE clause that already selects from `items_table`.
pub struct TagSqlEncoder<'a> {
    dialect: SqlDialect,
    items_table: &'a str,
    tags_table: &'a str,
    normalized: Option<&'a NormalizedColumns>,
    next_index: usize,
    args: Vec<String>,
}

impl<'a> TagSqlEncoder<'a> {
    /// Creates an encoder targeting the given (possibly schema-qualified)
    /// items and tags tables.
    pub fn new(dialect: SqlDialect, items_table: &'a str, tags_table: &'a str) -> Self {
        Self {
            dialect,
            items_table,
            tags_table,
            normalized: None,
            next_index: 1,
            args: Vec::new(),
        }
    }

    /// Routes projected tag names to a normalized side table.
    pub fn with_normalized(mut self, normalized: &'a NormalizedColumns) -> Self {
        self.normalized = Some(normalized);
        self
    }

    /// Sets the 1-based index of the first placeholder this encoder emits,
    /// for statements that already bind earlier parameters.
    pub fn with_start_index(mut self, index: usize) -> Self {
        self.next_index = index;
        self
    }

    /// Encodes the query, returning the SQL fragment and bind values in
    /// placeholder order.
    pub fn encode(mut self, query: &TagQuery) -> (String, Vec<String>) {
        let sql = self.encode_query(query);
        (sql, self.args)
    }

    fn bind(&mut self, value: &str) -> String {
        let ph = self.dialect.placeholder(self.next_index);
        self.next_index += 1;
        self.args.push(value.to_string());
        ph
    }

    fn encode_query(&mut self, query: &TagQuery) -> String {
        match query {
            TagQuery::Eq(name, value) => self.compare(name, "=", value),
            TagQuery::Neq(name, value) => self.compare(name, "!=", value),
            TagQuery::Gt(name, value) => self.compare(name, ">", value),
            TagQuery::Gte(name, value) => self.compare(name, ">=", value),
            TagQuery::Lt(name, value) => self.compare(name, "<", value),
            TagQuery::Lte(name, value) => self.compare(name, "<=", value),
            TagQuery::Like(name, pattern) => self.compare(name, "LIKE", pattern),
            TagQuery::In(name, values) => self.compare_in(name, values),
            TagQuery::Exist(names) => self.exist(names),
            TagQuery::And(children) => self.conjoin(children, " AND ", "(1 = 1)"),
            TagQuery::Or(children) => self.conjoin(children, " OR ", "(1 = 0)"),
            TagQuery::Not(child) => {
                let inner = self.encode_query(child);
                format!("NOT ({inner})")
            }
        }
    }

    fn conjoin(&mut self, children: &[TagQuery], sep: &str, empty: &str) -> String {
        if children.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = children.iter().map(|c| self.encode_query(c)).collect();
        format!("({})", parts.join(sep))
    }

    fn compare(&mut self, name: &str, op: &str, value: &str) -> String {
        if let Some(column) = self.normalized.and_then(|n| n.column_for(name)) {
            let table = self.normalized.expect("normalized set").table.clone();
            let items = self.items_table;
            let ph = self.bind(value);
            return format!(
                "EXISTS (SELECT 1 FROM {table} n WHERE n.item_id = {items}.id \
                 AND n.{column} {op} {ph})"
            );
        }
        let tags = self.tags_table;
        let items = self.items_table;
        let name_ph = self.bind(name);
        let value_ph = self.bind(value);
        format!(
            "EXISTS (SELECT 1 FROM {tags} t WHERE t.item_id = {items}.id \
             AND t.name = {name_ph} AND t.value {op} {value_ph})"
        )
    }

    fn compare_in(&mut self, name: &str, values: &[String]) -> String {
        if let Some(column) = self.normalized.and_then(|n| n.column_for(name)) {
            let table = self.normalized.expect("normalized set").table.clone();
            let items = self.items_table;
            let placeholders: Vec<String> = values.iter().map(|v| self.bind(v)).collect();
            return format!(
                "EXISTS (SELECT 1 FROM {table} n WHERE n.item_id = {items}.id \
                 AND n.{column} IN ({}))",
                placeholders.join(", ")
            );
        }
        let tags = self.tags_table;
        let items = self.items_table;
        let name_ph = self.bind(name);
        let placeholders: Vec<String> = values.iter().map(|v| self.bind(v)).collect();
        format!(
            "EXISTS (SELECT 1 FROM {tags} t WHERE t.item_id = {items}.id \
             AND t.name = {name_ph} AND t.value IN ({}))",
            placeholders.join(", ")
        )
    }

    fn exist(&mut self, names: &[String]) -> String {
        let clauses: Vec<String> = names
            .iter()
            .map(|name| {
                if let Some(column) = self.normalized.and_then(|n| n.column_for(name)) {
                    let table = self.normalized.expect("normalized set").table.clone();
                    let items = self.items_table;
                    format!(
                        "EXISTS (SELECT 1 FROM {table} n WHERE n.item_id = {items}.id \
                         AND n.{column} IS NOT NULL)"
                    )
                } else {
                    let tags = self.tags_table;
                    let items = self.items_table;
                    let name_ph = self.bind(name);
                    format!(
                        "EXISTS (SELECT 1 FROM {tags} t WHERE t.item_id = {items}.id \
                         AND t.name = {name_ph})"
                    )
                }
            })
            .collect();
        if clauses.len() == 1 {
            clauses.into_iter().next().expect("one clause")
        } else {
            format!("({})", clauses.join(" AND "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::query_from_str;
    use pretty_assertions::assert_eq;

    fn encode_sqlite(query: &TagQuery) -> (String, Vec<String>) {
        TagSqlEncoder::new(SqlDialect::Sqlite, "items", "items_tags").encode(query)
    }

    #[test]
    fn eq_lowers_to_exists() {
        let q = TagQuery::eq("status", "active");
        let (sql, args) = encode_sqlite(&q);
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM items_tags t WHERE t.item_id = items.id \
             AND t.name = ? AND t.value = ?)"
        );
        assert_eq!(args, vec!["status", "active"]);
    }

    #[test]
    fn postgres_placeholders_are_numbered_from_start_index() {
        let q = query_from_str(r#"{"a": "1", "b": {"$gt": "2"}}"#).unwrap();
        let (sql, args) = TagSqlEncoder::new(SqlDialect::Postgres, "sch.items", "sch.items_tags")
            .with_start_index(4)
            .encode(&q);
        assert!(sql.contains("t.name = $4 AND t.value = $5"));
        assert!(sql.contains("t.name = $6 AND t.value > $7"));
        assert_eq!(args, vec!["a", "1", "b", "2"]);
    }

    #[test]
    fn and_or_compose_with_parens() {
        let q = query_from_str(r#"{"$or": [{"a": "1"}, {"b": "2"}]}"#).unwrap();
        let (sql, args) = encode_sqlite(&q);
        assert!(sql.starts_with('('));
        assert!(sql.contains(" OR "));
        assert_eq!(args, vec!["a", "1", "b", "2"]);
    }

    #[test]
    fn empty_and_selects_all_empty_or_selects_none() {
        let (sql, args) = encode_sqlite(&TagQuery::And(vec![]));
        assert_eq!(sql, "(1 = 1)");
        assert!(args.is_empty());
        let (sql, _) = encode_sqlite(&TagQuery::Or(vec![]));
        assert_eq!(sql, "(1 = 0)");
    }

    #[test]
    fn not_wraps_inner_query() {
        let q = TagQuery::eq("a", "1").negate();
        let (sql, _) = encode_sqlite(&q);
        assert!(sql.starts_with("NOT ("));
        assert!(sql.ends_with(')'));
    }

    #[test]
    fn double_negation_nests() {
        let q = TagQuery::eq("a", "1").negate().negate();
        let (sql, args) = encode_sqlite(&q);
        assert!(sql.starts_with("NOT (NOT ("));
        assert_eq!(args, vec!["a", "1"]);
    }

    #[test]
    fn exist_emits_name_only_subqueries() {
        let q = TagQuery::Exist(vec!["a".into(), "b".into()]);
        let (sql, args) = encode_sqlite(&q);
        assert_eq!(sql.matches("EXISTS").count(), 2);
        assert!(!sql.contains("t.value"));
        assert_eq!(args, vec!["a", "b"]);
    }

    #[test]
    fn in_lowers_to_value_set() {
        let q = TagQuery::In("state".into(), vec!["init".into(), "done".into()]);
        let (sql, args) = encode_sqlite(&q);
        assert!(sql.contains("t.value IN (?, ?)"));
        assert_eq!(args, vec!["state", "init", "done"]);
    }

    #[test]
    fn normalized_names_route_to_side_table() {
        let normalized = NormalizedColumns {
            table: "connection_rec".into(),
            columns: vec!["state".into(), "their_did".into()],
        };
        let q = query_from_str(r#"{"state": "active", "other": "x"}"#).unwrap();
        let (sql, args) = TagSqlEncoder::new(SqlDialect::Sqlite, "items", "items_tags")
            .with_normalized(&normalized)
            .encode(&q);
        assert!(sql.contains("FROM connection_rec n"));
        assert!(sql.contains("n.state = ?"));
        // Unprojected tag still goes through items_tags.
        assert!(sql.contains("FROM items_tags t"));
        // The projected comparison binds only the value, not the name.
        assert_eq!(args, vec!["active", "other", "x"]);
    }

    #[test]
    fn normalized_exist_tests_not_null() {
        let normalized = NormalizedColumns {
            table: "connection_rec".into(),
            columns: vec!["state".into()],
        };
        let q = TagQuery::Exist(vec!["state".into()]);
        let (sql, args) = TagSqlEncoder::new(SqlDialect::Sqlite, "items", "items_tags")
            .with_normalized(&normalized)
            .encode(&q);
        assert!(sql.contains("n.state IS NOT NULL"));
        assert!(args.is_empty());
    }
}

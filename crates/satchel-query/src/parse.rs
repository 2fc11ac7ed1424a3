//! Parsing the WQL JSON form into the AST.
//!
//! The external form is a JSON object. A key that is a tag name with a
//! string value denotes equality; an object value `{"$op": v}` applies
//! the named comparator; `$and` / `$or` / `$not` / `$exist` are the
//! combinators. Several entries at one level conjoin.

use serde_json::{Map, Value};

use crate::ast::TagQuery;
use crate::error::QueryParseError;

/// Parses a WQL JSON string into a [`TagQuery`].
pub fn query_from_str(raw: &str) -> Result<TagQuery, QueryParseError> {
    let value: Value = serde_json::from_str(raw)?;
    query_from_json(&value)
}

/// Parses an already-deserialized WQL JSON value into a [`TagQuery`].
pub fn query_from_json(value: &Value) -> Result<TagQuery, QueryParseError> {
    let map = expect_object(value)?;
    parse_map(map)
}

fn expect_object(value: &Value) -> Result<&Map<String, Value>, QueryParseError> {
    value.as_object().ok_or(QueryParseError::NotAnObject {
        found: json_type(value),
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_map(map: &Map<String, Value>) -> Result<TagQuery, QueryParseError> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        clauses.push(parse_clause(key, value)?);
    }
    Ok(match clauses.len() {
        1 => clauses.pop().expect("one clause"),
        _ => TagQuery::And(clauses),
    })
}

fn parse_clause(key: &str, value: &Value) -> Result<TagQuery, QueryParseError> {
    match key {
        "$and" => Ok(TagQuery::And(parse_query_list(key, value)?)),
        "$or" => Ok(TagQuery::Or(parse_query_list(key, value)?)),
        "$not" => {
            let inner = query_from_json(value)?;
            Ok(inner.negate())
        }
        "$exist" => {
            let names = parse_string_list(key, value)?;
            if names.is_empty() {
                return Err(QueryParseError::EmptyExist);
            }
            Ok(TagQuery::Exist(names))
        }
        _ if key.starts_with('$') => Err(QueryParseError::UnknownOperator {
            operator: key.to_string(),
        }),
        tag => parse_tag_constraint(tag, value),
    }
}

fn parse_query_list(key: &str, value: &Value) -> Result<Vec<TagQuery>, QueryParseError> {
    let items = value.as_array().ok_or_else(|| QueryParseError::ExpectedList {
        key: key.to_string(),
    })?;
    items.iter().map(query_from_json).collect()
}

fn parse_string_list(key: &str, value: &Value) -> Result<Vec<String>, QueryParseError> {
    let items = value.as_array().ok_or_else(|| QueryParseError::ExpectedList {
        key: key.to_string(),
    })?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| QueryParseError::ExpectedScalar {
                    key: key.to_string(),
                })
        })
        .collect()
}

/// A tag-name key maps either to a scalar (equality) or to an object of
/// comparators applied to that tag.
fn parse_tag_constraint(tag: &str, value: &Value) -> Result<TagQuery, QueryParseError> {
    match value {
        Value::String(s) => Ok(TagQuery::Eq(tag.to_string(), s.clone())),
        Value::Object(ops) => {
            let mut clauses = Vec::with_capacity(ops.len());
            for (op, operand) in ops {
                clauses.push(parse_comparator(tag, op, operand)?);
            }
            Ok(match clauses.len() {
                1 => clauses.pop().expect("one comparator"),
                _ => TagQuery::And(clauses),
            })
        }
        _ => Err(QueryParseError::ExpectedScalar {
            key: tag.to_string(),
        }),
    }
}

fn parse_comparator(tag: &str, op: &str, operand: &Value) -> Result<TagQuery, QueryParseError> {
    let scalar = |v: &Value| -> Result<String, QueryParseError> {
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| QueryParseError::ExpectedScalar {
                key: tag.to_string(),
            })
    };
    let name = tag.to_string();
    match op {
        "$neq" => Ok(TagQuery::Neq(name, scalar(operand)?)),
        "$gt" => Ok(TagQuery::Gt(name, scalar(operand)?)),
        "$gte" => Ok(TagQuery::Gte(name, scalar(operand)?)),
        "$lt" => Ok(TagQuery::Lt(name, scalar(operand)?)),
        "$lte" => Ok(TagQuery::Lte(name, scalar(operand)?)),
        "$like" => Ok(TagQuery::Like(name, scalar(operand)?)),
        "$in" => {
            let values = parse_string_list(tag, operand)?;
            Ok(TagQuery::In(name, values))
        }
        other => Err(QueryParseError::UnknownOperator {
            operator: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tag_is_equality() {
        let q = query_from_str(r#"{"attr::person.status": "active"}"#).unwrap();
        assert_eq!(q, TagQuery::eq("attr::person.status", "active"));
    }

    #[test]
    fn multiple_keys_conjoin_in_order() {
        let q = query_from_str(r#"{"a": "1", "b": "2"}"#).unwrap();
        assert_eq!(
            q,
            TagQuery::And(vec![TagQuery::eq("a", "1"), TagQuery::eq("b", "2")])
        );
    }

    #[test]
    fn comparator_objects_parse() {
        let q = query_from_str(r#"{"attr::person.birthdate::value": {"$gt": "20000101"}}"#)
            .unwrap();
        assert_eq!(
            q,
            TagQuery::Gt("attr::person.birthdate::value".into(), "20000101".into())
        );
    }

    #[test]
    fn in_operator_takes_a_list() {
        let q = query_from_str(r#"{"state": {"$in": ["init", "done"]}}"#).unwrap();
        assert_eq!(
            q,
            TagQuery::In("state".into(), vec!["init".into(), "done".into()])
        );
    }

    #[test]
    fn and_or_not_combinators() {
        let q = query_from_str(
            r#"{"$or": [{"a": "1"}, {"$not": {"b": "2"}}], "$and": [{"c": "3"}]}"#,
        )
        .unwrap();
        assert_eq!(
            q,
            TagQuery::And(vec![
                TagQuery::Or(vec![
                    TagQuery::eq("a", "1"),
                    TagQuery::eq("b", "2").negate(),
                ]),
                TagQuery::And(vec![TagQuery::eq("c", "3")]),
            ])
        );
    }

    #[test]
    fn exist_takes_tag_names() {
        let q = query_from_str(r#"{"$exist": ["a", "b"]}"#).unwrap();
        assert_eq!(q, TagQuery::Exist(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn empty_exist_is_rejected() {
        let err = query_from_str(r#"{"$exist": []}"#).unwrap_err();
        assert!(matches!(err, QueryParseError::EmptyExist));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = query_from_str(r#"{"$xor": [{"a": "1"}]}"#).unwrap_err();
        assert!(matches!(err, QueryParseError::UnknownOperator { .. }));
        let err = query_from_str(r#"{"a": {"$regex": "x"}}"#).unwrap_err();
        assert!(matches!(err, QueryParseError::UnknownOperator { .. }));
    }

    #[test]
    fn non_scalar_tag_value_is_rejected() {
        let err = query_from_str(r#"{"a": 5}"#).unwrap_err();
        assert!(matches!(err, QueryParseError::ExpectedScalar { .. }));
    }

    #[test]
    fn top_level_must_be_object() {
        let err = query_from_str(r#"["a"]"#).unwrap_err();
        assert!(matches!(err, QueryParseError::NotAnObject { found: "array" }));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            query_from_str("{not json"),
            Err(QueryParseError::InvalidJson(_))
        ));
    }
}

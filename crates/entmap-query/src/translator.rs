//! `AS ENTITY` expansion.
//!
//! A clause of the form `<alias>.* AS ENTITY <entity>` is replaced with one
//! aliased column per declared field of the entity:
//!
//! ```text
//! SELECT g.* AS ENTITY group FROM groups g
//! SELECT g.id AS group__id, g.name AS group__name FROM groups g
//! ```
//!
//! The whitespace preceding a clause is reused between the generated
//! columns, so a clause written on its own indented line expands to one
//! indented line per column.

use crate::query::Query;
use entmap_core::error::{Error, QueryError, QueryErrorKind};
use entmap_core::{Mapping, PREFIX_SEPARATOR, Result};
use regex::Regex;
use std::sync::{Arc, OnceLock};

const ENTITY_CLAUSE: &str = r"(?i)(\s*)(\w+)\.\*\s+AS\s+ENTITY\s+(\w+)";
const TRAILING_LIMIT_ONE: &str = r"(?i)\bLIMIT\s+1\s*;?\s*$";

type Compiled = std::result::Result<Regex, regex::Error>;

fn compiled(cell: &'static OnceLock<Compiled>, pattern: &'static str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| Error::Custom(format!("invalid pattern {pattern}: {e}")))
}

fn entity_clause() -> Result<&'static Regex> {
    static RE: OnceLock<Compiled> = OnceLock::new();
    compiled(&RE, ENTITY_CLAUSE)
}

fn trailing_limit_one() -> Result<&'static Regex> {
    static RE: OnceLock<Compiled> = OnceLock::new();
    compiled(&RE, TRAILING_LIMIT_ONE)
}

/// Translates annotated SQL into executable SQL using the mapping.
#[derive(Debug, Clone)]
pub struct QueryTranslator {
    mapping: Arc<Mapping>,
}

impl QueryTranslator {
    pub fn new(mapping: Arc<Mapping>) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> Arc<Mapping> {
        Arc::clone(&self.mapping)
    }

    /// Expand every `AS ENTITY` clause of `expression`.
    ///
    /// Clauses are replaced by position, left to right, so two identical
    /// clauses each get their own expansion.
    #[tracing::instrument(level = "debug", skip(self, expression))]
    pub fn parse(&self, expression: &str) -> Result<Query> {
        let clause = entity_clause()?;
        let mut sql = String::with_capacity(expression.len() * 2);
        let mut entities: Vec<String> = Vec::new();
        let mut last = 0;

        for caps in clause.captures_iter(expression) {
            let (Some(whole), Some(spaces), Some(alias), Some(name)) =
                (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
            else {
                continue;
            };
            let entity_name = name.as_str();
            let entity = self.mapping.get(entity_name).map_err(|_| {
                Error::Query(
                    QueryError::new(
                        QueryErrorKind::UnknownEntity,
                        format!(
                            "Entity \"{}\" is not defined in the mapping. Query:\n{}",
                            entity_name, expression
                        ),
                    )
                    .with_sql(expression),
                )
            })?;

            let columns: Vec<String> = entity
                .fields()
                .iter()
                .map(|field| {
                    format!(
                        "{}.{} AS {}{}{}",
                        alias.as_str(),
                        field,
                        entity_name,
                        PREFIX_SEPARATOR,
                        field
                    )
                })
                .collect();

            sql.push_str(&expression[last..whole.start()]);
            sql.push_str(spaces.as_str());
            sql.push_str(&columns.join(&format!(",{}", spaces.as_str())));
            last = whole.end();

            if !entities.iter().any(|e| e == entity_name) {
                entities.push(entity_name.to_string());
            }
        }
        sql.push_str(&expression[last..]);

        let single_row = trailing_limit_one()?.is_match(expression);
        tracing::debug!(
            entities = ?entities,
            single_row,
            sql = %sql,
            "Translated query"
        );
        Ok(Query::new(sql, single_row, entities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Group {
        name: String,
    }

    #[derive(Default)]
    struct Customer {
        first_name: String,
        last_name: String,
    }

    fn translator() -> QueryTranslator {
        let mapping = Mapping::builder()
            .entity::<Group>(|e| {
                e.field("name", |g: &Group| g.name.clone(), |g: &mut Group, v| g.name = v)
            })
            .unwrap()
            .entity::<Customer>(|e| {
                e.field(
                    "first_name",
                    |c: &Customer| c.first_name.clone(),
                    |c: &mut Customer, v| c.first_name = v,
                )
                .field(
                    "last_name",
                    |c: &Customer| c.last_name.clone(),
                    |c: &mut Customer, v| c.last_name = v,
                )
            })
            .unwrap()
            .build()
            .unwrap();
        QueryTranslator::new(Arc::new(mapping))
    }

    #[test]
    fn test_single_line_expansion() {
        let query = translator()
            .parse("SELECT g.* AS ENTITY group FROM groups g")
            .unwrap();
        assert_eq!(
            query.sql(),
            "SELECT g.id AS group__id, g.name AS group__name FROM groups g"
        );
        assert!(!query.is_single_row());
        assert_eq!(query.entities(), &["group".to_string()]);
    }

    #[test]
    fn test_multi_line_expansion_keeps_indentation() {
        let expr = "SELECT\n  g.* AS entity group,\n  c.* AS ENTITY customer\nFROM groups g\n  INNER JOIN customer_groups cg ON cg.group_id = g.id\nWHERE cg.customer_id IN (1, 2)\n";
        let expected = "SELECT\n  g.id AS group__id,\n  g.name AS group__name,\n  c.id AS customer__id,\n  c.first_name AS customer__first_name,\n  c.last_name AS customer__last_name\nFROM groups g\n  INNER JOIN customer_groups cg ON cg.group_id = g.id\nWHERE cg.customer_id IN (1, 2)\n";
        let query = translator().parse(expr).unwrap();
        assert_eq!(query.sql(), expected);
        assert_eq!(
            query.entities(),
            &["group".to_string(), "customer".to_string()]
        );
    }

    #[test]
    fn test_identical_clauses_are_both_expanded() {
        let query = translator()
            .parse("SELECT g.* AS ENTITY group, g.* AS ENTITY group FROM groups g")
            .unwrap();
        assert_eq!(
            query.sql(),
            "SELECT g.id AS group__id, g.name AS group__name, g.id AS group__id, g.name AS group__name FROM groups g"
        );
        assert_eq!(query.entities(), &["group".to_string()]);
    }

    #[test]
    fn test_limit_one_marks_single_row() {
        let t = translator();
        assert!(
            t.parse("SELECT\n  g.* AS ENTITY group\nFROM groups g\nLIMIT 1\n")
                .unwrap()
                .is_single_row()
        );
        assert!(
            t.parse("SELECT g.* AS ENTITY group FROM groups g limit 1;")
                .unwrap()
                .is_single_row()
        );
    }

    #[test]
    fn test_other_limits_are_not_single_row() {
        let t = translator();
        assert!(
            !t.parse("SELECT\n  g.* AS ENTITY group\nFROM groups g\nLIMIT 10\n")
                .unwrap()
                .is_single_row()
        );
        assert!(
            !t.parse(
                "SELECT\n  g.* AS ENTITY group\nFROM groups g\n  INNER JOIN (SELECT id FROM users LIMIT 1) u ON g.owner = u.id\n"
            )
            .unwrap()
            .is_single_row()
        );
    }

    #[test]
    fn test_unknown_entity() {
        let expr = "SELECT\n  g.* AS ENTITY group,\n  g.* AS ENTITY undefined\nFROM groups g\n";
        let err = translator().parse(expr).unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::UnknownEntity));
        assert_eq!(
            err.to_string(),
            format!(
                "Entity \"undefined\" is not defined in the mapping. Query:\n{}",
                expr
            )
        );
        assert_eq!(err.sql(), Some(expr));
    }

    #[test]
    fn test_plain_sql_passes_through() {
        let query = translator().parse("SELECT 1").unwrap();
        assert_eq!(query.sql(), "SELECT 1");
        assert!(query.entities().is_empty());
    }
}

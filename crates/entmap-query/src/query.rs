//! Translated query value object.

/// A translated SQL statement plus the metadata `fetch` needs to validate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    sql: String,
    single_row: bool,
    entities: Vec<String>,
}

impl Query {
    pub fn new(sql: impl Into<String>, single_row: bool, entities: Vec<String>) -> Self {
        Self {
            sql: sql.into(),
            single_row,
            entities,
        }
    }

    /// Executable SQL with every `AS ENTITY` clause expanded.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether the outermost statement ends with `LIMIT 1`.
    pub fn is_single_row(&self) -> bool {
        self.single_row
    }

    /// Entities named in `AS ENTITY` clauses, deduplicated, in order of appearance.
    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn refers_to(&self, entity: &str) -> bool {
        self.entities.iter().any(|e| e == entity)
    }

    pub fn into_sql(self) -> String {
        self.sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refers_to() {
        let query = Query::new("SELECT 1", false, vec!["plan".into(), "customer".into()]);
        assert!(query.refers_to("plan"));
        assert!(!query.refers_to("invoice"));
        assert!(!query.is_single_row());
        assert_eq!(query.into_sql(), "SELECT 1");
    }
}

//! Database connection trait.
//!
//! The persistence engine never talks to a driver directly. Everything it
//! needs from the database goes through [`Connection`]:
//!
//! - [`Connection::query`] - run a SELECT and return keyed rows
//! - [`Connection::execute`] - run an UPDATE/DELETE and return affected rows
//! - [`Connection::insert`] - run an INSERT and return the generated id
//! - [`Connection::transaction`] - run a unit of work atomically
//!
//! Calls are synchronous and blocking.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// SQL dialect used when rendering statements generated by a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are escaped by doubling them.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Render `INSERT INTO t (c1, c2) VALUES (p1, p2)`.
    ///
    /// With no columns every value comes from the column defaults.
    pub fn insert_sql(self, table: &str, columns: &[&str]) -> String {
        if columns.is_empty() {
            return match self {
                Dialect::Mysql => format!("INSERT INTO {} () VALUES ()", self.quote_identifier(table)),
                Dialect::Postgres | Dialect::Sqlite => {
                    format!("INSERT INTO {} DEFAULT VALUES", self.quote_identifier(table))
                }
            };
        }
        let cols: Vec<String> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_identifier(table),
            cols.join(", "),
            params.join(", ")
        )
    }

    /// Render `UPDATE t SET c1 = p1, c2 = p2 WHERE id = pN`.
    pub fn update_by_id_sql(self, table: &str, columns: &[&str]) -> String {
        let sets: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_identifier(c), self.placeholder(i + 1)))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.quote_identifier(table),
            sets.join(", "),
            self.quote_identifier("id"),
            self.placeholder(columns.len() + 1)
        )
    }

    /// Render `DELETE FROM t WHERE c1 = p1 AND c2 = p2`.
    pub fn delete_sql(self, table: &str, columns: &[&str]) -> String {
        let conds: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_identifier(c), self.placeholder(i + 1)))
            .collect();
        format!(
            "DELETE FROM {} WHERE {}",
            self.quote_identifier(table),
            conds.join(" AND ")
        )
    }
}

/// A synchronous database connection.
///
/// Rows returned by [`query`](Connection::query) are keyed by the column
/// aliases of the statement, so `AS ENTITY` expansions arrive as
/// `<entity>__<field>` keys.
pub trait Connection: Send + Sync {
    /// The SQL dialect statements should be rendered for.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the generated primary key.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64>;

    /// Run `work` atomically.
    ///
    /// Commits when `work` returns `Ok`. On `Err` everything done inside
    /// `work` is rolled back and the error is returned unchanged.
    fn transaction(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.execute("BEGIN", &[])?;
        match work() {
            Ok(()) => {
                self.execute("COMMIT", &[])?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.execute("ROLLBACK", &[]) {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

//! Query translation for entmap.
//!
//! `entmap-query` turns SQL written with the `<alias>.* AS ENTITY <name>`
//! extension into plain SQL whose result columns are keyed
//! `<name>__<field>`, which is the shape the session's materializer reads.
//! A trailing outermost `LIMIT 1` marks the query as returning a single row.

pub mod query;
pub mod translator;

pub use query::Query;
pub use translator::QueryTranslator;

//! Core types and traits for entmap.
//!
//! This crate provides the foundations shared by the query and session layers:
//!
//! - `Value` and `Row` for data moving to and from the database
//! - `Connection` trait for the external driver
//! - `Mapping` registry describing persisted types
//! - `EntityRow` extraction of one entity from a prefixed result row
//! - `RuleList` validation attached to each mapped type

pub mod connection;
pub mod error;
pub mod inflect;
pub mod mapping;
pub mod row;
pub mod validate;
pub mod value;

pub use connection::{Connection, Dialect};
pub use error::{
    ConnectionError, DefinitionError, Error, FieldValidationError, QueryError, QueryErrorKind,
    Result, TypeError, ValidationError,
};
pub use mapping::{
    Collection, EntityMapping, EntityMappingBuilder, FieldAccessor, ID_FIELD, Mapping,
    MappingBuilder, Reference,
};
pub use row::{ColumnInfo, EntityRow, FromValue, PREFIX_SEPARATOR, Row};
pub use validate::{Rule, RuleList};
pub use value::{Value, ValueKind};

//! Error types for entmap operations.

use std::fmt;

/// The primary error type for all entmap operations.
#[derive(Debug)]
pub enum Error {
    /// Invalid mapping declarations
    Definition(DefinitionError),
    /// Query translation, lookup and result-shape errors
    Query(QueryError),
    /// An operation was invoked with an unsuitable argument
    Argument(String),
    /// Value conversion or typed-access errors
    Type(TypeError),
    /// Entity validation errors
    Validation(ValidationError),
    /// Errors reported by the database connection
    Connection(ConnectionError),
    /// Custom error with message
    Custom(String),
}

/// A mapping declaration that cannot be accepted.
#[derive(Debug, Clone)]
pub struct DefinitionError {
    pub message: String,
}

impl DefinitionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// An `AS ENTITY` clause names an entity missing from the mapping
    UnknownEntity,
    /// A fetch query lacks the `AS ENTITY` clause for the fetched type
    MissingEntityClause,
    /// A fan-out association query lacks the bucketing `<parent>_id` column
    MissingJoinColumn,
    /// A single-row query returned more than one row
    TooManyRows,
    /// Registry lookup of an entity name that was never registered
    UnregisteredEntity,
    /// Error raised by the database while executing a statement
    Database,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
        }
    }

    /// Attach the SQL text that caused the error.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Validation error collecting every invalid field of an entity.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Name of the entity that failed validation
    pub entity: String,
    /// The errors, one per invalid field
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            errors: Vec::new(),
        }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Message recorded for a field, if it is invalid.
    pub fn message_for(&self, field: &str) -> Option<&str> {
        self.errors
            .iter()
            .find(|e| e.field == field)
            .map(|e| e.message.as_str())
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Shorthand for a [`DefinitionError`].
    pub fn definition(message: impl Into<String>) -> Self {
        Error::Definition(DefinitionError::new(message))
    }

    /// Shorthand for a [`QueryError`] without SQL attached.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError::new(kind, message))
    }

    /// Kind of the query error, if this is one.
    pub fn query_kind(&self) -> Option<QueryErrorKind> {
        match self {
            Error::Query(q) => Some(q.kind),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Definition(e) => write!(f, "{}", e.message),
            Error::Query(e) => write!(f, "{}", e.message),
            Error::Argument(msg) => write!(f, "{}", msg),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Validation(e) => write!(f, "{}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "{} is valid", self.entity)
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "{} is invalid: {} {}", self.entity, err.field, err.message)
        } else {
            writeln!(f, "{} is invalid:", self.entity)?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<DefinitionError> for Error {
    fn from(err: DefinitionError) -> Self {
        Error::Definition(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for entmap operations.
pub type Result<T> = std::result::Result<T, Error>;

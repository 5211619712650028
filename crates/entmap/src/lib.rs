//! entmap - a lightweight unit-of-work persistence engine.
//!
//! entmap maps plain Rust structs to relational rows and back:
//!
//! - A mapping registry declaring fields, references and collections per type
//! - SQL with an `AS ENTITY` extension that expands to aliased columns
//! - Tracked entities that know what changed since they were loaded
//! - One transactional `finalize` writing everything in dependency order
//!
//! # Quick Start
//!
//! ```ignore
//! use entmap::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Plan {
//!     name: String,
//!     price: f64,
//! }
//!
//! let mapping = Mapping::builder()
//!     .entity::<Plan>(|e| {
//!         e.field("name", |p: &Plan| p.name.clone(), |p: &mut Plan, v| p.name = v)
//!             .field("price", |p: &Plan| p.price, |p: &mut Plan, v| p.price = v)
//!     })?
//!     .build()?;
//!
//! let env = Environment::new(mapping);
//! let session = env.open_session(conn);
//!
//! let plan = session.attach_object(Plan { name: "basic".into(), price: 10.0 })?;
//! session.finalize()?;
//!
//! let loaded = session
//!     .fetch::<Plan>("SELECT p.* AS ENTITY plan FROM plans p WHERE p.id = $1 LIMIT 1", &[plan.id().into()])?
//!     .into_one();
//! ```

// Re-export all public types from sub-crates
pub use entmap_core::{
    Collection, ColumnInfo, Connection, ConnectionError, DefinitionError, Dialect, EntityMapping,
    EntityMappingBuilder, EntityRow, Error, FieldAccessor, FieldValidationError, FromValue,
    ID_FIELD, Mapping, MappingBuilder, PREFIX_SEPARATOR, QueryError, QueryErrorKind, Reference,
    Result, Row, Rule, RuleList, TypeError, ValidationError, Value, ValueKind, inflect,
};
pub use entmap_query::{Query, QueryTranslator};
pub use entmap_session::{
    Association, AssociationResult, Attachment, Attribute, AttributeValue, DefaultObjectFactory,
    Entity, EntityBuilder, Fetched, FlushContext, FlushOrderer, Mapper, MemberIds, ObjectFactory,
    Session, SessionConfig, Targets, UnitOfWork, WeakEntity,
};

use std::sync::Arc;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::Environment;
    pub use entmap_core::{
        Connection, Dialect, Error, Mapping, QueryErrorKind, Result, Row, Value, ValueKind,
    };
    pub use entmap_session::{
        Association, AssociationResult, Attachment, Entity, Fetched, ObjectFactory, Session,
        SessionConfig, Targets,
    };
}

/// Long-lived wiring shared by every session: the mapping and the object factory.
///
/// Build it once at startup, then open one session per unit of work.
#[derive(Clone)]
pub struct Environment {
    mapping: Arc<Mapping>,
    factory: Arc<dyn ObjectFactory>,
}

impl Environment {
    pub fn new(mapping: Mapping) -> Self {
        Self::from_shared(Arc::new(mapping))
    }

    pub fn from_shared(mapping: Arc<Mapping>) -> Self {
        Self {
            mapping,
            factory: Arc::new(DefaultObjectFactory),
        }
    }

    /// Use `factory` to produce domain instances during materialization.
    pub fn with_factory(mut self, factory: impl ObjectFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    pub fn open_session<C: Connection>(&self, connection: C) -> Session<C> {
        self.open_session_with(connection, SessionConfig::default())
    }

    /// Wire a translator, mapper, builder and orderer for one session.
    #[tracing::instrument(level = "debug", skip(self, connection))]
    pub fn open_session_with<C: Connection>(
        &self,
        connection: C,
        config: SessionConfig,
    ) -> Session<C> {
        let builder = EntityBuilder::new(Arc::clone(&self.mapping));
        let mapper = Mapper::new(
            Arc::clone(&self.mapping),
            Arc::clone(&self.factory),
            builder.clone(),
        );
        Session::from_parts(
            connection,
            QueryTranslator::new(Arc::clone(&self.mapping)),
            mapper,
            builder,
            FlushOrderer::from_mapping(&self.mapping),
            config,
        )
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("entities", &self.mapping.len())
            .finish_non_exhaustive()
    }
}

//! Session and unit of work for entmap.
//!
//! `entmap-session` is the **unit-of-work layer**. It materializes rows into
//! tracked entities, detects what changed, and writes the changes back in
//! dependency order inside one transaction.
//!
//! # Role In The Architecture
//!
//! - **Materialization**: [`Mapper`] turns prefixed rows into [`Entity`] handles.
//! - **Change tracking**: every entity diffs itself against its baseline.
//! - **Transactional flush**: [`Session::finalize`] orders dirty entities with
//!   [`FlushOrderer`] and flushes them inside `Connection::transaction`.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(conn, mapping);
//!
//! let customer = session
//!     .fetch::<Customer>("SELECT c.* AS ENTITY customer FROM customers c WHERE c.id = $1 LIMIT 1", &[Value::BigInt(1)])?
//!     .into_one()
//!     .unwrap();
//! session.preload(&customer, "invoices", "SELECT i.* AS ENTITY invoice FROM invoices i WHERE i.customer_id = $1", &[Value::BigInt(1)])?;
//!
//! customer.write(|c: &mut Customer| c.last_name = "Kim".into())?;
//! session.attach_object(Plan::new("basic", 10.0))?;
//!
//! session.finalize()?;
//! ```

pub mod attribute;
pub mod builder;
pub mod change_tracker;
pub mod entity;
pub mod flush;
pub mod mapper;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod fixtures;

pub use attribute::{Attribute, AttributeValue, MemberIds};
pub use builder::{DefaultObjectFactory, EntityBuilder, ObjectFactory};
pub use entity::{Entity, WeakEntity};
pub use flush::{FlushContext, FlushOrderer};
pub use mapper::{Association, AssociationResult, Mapper, Targets};
pub use unit_of_work::UnitOfWork;

use entmap_core::error::{Error, QueryError, QueryErrorKind};
use entmap_core::{Connection, Mapping, Result, Value, inflect};
use entmap_query::QueryTranslator;
use std::any::Any;
use std::sync::Arc;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Run an entity's rule list when it is attached.
    pub validate_on_attach: bool,
    /// Run an entity's rule list before it is written by `finalize`.
    pub validate_on_flush: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            validate_on_attach: true,
            validate_on_flush: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validate_on_attach(mut self, value: bool) -> Self {
        self.validate_on_attach = value;
        self
    }

    pub fn with_validate_on_flush(mut self, value: bool) -> Self {
        self.validate_on_flush = value;
        self
    }
}

// ============================================================================
// Fetch Results and Attachments
// ============================================================================

/// Result of [`Session::fetch`].
#[derive(Debug, Clone)]
pub enum Fetched {
    /// The query returned no rows.
    Empty,
    /// A `LIMIT 1` query returned its row.
    One(Entity),
    /// Every other non-empty result, even with a single row.
    Many(Vec<Entity>),
}

impl Fetched {
    pub fn is_empty(&self) -> bool {
        matches!(self, Fetched::Empty)
    }

    pub fn len(&self) -> usize {
        match self {
            Fetched::Empty => 0,
            Fetched::One(_) => 1,
            Fetched::Many(entities) => entities.len(),
        }
    }

    pub fn one(&self) -> Option<&Entity> {
        match self {
            Fetched::One(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn into_one(self) -> Option<Entity> {
        match self {
            Fetched::One(entity) => Some(entity),
            _ => None,
        }
    }

    /// All fetched entities as a list, whatever the shape.
    pub fn into_vec(self) -> Vec<Entity> {
        match self {
            Fetched::Empty => Vec::new(),
            Fetched::One(entity) => vec![entity],
            Fetched::Many(entities) => entities,
        }
    }
}

/// Something [`Session::attach`] accepts.
pub enum Attachment {
    /// An entity that is tracked as is.
    Entity(Entity),
    /// A plain domain object, wrapped before tracking.
    Object(Box<dyn Any + Send>),
    /// A nested list, flattened.
    Many(Vec<Attachment>),
}

impl Attachment {
    pub fn object<T: Send + 'static>(value: T) -> Self {
        Attachment::Object(Box::new(value))
    }

    /// Collect the entities and plain objects of a possibly nested list.
    fn flatten_into(self, out: &mut Vec<Leaf>) {
        match self {
            Attachment::Entity(entity) => out.push(Leaf::Entity(entity)),
            Attachment::Object(payload) => out.push(Leaf::Object(payload)),
            Attachment::Many(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }
}

/// A flattened [`Attachment`].
enum Leaf {
    Entity(Entity),
    Object(Box<dyn Any + Send>),
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attachment::Entity(entity) => f.debug_tuple("Entity").field(entity).finish(),
            Attachment::Object(_) => f.write_str("Object(..)"),
            Attachment::Many(items) => f.debug_tuple("Many").field(items).finish(),
        }
    }
}

impl From<Entity> for Attachment {
    fn from(entity: Entity) -> Self {
        Attachment::Entity(entity)
    }
}

impl From<&Entity> for Attachment {
    fn from(entity: &Entity) -> Self {
        Attachment::Entity(entity.clone())
    }
}

impl From<Vec<Entity>> for Attachment {
    fn from(entities: Vec<Entity>) -> Self {
        Attachment::Many(entities.into_iter().map(Attachment::Entity).collect())
    }
}

impl From<Vec<Attachment>> for Attachment {
    fn from(items: Vec<Attachment>) -> Self {
        Attachment::Many(items)
    }
}

impl From<Box<dyn Any + Send>> for Attachment {
    fn from(payload: Box<dyn Any + Send>) -> Self {
        Attachment::Object(payload)
    }
}

// ============================================================================
// Session
// ============================================================================

/// One unit of work over a connection.
///
/// Every operation takes `&self`: the tracked set sits behind a mutex so
/// attaching from several threads at once is safe.
pub struct Session<C: Connection> {
    /// The database connection.
    connection: C,
    mapping: Arc<Mapping>,
    translator: QueryTranslator,
    mapper: Mapper,
    builder: EntityBuilder,
    orderer: FlushOrderer,
    uow: UnitOfWork,
    config: SessionConfig,
}

impl<C: Connection> Session<C> {
    /// Create a session with the default object factory and configuration.
    pub fn new(connection: C, mapping: Arc<Mapping>) -> Self {
        Self::with_config(connection, mapping, SessionConfig::default())
    }

    pub fn with_config(connection: C, mapping: Arc<Mapping>, config: SessionConfig) -> Self {
        let builder = EntityBuilder::new(Arc::clone(&mapping));
        let mapper = Mapper::new(
            Arc::clone(&mapping),
            Arc::new(DefaultObjectFactory),
            builder.clone(),
        );
        Self::from_parts(
            connection,
            QueryTranslator::new(Arc::clone(&mapping)),
            mapper,
            builder,
            FlushOrderer::from_mapping(&mapping),
            config,
        )
    }

    /// Create a session from already wired collaborators.
    pub fn from_parts(
        connection: C,
        translator: QueryTranslator,
        mapper: Mapper,
        builder: EntityBuilder,
        orderer: FlushOrderer,
        config: SessionConfig,
    ) -> Self {
        Self {
            connection,
            mapping: translator.mapping(),
            translator,
            mapper,
            builder,
            orderer,
            uow: UnitOfWork::new(),
            config,
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Number of entities currently tracked.
    pub fn tracked_len(&self) -> usize {
        self.uow.len()
    }

    /// Whether an entity is tracked by this session.
    pub fn is_tracked(&self, entity: &Entity) -> bool {
        self.uow.contains(entity)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Run a query and map its rows as `T`.
    ///
    /// The query must contain an `AS ENTITY` clause for `T`. A query ending
    /// in `LIMIT 1` yields [`Fetched::One`]; any other non-empty result
    /// yields [`Fetched::Many`].
    pub fn fetch<T: 'static>(&self, expression: &str, params: &[Value]) -> Result<Fetched> {
        let entity = self.entity_name_of::<T>()?;
        self.fetch_named(&entity, expression, params)
    }

    /// Like [`fetch`](Self::fetch), then hand the result to `then` for chained preloads.
    pub fn fetch_then<T, F>(&self, expression: &str, params: &[Value], then: F) -> Result<Fetched>
    where
        T: 'static,
        F: FnOnce(&Self, &Fetched) -> Result<()>,
    {
        let fetched = self.fetch::<T>(expression, params)?;
        then(self, &fetched)?;
        Ok(fetched)
    }

    /// [`fetch`](Self::fetch) by entity name.
    #[tracing::instrument(level = "debug", skip(self, expression, params))]
    pub fn fetch_named(&self, entity: &str, expression: &str, params: &[Value]) -> Result<Fetched> {
        if !self.mapping.contains(entity) {
            return Err(Error::Argument(format!(
                "Entity \"{}\" is not defined in the mapping.",
                entity
            )));
        }
        let query = self.translator.parse(expression)?;
        if !query.refers_to(entity) {
            return Err(Error::Query(
                QueryError::new(
                    QueryErrorKind::MissingEntityClause,
                    format!(
                        "The query doesn't contain \"AS ENTITY {}\" statement.",
                        entity
                    ),
                )
                .with_sql(expression),
            ));
        }

        let rows = self.connection.query(query.sql(), params)?;
        tracing::debug!(entity, rows = rows.len(), single_row = query.is_single_row(), "Fetched rows");

        match rows.len() {
            0 => Ok(Fetched::Empty),
            1 if query.is_single_row() => {
                let entity = self.mapper.map(entity, &rows[0], &self.uow)?;
                Ok(Fetched::One(entity))
            }
            n if query.is_single_row() => Err(Error::Query(
                QueryError::new(
                    QueryErrorKind::TooManyRows,
                    format!(
                        "A single row was expected to map but the query returned {} rows.",
                        n
                    ),
                )
                .with_sql(query.into_sql()),
            )),
            _ => {
                let entities = rows
                    .iter()
                    .map(|row| self.mapper.map(entity, row, &self.uow))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Fetched::Many(entities))
            }
        }
    }

    /// Load `relation` for the targets with a separate query.
    #[tracing::instrument(level = "debug", skip(self, targets, expression, params))]
    pub fn preload(
        &self,
        targets: impl Into<Targets>,
        relation: &str,
        expression: &str,
        params: &[Value],
    ) -> Result<Association> {
        let query = self.translator.parse(expression)?;
        let rows = self.connection.query(query.sql(), params)?;
        tracing::debug!(relation, rows = rows.len(), "Preloading association");
        self.mapper.map_association(targets, relation, &rows, &self.uow)
    }

    /// Like [`preload`](Self::preload), then hand the members and their ids to `then`.
    pub fn preload_then<F>(
        &self,
        targets: impl Into<Targets>,
        relation: &str,
        expression: &str,
        params: &[Value],
        then: F,
    ) -> Result<Association>
    where
        F: FnOnce(&Self, &AssociationResult, &[i64]) -> Result<()>,
    {
        let association = self.preload(targets, relation, expression, params)?;
        then(self, &association.result, &association.ids)?;
        Ok(association)
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Start tracking entities and plain objects.
    ///
    /// Nested lists are flattened. Plain objects are wrapped first. Nothing is
    /// attached when any item fails to wrap or validate.
    #[tracing::instrument(level = "debug", skip(self, items))]
    pub fn attach<I>(&self, items: I) -> Result<Vec<Entity>>
    where
        I: IntoIterator,
        I::Item: Into<Attachment>,
    {
        let mut flat = Vec::new();
        for item in items {
            item.into().flatten_into(&mut flat);
        }

        let mut entities = Vec::with_capacity(flat.len());
        for item in flat {
            let entity = match item {
                Leaf::Entity(entity) => entity,
                Leaf::Object(payload) => self.builder.create(payload)?,
            };
            if self.config.validate_on_attach {
                entity.validate()?;
            }
            entities.push(entity);
        }

        let added = entities.iter().filter(|e| self.uow.attach(e)).count();
        tracing::debug!(count = entities.len(), added, "Attached entities");
        Ok(entities)
    }

    /// Wrap and track a single plain object.
    pub fn attach_object<T: Send + 'static>(&self, value: T) -> Result<Entity> {
        let mut attached = self.attach([Attachment::object(value)])?;
        attached.pop().ok_or_else(|| Error::Custom("attach returned no entity".to_string()))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write every dirty tracked entity inside one transaction.
    ///
    /// Referenced types are written before the types referencing them. Any
    /// failure rolls the whole transaction back and returns every entity the
    /// flush touched to its previous id and baselines, so it can be attached
    /// and written again. The tracked set is cleared either way.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn finalize(&self) -> Result<()> {
        let dirty: Vec<Entity> = self
            .uow
            .tracked()
            .into_iter()
            .filter(Entity::is_dirty)
            .collect();
        let ordered = self.orderer.order(dirty);

        let result = if ordered.is_empty() {
            tracing::debug!("Nothing to flush");
            Ok(())
        } else {
            let snapshots = flush::snapshot_reachable(&ordered);
            let ctx = FlushContext::new(&self.connection)
                .with_validation(self.config.validate_on_flush);
            let result = self.connection.transaction(&mut || {
                for entity in &ordered {
                    entity.flush(&ctx)?;
                }
                Ok(())
            });
            if result.is_err() {
                tracing::debug!(entities = snapshots.len(), "Restoring ids and baselines");
                for snapshot in snapshots {
                    snapshot.restore();
                }
            }
            result
        };

        match &result {
            Ok(()) => tracing::info!(flushed = ordered.len(), "Session finalized"),
            Err(e) => tracing::warn!(error = %e, "Finalize failed, transaction rolled back"),
        }
        self.uow.clear();
        result
    }

    fn entity_name_of<T: 'static>(&self) -> Result<String> {
        self.mapping
            .of::<T>()
            .map(|m| m.name().to_string())
            .ok_or_else(|| {
                Error::Argument(format!(
                    "Type {} is not an entity type defined in the mapping.",
                    inflect::type_base_name(std::any::type_name::<T>())
                ))
            })
    }
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracked", &self.uow.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Turning result rows into tracked entities.
//!
//! Rows arrive flat, keyed `<prefix>__<field>`. [`Mapper::map`] builds one
//! entity per row and follows nested reference prefixes. [`Mapper::map_association`]
//! rebuilds a collection for one owner or fans a batch of rows out over
//! several owners using a `<owner>_id` bucketing column.

use crate::builder::{EntityBuilder, ObjectFactory};
use crate::entity::Entity;
use crate::unit_of_work::UnitOfWork;
use entmap_core::error::{Error, QueryErrorKind};
use entmap_core::{
    Collection, EntityMapping, EntityRow, ID_FIELD, Mapping, PREFIX_SEPARATOR, Result, Row, Value,
    inflect,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Owners whose collection is being rebuilt.
#[derive(Debug, Clone)]
pub enum Targets {
    One(Entity),
    Many(Vec<Entity>),
}

impl From<Entity> for Targets {
    fn from(entity: Entity) -> Self {
        Targets::One(entity)
    }
}

impl From<&Entity> for Targets {
    fn from(entity: &Entity) -> Self {
        Targets::One(entity.clone())
    }
}

impl From<Vec<Entity>> for Targets {
    fn from(entities: Vec<Entity>) -> Self {
        Targets::Many(entities)
    }
}

impl From<&[Entity]> for Targets {
    fn from(entities: &[Entity]) -> Self {
        Targets::Many(entities.to_vec())
    }
}

/// Members produced by [`Mapper::map_association`].
#[derive(Debug, Clone)]
pub enum AssociationResult {
    /// Members of a single owner, in row order.
    Members(Vec<Entity>),
    /// Members grouped by owner id.
    Buckets(BTreeMap<i64, Vec<Entity>>),
}

impl AssociationResult {
    /// Every distinct member, in first-seen order.
    pub fn entities(&self) -> Vec<Entity> {
        match self {
            AssociationResult::Members(members) => members.clone(),
            AssociationResult::Buckets(buckets) => {
                let mut all: Vec<Entity> = Vec::new();
                for member in buckets.values().flatten() {
                    if !all.iter().any(|e| e.same_as(member)) {
                        all.push(member.clone());
                    }
                }
                all
            }
        }
    }

    /// Members of one owner. A single-owner result ignores `owner_id`.
    pub fn for_owner(&self, owner_id: i64) -> Vec<Entity> {
        match self {
            AssociationResult::Members(members) => members.clone(),
            AssociationResult::Buckets(buckets) => {
                buckets.get(&owner_id).cloned().unwrap_or_default()
            }
        }
    }
}

/// Mapped members plus their ids, ready for a chained preload.
#[derive(Debug, Clone)]
pub struct Association {
    pub result: AssociationResult,
    pub ids: Vec<i64>,
}

/// Builds tracked entities from rows through the registry and an object factory.
#[derive(Clone)]
pub struct Mapper {
    mapping: Arc<Mapping>,
    factory: Arc<dyn ObjectFactory>,
    builder: EntityBuilder,
}

impl Mapper {
    pub fn new(mapping: Arc<Mapping>, factory: Arc<dyn ObjectFactory>, builder: EntityBuilder) -> Self {
        Self {
            mapping,
            factory,
            builder,
        }
    }

    /// Map a row under the entity's own name as prefix.
    pub fn map(&self, entity: &str, row: &Row, uow: &UnitOfWork) -> Result<Entity> {
        self.map_prefixed(entity, row, uow, entity)
    }

    /// Map a row whose columns for this entity are keyed `<prefix>__<field>`.
    #[tracing::instrument(level = "debug", skip(self, row, uow))]
    pub fn map_prefixed(
        &self,
        entity: &str,
        row: &Row,
        uow: &UnitOfWork,
        prefix: &str,
    ) -> Result<Entity> {
        let mapping = self.mapping.get(entity)?;
        let mut visited = vec![prefix.to_string()];
        self.map_row(mapping, row, uow, prefix, &mut visited)
    }

    fn map_row(
        &self,
        mapping: &Arc<EntityMapping>,
        row: &Row,
        uow: &UnitOfWork,
        prefix: &str,
        visited: &mut Vec<String>,
    ) -> Result<Entity> {
        let extracted = EntityRow::extract(row, mapping.fields(), prefix);
        let payload = self.factory.resolve(mapping, &extracted.attributes)?;
        let entity = self.builder.create_for(mapping, payload)?;
        entity.load_attributes(&extracted.attributes)?;

        for name in &extracted.reference_names {
            let Some(reference) = mapping.reference(name) else {
                continue;
            };
            if visited.iter().any(|v| v == name) {
                continue;
            }
            let id_column = format!("{name}{PREFIX_SEPARATOR}{ID_FIELD}");
            if row.get_by_name(&id_column).is_none_or(Value::is_null) {
                tracing::trace!(reference = %name, "Nested id is NULL, reference left unset");
                continue;
            }
            let target = self.mapping.get(&reference.target)?;
            visited.push(name.clone());
            let nested = self.map_row(target, row, uow, name, visited);
            visited.pop();
            entity.load_reference(name, Some(nested?))?;
        }

        uow.attach(&entity);
        tracing::trace!(entity = %mapping.name(), id = ?entity.id(), prefix, "Mapped entity");
        Ok(entity)
    }

    /// Rebuild `collection` on the targets from `rows`.
    ///
    /// Rows with a NULL member id are skipped. A member appearing in several
    /// rows is mapped once and shared.
    #[tracing::instrument(level = "debug", skip(self, targets, rows, uow), fields(rows = rows.len()))]
    pub fn map_association(
        &self,
        targets: impl Into<Targets>,
        collection: &str,
        rows: &[Row],
        uow: &UnitOfWork,
    ) -> Result<Association> {
        match targets.into() {
            Targets::One(owner) => self.map_for_owner(&owner, collection, rows, uow),
            Targets::Many(owners) => self.map_for_owners(&owners, collection, rows, uow),
        }
    }

    fn map_for_owner(
        &self,
        owner: &Entity,
        name: &str,
        rows: &[Row],
        uow: &UnitOfWork,
    ) -> Result<Association> {
        let owner_mapping = owner.mapping();
        let collection = collection_of(&owner_mapping, name)?;
        let member_mapping = self.mapping.get(&collection.target)?;
        let prefix = member_prefix(collection, rows);
        let back = member_mapping.reference_to(owner_mapping.name());

        let mut members: Vec<Entity> = Vec::new();
        let mut ids: Vec<i64> = Vec::new();
        for row in rows {
            let Some(member) = self.map_member(row, &prefix, &collection.target, &members, uow)? else {
                continue;
            };
            if let Some(back) = back {
                member.load_back_reference(&back.name, owner)?;
            }
            if let Some(id) = member.id() {
                if !ids.contains(&id) {
                    ids.push(id);
                    members.push(member);
                }
            }
        }

        owner.load_collection(&collection.name, members.clone())?;
        tracing::debug!(
            collection = %collection.name,
            owner = ?owner.id(),
            count = members.len(),
            "Loaded collection"
        );
        Ok(Association {
            result: AssociationResult::Members(members),
            ids,
        })
    }

    fn map_for_owners(
        &self,
        owners: &[Entity],
        name: &str,
        rows: &[Row],
        uow: &UnitOfWork,
    ) -> Result<Association> {
        let Some(first) = owners.first() else {
            return Ok(Association {
                result: AssociationResult::Buckets(BTreeMap::new()),
                ids: Vec::new(),
            });
        };
        let owner_mapping = first.mapping();
        let collection = collection_of(&owner_mapping, name)?;
        let member_mapping = self.mapping.get(&collection.target)?;
        let prefix = member_prefix(collection, rows);
        let bucket_column = owner_mapping.foreign_key();
        let back = member_mapping.reference_to(owner_mapping.name());
        let reciprocal = member_mapping
            .collection_of(owner_mapping.name())
            .filter(|c| c.join_table == collection.join_table);

        let mut members: Vec<Entity> = Vec::new();
        let mut ids: Vec<i64> = Vec::new();
        let mut buckets: BTreeMap<i64, Vec<Entity>> = BTreeMap::new();
        for row in rows {
            let owner_id = row.get_by_name(&bucket_column).ok_or_else(|| {
                Error::query(
                    QueryErrorKind::MissingJoinColumn,
                    format!(
                        "Field \"{}\" is not defined in the query but it's required to construct \"{} to {}\" association. Just add it to SELECT clause.",
                        bucket_column,
                        collection.name,
                        owner_mapping.name()
                    ),
                )
            })?;
            let Some(member) = self.map_member(row, &prefix, &collection.target, &members, uow)? else {
                continue;
            };
            let Some(id) = member.id() else {
                continue;
            };
            if !ids.contains(&id) {
                ids.push(id);
                members.push(member.clone());
            }
            let Some(owner_id) = owner_id.as_i64() else {
                continue;
            };
            let bucket = buckets.entry(owner_id).or_default();
            if !bucket.iter().any(|m| m.same_as(&member)) {
                bucket.push(member);
            }
        }

        let mut owners_of: Vec<(Entity, Vec<Entity>)> = Vec::new();
        for owner in owners {
            let bucket = owner
                .id()
                .and_then(|id| buckets.get(&id).cloned())
                .unwrap_or_default();
            for member in &bucket {
                if let Some(back) = back {
                    member.load_back_reference(&back.name, owner)?;
                }
                if reciprocal.is_some() {
                    match owners_of.iter_mut().find(|(m, _)| m.same_as(member)) {
                        Some((_, list)) => list.push(owner.clone()),
                        None => owners_of.push((member.clone(), vec![owner.clone()])),
                    }
                }
            }
            owner.load_collection(&collection.name, bucket)?;
        }
        if let Some(reciprocal) = reciprocal {
            for (member, list) in owners_of {
                member.load_back_collection(&reciprocal.name, &list)?;
            }
        }

        tracing::debug!(
            collection = %collection.name,
            owners = owners.len(),
            members = members.len(),
            "Loaded collection for owners"
        );
        Ok(Association {
            result: AssociationResult::Buckets(buckets),
            ids,
        })
    }

    /// Map the member carried by `row`, reusing one already mapped with the same id.
    fn map_member(
        &self,
        row: &Row,
        prefix: &str,
        entity: &str,
        seen: &[Entity],
        uow: &UnitOfWork,
    ) -> Result<Option<Entity>> {
        let id_column = format!("{prefix}{PREFIX_SEPARATOR}{ID_FIELD}");
        let Some(id) = row.get_by_name(&id_column).and_then(Value::as_i64) else {
            return Ok(None);
        };
        if let Some(existing) = seen.iter().find(|m| m.id() == Some(id)) {
            return Ok(Some(existing.clone()));
        }
        self.map_prefixed(entity, row, uow, prefix).map(Some)
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("entities", &self.mapping.len())
            .finish_non_exhaustive()
    }
}

fn collection_of<'m>(mapping: &'m EntityMapping, name: &str) -> Result<&'m Collection> {
    mapping.collection(name).ok_or_else(|| {
        Error::Argument(format!(
            "Collection \"{}\" is not defined for entity \"{}\".",
            name,
            mapping.name()
        ))
    })
}

/// Prefix of the member columns: the singular collection name, or the
/// member entity name when no column uses the former.
fn member_prefix(collection: &Collection, rows: &[Row]) -> String {
    let singular = inflect::singularize(&collection.name);
    let marker = format!("{singular}{PREFIX_SEPARATOR}");
    let used = rows
        .first()
        .is_none_or(|row| row.column_names().any(|c| c.starts_with(&marker)));
    if used { singular } else { collection.target.clone() }
}

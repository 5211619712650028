//! Writing tracked entities to the database.
//!
//! [`Entity::flush`] persists one entity and cascades to what it needs:
//!
//! - a new entity is inserted, after any new strong reference target
//! - a dirty entity gets a partial UPDATE of its changed columns
//! - every collection is reconciled against its member-id baseline
//!
//! [`FlushOrderer`] orders a batch of entities so referenced types are
//! written before the types that reference them.

use crate::attribute::{Attribute, AttributeValue, MemberIds};
use crate::entity::{Entity, Link, TrackingSnapshot};
use entmap_core::{Collection, Connection, Dialect, EntityMapping, ID_FIELD, Mapping, Result, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Connection and options shared by every flush of one finalize.
#[derive(Clone, Copy)]
pub struct FlushContext<'a> {
    conn: &'a dyn Connection,
    dialect: Dialect,
    validate: bool,
}

impl<'a> FlushContext<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self {
            conn,
            dialect: conn.dialect(),
            validate: true,
        }
    }

    /// Run each entity's rule list before it is written.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn insert(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<i64> {
        let sql = self.dialect.insert_sql(table, columns);
        tracing::trace!(sql = %sql, "Executing INSERT");
        self.conn.insert(&sql, values)
    }

    fn update(&self, table: &str, columns: &[&str], mut values: Vec<Value>, id: i64) -> Result<u64> {
        let sql = self.dialect.update_by_id_sql(table, columns);
        values.push(Value::BigInt(id));
        tracing::trace!(sql = %sql, "Executing UPDATE");
        self.conn.execute(&sql, &values)
    }

    fn link(&self, join_table: &str, columns: &[&str], values: &[Value]) -> Result<u64> {
        let sql = self.dialect.insert_sql(join_table, columns);
        tracing::trace!(sql = %sql, "Executing link INSERT");
        self.conn.execute(&sql, values)
    }

    fn delete(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<u64> {
        let sql = self.dialect.delete_sql(table, columns);
        tracing::trace!(sql = %sql, "Executing DELETE");
        self.conn.execute(&sql, values)
    }
}

impl std::fmt::Debug for FlushContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushContext")
            .field("dialect", &self.dialect)
            .field("validate", &self.validate)
            .finish_non_exhaustive()
    }
}

impl Entity {
    /// Persist this entity and reconcile its collections.
    ///
    /// An entity already being flushed further up the cascade is skipped.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(entity = %self.name(), id = ?self.id()))]
    pub fn flush(&self, ctx: &FlushContext<'_>) -> Result<()> {
        {
            let mut state = self.state();
            if state.in_flight {
                tracing::trace!("Entity already in flight, skipping");
                return Ok(());
            }
            state.in_flight = true;
        }
        let result = self.flush_in_flight(ctx);
        self.state().in_flight = false;
        result
    }

    fn flush_in_flight(&self, ctx: &FlushContext<'_>) -> Result<()> {
        if ctx.validate {
            self.validate()?;
        }
        let mapping = self.mapping();

        if self.is_new() {
            self.insert_row(ctx, &mapping)?;
        } else if self.is_dirty() {
            self.update_row(ctx, &mapping)?;
        }

        for (index, collection) in mapping.collections().iter().enumerate() {
            self.reconcile_collection(ctx, &mapping, index, collection)?;
        }
        Ok(())
    }

    fn insert_row(&self, ctx: &FlushContext<'_>, mapping: &Arc<EntityMapping>) -> Result<()> {
        let mut columns: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut baselines: Vec<(String, Value)> = Vec::new();
        let slots = {
            let state = self.state();
            for accessor in mapping.accessors() {
                let value = accessor.get(state.payload.as_ref())?;
                columns.push(accessor.name().to_string());
                values.push(value.clone());
                baselines.push((accessor.name().to_string(), value));
            }
            state.references.clone()
        };

        for (reference, slot) in mapping.references().iter().zip(&slots) {
            let Some(target) = slot.current.as_ref().and_then(Link::entity) else {
                continue;
            };
            if !reference.weak && target.is_new() {
                target.flush(ctx)?;
            }
            columns.push(reference.foreign_key());
            values.push(Value::from(target.id()));
        }

        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        let id = ctx.insert(mapping.table(), &column_refs, &values)?;
        tracing::debug!(entity = %mapping.name(), id, "Inserted entity");

        let mut state = self.state();
        state.id = Some(id);
        state.set_baseline(ID_FIELD, Value::BigInt(id));
        for (field, value) in baselines {
            state.set_baseline(&field, value);
        }
        for slot in &mut state.references {
            slot.settle();
        }
        Ok(())
    }

    fn update_row(&self, ctx: &FlushContext<'_>, mapping: &Arc<EntityMapping>) -> Result<()> {
        let dirty = self.dirty_attributes();
        let dirty_references = self.dirty_references();
        let mut columns: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let (id, slots) = {
            let state = self.state();
            for attribute in dirty.iter().filter(|a| a.name() != ID_FIELD) {
                columns.push(attribute.name().to_string());
                values.push(state.current_value(attribute.name()));
            }
            (state.id, state.references.clone())
        };
        let Some(id) = id else {
            return Ok(());
        };

        for &index in &dirty_references {
            let reference = &mapping.references()[index];
            let target = slots[index].current.as_ref().and_then(Link::entity);
            if let Some(target) = &target {
                if !reference.weak && target.is_new() {
                    target.flush(ctx)?;
                }
            }
            columns.push(reference.foreign_key());
            values.push(Value::from(target.as_ref().and_then(Entity::id)));
        }

        if columns.is_empty() {
            return Ok(());
        }

        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        ctx.update(mapping.table(), &column_refs, values.clone(), id)?;
        tracing::debug!(entity = %mapping.name(), id, columns = ?column_refs, "Updated entity");

        let mut state = self.state();
        for (column, value) in columns.iter().zip(values) {
            if state.attributes.iter().any(|a| a.name() == column) {
                state.set_baseline(column, value);
            }
        }
        for index in dirty_references {
            state.references[index].settle();
        }
        Ok(())
    }

    fn collection_baseline(&self, index: usize) -> MemberIds {
        let state = self.state();
        match state.collections[index].baseline.as_ref().map(Attribute::baseline) {
            Some(AttributeValue::Members(ids)) => ids.clone(),
            _ => MemberIds::default(),
        }
    }

    fn reconcile_collection(
        &self,
        ctx: &FlushContext<'_>,
        mapping: &Arc<EntityMapping>,
        index: usize,
        collection: &Collection,
    ) -> Result<()> {
        let (owner_id, links) = {
            let state = self.state();
            (state.id, state.collections[index].current.clone())
        };
        let Some(owner_id) = owner_id else {
            return Ok(());
        };

        let baseline = self.collection_baseline(index);
        let current = MemberIds::from_ids(links.iter().map(Link::id));
        let members: Vec<Entity> = links.iter().filter_map(Link::entity).collect();
        let member_fk = entmap_core::inflect::foreign_key(&collection.target);
        let owner_fk = mapping.foreign_key();

        for removed in baseline.removed_from(&current) {
            match &collection.join_table {
                Some(join_table) => {
                    ctx.delete(
                        join_table,
                        &[owner_fk.as_str(), member_fk.as_str()],
                        &[Value::BigInt(owner_id), Value::BigInt(removed)],
                    )?;
                }
                None => {
                    ctx.delete(
                        &collection.target_table,
                        &[ID_FIELD],
                        &[Value::BigInt(removed)],
                    )?;
                }
            }
            tracing::debug!(
                collection = %collection.name,
                owner = owner_id,
                member = removed,
                "Removed collection member"
            );
        }

        for member in &members {
            let added = member.id().is_none_or(|id| !baseline.contains(id));
            if !added {
                continue;
            }
            let Some(join_table) = &collection.join_table else {
                self.claim_member(member, mapping)?;
                member.flush(ctx)?;
                continue;
            };
            if member.is_new() {
                member.flush(ctx)?;
            }
            let Some(member_id) = member.id() else {
                tracing::warn!(collection = %collection.name, "Member has no id, join row skipped");
                continue;
            };
            // the member's own flush may already have linked both sides
            if self.collection_baseline(index).contains(member_id) {
                continue;
            }
            ctx.link(
                join_table,
                &[owner_fk.as_str(), member_fk.as_str()],
                &[Value::BigInt(owner_id), Value::BigInt(member_id)],
            )?;
            self.mark_reciprocal_linked(member, mapping, join_table, owner_id);
            tracing::debug!(
                join_table = %join_table,
                owner = owner_id,
                member = member_id,
                "Linked collection member"
            );
        }

        let settled = MemberIds::from_ids(links.iter().map(Link::id));
        self.state().collections[index].baseline =
            Some(Attribute::members(collection.name.clone(), settled));
        Ok(())
    }

    /// Point a one-to-many member's back reference at this entity.
    fn claim_member(&self, member: &Entity, owner: &EntityMapping) -> Result<()> {
        let member_mapping = member.mapping();
        let Some(back) = member_mapping.reference_to(owner.name()) else {
            return Ok(());
        };
        let points_here = member
            .reference(&back.name)
            .is_some_and(|current| current.same_as(self));
        if !points_here {
            member.set_back_reference(&back.name, self)?;
        }
        Ok(())
    }

    /// Record a freshly written join row in the member's own collection
    /// baseline, so flushing the member does not write it again.
    fn mark_reciprocal_linked(
        &self,
        member: &Entity,
        owner: &EntityMapping,
        join_table: &str,
        owner_id: i64,
    ) {
        let member_mapping = member.mapping();
        let Some(position) = member_mapping.collections().iter().position(|c| {
            c.target == owner.name() && c.join_table.as_deref() == Some(join_table)
        }) else {
            return;
        };
        let holds_owner = {
            let state = member.state();
            state.collections[position]
                .current
                .iter()
                .any(|m| m.points_to(self))
        };
        if !holds_owner {
            return;
        }
        let mut state = member.state();
        let slot = &mut state.collections[position];
        let mut ids = match slot.baseline.as_ref().map(Attribute::baseline) {
            Some(AttributeValue::Members(ids)) => ids.clone(),
            _ => MemberIds::default(),
        };
        ids.insert(owner_id);
        slot.baseline = Some(Attribute::members(
            member_mapping.collections()[position].name.clone(),
            ids,
        ));
    }
}

/// Tracking state of `entities` and of everything reachable from them.
///
/// A flush can assign ids and move baselines on any entity it cascades to,
/// so all of them are recorded.
pub(crate) fn snapshot_reachable(entities: &[Entity]) -> Vec<TrackingSnapshot> {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut pending: Vec<Entity> = entities.to_vec();
    let mut snapshots = Vec::new();
    while let Some(entity) = pending.pop() {
        if !seen.insert(entity.address()) {
            continue;
        }
        snapshots.push(entity.tracking_snapshot());
        pending.extend(entity.neighbours());
    }
    snapshots
}

/// Orders entities so that referenced types flush before their dependents.
///
/// Only strong references count as dependencies.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity -> entities it depends on.
    dependencies: HashMap<String, Vec<String>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every entity of the mapping with its strong dependencies.
    pub fn from_mapping(mapping: &Mapping) -> Self {
        let mut orderer = Self::new();
        for entity in mapping.iter() {
            orderer.register(
                entity.name(),
                entity.dependencies().into_iter().map(str::to_string).collect(),
            );
        }
        orderer
    }

    /// Register an entity's dependencies directly.
    pub fn register(&mut self, entity: &str, depends_on: Vec<String>) {
        self.dependencies.insert(entity.to_string(), depends_on);
    }

    fn depends_on(&self, entity: &str, other: &str) -> bool {
        self.dependencies
            .get(entity)
            .is_some_and(|deps| deps.iter().any(|d| d == other))
    }

    /// Group entities by type and order the groups.
    ///
    /// A type is emitted once no remaining type it directly depends on is
    /// still pending. Ties keep first-appearance order. On a cycle the first
    /// pending type is emitted as is.
    #[tracing::instrument(level = "debug", skip(self, entities), fields(count = entities.len()))]
    pub fn order(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let mut types: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Entity>> = HashMap::new();
        for entity in entities {
            let name = entity.name();
            if !groups.contains_key(&name) {
                types.push(name.clone());
            }
            groups.entry(name).or_default().push(entity);
        }

        let mut pending = types;
        let mut ordered_types: Vec<String> = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|candidate| {
                    !pending
                        .iter()
                        .any(|other| other != candidate && self.depends_on(candidate, other))
                })
                .unwrap_or(0);
            ordered_types.push(pending.remove(ready));
        }

        tracing::debug!(order = ?ordered_types, "Ordered entity types for flush");
        ordered_types
            .into_iter()
            .flat_map(|name| groups.remove(&name).unwrap_or_default())
            .collect()
    }
}

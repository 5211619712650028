//! Tracked entity handle.
//!
//! An [`Entity`] owns a domain object (the payload) together with its
//! identity and everything needed to detect and persist changes: attribute
//! baselines, reference slots and collection slots. Associations live on the
//! handle rather than on the domain type, so the domain type stays a plain
//! struct with scalar fields.
//!
//! Handles are cheap to clone and share one state. Identity comparisons use
//! [`Entity::same_as`].

use crate::attribute::{Attribute, MemberIds};
use entmap_core::error::{Error, TypeError};
use entmap_core::{EntityMapping, ID_FIELD, Result, Value};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// One end of an association held by an entity.
///
/// Links set through the public API own their target. Links pointing back at
/// an owner (a member's reference to the entity holding it in a collection,
/// or a many-to-many collection filled from the other side) do not, so an
/// aggregate never keeps itself alive.
#[derive(Clone)]
pub(crate) enum Link {
    Owned(Entity),
    /// Non-owning link with the target id known when the link was made.
    Back(WeakEntity, Option<i64>),
}

impl Link {
    /// Non-owning link to `target`. Locks `target` to read its id.
    pub(crate) fn back(target: &Entity) -> Self {
        Link::Back(target.downgrade(), target.id())
    }

    /// The target, if it is still alive.
    pub(crate) fn entity(&self) -> Option<Entity> {
        match self {
            Link::Owned(entity) => Some(entity.clone()),
            Link::Back(weak, _) => weak.upgrade(),
        }
    }

    /// Id of the target. A dropped target reports its last known id.
    pub(crate) fn id(&self) -> Option<i64> {
        match self {
            Link::Owned(entity) => entity.id(),
            Link::Back(weak, known) => weak.upgrade().map_or(*known, |e| e.id()),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakEntity {
        match self {
            Link::Owned(entity) => entity.downgrade(),
            Link::Back(weak, _) => weak.clone(),
        }
    }

    pub(crate) fn points_to(&self, entity: &Entity) -> bool {
        std::ptr::eq(self.as_ptr(), Arc::as_ptr(&entity.inner))
    }

    pub(crate) fn is(&self, other: &WeakEntity) -> bool {
        std::ptr::eq(self.as_ptr(), other.inner.as_ptr())
    }

    fn as_ptr(&self) -> *const Mutex<EntityState> {
        match self {
            Link::Owned(entity) => Arc::as_ptr(&entity.inner),
            Link::Back(weak, _) => weak.inner.as_ptr(),
        }
    }
}

/// Current target of a reference plus the target it had at the baseline.
///
/// `baseline` is `None` until the reference has been loaded or flushed. It
/// only serves identity comparisons, so it never owns the target.
#[derive(Clone, Default)]
pub(crate) struct ReferenceSlot {
    pub(crate) current: Option<Link>,
    pub(crate) baseline: Option<Option<WeakEntity>>,
}

impl ReferenceSlot {
    /// Take the current target as the new baseline.
    pub(crate) fn settle(&mut self) {
        self.baseline = Some(self.current.as_ref().map(Link::downgrade));
    }

    pub(crate) fn changed(&self) -> bool {
        match (self.baseline.as_ref().and_then(Option::as_ref), &self.current) {
            (None, None) => false,
            (Some(before), Some(now)) => !now.is(before),
            _ => true,
        }
    }
}

/// Current members of a collection plus the member-id baseline.
#[derive(Clone, Default)]
pub(crate) struct CollectionSlot {
    pub(crate) current: Vec<Link>,
    pub(crate) baseline: Option<Attribute>,
}

impl CollectionSlot {
    /// Members still alive, in collection order.
    pub(crate) fn members(&self) -> Vec<Entity> {
        self.current.iter().filter_map(Link::entity).collect()
    }
}

pub(crate) struct EntityState {
    pub(crate) mapping: Arc<EntityMapping>,
    pub(crate) payload: Box<dyn Any + Send>,
    pub(crate) id: Option<i64>,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) references: Vec<ReferenceSlot>,
    pub(crate) collections: Vec<CollectionSlot>,
    pub(crate) in_flight: bool,
}

impl EntityState {
    /// Current value of a declared field.
    pub(crate) fn current_value(&self, field: &str) -> Value {
        if field == ID_FIELD {
            return Value::from(self.id);
        }
        self.mapping
            .accessor(field)
            .and_then(|a| a.get(self.payload.as_ref()).ok())
            .unwrap_or(Value::Null)
    }

    /// Record `value` as the baseline of `field`, replacing any previous one.
    pub(crate) fn set_baseline(&mut self, field: &str, value: Value) {
        match self.attributes.iter_mut().find(|a| a.name() == field) {
            Some(existing) => *existing = Attribute::scalar(field, value),
            None => self.attributes.push(Attribute::scalar(field, value)),
        }
    }

    fn reference_index(&self, name: &str) -> Result<usize> {
        self.mapping
            .references()
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| {
                Error::Argument(format!(
                    "Reference \"{}\" is not defined for entity \"{}\".",
                    name,
                    self.mapping.name()
                ))
            })
    }

    fn collection_index(&self, name: &str) -> Result<usize> {
        self.mapping
            .collections()
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                Error::Argument(format!(
                    "Collection \"{}\" is not defined for entity \"{}\".",
                    name,
                    self.mapping.name()
                ))
            })
    }
}

/// A domain object under change tracking.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<Mutex<EntityState>>,
}

/// Non-owning handle to a tracked entity.
#[derive(Clone)]
pub struct WeakEntity {
    inner: Weak<Mutex<EntityState>>,
}

impl WeakEntity {
    /// The entity, unless every owning handle has been dropped.
    pub fn upgrade(&self) -> Option<Entity> {
        self.inner.upgrade().map(|inner| Entity { inner })
    }
}

impl fmt::Debug for WeakEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(entity) => f.debug_tuple("WeakEntity").field(&entity).finish(),
            None => f.write_str("WeakEntity(dropped)"),
        }
    }
}

impl Entity {
    pub(crate) fn new(mapping: Arc<EntityMapping>, payload: Box<dyn Any + Send>) -> Self {
        let references = vec![ReferenceSlot::default(); mapping.references().len()];
        let collections = vec![CollectionSlot::default(); mapping.collections().len()];
        Self {
            inner: Arc::new(Mutex::new(EntityState {
                mapping,
                payload,
                id: None,
                attributes: Vec::new(),
                references,
                collections,
                in_flight: false,
            })),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EntityState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<i64> {
        self.state().id
    }

    /// An entity is new until it has been inserted.
    pub fn is_new(&self) -> bool {
        self.state().id.is_none()
    }

    /// Entity name from the mapping.
    pub fn name(&self) -> String {
        self.state().mapping.name().to_string()
    }

    pub fn mapping(&self) -> Arc<EntityMapping> {
        Arc::clone(&self.state().mapping)
    }

    /// Whether the payload is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.state().payload.is::<T>()
    }

    /// Both handles point at the same tracked object.
    pub fn same_as(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Address of the shared state, usable as a set key while the handle lives.
    pub(crate) fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Borrow the payload as a `T`.
    pub fn read<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let state = self.state();
        let payload = state
            .payload
            .downcast_ref::<T>()
            .ok_or_else(|| payload_mismatch::<T>(&state.mapping))?;
        Ok(f(payload))
    }

    /// Mutably borrow the payload as a `T`.
    pub fn write<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut state = self.state();
        let mapping = Arc::clone(&state.mapping);
        let payload = state
            .payload
            .downcast_mut::<T>()
            .ok_or_else(|| payload_mismatch::<T>(&mapping))?;
        Ok(f(payload))
    }

    /// Current value of a declared field, `id` included.
    pub fn get(&self, field: &str) -> Result<Value> {
        let state = self.state();
        if field == ID_FIELD {
            return Ok(Value::from(state.id));
        }
        let accessor = state
            .mapping
            .accessor(field)
            .ok_or_else(|| unknown_field(&state.mapping, field))?;
        accessor.get(state.payload.as_ref())
    }

    /// Write a declared field through its accessor.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let mut state = self.state();
        let mapping = Arc::clone(&state.mapping);
        let accessor = mapping
            .accessor(field)
            .ok_or_else(|| unknown_field(&mapping, field))?;
        accessor.set(state.payload.as_mut(), &value.into())
    }

    /// Target of a reference.
    ///
    /// A reference back to an owner reads as `None` once the owner is dropped.
    pub fn reference(&self, name: &str) -> Option<Entity> {
        let state = self.state();
        let index = state.reference_index(name).ok()?;
        state.references[index].current.as_ref().and_then(Link::entity)
    }

    /// Point a reference at another entity, or clear it.
    pub fn set_reference(&self, name: &str, target: Option<Entity>) -> Result<()> {
        let index = self.checked_reference(name, target.as_ref())?;
        self.state().references[index].current = target.map(Link::Owned);
        Ok(())
    }

    /// Members of a collection. Members filled in from the other side of a
    /// many-to-many association are left out once dropped.
    pub fn collection(&self, name: &str) -> Vec<Entity> {
        let state = self.state();
        match state.collection_index(name) {
            Ok(index) => state.collections[index].members(),
            Err(_) => Vec::new(),
        }
    }

    /// Replace the members of a collection.
    pub fn set_collection(&self, name: &str, members: Vec<Entity>) -> Result<()> {
        let index = self.checked_collection(name, &members)?;
        self.state().collections[index].current = members.into_iter().map(Link::Owned).collect();
        Ok(())
    }

    /// Append a member to a collection.
    pub fn push(&self, name: &str, member: Entity) -> Result<()> {
        let index = self.checked_collection(name, std::slice::from_ref(&member))?;
        self.state().collections[index].current.push(Link::Owned(member));
        Ok(())
    }

    /// Remove a member from a collection. Returns whether it was present.
    pub fn remove(&self, name: &str, member: &Entity) -> Result<bool> {
        let mut state = self.state();
        let index = state.collection_index(name)?;
        let members = &mut state.collections[index].current;
        let before = members.len();
        members.retain(|m| !m.points_to(member));
        Ok(members.len() != before)
    }

    /// Set field values and their baselines from a materialized row.
    ///
    /// The baseline is read back through the getter so it compares equal to
    /// the unchanged current value whatever column type the driver returned.
    pub fn load_attributes(&self, attributes: &[(String, Value)]) -> Result<()> {
        let mut state = self.state();
        let mapping = Arc::clone(&state.mapping);
        for (field, value) in attributes {
            if field == ID_FIELD {
                state.id = value.as_i64();
                let id = Value::from(state.id);
                state.set_baseline(ID_FIELD, id);
                continue;
            }
            let Some(accessor) = mapping.accessor(field) else {
                continue;
            };
            accessor.set(state.payload.as_mut(), value)?;
            let baseline = accessor.get(state.payload.as_ref())?;
            state.set_baseline(field, baseline);
        }
        Ok(())
    }

    /// Set a reference together with its baseline.
    pub fn load_reference(&self, name: &str, target: Option<Entity>) -> Result<()> {
        let index = self.checked_reference(name, target.as_ref())?;
        let mut slot = ReferenceSlot {
            current: target.map(Link::Owned),
            baseline: None,
        };
        slot.settle();
        self.state().references[index] = slot;
        Ok(())
    }

    /// Set a reference back to `owner`, baseline included, without owning it.
    pub(crate) fn load_back_reference(&self, name: &str, owner: &Entity) -> Result<()> {
        let index = self.checked_reference(name, Some(owner))?;
        let mut slot = ReferenceSlot {
            current: Some(Link::back(owner)),
            baseline: None,
        };
        slot.settle();
        self.state().references[index] = slot;
        Ok(())
    }

    /// Point a reference back at `owner` without touching its baseline.
    pub(crate) fn set_back_reference(&self, name: &str, owner: &Entity) -> Result<()> {
        let index = self.checked_reference(name, Some(owner))?;
        let link = Link::back(owner);
        self.state().references[index].current = Some(link);
        Ok(())
    }

    /// Set a collection together with its member-id baseline.
    pub fn load_collection(&self, name: &str, members: Vec<Entity>) -> Result<()> {
        let links = members.iter().cloned().map(Link::Owned).collect();
        self.load_links(name, &members, links)
    }

    /// Set a collection of owners, baseline included, without owning them.
    pub(crate) fn load_back_collection(&self, name: &str, owners: &[Entity]) -> Result<()> {
        let links = owners.iter().map(Link::back).collect();
        self.load_links(name, owners, links)
    }

    fn load_links(&self, name: &str, members: &[Entity], links: Vec<Link>) -> Result<()> {
        let index = self.checked_collection(name, members)?;
        let ids = MemberIds::from_ids(members.iter().map(Entity::id));
        self.state().collections[index] = CollectionSlot {
            current: links,
            baseline: Some(Attribute::members(name, ids)),
        };
        Ok(())
    }

    /// Entities this one links to through live references and collections.
    pub(crate) fn neighbours(&self) -> Vec<Entity> {
        let (references, collections) = {
            let state = self.state();
            (state.references.clone(), state.collections.clone())
        };
        references
            .iter()
            .filter_map(|slot| slot.current.as_ref().and_then(Link::entity))
            .chain(collections.iter().flat_map(CollectionSlot::members))
            .collect()
    }

    /// Record the persistence bookkeeping so it can be put back later.
    pub(crate) fn tracking_snapshot(&self) -> TrackingSnapshot {
        let state = self.state();
        TrackingSnapshot {
            entity: self.clone(),
            id: state.id,
            attributes: state.attributes.clone(),
            reference_baselines: state.references.iter().map(|r| r.baseline.clone()).collect(),
            collection_baselines: state.collections.iter().map(|c| c.baseline.clone()).collect(),
        }
    }

    /// Run the mapping's rule list against the current field values.
    pub fn validate(&self) -> Result<()> {
        let state = self.state();
        let mapping = Arc::clone(&state.mapping);
        if mapping.rules().is_empty() {
            return Ok(());
        }
        mapping
            .rules()
            .evaluate(mapping.type_name(), |field| Some(state.current_value(field)))
            .map_err(Error::Validation)
    }

    fn checked_reference(&self, name: &str, target: Option<&Entity>) -> Result<usize> {
        let (index, expected, owner) = {
            let state = self.state();
            let index = state.reference_index(name)?;
            let expected = state.mapping.references()[index].target.clone();
            (index, expected, state.mapping.name().to_string())
        };
        if let Some(target) = target {
            let actual = target.name();
            if actual != expected {
                return Err(Error::Argument(format!(
                    "Reference \"{}\" of entity \"{}\" expects \"{}\" but got \"{}\".",
                    name, owner, expected, actual
                )));
            }
        }
        Ok(index)
    }

    fn checked_collection(&self, name: &str, members: &[Entity]) -> Result<usize> {
        let (index, expected, owner) = {
            let state = self.state();
            let index = state.collection_index(name)?;
            let expected = state.mapping.collections()[index].target.clone();
            (index, expected, state.mapping.name().to_string())
        };
        for member in members {
            let actual = member.name();
            if actual != expected {
                return Err(Error::Argument(format!(
                    "Collection \"{}\" of entity \"{}\" holds \"{}\" but got \"{}\".",
                    name, owner, expected, actual
                )));
            }
        }
        Ok(index)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Entity")
            .field("name", &state.mapping.name())
            .field("id", &state.id)
            .finish_non_exhaustive()
    }
}

/// Id and baselines of one entity at a point in time.
pub(crate) struct TrackingSnapshot {
    entity: Entity,
    id: Option<i64>,
    attributes: Vec<Attribute>,
    reference_baselines: Vec<Option<Option<WeakEntity>>>,
    collection_baselines: Vec<Option<Attribute>>,
}

impl TrackingSnapshot {
    /// Put the recorded id and baselines back. Current values are kept.
    pub(crate) fn restore(self) {
        let mut state = self.entity.state();
        state.id = self.id;
        state.attributes = self.attributes;
        state.in_flight = false;
        for (slot, baseline) in state.references.iter_mut().zip(self.reference_baselines) {
            slot.baseline = baseline;
        }
        for (slot, baseline) in state.collections.iter_mut().zip(self.collection_baselines) {
            slot.baseline = baseline;
        }
    }
}

fn payload_mismatch<T>(mapping: &EntityMapping) -> Error {
    Error::Type(TypeError {
        expected: std::any::type_name::<T>(),
        actual: mapping.type_name().to_string(),
        column: None,
    })
}

fn unknown_field(mapping: &EntityMapping, field: &str) -> Error {
    Error::Argument(format!(
        "Field \"{}\" is not defined for entity \"{}\".",
        field,
        mapping.name()
    ))
}

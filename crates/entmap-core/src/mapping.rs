//! Mapping registry.
//!
//! A [`Mapping`] is built once per application and describes, for every
//! persisted Rust type, the entity name, the backing table, the ordered
//! field list (always starting with `id`), the typed field accessors, the
//! references to other entities and the collections of other entities.
//!
//! ```ignore
//! let mapping = Mapping::builder()
//!     .entity::<Plan>(|e| {
//!         e.field("name", |p: &Plan| p.name.clone(), |p: &mut Plan, v| p.name = v)
//!             .presence("name")
//!     })?
//!     .entity::<Subscription>(|e| {
//!         e.field("active", |s: &Subscription| s.active, |s: &mut Subscription, v| s.active = v)
//!             .reference::<Plan>("plan")
//!     })?
//!     .build()?;
//! ```

use crate::error::{Error, QueryErrorKind, TypeError};
use crate::inflect;
use crate::row::FromValue;
use crate::validate::{Rule, RuleList};
use crate::value::{Value, ValueKind};
use crate::Result;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the implicit identity field.
pub const ID_FIELD: &str = "id";

type Getter = Arc<dyn Fn(&dyn Any) -> Result<Value> + Send + Sync>;
type Setter = Arc<dyn Fn(&mut dyn Any, &Value) -> Result<()> + Send + Sync>;
type Constructor = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Typed getter/setter pair for one declared field.
#[derive(Clone)]
pub struct FieldAccessor {
    name: String,
    get: Getter,
    set: Setter,
}

impl FieldAccessor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the field from a payload of the mapped type.
    pub fn get(&self, payload: &dyn Any) -> Result<Value> {
        (self.get)(payload)
    }

    /// Write a column value into a payload of the mapped type.
    pub fn set(&self, payload: &mut dyn Any, value: &Value) -> Result<()> {
        (self.set)(payload, value)
    }
}

impl fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A single-valued association to another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    /// Entity name of the referenced type.
    pub target: String,
    /// Weak references are neither cascaded on insert nor used for ordering.
    pub weak: bool,
}

impl Reference {
    /// Column holding the referenced id: `<name>_id`.
    pub fn foreign_key(&self) -> String {
        inflect::foreign_key(&self.name)
    }
}

/// A multi-valued association to another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    /// Entity name of the member type.
    pub target: String,
    /// Table of the member type.
    pub target_table: String,
    /// Present for many-to-many collections.
    pub join_table: Option<String>,
}

impl Collection {
    pub fn is_many_to_many(&self) -> bool {
        self.join_table.is_some()
    }
}

/// Everything the engine knows about one mapped type.
pub struct EntityMapping {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    table: String,
    fields: Vec<String>,
    accessors: Vec<FieldAccessor>,
    references: Vec<Reference>,
    collections: Vec<Collection>,
    rules: RuleList,
    constructor: Constructor,
}

impl EntityMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `TypeId` of the mapped payload type.
    pub fn payload_type_id(&self) -> TypeId {
        self.type_id
    }

    /// Short Rust type name, e.g. `LineItem`.
    pub fn type_name(&self) -> &'static str {
        inflect::type_base_name(self.type_name)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared field names, `id` first.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Accessors for every declared field except `id`, in declaration order.
    pub fn accessors(&self) -> &[FieldAccessor] {
        &self.accessors
    }

    pub fn accessor(&self, field: &str) -> Option<&FieldAccessor> {
        self.accessors.iter().find(|a| a.name == field)
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn reference(&self, name: &str) -> Option<&Reference> {
        self.references.iter().find(|r| r.name == name)
    }

    /// First reference whose target is the given entity.
    pub fn reference_to(&self, target: &str) -> Option<&Reference> {
        self.references.iter().find(|r| r.target == target)
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// First collection whose members are the given entity.
    pub fn collection_of(&self, target: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.target == target)
    }

    /// Entity names this entity must be flushed after: strong reference targets.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for reference in self.references.iter().filter(|r| !r.weak) {
            if !deps.contains(&reference.target.as_str()) {
                deps.push(&reference.target);
            }
        }
        deps
    }

    /// Every referenced entity name, strong and weak.
    pub fn relations(&self) -> Vec<&str> {
        let mut rels: Vec<&str> = Vec::new();
        for reference in &self.references {
            if !rels.contains(&reference.target.as_str()) {
                rels.push(&reference.target);
            }
        }
        rels
    }

    pub fn rules(&self) -> &RuleList {
        &self.rules
    }

    /// Foreign key other tables use to point at this entity: `<name>_id`.
    pub fn foreign_key(&self) -> String {
        inflect::foreign_key(&self.name)
    }

    /// Build a fresh default payload of the mapped type.
    pub fn construct(&self) -> Box<dyn Any + Send> {
        (self.constructor)()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for EntityMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMapping")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("references", &self.references)
            .field("collections", &self.collections)
            .finish_non_exhaustive()
    }
}

/// The registry of every mapped entity.
#[derive(Debug, Default)]
pub struct Mapping {
    entities: Vec<Arc<EntityMapping>>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl Mapping {
    pub fn builder() -> MappingBuilder {
        MappingBuilder::default()
    }

    /// Look up an entity by name.
    pub fn get(&self, name: &str) -> Result<&Arc<EntityMapping>> {
        self.by_name
            .get(name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| {
                Error::query(
                    QueryErrorKind::UnregisteredEntity,
                    format!("Entity \"{}\" is not defined in the mapping.", name),
                )
            })
    }

    pub fn get_by_type(&self, type_id: TypeId) -> Option<&Arc<EntityMapping>> {
        self.by_type.get(&type_id).map(|&i| &self.entities[i])
    }

    pub fn of<T: 'static>(&self) -> Option<&Arc<EntityMapping>> {
        self.get_by_type(TypeId::of::<T>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered entities in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityMapping>> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

struct PendingAssociation {
    name: String,
    target: TypeId,
    target_type: &'static str,
    weak: bool,
    join_table: Option<String>,
}

struct PendingEntity {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    table: String,
    declared: Vec<String>,
    accessors: Vec<FieldAccessor>,
    references: Vec<PendingAssociation>,
    collections: Vec<PendingAssociation>,
    rules: Vec<Rule>,
    constructor: Constructor,
}

/// Collects entity declarations and validates them as a whole in [`build`](Self::build).
#[derive(Default)]
pub struct MappingBuilder {
    pending: Vec<PendingEntity>,
}

impl MappingBuilder {
    /// Register `T` under its default entity name.
    pub fn entity<T>(
        self,
        declare: impl FnOnce(EntityMappingBuilder<T>) -> EntityMappingBuilder<T>,
    ) -> Result<Self>
    where
        T: Default + Send + 'static,
    {
        self.entity_named::<T>(&inflect::entity_name_of::<T>(), declare)
    }

    /// Register `T` under an explicit entity name.
    pub fn entity_named<T>(
        mut self,
        name: &str,
        declare: impl FnOnce(EntityMappingBuilder<T>) -> EntityMappingBuilder<T>,
    ) -> Result<Self>
    where
        T: Default + Send + 'static,
    {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        if self.pending.iter().any(|p| p.type_id == type_id) {
            return Err(Error::definition(format!(
                "Mapping definition for entity of type {} is already registered.",
                inflect::type_base_name(type_name)
            )));
        }
        if self.pending.iter().any(|p| p.name == name) {
            return Err(Error::definition(format!(
                "Entity name \"{}\" is already used by another type.",
                name
            )));
        }

        let declared = declare(EntityMappingBuilder::new(name));
        tracing::trace!(entity = %name, fields = declared.accessors.len(), "Declared entity");
        self.pending.push(declared.into_pending(type_id, type_name));
        Ok(self)
    }

    /// Resolve association targets and check the declarations.
    pub fn build(self) -> Result<Mapping> {
        let names: HashMap<TypeId, (String, String)> = self
            .pending
            .iter()
            .map(|p| (p.type_id, (p.name.clone(), p.table.clone())))
            .collect();
        let resolve = |owner: &str, assoc: &PendingAssociation| -> Result<(String, String)> {
            names.get(&assoc.target).cloned().ok_or_else(|| {
                Error::definition(format!(
                    "Association \"{}\" of entity \"{}\" targets type {} which is not registered.",
                    assoc.name,
                    owner,
                    inflect::type_base_name(assoc.target_type)
                ))
            })
        };

        let mut mapping = Mapping::default();
        for pending in self.pending {
            if pending.declared.iter().any(|d| d == ID_FIELD) {
                return Err(Error::definition(format!(
                    "Field \"id\" is implicit and cannot be declared for entity \"{}\".",
                    pending.name
                )));
            }
            for (i, declared) in pending.declared.iter().enumerate() {
                if pending.declared[..i].contains(declared) {
                    return Err(Error::definition(format!(
                        "\"{}\" is declared more than once for entity \"{}\".",
                        declared, pending.name
                    )));
                }
            }

            let mut fields = vec![ID_FIELD.to_string()];
            fields.extend(pending.accessors.iter().map(|a| a.name.clone()));

            for rule in &pending.rules {
                if !fields.iter().any(|f| f == rule.field()) {
                    return Err(Error::definition(format!(
                        "Validation rule for entity \"{}\" names undeclared field \"{}\".",
                        pending.name,
                        rule.field()
                    )));
                }
            }

            let references = pending
                .references
                .iter()
                .map(|r| {
                    Ok(Reference {
                        name: r.name.clone(),
                        target: resolve(&pending.name, r)?.0,
                        weak: r.weak,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let collections = pending
                .collections
                .iter()
                .map(|c| {
                    let (target, target_table) = resolve(&pending.name, c)?;
                    Ok(Collection {
                        name: c.name.clone(),
                        target,
                        target_table,
                        join_table: c.join_table.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let index = mapping.entities.len();
            mapping.by_name.insert(pending.name.clone(), index);
            mapping.by_type.insert(pending.type_id, index);
            mapping.entities.push(Arc::new(EntityMapping {
                name: pending.name,
                type_id: pending.type_id,
                type_name: pending.type_name,
                table: pending.table,
                fields,
                accessors: pending.accessors,
                references,
                collections,
                rules: RuleList::new(pending.rules),
                constructor: pending.constructor,
            }));
        }

        tracing::debug!(entities = mapping.len(), "Mapping built");
        Ok(mapping)
    }
}

/// Declarations for a single entity type.
pub struct EntityMappingBuilder<T> {
    name: String,
    table: String,
    declared: Vec<String>,
    accessors: Vec<FieldAccessor>,
    references: Vec<PendingAssociation>,
    collections: Vec<PendingAssociation>,
    rules: Vec<Rule>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Default + Send + 'static> EntityMappingBuilder<T> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: inflect::pluralize(name),
            declared: Vec::new(),
            accessors: Vec::new(),
            references: Vec::new(),
            collections: Vec::new(),
            rules: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Override the table name.
    pub fn table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    /// Declare a persisted field with its getter and setter.
    pub fn field<V, G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        V: Into<Value> + FromValue + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let field = name.to_string();
        let column = field.clone();
        let getter: Getter = Arc::new(move |payload: &dyn Any| {
            payload
                .downcast_ref::<T>()
                .map(|p| get(p).into())
                .ok_or_else(|| payload_mismatch::<T>())
        });
        let setter: Setter = Arc::new(move |payload: &mut dyn Any, value: &Value| {
            let target = payload
                .downcast_mut::<T>()
                .ok_or_else(|| payload_mismatch::<T>())?;
            let converted = V::from_value(value).map_err(|e| match e {
                Error::Type(mut te) => {
                    te.column = Some(column.clone());
                    Error::Type(te)
                }
                e => e,
            })?;
            set(target, converted);
            Ok(())
        });
        self.declared.push(field.clone());
        self.accessors.push(FieldAccessor {
            name: field,
            get: getter,
            set: setter,
        });
        self
    }

    /// Declare a strong reference: cascaded on insert, flushed first.
    pub fn reference<U: 'static>(self, name: &str) -> Self {
        self.push_reference::<U>(name, false)
    }

    /// Declare a weak reference: never cascaded, ignored for ordering.
    pub fn weak_reference<U: 'static>(self, name: &str) -> Self {
        self.push_reference::<U>(name, true)
    }

    /// Declare a one-to-many collection stored as a foreign key on the member table.
    pub fn collection<U: 'static>(self, name: &str) -> Self {
        self.push_collection::<U>(name, None)
    }

    /// Declare a many-to-many collection stored in `join_table`.
    pub fn collection_via<U: 'static>(self, name: &str, join_table: &str) -> Self {
        self.push_collection::<U>(name, Some(join_table.to_string()))
    }

    /// Add a custom rule for `field`.
    pub fn validate<P>(mut self, field: &str, message: &str, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule::new(field, message, predicate));
        self
    }

    pub fn presence(mut self, field: &str) -> Self {
        self.rules.push(Rule::presence(field));
        self
    }

    pub fn kind(mut self, field: &str, kind: ValueKind) -> Self {
        self.rules.push(Rule::kind(field, kind));
        self
    }

    fn push_reference<U: 'static>(mut self, name: &str, weak: bool) -> Self {
        self.declared.push(name.to_string());
        self.references.push(PendingAssociation {
            name: name.to_string(),
            target: TypeId::of::<U>(),
            target_type: std::any::type_name::<U>(),
            weak,
            join_table: None,
        });
        self
    }

    fn push_collection<U: 'static>(mut self, name: &str, join_table: Option<String>) -> Self {
        self.declared.push(name.to_string());
        self.collections.push(PendingAssociation {
            name: name.to_string(),
            target: TypeId::of::<U>(),
            target_type: std::any::type_name::<U>(),
            weak: false,
            join_table,
        });
        self
    }

    fn into_pending(self, type_id: TypeId, type_name: &'static str) -> PendingEntity {
        PendingEntity {
            name: self.name,
            type_id,
            type_name,
            table: self.table,
            declared: self.declared,
            accessors: self.accessors,
            references: self.references,
            collections: self.collections,
            rules: self.rules,
            constructor: Arc::new(|| Box::new(T::default())),
        }
    }
}

fn payload_mismatch<T>() -> Error {
    Error::Type(TypeError {
        expected: std::any::type_name::<T>(),
        actual: "payload of another type".to_string(),
        column: None,
    })
}

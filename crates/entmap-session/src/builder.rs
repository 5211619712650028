//! Creation of bare domain objects and their tracked wrappers.

use crate::entity::Entity;
use entmap_core::error::{Error, TypeError};
use entmap_core::{EntityMapping, Mapping, Result, Value};
use std::any::Any;
use std::sync::Arc;

/// Produces bare domain instances for mapped types.
///
/// The materializer asks the factory for an instance before filling it from
/// a row. `attributes` carries the extracted `(field, value)` pairs for
/// factories that want to construct from them directly.
pub trait ObjectFactory: Send + Sync {
    fn resolve(
        &self,
        mapping: &EntityMapping,
        attributes: &[(String, Value)],
    ) -> Result<Box<dyn Any + Send>>;
}

/// Builds every type through the constructor registered with its mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultObjectFactory;

impl ObjectFactory for DefaultObjectFactory {
    fn resolve(
        &self,
        mapping: &EntityMapping,
        _attributes: &[(String, Value)],
    ) -> Result<Box<dyn Any + Send>> {
        Ok(mapping.construct())
    }
}

/// Wraps domain objects into tracked entities.
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    mapping: Arc<Mapping>,
}

impl EntityBuilder {
    pub fn new(mapping: Arc<Mapping>) -> Self {
        Self { mapping }
    }

    /// Wrap a boxed payload, looking its mapping up by runtime type.
    pub fn create(&self, payload: Box<dyn Any + Send>) -> Result<Entity> {
        let type_id = Any::type_id(&*payload);
        let mapping = self.mapping.get_by_type(type_id).ok_or_else(|| {
            Error::Argument(
                "Attached object is not an instance of a type defined in the mapping.".to_string(),
            )
        })?;
        Ok(Entity::new(Arc::clone(mapping), payload))
    }

    pub fn wrap<T: Send + 'static>(&self, value: T) -> Result<Entity> {
        self.create(Box::new(value))
    }

    /// Wrap a payload produced for a known mapping.
    pub fn create_for(
        &self,
        mapping: &Arc<EntityMapping>,
        payload: Box<dyn Any + Send>,
    ) -> Result<Entity> {
        if Any::type_id(&*payload) != mapping.payload_type_id() {
            return Err(Error::Type(TypeError {
                expected: mapping.type_name(),
                actual: "object of another type from the factory".to_string(),
                column: None,
            }));
        }
        Ok(Entity::new(Arc::clone(mapping), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Plan};
    use entmap_core::EntityRow;

    #[test]
    fn test_create_finds_mapping_by_type() {
        let builder = EntityBuilder::new(fixtures::shared_mapping());
        let entity = builder.wrap(Plan::new("basic", 1.0)).unwrap();
        assert_eq!(entity.name(), "plan");
        assert!(entity.is_new());
    }

    #[test]
    fn test_create_rejects_unmapped_type() {
        let builder = EntityBuilder::new(fixtures::shared_mapping());
        let err = builder.wrap(String::from("not an entity")).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn test_create_for_checks_payload_type() {
        let mapping = fixtures::shared_mapping();
        let builder = EntityBuilder::new(Arc::clone(&mapping));
        let plan = mapping.get("plan").unwrap();
        assert!(builder.create_for(plan, Box::new(Plan::default())).is_ok());
        assert!(matches!(
            builder.create_for(plan, Box::new(42_i32)),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_create_for_wraps_a_payload_resolved_for_a_row() {
        let mapping = fixtures::shared_mapping();
        let builder = EntityBuilder::new(Arc::clone(&mapping));
        let plan = mapping.get("plan").unwrap();
        let row = fixtures::row(&[
            ("plan__id", Value::BigInt(4)),
            ("plan__name", Value::from("pro")),
            ("plan__price", Value::Double(30.0)),
        ]);
        let extracted = EntityRow::extract(&row, plan.fields(), "plan");

        let payload = DefaultObjectFactory
            .resolve(plan, &extracted.attributes)
            .unwrap();
        let entity = builder.create_for(plan, payload).unwrap();
        entity.load_attributes(&extracted.attributes).unwrap();

        assert_eq!(entity.id(), Some(4));
        assert_eq!(entity.read(|p: &Plan| p.name.clone()).unwrap(), "pro");
        assert!(!entity.is_dirty());
    }

    #[test]
    fn test_default_factory_uses_registered_constructor() {
        let mapping = fixtures::mapping();
        let plan = mapping.get("plan").unwrap();
        let payload = DefaultObjectFactory.resolve(plan, &[]).unwrap();
        assert!(payload.is::<Plan>());
    }
}

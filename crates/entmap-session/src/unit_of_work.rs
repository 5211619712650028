//! The set of entities tracked by one session.
//!
//! Attaching may happen from several threads at once (for example from
//! parallel preload callbacks), so the set lives behind a mutex. Attaching
//! the same handle twice keeps a single entry.

use crate::entity::Entity;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct UnitOfWork {
    tracked: Mutex<Vec<Entity>>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Entity>> {
        self.tracked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start tracking an entity. Returns `false` if it was already tracked.
    pub fn attach(&self, entity: &Entity) -> bool {
        let mut tracked = self.guard();
        if tracked.iter().any(|e| e.same_as(entity)) {
            return false;
        }
        tracked.push(entity.clone());
        tracing::trace!(entity = %entity.name(), id = ?entity.id(), "Entity attached");
        true
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.guard().iter().any(|e| e.same_as(entity))
    }

    /// Snapshot of the tracked entities in attach order.
    pub fn tracked(&self) -> Vec<Entity> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Stop tracking everything.
    pub fn clear(&self) {
        let mut tracked = self.guard();
        tracing::debug!(count = tracked.len(), "Clearing tracked entities");
        tracked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Group, Plan};

    #[test]
    fn test_attach_is_idempotent_per_handle() {
        let uow = UnitOfWork::new();
        let plan = fixtures::entity(Plan::new("basic", 1.0));
        assert!(uow.attach(&plan));
        assert!(!uow.attach(&plan.clone()));
        assert_eq!(uow.len(), 1);
        assert!(uow.contains(&plan));
    }

    #[test]
    fn test_clear() {
        let uow = UnitOfWork::new();
        uow.attach(&fixtures::entity(Plan::new("basic", 1.0)));
        uow.attach(&fixtures::entity(Group::new("admins")));
        assert_eq!(uow.tracked().len(), 2);
        uow.clear();
        assert!(uow.is_empty());
    }

    #[test]
    fn test_concurrent_attach() {
        let uow = UnitOfWork::new();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let uow = &uow;
                scope.spawn(move || {
                    for j in 0..25 {
                        uow.attach(&fixtures::entity(Plan::new(&format!("{i}-{j}"), 1.0)));
                    }
                });
            }
        });
        assert_eq!(uow.len(), 200);
    }
}

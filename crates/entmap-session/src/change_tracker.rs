//! Change tracking and dirty detection for tracked entities.
//!
//! Every check compares the current in-memory state of an entity against the
//! baseline recorded when it was materialized or last flushed:
//!
//! - attributes compare by value
//! - references compare by identity of the target handle
//! - collections compare by member-id set, pending members included

use crate::attribute::{Attribute, AttributeValue, MemberIds};
use crate::entity::{Entity, Link};

impl Entity {
    /// New entities are always dirty. Otherwise any attribute, reference or
    /// collection differing from its baseline makes the entity dirty.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn is_dirty(&self) -> bool {
        let dirty = self.is_new()
            || !self.dirty_attributes().is_empty()
            || !self.dirty_references().is_empty()
            || !self.dirty_collections().is_empty();
        tracing::trace!(entity = %self.name(), id = ?self.id(), dirty, "Dirty check result");
        dirty
    }

    /// Baselines of the attributes whose current value differs.
    pub fn dirty_attributes(&self) -> Vec<Attribute> {
        let state = self.state();
        state
            .attributes
            .iter()
            .filter(|attribute| attribute.changed_scalar(&state.current_value(attribute.name())))
            .cloned()
            .collect()
    }

    /// Indexes of references whose target differs from the baseline.
    ///
    /// A reference never loaded nor flushed has an empty baseline.
    pub(crate) fn dirty_references(&self) -> Vec<usize> {
        self.state()
            .references
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.changed())
            .map(|(i, _)| i)
            .collect()
    }

    /// Indexes of collections whose members differ from the baseline.
    pub(crate) fn dirty_collections(&self) -> Vec<usize> {
        let slots = self.state().collections.clone();
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                let current = MemberIds::from_ids(slot.current.iter().map(Link::id));
                match &slot.baseline {
                    Some(baseline) => baseline.changed(&AttributeValue::Members(current)),
                    None => !current.is_empty(),
                }
            })
            .map(|(i, _)| i)
            .collect()
    }
}

use crate::identifier;
use crate::model::EntityType;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscribedEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
}

/// Entities one connection is subscribed to, grouped by base identifier.
#[derive(Debug, Default)]
pub struct SubscribedEntitiesHolder {
    entries: DashMap<String, HashSet<SubscribedEntity>>,
}

impl SubscribedEntitiesHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing key matching `base` case-insensitively, or `base` itself.
    fn key_for(&self, base: &str) -> String {
        self.entries
            .iter()
            .find(|e| e.key().eq_ignore_ascii_case(base))
            .map(|e| e.key().clone())
            .unwrap_or_else(|| base.to_string())
    }

    pub fn add(&self, entity_id: &str) {
        let base = self.key_for(&identifier::decode(entity_id));
        let entity = SubscribedEntity {
            entity_id: entity_id.to_string(),
            entity_type: identifier::type_of(entity_id),
        };
        self.entries.entry(base).or_default().insert(entity);
    }

    pub fn remove(&self, entity_id: &str) {
        let base = self.key_for(&identifier::decode(entity_id));
        if let Some(mut set) = self.entries.get_mut(&base) {
            set.retain(|e| !e.entity_id.eq_ignore_ascii_case(entity_id));
        }
        self.entries.remove_if(&base, |_, set| set.is_empty());
    }

    /// Copy of the current mapping; callers may iterate it while the live
    /// registry keeps changing.
    pub fn snapshot(&self) -> HashMap<String, HashSet<SubscribedEntity>> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn base_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains_base(&self, base_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.key().eq_ignore_ascii_case(base_id))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CountStore, CountStoreError};
use crate::event::EntityType;

type EntityKey = (EntityType, String);

#[derive(Default)]
struct State {
    counts: HashMap<EntityKey, i64>,
    failing: HashSet<EntityKey>,
    unavailable: bool,
    create_on_write: bool,
}

/// An in-process `CountStore`.
///
/// By default entities are created on first write. `with_known_entities` switches
/// to only accepting entities that were registered, reporting the rest as missing.
#[derive(Clone)]
pub struct MemoryCountStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryCountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCountStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                create_on_write: true,
                ..State::default()
            })),
        }
    }

    pub fn with_known_entities<'a>(
        entities: impl IntoIterator<Item = (EntityType, &'a str)>,
    ) -> Self {
        let counts = entities
            .into_iter()
            .map(|(entity_type, id)| ((entity_type, id.to_owned()), 0))
            .collect();

        Self {
            state: Arc::new(Mutex::new(State {
                counts,
                create_on_write: false,
                ..State::default()
            })),
        }
    }

    pub fn count(&self, entity_type: EntityType, entity_id: &str) -> i64 {
        self.lock()
            .counts
            .get(&(entity_type, entity_id.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    /// Make writes for one entity fail until cleared.
    pub fn set_failing(&self, entity_type: EntityType, entity_id: &str, failing: bool) {
        let key = (entity_type, entity_id.to_owned());
        let mut state = self.lock();
        if failing {
            state.failing.insert(key);
        } else {
            state.failing.remove(&key);
        }
    }

    /// Make every write fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CountStore for MemoryCountStore {
    async fn add_views(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        delta: i64,
    ) -> Result<(), CountStoreError> {
        let key = (entity_type, entity_id.to_owned());
        let mut state = self.lock();

        if state.unavailable || state.failing.contains(&key) {
            return Err(CountStoreError::Unavailable(format!(
                "writes to {entity_type} {entity_id} are failing"
            )));
        }

        if !state.create_on_write && !state.counts.contains_key(&key) {
            return Err(CountStoreError::EntityNotFound {
                entity_type,
                entity_id: entity_id.to_owned(),
            });
        }

        *state.counts.entry(key).or_insert(0) += delta;
        Ok(())
    }
}

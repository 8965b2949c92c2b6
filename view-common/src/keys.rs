//! # Keys
//!
//! Naming of every key the pipeline touches in the dedup store. Ingestion and
//! sync must agree on these, so they are only ever built here.
use crate::event::EntityType;

pub const KEY_PREFIX: &str = "views";

/// Set of fingerprints that already viewed an entity within the dedup window.
pub fn recent_viewers_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{KEY_PREFIX}:recent:{}:{}", entity_type.as_str(), entity_id)
}

/// Counter of views not yet flushed to the durable store.
pub fn pending_counter_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{KEY_PREFIX}:pending:{}:{}", entity_type.as_str(), entity_id)
}

/// Set of entity ids of one type whose pending counter may be nonzero.
pub fn dirty_set_key(entity_type: EntityType) -> String {
    format!("{KEY_PREFIX}:dirty:{}", entity_type.plural())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(
            recent_viewers_key(EntityType::Chapter, "ch-1"),
            "views:recent:chapter:ch-1"
        );
        assert_eq!(
            pending_counter_key(EntityType::Series, "s-9"),
            "views:pending:series:s-9"
        );
        assert_eq!(dirty_set_key(EntityType::Series), "views:dirty:series");
        assert_eq!(dirty_set_key(EntityType::Chapter), "views:dirty:chapters");
    }

    #[test]
    fn test_entity_types_do_not_share_keys() {
        assert_ne!(
            pending_counter_key(EntityType::Series, "1"),
            pending_counter_key(EntityType::Chapter, "1")
        );
    }
}

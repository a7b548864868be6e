//! Process definition cache
//!
//! Bounded LRU over parsed definitions, keyed by definition id. Ids are
//! never reused across redeploys, so entries can never go stale; eviction is
//! purely a memory bound. Population on miss happens in the command layer
//! (`EngineServices::resolve_definition`) with a race-safe double lookup.

use crate::graph::ProcessDefinition;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct CacheEntry {
    definition: Arc<ProcessDefinition>,
    #[allow(dead_code)]
    created_at: Instant,
    last_used: Instant,
}

pub struct DefinitionCache {
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DefinitionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        let entry = entries.get_mut(id)?;
        entry.last_used = Instant::now();
        Some(entry.definition.clone())
    }

    pub fn insert(&self, definition: Arc<ProcessDefinition>) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        let now = Instant::now();
        entries.insert(
            definition.id.clone(),
            CacheEntry {
                definition,
                created_at: now,
                last_used: now,
            },
        );
        while entries.len() > self.capacity {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DefinitionModel, ProcessBuilder};

    fn definition(id: &str) -> Arc<ProcessDefinition> {
        let model: DefinitionModel = ProcessBuilder::new("p")
            .start("start")
            .end("done")
            .flow("start", "done")
            .build()
            .unwrap();
        Arc::new(ProcessDefinition {
            id: id.to_string(),
            key: "p".to_string(),
            version: 1,
            deployment_id: "dep".to_string(),
            model,
        })
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = DefinitionCache::new(2);
        cache.insert(definition("a"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(definition("b"));
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(definition("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }
}

//! Identity → live retry-capable handler lookup table.
//!
//! Call sites that only hold an identity (or the original, unwrapped handler)
//! resolve the wrapped instance here. The map itself is last-writer-wins;
//! rejecting duplicate identities is the engine's job at registration time.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

type Entry = Arc<dyn Any + Send + Sync>;

/// Shared dispatch table. Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct DispatchRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl DispatchRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the live instance for `identity`.
    /// Returns `true` if an earlier entry was overwritten.
    pub fn register<W: Any + Send + Sync>(&self, identity: &str, handler: Arc<W>) -> bool {
        // A poisoned lock still guards a consistent map: inserts are single calls.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(identity.to_string(), handler).is_some()
    }

    /// Live instance for `identity`, if one of type `W` is registered.
    /// Absence (or a type mismatch) is a normal outcome, never an error.
    pub fn lookup<W: Any + Send + Sync>(&self, identity: &str) -> Option<Arc<W>> {
        let entry = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(identity).cloned()
        }?;
        entry.downcast::<W>().ok()
    }

    /// Whether any entry exists for `identity`.
    pub fn contains(&self, identity: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(identity)
    }

    /// Registered identities, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_type() {
        let reg = DispatchRegistry::new();
        assert!(!reg.register("a", Arc::new(41u32)));
        assert_eq!(reg.lookup::<u32>("a").as_deref(), Some(&41));
        assert!(reg.lookup::<String>("a").is_none());
        assert!(reg.lookup::<u32>("missing").is_none());
    }

    #[test]
    fn last_writer_wins() {
        let reg = DispatchRegistry::new();
        reg.register("a", Arc::new(1u32));
        assert!(reg.register("a", Arc::new(2u32)));
        assert_eq!(reg.lookup::<u32>("a").as_deref(), Some(&2));
        assert_eq!(reg.identities(), vec!["a".to_string()]);
    }

    #[test]
    fn concurrent_readers_see_entries() {
        let reg = DispatchRegistry::new();
        reg.register("a", Arc::new(7u64));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    reg.register(&format!("h{i}"), Arc::new(i as u64));
                    reg.lookup::<u64>("a").map(|v| *v)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(7));
        }
        assert_eq!(reg.identities().len(), 9);
    }
}

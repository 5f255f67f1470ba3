//! In-memory parameter cache.
//!
//! Keyed by stored index. Readers get consistent snapshots; a `set_many`
//! batch becomes visible in one step, never partially.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::model::Parameter;

#[derive(Default)]
struct CacheState {
    parameters: BTreeMap<u32, Parameter>,
    last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ParameterCache {
    state: RwLock<CacheState>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u32) -> Option<Parameter> {
        self.state.read().parameters.get(&index).cloned()
    }

    /// First parameter with this name. Names are only unique within one
    /// address space, so a linear scan over the index order is the lookup.
    pub fn get_by_name(&self, name: &str) -> Option<Parameter> {
        self.state
            .read()
            .parameters
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Snapshot copy of the whole cache.
    pub fn get_all(&self) -> BTreeMap<u32, Parameter> {
        self.state.read().parameters.clone()
    }

    pub fn set(&self, param: Parameter) {
        let mut state = self.state.write();
        state.parameters.insert(param.index, param);
        state.last_update = Some(Utc::now());
    }

    /// Store a batch atomically: observers see all of it or none of it.
    pub fn set_many(&self, params: Vec<Parameter>) {
        if params.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for param in params {
            state.parameters.insert(param.index, param);
        }
        state.last_update = Some(Utc::now());
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.parameters.clear();
        state.last_update = None;
    }

    pub fn count(&self) -> usize {
        self.state.read().parameters.len()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use std::sync::Arc;

    fn param(index: u32, name: &str, value: i64) -> Parameter {
        Parameter {
            index,
            name: name.into(),
            value: Value::Int(value),
            type_code: 2,
            unit: 1,
            writable: true,
            min_value: None,
            max_value: None,
        }
    }

    #[test]
    fn same_name_different_space_coexist() {
        let cache = ParameterCache::new();
        cache.set(param(7, "Temperature", 40));
        cache.set(param(10007, "Temperature", 21));

        assert_eq!(cache.count(), 2);
        // First match walks in index order: controller space wins.
        assert_eq!(cache.get_by_name("Temperature").unwrap().index, 7);
        assert_eq!(cache.get(10007).unwrap().value, Value::Int(21));
    }

    #[test]
    fn set_replaces_by_index() {
        let cache = ParameterCache::new();
        cache.set(param(3, "A", 1));
        cache.set(param(3, "A", 2));
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.get(3).unwrap().value, Value::Int(2));
    }

    #[test]
    fn mutations_stamp_last_update() {
        let cache = ParameterCache::new();
        assert!(cache.last_update().is_none());

        cache.set(param(1, "A", 1));
        let first = cache.last_update().unwrap();

        cache.set_many(vec![param(2, "B", 2)]);
        assert!(cache.last_update().unwrap() >= first);

        cache.clear();
        assert!(cache.last_update().is_none());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn empty_batch_does_not_touch_timestamp() {
        let cache = ParameterCache::new();
        cache.set_many(Vec::new());
        assert!(cache.last_update().is_none());
    }

    #[test]
    fn batches_are_observed_atomically() {
        let cache = Arc::new(ParameterCache::new());
        cache.set_many((0..50).map(|i| param(i, "pre", 0)).collect());

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for round in 1..=20i64 {
                    cache.set_many((0..50).map(|i| param(i, "p", round)).collect());
                }
            })
        };

        // Every snapshot must hold one uniform round, never a mix.
        for _ in 0..200 {
            let snapshot = cache.get_all();
            let mut rounds = snapshot.values().map(|p| match &p.value {
                Value::Int(v) => *v,
                _ => unreachable!(),
            });
            let first = rounds.next().unwrap();
            assert!(rounds.all(|r| r == first), "observed a torn batch");
        }

        writer.join().unwrap();
    }
}

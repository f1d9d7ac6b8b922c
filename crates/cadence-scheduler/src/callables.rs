use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use cadence_marshal::{StateMap, StateValue};

/// The body of a job: positional and keyword arguments in, a value or a fault out.
pub type Callable = dyn Fn(&[StateValue], &StateMap) -> anyhow::Result<StateValue> + Send + Sync;

/// Name → function table. Jobs refer to their body by name so they stay
/// marshalable; the scheduler resolves the name when a run is submitted.
#[derive(Clone, Default)]
pub struct CallableRegistry {
    funcs: Arc<RwLock<HashMap<String, Arc<Callable>>>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the function behind `name`.
    pub fn register<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(&[StateValue], &StateMap) -> anyhow::Result<StateValue> + Send + Sync + 'static,
    {
        let mut funcs = self.funcs.write().expect("callable registry poisoned");
        funcs.insert(name.into(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Callable>> {
        let funcs = self.funcs.read().expect("callable registry poisoned");
        funcs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let funcs = self.funcs.read().expect("callable registry poisoned");
        funcs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let funcs = self.funcs.read().expect("callable registry poisoned");
        let mut names: Vec<String> = funcs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_callables_are_shared_between_clones() {
        let registry = CallableRegistry::new();
        let view = registry.clone();
        registry.register("sum", |args, _| {
            Ok(StateValue::Int(args.iter().filter_map(StateValue::as_i64).sum()))
        });

        assert!(view.contains("sum"));
        let sum = view.get("sum").unwrap();
        let out = sum(&[StateValue::Int(2), StateValue::Int(5)], &StateMap::new()).unwrap();
        assert_eq!(out, StateValue::Int(7));
        assert!(view.get("missing").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let registry = CallableRegistry::new();
        registry.register("b", |_, _| Ok(StateValue::Null));
        registry.register("a", |_, _| Ok(StateValue::Null));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}

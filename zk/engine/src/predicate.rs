use ledger::{ActionType, ActionTypeRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Business rules (geofence containment and the like) evaluated while the
/// witness is built.
pub trait PredicateProvider: Send + Sync {
    fn check(&self, action_type: &ActionType, payload: &[u8]) -> bool;

    fn predicate_id(&self, _action_type: &ActionType) -> Option<String> {
        None
    }
}

pub struct AcceptAll;

impl PredicateProvider for AcceptAll {
    fn check(&self, _action_type: &ActionType, _payload: &[u8]) -> bool {
        true
    }
}

pub type PredicateFn = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Resolves an action type to its registry `predicate_id` and runs the
/// matching function. Action types without a predicate pass; a predicate id
/// with no registered function fails closed.
pub struct PredicateSet {
    registry: Arc<ActionTypeRegistry>,
    predicates: HashMap<String, PredicateFn>,
}

impl PredicateSet {
    pub fn new(registry: Arc<ActionTypeRegistry>) -> Self {
        Self {
            registry,
            predicates: HashMap::new(),
        }
    }

    /// `non_empty` and `json_object`.
    pub fn with_builtins(registry: Arc<ActionTypeRegistry>) -> Self {
        let mut set = Self::new(registry);
        set.register("non_empty", Arc::new(|payload: &[u8]| !payload.is_empty()));
        set.register(
            "json_object",
            Arc::new(|payload: &[u8]| {
                serde_json::from_slice::<serde_json::Value>(payload)
                    .map(|v| v.is_object())
                    .unwrap_or(false)
            }),
        );
        set
    }

    pub fn register(&mut self, id: &str, predicate: PredicateFn) {
        self.predicates.insert(id.to_string(), predicate);
    }
}

impl PredicateProvider for PredicateSet {
    fn check(&self, action_type: &ActionType, payload: &[u8]) -> bool {
        let Some(id) = self.registry.predicate_id(action_type) else {
            return true;
        };
        match self.predicates.get(id) {
            Some(predicate) => predicate(payload),
            None => {
                warn!(%action_type, predicate = id, "predicate not registered");
                false
            }
        }
    }

    fn predicate_id(&self, action_type: &ActionType) -> Option<String> {
        self.registry.predicate_id(action_type).map(str::to_string)
    }
}

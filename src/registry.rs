//! Action registry of host-registered handlers invoked by inbound commands
//!
//! The host owns the registry and injects it into the dispatcher.
//! Names are unique: registering an existing name is rejected.

use crate::error::{Result, TransportError};
use crate::types::ActionDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Callback run when the remote side triggers an action
///
/// Receives the full inbound payload; the return value is relayed back
/// on `axm:reply`. Handlers run on the blocking pool, so they may block.
/// A handler that outlives the action timeout is abandoned, not stopped:
/// it keeps its pool thread and its in-flight slot until it returns.
pub type ActionHandler = Arc<dyn Fn(&serde_json::Value) -> serde_json::Value + Send + Sync>;

/// A named, registered action
#[derive(Clone)]
pub struct Action {
    pub descriptor: ActionDescriptor,
    pub handler: ActionHandler,
}

impl Action {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        Self {
            descriptor: ActionDescriptor::custom(name),
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.action_name
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Mapping from action name to handler
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action; fails if the name is empty or already taken
    pub fn register(&self, action: Action) -> Result<()> {
        if action.name().is_empty() {
            return Err(TransportError::Config(
                "Action name cannot be empty".to_string(),
            ));
        }

        let mut actions = self.actions.write().map_err(|e| {
            TransportError::Config(format!("Action registry lock poisoned: {}", e))
        })?;
        if actions.contains_key(action.name()) {
            return Err(TransportError::DuplicateAction(action.name().to_string()));
        }

        tracing::debug!(action = action.name(), "Action registered");
        actions.insert(action.name().to_string(), action);
        Ok(())
    }

    /// Shorthand for `register(Action::new(name, handler))`
    pub fn add<F>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.register(Action::new(name, handler))
    }

    /// Look up the handler for `name`
    pub fn handler(&self, name: &str) -> Result<ActionHandler> {
        let actions = self.actions.read().map_err(|e| {
            TransportError::Config(format!("Action registry lock poisoned: {}", e))
        })?;
        actions
            .get(name)
            .map(|a| Arc::clone(&a.handler))
            .ok_or_else(|| TransportError::ActionNotFound(name.to_string()))
    }

    /// Run the handler for `name` on the calling thread
    pub fn call(&self, name: &str, params: &serde_json::Value) -> Result<serde_json::Value> {
        let handler = self.handler(name)?;
        Ok(handler(params))
    }

    /// Descriptors of every registered action, sorted by name
    pub fn descriptors(&self) -> Vec<ActionDescriptor> {
        let Ok(actions) = self.actions.read() else {
            return Vec::new();
        };
        let mut list: Vec<ActionDescriptor> =
            actions.values().map(|a| a.descriptor.clone()).collect();
        list.sort_by(|a, b| a.action_name.cmp(&b.action_name));
        list
    }

    pub fn len(&self) -> usize {
        self.actions.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_call() {
        let registry = ActionRegistry::new();
        registry
            .add("echo", |params| json!({"got": params["value"]}))
            .unwrap();

        let ret = registry.call("echo", &json!({"value": 7})).unwrap();
        assert_eq!(ret, json!({"got": 7}));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = ActionRegistry::new();
        registry.add("Test", |_| json!("first")).unwrap();
        let err = registry.add("Test", |_| json!("second")).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateAction(ref n) if n == "Test"));

        // First registration is untouched
        assert_eq!(registry.call("Test", &json!({})).unwrap(), json!("first"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = ActionRegistry::new();
        assert!(registry.add("", |_| json!(null)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::new();
        let err = registry.call("missing", &json!({})).unwrap_err();
        assert!(matches!(err, TransportError::ActionNotFound(ref n) if n == "missing"));
    }

    #[test]
    fn test_descriptors_sorted() {
        let registry = ActionRegistry::new();
        registry.add("Get env", |_| json!("")).unwrap();
        registry.add("Clear cache", |_| json!("")).unwrap();

        let list = registry.descriptors();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].action_name, "Clear cache");
        assert_eq!(list[1].action_type, "custom");
    }
}

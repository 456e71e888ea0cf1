// Action capabilities: the pluggable integrations a node type maps to

use crate::types::CredentialRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub mod builtin;

pub use builtin::{DelayAction, EchoAction};

/// Error returned by an action invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    /// Whether retrying the same invocation may succeed
    pub transient: bool,
}

impl ActionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// A credential an action needs before it can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequirement {
    pub service: String,
    pub required: bool,
}

impl CredentialRequirement {
    pub fn required(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            required: true,
        }
    }

    pub fn optional(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            required: false,
        }
    }
}

/// Credentials resolved for one invocation, keyed by service
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    by_service: BTreeMap<String, CredentialRef>,
}

impl Credentials {
    pub fn insert(&mut self, credential: CredentialRef) {
        self.by_service.insert(credential.service.clone(), credential);
    }

    pub fn get(&self, service: &str) -> Option<&CredentialRef> {
        self.by_service.get(service)
    }

    /// The raw secret for a service
    pub fn value(&self, service: &str) -> Option<&str> {
        self.by_service.get(service).map(|c| c.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_service.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_service.is_empty()
    }
}

/// Read-only credential lookup for a single run
pub trait CredentialResolver: Send + Sync {
    fn lookup(&self, service: &str) -> Option<CredentialRef>;
}

/// Frozen set of credentials supplied when a run starts
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    credentials: HashMap<String, CredentialRef>,
}

impl CredentialSet {
    pub fn new(credentials: impl IntoIterator<Item = CredentialRef>) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.service.clone(), c))
                .collect(),
        }
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.credentials.keys().cloned().collect();
        services.sort();
        services
    }
}

impl CredentialResolver for CredentialSet {
    fn lookup(&self, service: &str) -> Option<CredentialRef> {
        self.credentials.get(service).cloned()
    }
}

/// A unit of integration work a node type maps to
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    /// Node type this action is registered under
    fn name(&self) -> &str;

    /// Credentials to resolve before invoking with `config`
    fn credentials(&self, _config: &serde_json::Value) -> Vec<CredentialRequirement> {
        Vec::new()
    }

    async fn invoke(
        &self,
        config: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<serde_json::Value, ActionError>;
}

/// Action registry mapping node types to capabilities
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in actions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoAction));
        registry.register(Arc::new(DelayAction));
        registry
    }

    /// Register an action under its name, replacing any previous one
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn resolve(&self, node_type: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.actions.contains_key(node_type)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

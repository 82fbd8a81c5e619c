use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::AgentProvider;
use agentflow_core::workflow::AgentRole;

/// Registry of capability providers, keyed by capability tag.
pub struct CapabilityRegistry {
    providers: HashMap<String, Vec<Arc<dyn AgentProvider>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, provider: impl AgentProvider) {
        self.register_arc(Arc::new(provider));
    }

    pub fn register_arc(&mut self, provider: Arc<dyn AgentProvider>) {
        let list = self
            .providers
            .entry(provider.capability().to_string())
            .or_default();
        list.push(provider);
        list.sort_by_key(|p| p.priority());
    }

    /// Unregister a provider by capability and name.
    pub fn unregister(&mut self, capability: &str, name: &str) -> bool {
        let Some(list) = self.providers.get_mut(capability) else {
            return false;
        };
        let before = list.len();
        list.retain(|p| p.name() != name);
        before != list.len()
    }

    /// List all served capability tags.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut caps: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        caps.sort();
        caps
    }

    /// Pick the provider for a role.
    ///
    /// A persona's preferred `model` is honoured when a provider of that name
    /// is available. Otherwise providers are tried in priority order and the
    /// first available one wins.
    pub fn resolve(&self, role: &AgentRole) -> Result<Arc<dyn AgentProvider>> {
        let capability = role.capability();
        let list = self
            .providers
            .get(capability)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| FlowError::CapabilityNotFound(capability.to_string()))?;

        let preferred = match role {
            AgentRole::Agent(persona) => persona.model.as_deref(),
            _ => None,
        };

        if let Some(name) = preferred {
            match list.iter().find(|p| p.name() == name) {
                Some(p) if p.is_available() => return Ok(p.clone()),
                Some(_) => warn!(provider = name, capability, "Preferred provider unavailable, falling back"),
                None => warn!(provider = name, capability, "Preferred provider not registered, falling back"),
            }
        }

        for (i, provider) in list.iter().enumerate() {
            if provider.is_available() {
                if i > 0 && preferred.is_none() {
                    warn!(
                        provider = provider.name(),
                        capability,
                        "Falling back to lower-priority provider"
                    );
                }
                return Ok(provider.clone());
            }
        }

        Err(FlowError::AgentInvocation {
            capability: capability.to_string(),
            message: "no provider available".to_string(),
            retryable: true,
        })
    }

    /// Create a registry with the built-in providers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::output::OutputCollector);
        registry.register(crate::builtin::command::CommandProvider::for_command_nodes());
        registry
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Plugin-based provider registry
//!
//! DNS providers register a factory under their type name at startup, so the
//! binary builds a provider from configuration without an if-else per vendor.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tunnel_core::{ApiBudget, ProviderRegistry};
//!
//! let registry = ProviderRegistry::new();
//! tunnel_provider_cloudflare::register(&registry);
//!
//! let budget = Arc::new(ApiBudget::from_config(&config.dns));
//! let provider = registry.create_provider(&provider_config, budget)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::budget::ApiBudget;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::traits::{DnsProvider, DnsProviderFactory};

/// Registry of DNS provider factories keyed by provider type name
///
/// Uses interior mutability so registration and lookup both take `&self`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Box<dyn DnsProviderFactory>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a DNS provider factory, replacing any factory of the same name
    pub fn register_provider(&self, name: impl Into<String>, factory: Box<dyn DnsProviderFactory>) {
        let name = name.into();
        tracing::debug!(provider = %name, "Registering DNS provider");
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, factory);
    }

    /// Create a DNS provider from configuration
    ///
    /// Every provider created with the same `budget` shares its request allowance.
    pub fn create_provider(
        &self,
        config: &ProviderConfig,
        budget: Arc<ApiBudget>,
    ) -> Result<Arc<dyn DnsProvider>> {
        config.validate()?;

        let provider_type = config.type_name();
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let factory = providers
            .get(provider_type)
            .ok_or_else(|| Error::config(format!("Unknown provider type: {}", provider_type)))?;

        factory.create(config, budget).map(Arc::from)
    }

    /// List all registered provider types
    pub fn list_providers(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a provider type is registered
    pub fn has_provider(&self, name: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

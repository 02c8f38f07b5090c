//! Adapter registry: one cached `ProviderAdapter` per (provider, model).
//!
//! Backends come from a `BackendFactory`, so the same registry serves real
//! HTTP providers in production and scripted ones in simulation.

use crate::config::{ProviderCredentials, RetryPolicy};
use crate::error::Result;
use crate::http_backend::HttpBackend;
use crate::provider::{ProviderAdapter, ProviderBackend, ProviderKind};
use chorus_env::ChorusContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Builds the raw backend for a provider.
pub trait BackendFactory: Send + Sync + 'static {
    fn backend(&self, provider: ProviderKind, model: &str) -> Result<Arc<dyn ProviderBackend>>;
}

/// Factory for the real HTTP APIs.
pub struct HttpBackendFactory {
    credentials: ProviderCredentials,
    timeout: Duration,
}

impl HttpBackendFactory {
    pub fn new(credentials: ProviderCredentials, timeout: Duration) -> Self {
        Self { credentials, timeout }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn backend(&self, provider: ProviderKind, _model: &str) -> Result<Arc<dyn ProviderBackend>> {
        let key = self.credentials.key_for(provider).map(str::to_string);
        Ok(Arc::new(HttpBackend::new(provider, key, self.timeout)?))
    }
}

pub struct AdapterRegistry {
    factory: Arc<dyn BackendFactory>,
    retry: RetryPolicy,
    context: Arc<dyn ChorusContext>,
    adapters: Mutex<HashMap<(ProviderKind, String), Arc<ProviderAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(factory: Arc<dyn BackendFactory>, retry: RetryPolicy, context: Arc<dyn ChorusContext>) -> Self {
        Self {
            factory,
            retry,
            context,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached adapter for (provider, model), creating it on
    /// first use. `None` selects the provider's default model.
    pub fn get(&self, provider: ProviderKind, model: Option<&str>) -> Result<Arc<ProviderAdapter>> {
        let model = model.unwrap_or_else(|| provider.default_model()).to_string();
        let mut adapters = self.adapters.lock().unwrap();
        if let Some(adapter) = adapters.get(&(provider, model.clone())) {
            return Ok(adapter.clone());
        }

        let backend = self.factory.backend(provider, &model)?;
        let adapter = Arc::new(ProviderAdapter::new(
            provider,
            Some(model.clone()),
            backend,
            self.retry.clone(),
            self.context.clone(),
        ));
        debug!(provider = %provider, model = %model, "Created provider adapter");
        adapters.insert((provider, model), adapter.clone());
        Ok(adapter)
    }

    /// Adapters for each provider, using `models` overrides where present.
    pub fn adapters_for(
        &self,
        providers: &[ProviderKind],
        models: &HashMap<ProviderKind, String>,
    ) -> Result<Vec<Arc<ProviderAdapter>>> {
        providers
            .iter()
            .map(|p| self.get(*p, models.get(p).map(String::as_str)))
            .collect()
    }

    /// Providers that have credentials configured.
    pub fn available(credentials: &ProviderCredentials) -> Vec<ProviderKind> {
        ProviderKind::all()
            .into_iter()
            .filter(|p| credentials.key_for(*p).is_some())
            .collect()
    }

    /// Every cached adapter.
    pub fn cached(&self) -> Vec<Arc<ProviderAdapter>> {
        self.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Drops every cached adapter.
    pub fn clear(&self) {
        self.adapters.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

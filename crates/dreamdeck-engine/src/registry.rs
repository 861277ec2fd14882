use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use dreamdeck_contracts::{BackendCapabilities, BackendId, ErrorKey, GenerationError, Settings};
use tracing::{debug, info};

use crate::backends::{
    Automatic1111Client, BackendClient, ClientContext, StabilityClient, StableHordeClient,
};
use crate::transport::HttpTransport;

/// Last model list fetched from one backend. Concurrent refreshes race and
/// the last write wins.
#[derive(Debug, Default)]
pub struct ModelCache {
    models: RwLock<Option<Vec<String>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Vec<String>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn refresh(&self, client: &dyn BackendClient) -> Result<Vec<String>, GenerationError> {
        let models = client.list_models()?;
        debug!(backend = %client.id(), count = models.len(), "refreshed model list");
        *self.models.write().unwrap_or_else(PoisonError::into_inner) = Some(models.clone());
        Ok(models)
    }

    pub fn get_or_refresh(
        &self,
        client: &dyn BackendClient,
    ) -> Result<Vec<String>, GenerationError> {
        match self.get() {
            Some(models) => Ok(models),
            None => self.refresh(client),
        }
    }
}

struct RegisteredBackend {
    client: Arc<dyn BackendClient>,
    models: ModelCache,
}

/// Every known backend client, plus which one the configuration selects.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendId, RegisteredBackend>,
    selected: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a client for every backend. No network traffic.
    pub fn from_settings(settings: &Settings, transport: Arc<dyn HttpTransport>) -> Self {
        let output_dir = settings.output_dir();
        let mut registry = Self {
            backends: BTreeMap::new(),
            selected: settings.selected_backend().map(str::to_string),
        };
        for backend in BackendId::ALL {
            let ctx = ClientContext {
                backend,
                settings: settings.backend_settings(backend),
                transport: Arc::clone(&transport),
                output_dir: output_dir.clone(),
                self_hosted: backend == BackendId::Automatic1111,
            };
            match backend {
                BackendId::Stability => registry.register(StabilityClient::new(ctx)),
                BackendId::Automatic1111 => registry.register(Automatic1111Client::new(ctx)),
                BackendId::StableHorde => registry.register(StableHordeClient::new(ctx)),
            }
        }
        info!(
            selected = registry.selected.as_deref().unwrap_or("<unset>"),
            output_dir = %output_dir.display(),
            "backend registry ready"
        );
        registry
    }

    /// Adds a client, replacing any existing client for the same backend.
    pub fn register<C: BackendClient + 'static>(&mut self, client: C) {
        self.backends.insert(
            client.id(),
            RegisteredBackend {
                client: Arc::new(client),
                models: ModelCache::new(),
            },
        );
    }

    pub fn get(&self, backend: BackendId) -> Option<Arc<dyn BackendClient>> {
        self.backends
            .get(&backend)
            .map(|entry| Arc::clone(&entry.client))
    }

    pub fn ids(&self) -> Vec<BackendId> {
        self.backends.keys().copied().collect()
    }

    pub fn capabilities(&self, backend: BackendId) -> Option<BackendCapabilities> {
        self.backends
            .get(&backend)
            .map(|entry| entry.client.capabilities())
    }

    /// The configured backend. Never falls back to a default.
    pub fn active(&self) -> Result<Arc<dyn BackendClient>, GenerationError> {
        let Some(raw) = self.selected.as_deref() else {
            return Err(GenerationError::new(
                "No backend is selected. Choose one of: stability, automatic1111, stablehorde.",
                ErrorKey::BackendConfig,
            ));
        };
        let backend = raw
            .parse::<BackendId>()
            .map_err(|message| GenerationError::new(message, ErrorKey::BackendConfig))?;
        self.get(backend).ok_or_else(|| {
            GenerationError::new(
                format!("The {} backend is not available.", backend.display_name()),
                ErrorKey::BackendConfig,
            )
        })
    }

    /// Cached model list, fetched on first use or when `refresh` is set.
    pub fn models(
        &self,
        backend: BackendId,
        refresh: bool,
    ) -> Result<Vec<String>, GenerationError> {
        let Some(entry) = self.backends.get(&backend) else {
            return Err(GenerationError::new(
                format!("The {} backend is not available.", backend.display_name()),
                ErrorKey::BackendConfig,
            ));
        };
        if refresh {
            entry.models.refresh(entry.client.as_ref())
        } else {
            entry.models.get_or_refresh(entry.client.as_ref())
        }
    }

    pub fn model_cache(&self, backend: BackendId) -> Option<&ModelCache> {
        self.backends.get(&backend).map(|entry| &entry.models)
    }
}

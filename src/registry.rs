use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::config::ResolvedConfig;
use crate::error::EnviroError;
use crate::providers::{gridded, raster, stations};
use crate::service::{Getter, Loader, ServiceDefinition, ServiceFamily};
use crate::upstream::HttpUpstream;

pub type LoaderFactory =
    Box<dyn Fn(&ServiceDefinition) -> Result<Arc<dyn Loader>, EnviroError> + Send + Sync>;
pub type GetterFactory =
    Box<dyn Fn(&ServiceDefinition) -> Result<Arc<dyn Getter>, EnviroError> + Send + Sync>;

struct Entry {
    definition: Arc<ServiceDefinition>,
    loader_factory: LoaderFactory,
    getter_factory: GetterFactory,
    loader: OnceLock<Arc<dyn Loader>>,
    getter: OnceLock<Arc<dyn Getter>>,
}

/// Services by label. Registration does no I/O; loaders and getters are
/// built on first use and then shared.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: ServiceDefinition,
        loader_factory: LoaderFactory,
        getter_factory: GetterFactory,
    ) -> Result<(), EnviroError> {
        if self.entries.contains_key(&definition.label) {
            return Err(EnviroError::DuplicateService(definition.label));
        }
        tracing::debug!(service = %definition.label, family = %definition.family(), "registered service");
        self.entries.insert(
            definition.label.clone(),
            Entry {
                definition: Arc::new(definition),
                loader_factory,
                getter_factory,
                loader: OnceLock::new(),
                getter: OnceLock::new(),
            },
        );
        Ok(())
    }

    /// Registry with the built-in family bindings for every configured service.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, EnviroError> {
        let mut registry = Self::new();
        for definition in &config.services {
            let (loader_factory, getter_factory) = family_factories(definition)?;
            registry.register(definition.clone(), loader_factory, getter_factory)?;
        }
        Ok(registry)
    }

    /// Definitions in label order.
    pub fn list_services(&self) -> Vec<Arc<ServiceDefinition>> {
        self.entries
            .values()
            .map(|entry| entry.definition.clone())
            .collect()
    }

    pub fn definition(&self, label: &str) -> Result<Arc<ServiceDefinition>, EnviroError> {
        Ok(self.entry(label)?.definition.clone())
    }

    pub fn resolve(&self, label: &str) -> Result<(Arc<dyn Loader>, Arc<dyn Getter>), EnviroError> {
        Ok((self.loader(label)?, self.getter(label)?))
    }

    pub fn loader(&self, label: &str) -> Result<Arc<dyn Loader>, EnviroError> {
        let entry = self.entry(label)?;
        if let Some(loader) = entry.loader.get() {
            return Ok(loader.clone());
        }
        let built = (entry.loader_factory)(&entry.definition)?;
        Ok(entry.loader.get_or_init(|| built).clone())
    }

    pub fn getter(&self, label: &str) -> Result<Arc<dyn Getter>, EnviroError> {
        let entry = self.entry(label)?;
        if let Some(getter) = entry.getter.get() {
            return Ok(getter.clone());
        }
        let built = (entry.getter_factory)(&entry.definition)?;
        Ok(entry.getter.get_or_init(|| built).clone())
    }

    fn entry(&self, label: &str) -> Result<&Entry, EnviroError> {
        self.entries
            .get(label)
            .ok_or_else(|| EnviroError::UnknownService(label.to_string()))
    }
}

fn family_factories(
    definition: &ServiceDefinition,
) -> Result<(LoaderFactory, GetterFactory), EnviroError> {
    Ok(match definition.family() {
        ServiceFamily::Gridded => {
            // Surface path pattern errors at startup.
            gridded::grid_store(definition)?;
            (
                loader_factory(gridded::GriddedLoader::<HttpUpstream>::new),
                getter_factory(gridded::getter),
            )
        }
        ServiceFamily::Stations => (
            loader_factory(stations::StationsLoader::<HttpUpstream>::new),
            getter_factory(stations::getter),
        ),
        ServiceFamily::Raster => (
            loader_factory(raster::RasterLoader::<HttpUpstream>::new),
            getter_factory(raster::getter),
        ),
    })
}

fn loader_factory<L: Loader + 'static>(
    build: fn(ServiceDefinition, HttpUpstream) -> Result<L, EnviroError>,
) -> LoaderFactory {
    Box::new(
        move |definition: &ServiceDefinition| -> Result<Arc<dyn Loader>, EnviroError> {
            let upstream = HttpUpstream::new(definition.loader.retry.clone())?;
            Ok(Arc::new(build(definition.clone(), upstream)?))
        },
    )
}

fn getter_factory<G: Getter + 'static>(
    build: fn(&ServiceDefinition) -> Result<G, EnviroError>,
) -> GetterFactory {
    Box::new(
        move |definition: &ServiceDefinition| -> Result<Arc<dyn Getter>, EnviroError> {
            Ok(Arc::new(build(definition)?))
        },
    )
}

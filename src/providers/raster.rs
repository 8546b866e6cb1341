use std::collections::BTreeMap;

use super::{Acquisition, StoreGetter, run_load};
use crate::domain::{CancelFlag, TimeRange};
use crate::error::EnviroError;
use crate::fs_util::{is_zip_source, read_zip_member};
use crate::report::LoadReport;
use crate::service::{Loader, ServiceDefinition, SourceConfig};
use crate::store::raster::{RasterLayer, RasterStore};
use crate::upstream::Upstream;

pub type RasterGetter = StoreGetter<RasterStore>;

pub fn raster_store(definition: &ServiceDefinition) -> Result<RasterStore, EnviroError> {
    match &definition.source {
        SourceConfig::Raster { .. } => Ok(RasterStore::new(definition.cache_dir.clone())),
        other => Err(EnviroError::InvalidConfiguration(format!(
            "service {} is {}, not raster",
            definition.label,
            other.family()
        ))),
    }
}

pub fn getter(definition: &ServiceDefinition) -> Result<RasterGetter, EnviroError> {
    Ok(StoreGetter::new(definition.clone(), raster_store(definition)?))
}

/// Copies or downloads static raster layers, unpacking zipped sources.
///
/// A raster has no time dimension, so any requested range is one unit that
/// is cached once every configured layer is present.
pub struct RasterLoader<U: Upstream> {
    definition: ServiceDefinition,
    store: RasterStore,
    sources: BTreeMap<String, String>,
    upstream: U,
}

impl<U: Upstream> RasterLoader<U> {
    pub fn new(definition: ServiceDefinition, upstream: U) -> Result<Self, EnviroError> {
        let store = raster_store(&definition)?;
        let sources = match &definition.source {
            SourceConfig::Raster { sources } => sources.clone(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            definition,
            store,
            sources,
            upstream,
        })
    }

    fn acquire(&self, variable: &str, source: &str) -> Result<RasterLayer, EnviroError> {
        let content = if is_zip_source(source) {
            let scratch = tempfile::tempdir().map_err(|err| EnviroError::Filesystem(err.to_string()))?;
            let archive = scratch.path().join("source.zip");
            self.upstream.download(source, &archive)?;
            let (member, content) = read_zip_member(&archive, "asc")?.ok_or_else(|| {
                EnviroError::Decode(format!("{source}: archive holds no .asc member"))
            })?;
            tracing::debug!(%source, member = %member.display(), "unpacked raster member");
            content
        } else {
            self.upstream.fetch(source)?
        };
        Ok(RasterLayer {
            variable: variable.to_string(),
            content,
        })
    }
}

impl<U: Upstream> Acquisition for RasterLoader<U> {
    type Store = RasterStore;

    fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    fn store(&self) -> &RasterStore {
        &self.store
    }

    fn split(&self, range: &TimeRange) -> Vec<TimeRange> {
        vec![*range]
    }

    fn is_cached(&self, _part: &TimeRange) -> Result<bool, EnviroError> {
        Ok(self
            .sources
            .keys()
            .all(|variable| self.store.has_layer(variable)))
    }

    fn fetch(&self, _part: &TimeRange) -> Result<Vec<RasterLayer>, EnviroError> {
        let refresh = self.definition.loader.refresh;
        self.sources
            .iter()
            .filter(|(variable, _)| refresh || !self.store.has_layer(variable))
            .map(|(variable, source)| {
                tracing::debug!(service = %self.definition.label, %variable, %source, "acquiring raster");
                self.acquire(variable, source)
            })
            .collect()
    }
}

impl<U: Upstream> Loader for RasterLoader<U> {
    fn load(&self, range: &TimeRange, cancel: &CancelFlag) -> LoadReport {
        run_load(self, range, cancel)
    }
}

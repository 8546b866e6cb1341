//! Service definitions and the two capabilities every service offers.
//!
//! A [`Loader`] fills a service's cache from its upstream and may run long;
//! a [`Getter`] answers from the cache only and never writes.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BoundingBox, CancelFlag, Coordinate, RawSample, TimeRange};
use crate::error::EnviroError;
use crate::report::LoadReport;
use crate::statistics::StatisticDefinition;
use crate::store::CacheState;
use crate::store::grid::Interpolation;
use crate::upstream::RetryPolicy;

pub trait Loader: Send + Sync {
    /// Bring the cache up to date for `range`. Failures are reported, never raised.
    fn load(&self, range: &TimeRange, cancel: &CancelFlag) -> LoadReport;
}

pub trait Getter: Send + Sync {
    /// Samples of every service variable within `[query_time - lookback, query_time + lookahead]`.
    fn get(
        &self,
        coordinate: &Coordinate,
        query_time: DateTime<Utc>,
        lookback: Duration,
        lookahead: Duration,
    ) -> Result<Vec<RawSample>, EnviroError>;

    fn cache_state(&self) -> Result<CacheState, EnviroError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceFamily {
    Gridded,
    Stations,
    Raster,
}

impl fmt::Display for ServiceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFamily::Gridded => write!(f, "gridded"),
            ServiceFamily::Stations => write!(f, "stations"),
            ServiceFamily::Raster => write!(f, "raster"),
        }
    }
}

/// Where a family's data comes from and how it is laid out in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    Gridded {
        url: String,
        path_pattern: String,
        interpolation: Interpolation,
    },
    Stations {
        url: String,
        database: String,
        max_distance_km: f64,
    },
    /// Source variable name to local path or URL.
    Raster { sources: BTreeMap<String, String> },
}

impl SourceConfig {
    pub fn family(&self) -> ServiceFamily {
        match self {
            SourceConfig::Gridded { .. } => ServiceFamily::Gridded,
            SourceConfig::Stations { .. } => ServiceFamily::Stations,
            SourceConfig::Raster { .. } => ServiceFamily::Raster,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Upstream holds nothing before this instant.
    pub available_from: Option<DateTime<Utc>>,
    /// Re-fetch sub-ranges that are already cached.
    pub refresh: bool,
    pub max_parallel_fetches: usize,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            available_from: None,
            refresh: false,
            max_parallel_fetches: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Maps a cached source variable to service units: `value * scale + offset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableBinding {
    pub source: String,
    pub scale: f64,
    pub offset: f64,
}

impl VariableBinding {
    pub fn identity(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            scale: 1.0,
            offset: 0.0,
        }
    }

    pub fn convert(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableDefinition {
    pub name: String,
    pub unit: String,
    pub description: String,
    pub binding: VariableBinding,
    statistics: Vec<StatisticDefinition>,
}

impl VariableDefinition {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        description: impl Into<String>,
        binding: VariableBinding,
        statistics: Vec<StatisticDefinition>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            description: description.into(),
            binding,
            statistics,
        }
    }

    pub fn statistics(&self) -> &[StatisticDefinition] {
        &self.statistics
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub label: String,
    pub description: String,
    pub variables: Vec<VariableDefinition>,
    pub domain: BoundingBox,
    /// Local time of the service, used for day-aligned statistics.
    pub timezone: FixedOffset,
    /// Directory holding this service's cache.
    pub cache_dir: Utf8PathBuf,
    pub source: SourceConfig,
    pub loader: LoaderConfig,
}

impl ServiceDefinition {
    pub fn family(&self) -> ServiceFamily {
        self.source.family()
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables.iter().find(|variable| variable.name == name)
    }

    /// Smallest `(lookback, lookahead)` covering every statistic of every variable.
    pub fn lookaround(&self, query_time: DateTime<Utc>) -> (Duration, Duration) {
        self.variables
            .iter()
            .flat_map(VariableDefinition::statistics)
            .map(|statistic| statistic.window(query_time, self.timezone))
            .fold((Duration::zero(), Duration::zero()), |(back, ahead), window| {
                (
                    back.max(query_time - window.start),
                    ahead.max(window.end - query_time),
                )
            })
    }
}

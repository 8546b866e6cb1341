use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{BoundingBox, TimeRange, day_range};
use crate::error::EnviroError;
use crate::service::{
    LoaderConfig, ServiceDefinition, SourceConfig, VariableBinding, VariableDefinition,
};
use crate::statistics::{Aggregation, StatisticCatalogue, StatisticDefinition, parse_offset};
use crate::store::grid::Interpolation;
use crate::upstream::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "envirocode.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub period: Option<PeriodEntry>,
    /// Custom statistics, added to the built-in catalogue.
    #[serde(default)]
    pub statistics: Vec<StatisticEntry>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeriodEntry {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatisticEntry {
    pub name: String,
    pub start: String,
    pub end: String,
    pub function: Aggregation,
    #[serde(default)]
    pub daily: Option<Aggregation>,
    #[serde(default)]
    pub day_aligned: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServiceEntry {
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// `[west, south, east, north]`; the whole globe when absent.
    #[serde(default)]
    pub domain: Option<[f64; 4]>,
    /// UTC offset such as `+01:00`; UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub source: SourceEntry,
    #[serde(default)]
    pub loader: LoaderEntry,
    pub variables: Vec<VariableEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum SourceEntry {
    Gridded {
        url: String,
        path_pattern: String,
        #[serde(default)]
        interpolation: Interpolation,
    },
    Stations {
        url: String,
        #[serde(default = "default_database")]
        database: String,
        #[serde(default = "default_max_distance_km")]
        max_distance_km: f64,
    },
    Raster {
        sources: BTreeMap<String, String>,
    },
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderEntry {
    pub available_from: Option<String>,
    pub refresh: bool,
    pub max_parallel_fetches: Option<usize>,
    #[serde(skip_serializing)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VariableEntry {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    /// Variable name in the cache; defaults to `name`.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_statistics")]
    pub statistics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub cache_root: Utf8PathBuf,
    /// Default range for `load` when none is given.
    pub period: Option<TimeRange>,
    pub services: Vec<ServiceDefinition>,
    pub statistics: StatisticCatalogue,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, EnviroError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(EnviroError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| EnviroError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| EnviroError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, EnviroError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let cache_root = match config.cache_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_cache_root()?,
        };
        let period = config
            .period
            .map(|period| {
                let start = parse_instant(&period.start)?;
                let end = parse_end_instant(&period.end)?;
                TimeRange::new(start, end)
            })
            .transpose()?;

        let mut statistics = StatisticCatalogue::with_builtins();
        for entry in config.statistics {
            statistics.insert(resolve_statistic(entry)?);
        }

        let services = config
            .services
            .into_iter()
            .map(|entry| resolve_service(entry, &cache_root, &statistics))
            .collect::<Result<Vec<_>, EnviroError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            cache_root,
            period,
            services,
            statistics,
        })
    }
}

fn resolve_statistic(entry: StatisticEntry) -> Result<StatisticDefinition, EnviroError> {
    let statistic = StatisticDefinition::new(
        entry.name,
        parse_offset(&entry.start)?,
        parse_offset(&entry.end)?,
        entry.function,
    )?;
    let statistic = match entry.daily {
        Some(daily) => statistic.bucketed(daily)?,
        None => statistic,
    };
    Ok(if entry.day_aligned {
        statistic.day_aligned()
    } else {
        statistic
    })
}

fn resolve_service(
    entry: ServiceEntry,
    cache_root: &Utf8Path,
    statistics: &StatisticCatalogue,
) -> Result<ServiceDefinition, EnviroError> {
    let label = entry.label.trim().to_string();
    let safe_label = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && label != "."
        && label != "..";
    if !safe_label {
        return Err(EnviroError::InvalidConfiguration(format!(
            "service label {:?} must be non-empty and use only letters, digits, '-', '_' or '.'",
            entry.label
        )));
    }

    let domain = match entry.domain {
        Some([west, south, east, north]) => BoundingBox::new(west, south, east, north)?,
        None => BoundingBox::WORLD,
    };
    let timezone = entry
        .timezone
        .as_deref()
        .map(parse_timezone)
        .transpose()?
        .unwrap_or_else(utc_offset);

    if entry.variables.is_empty() {
        return Err(EnviroError::InvalidConfiguration(format!(
            "service {label} declares no variables"
        )));
    }
    let variables = entry
        .variables
        .into_iter()
        .map(|variable| {
            let stats = variable
                .statistics
                .iter()
                .map(|name| statistics.resolve(name))
                .collect::<Result<Vec<_>, _>>()?;
            let source = variable.source.unwrap_or_else(|| variable.name.clone());
            Ok(VariableDefinition::new(
                variable.name,
                variable.unit,
                variable.description,
                VariableBinding {
                    source,
                    scale: variable.scale,
                    offset: variable.offset,
                },
                stats,
            ))
        })
        .collect::<Result<Vec<_>, EnviroError>>()?;

    let source = match entry.source {
        SourceEntry::Gridded {
            url,
            path_pattern,
            interpolation,
        } => SourceConfig::Gridded {
            url,
            path_pattern,
            interpolation,
        },
        SourceEntry::Stations {
            url,
            database,
            max_distance_km,
        } => SourceConfig::Stations {
            url,
            database,
            max_distance_km,
        },
        SourceEntry::Raster { sources } => {
            if let Some(missing) = variables
                .iter()
                .find(|variable| !sources.contains_key(&variable.binding.source))
            {
                return Err(EnviroError::InvalidConfiguration(format!(
                    "service {label}: no raster source for {}",
                    missing.binding.source
                )));
            }
            SourceConfig::Raster { sources }
        }
    };

    let max_parallel_fetches = entry.loader.max_parallel_fetches.unwrap_or(4);
    if max_parallel_fetches == 0 {
        return Err(EnviroError::InvalidConfiguration(format!(
            "service {label}: max_parallel_fetches must be at least 1"
        )));
    }
    let loader = LoaderConfig {
        available_from: entry
            .loader
            .available_from
            .as_deref()
            .map(parse_instant)
            .transpose()?,
        refresh: entry.loader.refresh,
        max_parallel_fetches,
        retry: entry.loader.retry,
    };

    Ok(ServiceDefinition {
        cache_dir: cache_root.join(&label),
        label,
        description: entry.description,
        variables,
        domain,
        timezone,
        source,
        loader,
    })
}

pub fn default_cache_root() -> Result<Utf8PathBuf, EnviroError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("envirocode")).ok()
        })
        .ok_or_else(|| EnviroError::Filesystem("unable to resolve cache directory".to_string()))
}

/// RFC 3339 timestamp, or a bare date meaning its first instant (UTC).
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, EnviroError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value.trim()) {
        return Ok(parsed.with_timezone(&Utc));
    }
    parse_date(value).map(|date| day_range(date).start)
}

/// Like [`parse_instant`], but a bare date means its last second.
pub fn parse_end_instant(value: &str) -> Result<DateTime<Utc>, EnviroError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value.trim()) {
        return Ok(parsed.with_timezone(&Utc));
    }
    parse_date(value).map(|date| day_range(date).end)
}

fn parse_date(value: &str) -> Result<NaiveDate, EnviroError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| EnviroError::InvalidConfiguration(format!("invalid date or time: {value}")))
}

pub fn parse_timezone(value: &str) -> Result<FixedOffset, EnviroError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return Ok(utc_offset());
    }
    FixedOffset::from_str(trimmed)
        .map_err(|_| EnviroError::InvalidConfiguration(format!("invalid timezone offset: {value}")))
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

fn default_database() -> String {
    "stations.sqlite".to_string()
}

fn default_max_distance_km() -> f64 {
    25.0
}

fn default_scale() -> f64 {
    1.0
}

fn default_statistics() -> Vec<String> {
    vec!["current".to_string()]
}

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use super::{Acquisition, StoreGetter, run_load};
use crate::domain::{CancelFlag, Coordinate, TimeRange, month_range};
use crate::error::EnviroError;
use crate::report::LoadReport;
use crate::service::{Loader, ServiceDefinition, SourceConfig};
use crate::store::station::{Observation, Station, StationBatch, StationStore};
use crate::upstream::{Upstream, fill_template};

pub type StationsGetter = StoreGetter<StationStore>;

pub fn station_store(definition: &ServiceDefinition) -> Result<StationStore, EnviroError> {
    match &definition.source {
        SourceConfig::Stations {
            database,
            max_distance_km,
            ..
        } => StationStore::new(definition.cache_dir.join(database), *max_distance_km),
        other => Err(EnviroError::InvalidConfiguration(format!(
            "service {} is {}, not stations",
            definition.label,
            other.family()
        ))),
    }
}

pub fn getter(definition: &ServiceDefinition) -> Result<StationsGetter, EnviroError> {
    Ok(StoreGetter::new(definition.clone(), station_store(definition)?))
}

/// Fetches station observations one calendar month at a time.
pub struct StationsLoader<U: Upstream> {
    definition: ServiceDefinition,
    store: StationStore,
    url: String,
    upstream: U,
}

impl<U: Upstream> StationsLoader<U> {
    pub fn new(definition: ServiceDefinition, upstream: U) -> Result<Self, EnviroError> {
        let store = station_store(&definition)?;
        let url = match &definition.source {
            SourceConfig::Stations { url, .. } => url.clone(),
            _ => String::new(),
        };
        Ok(Self {
            definition,
            store,
            url,
            upstream,
        })
    }
}

impl<U: Upstream> Acquisition for StationsLoader<U> {
    type Store = StationStore;

    fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    fn store(&self) -> &StationStore {
        &self.store
    }

    fn split(&self, range: &TimeRange) -> Vec<TimeRange> {
        range
            .months()
            .into_iter()
            .filter_map(|(year, month)| month_range(year, month))
            .collect()
    }

    fn is_cached(&self, part: &TimeRange) -> Result<bool, EnviroError> {
        self.store.has_range(part)
    }

    fn fetch(&self, part: &TimeRange) -> Result<StationBatch, EnviroError> {
        let url = fill_template(
            &self.url,
            &[
                ("bbox", self.definition.domain.to_query_value()),
                ("start", part.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("end", part.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ],
        );
        tracing::debug!(service = %self.definition.label, %url, "fetching observations");
        let body = self.upstream.fetch(&url)?;
        let text = std::str::from_utf8(&body).map_err(|err| EnviroError::Decode(err.to_string()))?;
        parse_observations(text)
    }
}

impl<U: Upstream> Loader for StationsLoader<U> {
    fn load(&self, range: &TimeRange, cancel: &CancelFlag) -> LoadReport {
        run_load(self, range, cancel)
    }
}

/// Parse `station_id,longitude,latitude,timestamp,variable,value` rows.
///
/// A header row is optional. Empty, `null` and `NaN` values are missing
/// data. Each station is considered active between its first and last row.
pub fn parse_observations(text: &str) -> Result<StationBatch, EnviroError> {
    let mut stations: BTreeMap<String, Station> = BTreeMap::new();
    let mut observations = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (index == 0 && line.starts_with("station_id")) {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [station_id, longitude, latitude, timestamp, variable, value] = fields[..] else {
            return Err(EnviroError::Decode(format!(
                "line {}: expected 6 fields, found {}",
                index + 1,
                fields.len()
            )));
        };
        let number = |field: &str| {
            field
                .parse::<f64>()
                .map_err(|_| EnviroError::Decode(format!("line {}: invalid number {field}", index + 1)))
        };
        let location = Coordinate::new(number(longitude)?, number(latitude)?)
            .map_err(|err| EnviroError::Decode(format!("line {}: {err}", index + 1)))?;
        let timestamp = parse_timestamp(timestamp)
            .ok_or_else(|| EnviroError::Decode(format!("line {}: invalid timestamp", index + 1)))?;
        let value = match value {
            "" => None,
            v if v.eq_ignore_ascii_case("null") || v.eq_ignore_ascii_case("nan") => None,
            v => Some(number(v)?).filter(|value| value.is_finite()),
        };

        let station = stations.entry(station_id.to_string()).or_insert_with(|| Station {
            id: station_id.to_string(),
            location,
            active_from: Some(timestamp),
            active_to: Some(timestamp),
        });
        station.active_from = station.active_from.min(Some(timestamp));
        station.active_to = station.active_to.max(Some(timestamp));
        observations.push(Observation {
            station_id: station_id.to_string(),
            variable: variable.to_string(),
            timestamp,
            value,
        });
    }
    Ok(StationBatch {
        stations: stations.into_values().collect(),
        observations,
    })
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

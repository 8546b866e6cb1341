use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::{Acquisition, StoreGetter, run_load};
use crate::domain::{CancelFlag, TimeRange, day_range};
use crate::error::EnviroError;
use crate::report::LoadReport;
use crate::service::{Loader, ServiceDefinition, SourceConfig};
use crate::store::grid::{GridFile, GridStore};
use crate::upstream::{Upstream, fill_template};

pub type GriddedGetter = StoreGetter<GridStore>;

pub fn grid_store(definition: &ServiceDefinition) -> Result<GridStore, EnviroError> {
    match &definition.source {
        SourceConfig::Gridded {
            path_pattern,
            interpolation,
            ..
        } => GridStore::new(definition.cache_dir.clone(), path_pattern.clone(), *interpolation),
        other => Err(EnviroError::InvalidConfiguration(format!(
            "service {} is {}, not gridded",
            definition.label,
            other.family()
        ))),
    }
}

pub fn getter(definition: &ServiceDefinition) -> Result<GriddedGetter, EnviroError> {
    Ok(StoreGetter::new(definition.clone(), grid_store(definition)?))
}

/// Fetches one CoverageJSON grid per UTC day.
pub struct GriddedLoader<U: Upstream> {
    definition: ServiceDefinition,
    store: GridStore,
    url: String,
    upstream: U,
}

impl<U: Upstream> GriddedLoader<U> {
    pub fn new(definition: ServiceDefinition, upstream: U) -> Result<Self, EnviroError> {
        let store = grid_store(&definition)?;
        let url = match &definition.source {
            SourceConfig::Gridded { url, .. } => url.clone(),
            _ => String::new(),
        };
        Ok(Self {
            definition,
            store,
            url,
            upstream,
        })
    }

    fn request_url(&self, part: &TimeRange) -> String {
        let parameters = self
            .definition
            .variables
            .iter()
            .map(|variable| variable.binding.source.as_str())
            .collect::<Vec<_>>()
            .join(",");
        fill_template(
            &self.url,
            &[
                ("bbox", self.definition.domain.to_query_value()),
                ("start", part.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("end", part.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("parameters", parameters),
            ],
        )
    }
}

impl<U: Upstream> Acquisition for GriddedLoader<U> {
    type Store = GridStore;

    fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    fn store(&self) -> &GridStore {
        &self.store
    }

    fn split(&self, range: &TimeRange) -> Vec<TimeRange> {
        range.days().into_iter().map(day_range).collect()
    }

    fn is_cached(&self, part: &TimeRange) -> Result<bool, EnviroError> {
        Ok(self.store.has_day(part.start.date_naive()))
    }

    fn fetch(&self, part: &TimeRange) -> Result<GridFile, EnviroError> {
        let url = self.request_url(part);
        tracing::debug!(service = %self.definition.label, %url, "fetching coverage");
        let body = self.upstream.fetch(&url)?;
        parse_coverage(&body)
    }
}

impl<U: Upstream> Loader for GriddedLoader<U> {
    fn load(&self, range: &TimeRange, cancel: &CancelFlag) -> LoadReport {
        run_load(self, range, cancel)
    }
}

#[derive(Debug, Deserialize)]
struct Coverage {
    #[serde(rename = "type")]
    kind: String,
    domain: CoverageDomain,
    ranges: BTreeMap<String, NdArray>,
}

#[derive(Debug, Deserialize)]
struct CoverageDomain {
    axes: CoverageAxes,
}

#[derive(Debug, Deserialize)]
struct CoverageAxes {
    x: NumericAxis,
    y: NumericAxis,
    t: Option<TimeAxis>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumericAxis {
    Values { values: Vec<f64> },
    Regular { start: f64, stop: f64, num: usize },
}

impl NumericAxis {
    fn values(&self) -> Vec<f64> {
        match self {
            NumericAxis::Values { values } => values.clone(),
            NumericAxis::Regular { start, stop, num } => match *num {
                0 => Vec::new(),
                1 => vec![*start],
                n => (0..n)
                    .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct TimeAxis {
    values: Vec<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NdArray {
    axis_names: Vec<String>,
    shape: Vec<usize>,
    values: Vec<Option<f64>>,
}

impl NdArray {
    /// Reorder into `[t][y][x]`, whatever axis order the upstream used.
    fn to_tyx(
        &self,
        name: &str,
        nt: usize,
        ny: usize,
        nx: usize,
    ) -> Result<Vec<Option<f64>>, EnviroError> {
        if self.axis_names.len() != self.shape.len() {
            return Err(EnviroError::Decode(format!("range {name}: axisNames and shape differ")));
        }
        let mut strides = BTreeMap::new();
        let mut stride = 1usize;
        for (axis, size) in self.axis_names.iter().zip(&self.shape).rev() {
            strides.insert(axis.as_str(), (stride, *size));
            stride *= size;
        }
        let expected = |axis: &str, size: usize| match strides.get(axis) {
            Some((_, actual)) if *actual != size => Err(EnviroError::Decode(format!(
                "range {name}: axis {axis} has {actual} entries, expected {size}"
            ))),
            Some((stride, _)) => Ok(*stride),
            None if size == 1 => Ok(0),
            None => Err(EnviroError::Decode(format!("range {name}: missing axis {axis}"))),
        };
        let (st, sy, sx) = (expected("t", nt)?, expected("y", ny)?, expected("x", nx)?);
        if self.values.len() != stride {
            return Err(EnviroError::Decode(format!(
                "range {name}: {} values for shape {:?}",
                self.values.len(),
                self.shape
            )));
        }
        let mut out = Vec::with_capacity(nt * ny * nx);
        for t in 0..nt {
            for y in 0..ny {
                for x in 0..nx {
                    out.push(self.values[t * st + y * sy + x * sx]);
                }
            }
        }
        Ok(out)
    }
}

/// Decode a CoverageJSON grid coverage.
pub fn parse_coverage(body: &[u8]) -> Result<GridFile, EnviroError> {
    let coverage: Coverage =
        serde_json::from_slice(body).map_err(|err| EnviroError::Decode(err.to_string()))?;
    if coverage.kind != "Coverage" {
        return Err(EnviroError::Decode(format!(
            "expected a Coverage, got {}",
            coverage.kind
        )));
    }
    let lon = coverage.domain.axes.x.values();
    let lat = coverage.domain.axes.y.values();
    let time = coverage
        .domain
        .axes
        .t
        .map(|axis| axis.values)
        .unwrap_or_default();
    let variables = coverage
        .ranges
        .iter()
        .map(|(name, array)| {
            array
                .to_tyx(name, time.len(), lat.len(), lon.len())
                .map(|values| (name.clone(), values))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    GridFile::new(lon, lat, time, variables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_with_regular_axes_and_nulls() {
        let body = br#"{
            "type": "Coverage",
            "domain": {
                "type": "Domain",
                "domainType": "Grid",
                "axes": {
                    "x": {"start": 10.0, "stop": 11.0, "num": 2},
                    "y": {"values": [48.0, 49.0]},
                    "t": {"values": ["2024-01-01T00:00:00Z", "2024-01-01T01:00:00Z"]}
                }
            },
            "ranges": {
                "t2m": {
                    "type": "NdArray",
                    "dataType": "float",
                    "axisNames": ["t", "y", "x"],
                    "shape": [2, 2, 2],
                    "values": [1, 2, 3, null, 5, 6, 7, 8]
                }
            }
        }"#;
        let grid = parse_coverage(body).unwrap();
        assert_eq!(grid.lon, vec![10.0, 11.0]);
        assert_eq!(grid.time.len(), 2);
        assert_eq!(grid.variables["t2m"][3], None);
        assert_eq!(grid.variables["t2m"][4], Some(5.0));
    }

    #[test]
    fn axis_order_is_normalised() {
        let array = NdArray {
            axis_names: vec!["x".into(), "y".into()],
            shape: vec![2, 3],
            values: (0..6).map(|v| Some(v as f64)).collect(),
        };
        let tyx = array.to_tyx("v", 1, 3, 2).unwrap();
        assert_eq!(
            tyx,
            vec![Some(0.0), Some(3.0), Some(1.0), Some(4.0), Some(2.0), Some(5.0)]
        );
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let body = br#"{"type": "CoverageCollection", "domain": {"axes": {"x": {"values": [0]}, "y": {"values": [0]}}}, "ranges": {}}"#;
        assert!(parse_coverage(body).is_err());
    }
}

//! Fan-out over every registered service for one coordinate and time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::domain::{CancelFlag, Coordinate, TimeRange};
use crate::error::EnviroError;
use crate::registry::ServiceRegistry;
use crate::report::{LoadReport, LoadSummary};
use crate::service::{ServiceDefinition, ServiceFamily};
use crate::statistics::aggregate;
use crate::store::CacheState;

/// Statistic name to value; `None` is no data.
pub type StatisticValues = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceOutcome {
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Variable name to its statistics.
    pub values: BTreeMap<String, StatisticValues>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableMetadata {
    pub unit: String,
    pub description: String,
    pub statistics: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetadata {
    pub description: String,
    pub family: ServiceFamily,
    pub variables: BTreeMap<String, VariableMetadata>,
    pub cache_state: Option<CacheState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultMetadata {
    pub package_version: String,
    pub creation_date: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvirocodingResult {
    pub location: Coordinate,
    pub requested_date_utc: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceOutcome>,
    pub metadata: ResultMetadata,
}

pub struct Environment {
    registry: Arc<ServiceRegistry>,
}

impl Environment {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Every statistic of every variable of every service.
    pub fn query(&self, coordinate: &Coordinate, time: DateTime<Utc>) -> EnvirocodingResult {
        self.query_filtered(coordinate, time, None)
    }

    /// Like [`Environment::query`], restricted to the named variables.
    /// Services holding none of them are left out.
    pub fn query_variables(
        &self,
        coordinate: &Coordinate,
        time: DateTime<Utc>,
        variables: &[String],
    ) -> EnvirocodingResult {
        self.query_filtered(coordinate, time, Some(variables))
    }

    fn query_filtered(
        &self,
        coordinate: &Coordinate,
        time: DateTime<Utc>,
        variables: Option<&[String]>,
    ) -> EnvirocodingResult {
        let wanted = |name: &str| variables.is_none_or(|names| names.iter().any(|n| n == name));
        let services: Vec<Arc<ServiceDefinition>> = self
            .registry
            .list_services()
            .into_iter()
            .filter(|definition| {
                definition
                    .variables
                    .iter()
                    .any(|variable| wanted(&variable.name))
            })
            .collect();

        let answers: Vec<(String, ServiceOutcome, ServiceMetadata)> = services
            .par_iter()
            .map(|definition| {
                let outcome = self.query_service(definition, coordinate, time, &wanted);
                let metadata = self.service_metadata(definition);
                (definition.label.clone(), outcome, metadata)
            })
            .collect();

        let mut outcomes = BTreeMap::new();
        let mut metadata = BTreeMap::new();
        for (label, outcome, service_metadata) in answers {
            outcomes.insert(label.clone(), outcome);
            metadata.insert(label, service_metadata);
        }
        EnvirocodingResult {
            location: *coordinate,
            requested_date_utc: time,
            services: outcomes,
            metadata: ResultMetadata {
                package_version: env!("CARGO_PKG_VERSION").to_string(),
                creation_date: Utc::now(),
                services: metadata,
            },
        }
    }

    fn query_service(
        &self,
        definition: &ServiceDefinition,
        coordinate: &Coordinate,
        time: DateTime<Utc>,
        wanted: &(dyn Fn(&str) -> bool + Sync),
    ) -> ServiceOutcome {
        match self.evaluate(definition, coordinate, time, wanted) {
            Ok(values) => ServiceOutcome {
                status: ServiceStatus::Ok,
                reason: None,
                values,
            },
            Err(err) => {
                tracing::warn!(service = %definition.label, error = %err, "service degraded");
                let values = definition
                    .variables
                    .iter()
                    .filter(|variable| wanted(&variable.name))
                    .map(|variable| {
                        let stats: StatisticValues = variable
                            .statistics()
                            .iter()
                            .map(|statistic| (statistic.name().to_string(), None))
                            .collect();
                        (variable.name.clone(), stats)
                    })
                    .collect();
                ServiceOutcome {
                    status: ServiceStatus::Degraded,
                    reason: Some(err.to_string()),
                    values,
                }
            }
        }
    }

    fn evaluate(
        &self,
        definition: &ServiceDefinition,
        coordinate: &Coordinate,
        time: DateTime<Utc>,
        wanted: &(dyn Fn(&str) -> bool + Sync),
    ) -> Result<BTreeMap<String, StatisticValues>, EnviroError> {
        let getter = self.registry.getter(&definition.label)?;
        let (lookback, lookahead) = definition.lookaround(time);
        let samples = getter.get(coordinate, time, lookback, lookahead)?;
        tracing::debug!(
            service = %definition.label,
            samples = samples.len(),
            "evaluating statistics"
        );

        let mut values = BTreeMap::new();
        for variable in definition
            .variables
            .iter()
            .filter(|variable| wanted(&variable.name))
        {
            let own: Vec<_> = samples
                .iter()
                .filter(|sample| sample.variable == variable.name)
                .cloned()
                .collect();
            let stats: StatisticValues = variable
                .statistics()
                .iter()
                .map(|statistic| {
                    let value = aggregate(&own, statistic, time, definition.timezone);
                    (statistic.name().to_string(), value)
                })
                .collect();
            values.insert(variable.name.clone(), stats);
        }
        Ok(values)
    }

    fn service_metadata(&self, definition: &ServiceDefinition) -> ServiceMetadata {
        let cache_state = match self
            .registry
            .getter(&definition.label)
            .and_then(|getter| getter.cache_state())
        {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::debug!(service = %definition.label, error = %err, "cache state unavailable");
                None
            }
        };
        ServiceMetadata {
            description: definition.description.clone(),
            family: definition.family(),
            variables: definition
                .variables
                .iter()
                .map(|variable| {
                    (
                        variable.name.clone(),
                        VariableMetadata {
                            unit: variable.unit.clone(),
                            description: variable.description.clone(),
                            statistics: variable
                                .statistics()
                                .iter()
                                .map(|statistic| statistic.name().to_string())
                                .collect(),
                        },
                    )
                })
                .collect(),
            cache_state,
        }
    }

    /// Metadata of every registered service, including its cache state.
    pub fn describe_services(&self) -> BTreeMap<String, ServiceMetadata> {
        self.registry
            .list_services()
            .iter()
            .map(|definition| (definition.label.clone(), self.service_metadata(definition)))
            .collect()
    }

    /// Run every loader over `range`, one service after the other.
    pub fn load_all(&self, range: &TimeRange, cancel: &CancelFlag) -> LoadSummary {
        let mut summary = LoadSummary::default();
        for definition in self.registry.list_services() {
            let label = definition.label.as_str();
            tracing::info!(service = label, %range, "load started");
            let report = match self.registry.loader(label) {
                Ok(loader) => loader.load(range, cancel),
                Err(err) => {
                    tracing::warn!(service = label, error = %err, "loader unavailable");
                    let mut report = LoadReport::new(label);
                    report.fail(*range, err);
                    report
                }
            };
            summary.record(report);
        }
        summary
    }
}

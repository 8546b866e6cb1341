use assert_matches::assert_matches;
use chrono::Duration;
use serde_json::json;

use envirocode::config::{Config, ConfigLoader, ResolvedConfig};
use envirocode::domain::BoundingBox;
use envirocode::error::EnviroError;
use envirocode::registry::ServiceRegistry;
use envirocode::service::{ServiceFamily, SourceConfig};
use envirocode::statistics::Aggregation;

fn resolve(value: serde_json::Value) -> Result<ResolvedConfig, EnviroError> {
    let config: Config = serde_json::from_value(value).unwrap();
    ConfigLoader::resolve_config(config)
}

fn stations_service(label: &str) -> serde_json::Value {
    json!({
        "label": label,
        "family": "stations",
        "url": "https://example.org/obs?bbox={bbox}&start={start}&end={end}",
        "variables": [{"name": "no2"}]
    })
}

#[test]
fn defaults_are_filled_in() {
    let resolved = resolve(json!({
        "cache_root": "/var/cache/envirocode",
        "services": [stations_service("uba")]
    }))
    .unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert!(resolved.period.is_none());

    let service = &resolved.services[0];
    assert_eq!(service.family(), ServiceFamily::Stations);
    assert_eq!(service.cache_dir, "/var/cache/envirocode/uba");
    assert_eq!(service.domain, BoundingBox::WORLD);
    assert_eq!(service.timezone.local_minus_utc(), 0);
    assert_eq!(service.loader.max_parallel_fetches, 4);
    assert!(!service.loader.refresh);
    assert_matches!(
        &service.source,
        SourceConfig::Stations { database, max_distance_km, .. }
            if database == "stations.sqlite" && *max_distance_km == 25.0
    );
    let variable = &service.variables[0];
    assert_eq!(variable.binding.source, "no2");
    assert_eq!(variable.binding.scale, 1.0);
    assert_eq!(variable.statistics()[0].name(), "current");
}

#[test]
fn custom_statistics_join_the_catalogue() {
    let resolved = resolve(json!({
        "cache_root": "/tmp/envirocode",
        "statistics": [{
            "name": "week_max_delta",
            "start": "-7d",
            "end": "0",
            "function": {"kind": "max_abs_delta", "steps": 6}
        }],
        "services": [{
            "label": "dwd",
            "family": "gridded",
            "url": "https://example.org/cube",
            "path_pattern": "%Y/%Y%m%d.json.gz",
            "interpolation": "bilinear",
            "timezone": "+01:00",
            "loader": {"available_from": "1990-01-01", "max_parallel_fetches": 2},
            "variables": [{
                "name": "temperature",
                "source": "t2m",
                "offset": -273.15,
                "statistics": ["current", "week_max_delta", "3day_mean_mda8"]
            }]
        }]
    }))
    .unwrap();
    let service = &resolved.services[0];
    assert_eq!(service.timezone.local_minus_utc(), 3600);
    assert_eq!(service.loader.max_parallel_fetches, 2);
    assert_eq!(
        service.loader.available_from.unwrap().to_rfc3339(),
        "1990-01-01T00:00:00+00:00"
    );
    let statistic = &service.variables[0].statistics()[1];
    assert_eq!(statistic.start_offset(), Duration::days(-7));
    assert_eq!(statistic.function(), Aggregation::MaxAbsDelta { steps: 6 });
    assert!(resolved.statistics.get("week_max_delta").is_some());
    assert!((service.variables[0].binding.convert(300.0) - 26.85).abs() < 1e-9);
}

#[test]
fn invalid_services_are_rejected() {
    let unknown_statistic = json!({
        "cache_root": "/tmp/envirocode",
        "services": [{
            "label": "uba",
            "family": "stations",
            "url": "https://example.org/obs",
            "variables": [{"name": "no2", "statistics": ["fortnight_mean"]}]
        }]
    });
    assert_matches!(
        resolve(unknown_statistic),
        Err(EnviroError::InvalidConfiguration(message)) if message.contains("fortnight_mean")
    );

    let bad_label = json!({"cache_root": "/tmp/envirocode", "services": [stations_service("../uba")]});
    assert_matches!(resolve(bad_label), Err(EnviroError::InvalidConfiguration(_)));

    let no_variables = json!({
        "cache_root": "/tmp/envirocode",
        "services": [{"label": "uba", "family": "stations", "url": "x", "variables": []}]
    });
    assert_matches!(resolve(no_variables), Err(EnviroError::InvalidConfiguration(_)));

    let missing_raster = json!({
        "cache_root": "/tmp/envirocode",
        "services": [{
            "label": "landscape",
            "family": "raster",
            "sources": {"dem": "/data/dem.asc"},
            "variables": [{"name": "elevation", "source": "dem"}, {"name": "imperviousness"}]
        }]
    });
    assert_matches!(resolve(missing_raster), Err(EnviroError::InvalidConfiguration(_)));

    let bad_timezone = json!({
        "cache_root": "/tmp/envirocode",
        "services": [{
            "label": "uba",
            "family": "stations",
            "url": "x",
            "timezone": "Europe/Berlin",
            "variables": [{"name": "no2"}]
        }]
    });
    assert_matches!(resolve(bad_timezone), Err(EnviroError::InvalidConfiguration(_)));

    let bad_domain = json!({
        "cache_root": "/tmp/envirocode",
        "services": [{
            "label": "uba",
            "family": "stations",
            "url": "x",
            "domain": [15.0, 47.0, 5.0, 55.0],
            "variables": [{"name": "no2"}]
        }]
    });
    assert_matches!(resolve(bad_domain), Err(EnviroError::InvalidConfiguration(_)));
}

#[test]
fn registry_validates_at_startup() {
    let bad_pattern = resolve(json!({
        "cache_root": "/tmp/envirocode",
        "services": [{
            "label": "era5",
            "family": "gridded",
            "url": "https://example.org/cube",
            "path_pattern": "%Y/%m.json.gz",
            "variables": [{"name": "t2m"}]
        }]
    }))
    .unwrap();
    assert_matches!(
        ServiceRegistry::from_config(&bad_pattern).err(),
        Some(EnviroError::InvalidConfiguration(_))
    );

    let duplicate = resolve(json!({
        "cache_root": "/tmp/envirocode",
        "services": [stations_service("uba"), stations_service("uba")]
    }))
    .unwrap();
    assert_matches!(
        ServiceRegistry::from_config(&duplicate).err(),
        Some(EnviroError::DuplicateService(label)) if label == "uba"
    );
}

#[test]
fn config_files_are_read_from_disk() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("envirocode.json");
    std::fs::write(
        &path,
        json!({
            "cache_root": temp.path().join("cache").to_str().unwrap(),
            "period": {"start": "2024-01-01", "end": "2024-01-31"},
            "services": [stations_service("uba")]
        })
        .to_string(),
    )
    .unwrap();
    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    let period = resolved.period.unwrap();
    assert_eq!(period.end.to_rfc3339(), "2024-01-31T23:59:59+00:00");
    assert_eq!(resolved.services.len(), 1);

    let missing = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(EnviroError::ConfigRead(_))
    );

    std::fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(EnviroError::ConfigParse(_))
    );
}

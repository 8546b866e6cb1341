use std::collections::BTreeMap;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use envirocode::domain::{BoundingBox, CellRef, Coordinate, TimeRange, day_range};
use envirocode::error::EnviroError;
use envirocode::store::CacheStore;
use envirocode::store::grid::{GridFile, GridStore, Interpolation};
use envirocode::store::raster::{RasterLayer, RasterStore};
use envirocode::store::station::{Observation, Station, StationBatch, StationStore};

const DEM: &str = "ncols 3\nnrows 2\nxllcorner 10.0\nyllcorner 50.0\ncellsize 0.5\nNODATA_value -9999\n1 2 3\n4 -9999 6\n";

fn utc(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .unwrap()
        .with_timezone(&Utc)
}

fn utf8_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}

fn jan(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

/// 2x2 grid over two days, one step every six hours. Cell (x=1, y=1) is missing.
fn two_day_grid() -> GridFile {
    let time: Vec<DateTime<Utc>> = (0..8)
        .map(|step| utc("2024-01-01T00:00:00Z") + Duration::hours(6 * step))
        .collect();
    let values = (0..8)
        .flat_map(|step| {
            let base = step as f64 * 10.0;
            [Some(base + 1.0), Some(base + 2.0), Some(base + 3.0), None]
        })
        .collect();
    GridFile::new(
        vec![10.0, 11.0],
        vec![48.0, 49.0],
        time,
        BTreeMap::from([("t2m".to_string(), values)]),
    )
    .unwrap()
}

fn munich_box() -> BoundingBox {
    BoundingBox::new(9.5, 47.5, 12.5, 49.5).unwrap()
}

#[test]
fn grid_put_splits_days_and_reads_back() {
    let temp = tempfile::tempdir().unwrap();
    let store = GridStore::new(utf8_dir(&temp), "era5/%Y/%m/%Y%m%d.json.gz", Interpolation::Nearest)
        .unwrap();
    let range = TimeRange::new(day_range(jan(1)).start, day_range(jan(2)).end).unwrap();
    store.put(&range, &munich_box(), two_day_grid()).unwrap();

    assert!(store.path_for(jan(1)).ends_with("era5/2024/01/20240101.json.gz"));
    assert!(store.has_day(jan(1)) && store.has_day(jan(2)));
    assert_eq!(store.read_day(jan(2)).unwrap().unwrap().time.len(), 4);

    let near_origin = Coordinate::new(10.1, 48.2).unwrap();
    let samples = store
        .read(&near_origin, &day_range(jan(2)), "t2m")
        .unwrap();
    assert_eq!(samples.len(), 4);
    assert_eq!(samples[0].timestamp, utc("2024-01-02T00:00:00Z"));
    assert_eq!(samples[0].value, Some(41.0));
    assert_eq!(samples[0].cell, CellRef::Grid { x: 0, y: 0 });

    let missing_cell = Coordinate::new(10.9, 48.9).unwrap();
    let samples = store.read(&missing_cell, &day_range(jan(1)), "t2m").unwrap();
    assert!(samples.iter().all(|sample| sample.value.is_none()));

    let state = store.cache_state().unwrap();
    assert_eq!(state.entries, 2);
    assert_eq!(state.first, Some(utc("2024-01-01T00:00:00Z")));
}

#[test]
fn partial_day_puts_keep_the_rest_of_the_day() {
    let temp = tempfile::tempdir().unwrap();
    let store = GridStore::new(utf8_dir(&temp), "%Y%m%d.json.gz", Interpolation::Nearest).unwrap();
    let morning = TimeRange::new(utc("2024-01-01T00:00:00Z"), utc("2024-01-01T11:59:59Z")).unwrap();
    let afternoon = TimeRange::new(utc("2024-01-01T12:00:00Z"), utc("2024-01-01T23:59:59Z")).unwrap();
    store.put(&morning, &munich_box(), two_day_grid()).unwrap();
    store.put(&afternoon, &munich_box(), two_day_grid()).unwrap();

    let near_origin = Coordinate::new(10.1, 48.2).unwrap();
    let values = |store: &GridStore| -> Vec<(String, Option<f64>)> {
        store
            .read(&near_origin, &day_range(jan(1)), "t2m")
            .unwrap()
            .into_iter()
            .map(|sample| (sample.timestamp.format("%H:%M").to_string(), sample.value))
            .collect()
    };
    let expected = |first: f64| {
        vec![
            ("00:00".to_string(), Some(first)),
            ("06:00".to_string(), Some(11.0)),
            ("12:00".to_string(), Some(21.0)),
            ("18:00".to_string(), Some(31.0)),
        ]
    };
    assert_eq!(values(&store), expected(1.0));

    let mut revised = two_day_grid();
    for value in revised.variables.get_mut("t2m").unwrap().iter_mut().flatten() {
        *value += 100.0;
    }
    let first_step = TimeRange::new(utc("2024-01-01T00:00:00Z"), utc("2024-01-01T05:59:59Z")).unwrap();
    store.put(&first_step, &munich_box(), revised).unwrap();
    assert_eq!(values(&store), expected(101.0));
}

#[test]
fn grid_read_errors() {
    let temp = tempfile::tempdir().unwrap();
    let store = GridStore::new(utf8_dir(&temp), "%Y%m%d.json.gz", Interpolation::Nearest).unwrap();
    let coordinate = Coordinate::new(10.5, 48.5).unwrap();
    assert_matches!(
        store.read(&coordinate, &day_range(jan(1)), "t2m"),
        Err(EnviroError::CacheMiss(_))
    );

    store
        .put(&day_range(jan(1)), &munich_box(), two_day_grid())
        .unwrap();
    assert_matches!(
        store.read(&coordinate, &day_range(jan(1)), "no2"),
        Err(EnviroError::CacheMiss(_))
    );
    let outside = Coordinate::new(20.0, 48.5).unwrap();
    assert_matches!(
        store.read(&outside, &day_range(jan(1)), "t2m"),
        Err(EnviroError::OutOfDomain(_))
    );
}

#[test]
fn grid_bilinear_interpolation() {
    let temp = tempfile::tempdir().unwrap();
    let store =
        GridStore::new(utf8_dir(&temp), "%Y%m%d.json.gz", Interpolation::Bilinear).unwrap();
    store
        .put(&day_range(jan(1)), &munich_box(), two_day_grid())
        .unwrap();
    let between = Coordinate::new(10.5, 48.0).unwrap();
    let samples = store.read(&between, &day_range(jan(1)), "t2m").unwrap();
    assert_eq!(samples[0].value, Some(1.5));

    // One of the four corners has no data.
    let centre = Coordinate::new(10.5, 48.5).unwrap();
    let samples = store.read(&centre, &day_range(jan(1)), "t2m").unwrap();
    assert_eq!(samples[0].value, None);
}

#[test]
fn grid_rewrite_replaces_the_day() {
    let temp = tempfile::tempdir().unwrap();
    let store = GridStore::new(utf8_dir(&temp), "%Y%m%d.json.gz", Interpolation::Nearest).unwrap();
    store
        .put(&day_range(jan(1)), &munich_box(), two_day_grid())
        .unwrap();
    let mut updated = two_day_grid();
    for value in updated.variables.get_mut("t2m").unwrap().iter_mut() {
        *value = value.map(|v| v + 100.0);
    }
    store.put(&day_range(jan(1)), &munich_box(), updated).unwrap();

    let coordinate = Coordinate::new(10.0, 48.0).unwrap();
    let samples = store.read(&coordinate, &day_range(jan(1)), "t2m").unwrap();
    assert_eq!(samples[0].value, Some(101.0));
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty());
}

fn station(id: &str, longitude: f64, latitude: f64, from: &str, to: &str) -> Station {
    Station {
        id: id.to_string(),
        location: Coordinate::new(longitude, latitude).unwrap(),
        active_from: Some(utc(from)),
        active_to: Some(utc(to)),
    }
}

fn observation(station_id: &str, timestamp: &str, value: Option<f64>) -> Observation {
    Observation {
        station_id: station_id.to_string(),
        variable: "no2".to_string(),
        timestamp: utc(timestamp),
        value,
    }
}

fn month(value: &str, end: &str) -> TimeRange {
    TimeRange::new(utc(value), utc(end)).unwrap()
}

#[test]
fn station_read_skips_inactive_nearest_station() {
    let temp = tempfile::tempdir().unwrap();
    let store = StationStore::new(utf8_dir(&temp).join("stations.sqlite"), 25.0).unwrap();
    let jan_2023 = month("2023-01-01T00:00:00Z", "2023-01-31T23:59:59Z");
    let jan_2024 = month("2024-01-01T00:00:00Z", "2024-01-31T23:59:59Z");

    store
        .put(
            &jan_2023,
            &munich_box(),
            StationBatch {
                stations: vec![station(
                    "closed",
                    11.575,
                    48.14,
                    "2023-01-01T00:00:00Z",
                    "2023-01-31T23:00:00Z",
                )],
                observations: vec![observation("closed", "2023-01-10T00:00:00Z", Some(30.0))],
            },
        )
        .unwrap();
    store
        .put(
            &jan_2024,
            &munich_box(),
            StationBatch {
                stations: vec![station(
                    "open",
                    11.70,
                    48.20,
                    "2024-01-01T00:00:00Z",
                    "2024-01-31T23:00:00Z",
                )],
                observations: vec![
                    observation("open", "2024-01-10T00:00:00Z", Some(21.0)),
                    observation("open", "2024-01-10T01:00:00Z", None),
                    observation("open", "2024-02-10T01:00:00Z", Some(99.0)),
                ],
            },
        )
        .unwrap();

    let coordinate = Coordinate::new(11.576, 48.14).unwrap();
    let window = TimeRange::new(utc("2024-01-09T12:00:00Z"), utc("2024-01-10T12:00:00Z")).unwrap();
    let samples = store.read(&coordinate, &window, "no2").unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(
        samples[0].cell,
        CellRef::Station {
            id: "open".to_string()
        }
    );
    assert_eq!(samples[0].value, Some(21.0));
    assert_eq!(samples[1].value, None);

    let state = store.cache_state().unwrap();
    assert_eq!(state.entries, 2);
    assert_eq!(state.first, Some(jan_2023.start));
    assert_eq!(state.last, Some(jan_2024.end));
}

#[test]
fn station_read_errors() {
    let temp = tempfile::tempdir().unwrap();
    let store = StationStore::new(utf8_dir(&temp).join("stations.sqlite"), 25.0).unwrap();
    let coordinate = Coordinate::new(11.576, 48.14).unwrap();
    let jan_2024 = month("2024-01-01T00:00:00Z", "2024-01-31T23:59:59Z");
    assert_matches!(
        store.read(&coordinate, &jan_2024, "no2"),
        Err(EnviroError::CacheMiss(_))
    );

    store
        .put(
            &jan_2024,
            &munich_box(),
            StationBatch {
                stations: vec![
                    station("open", 11.70, 48.20, "2024-01-01T00:00:00Z", "2024-01-31T23:00:00Z"),
                    station("paris", 2.35, 48.85, "2024-01-01T00:00:00Z", "2024-01-31T23:00:00Z"),
                ],
                observations: vec![observation("open", "2024-01-10T00:00:00Z", Some(21.0))],
            },
        )
        .unwrap();
    assert_eq!(store.stations().unwrap().len(), 1);
    assert!(store.has_range(&jan_2024).unwrap());

    let berlin = Coordinate::new(13.4, 52.5).unwrap();
    assert_matches!(
        store.read(&berlin, &jan_2024, "no2"),
        Err(EnviroError::OutOfDomain(_))
    );
    assert!(store.read(&coordinate, &jan_2024, "pm10").unwrap().is_empty());
}

#[test]
fn station_store_rejects_bad_distance() {
    let temp = tempfile::tempdir().unwrap();
    assert_matches!(
        StationStore::new(utf8_dir(&temp).join("stations.sqlite"), 0.0),
        Err(EnviroError::InvalidConfiguration(_))
    );
}

#[test]
fn raster_layers_answer_every_hour() {
    let temp = tempfile::tempdir().unwrap();
    let store = RasterStore::new(utf8_dir(&temp));
    let extent = BoundingBox::new(10.0, 50.0, 12.0, 51.0).unwrap();
    let window = TimeRange::new(utc("2024-01-01T10:30:00Z"), utc("2024-01-01T12:30:00Z")).unwrap();
    let coordinate = Coordinate::new(10.1, 50.9).unwrap();
    assert_matches!(
        store.read(&coordinate, &window, "elevation"),
        Err(EnviroError::CacheMiss(_))
    );

    store
        .put(
            &window,
            &extent,
            vec![RasterLayer {
                variable: "elevation".to_string(),
                content: DEM.as_bytes().to_vec(),
            }],
        )
        .unwrap();
    assert!(store.has_layer("elevation"));

    let samples = store.read(&coordinate, &window, "elevation").unwrap();
    assert_eq!(samples.len(), 3);
    assert!(samples.iter().all(|sample| sample.value == Some(1.0)));
    assert_eq!(samples[0].cell, CellRef::Pixel { row: 0, col: 0 });

    let nodata = Coordinate::new(10.6, 50.1).unwrap();
    let samples = store.read(&nodata, &window, "elevation").unwrap();
    assert!(samples.iter().all(|sample| sample.value.is_none()));

    let outside = Coordinate::new(13.0, 50.5).unwrap();
    assert_matches!(
        store.read(&outside, &window, "elevation"),
        Err(EnviroError::OutOfDomain(_))
    );
    assert_eq!(store.cache_state().unwrap().entries, 1);

    // A fresh store instance parses the cached file.
    let reopened = RasterStore::new(utf8_dir(&temp));
    let samples = reopened.read(&coordinate, &window, "elevation").unwrap();
    assert_eq!(samples[0].value, Some(1.0));
}

#[test]
fn raster_outside_the_domain_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let store = RasterStore::new(utf8_dir(&temp));
    let window = day_range(jan(1));
    let result = store.put(
        &window,
        &munich_box(),
        vec![RasterLayer {
            variable: "elevation".to_string(),
            content: DEM.as_bytes().to_vec(),
        }],
    );
    assert_matches!(result, Err(EnviroError::Decode(_)));
    assert!(!store.has_layer("elevation"));
}

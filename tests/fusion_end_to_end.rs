use std::collections::BTreeMap;

use bikeprep::{
    decode_csv_rows, load_partition, run_fusion, run_training_split, window_from,
    EmptyResultNotice, FetchWindow, InMemoryReadingStore, LocalObjectStore, ObjectStore,
    PartitionManifest, PartitionName, PipelineConfig, PipelineError, RawReading, Row,
    SchemaError, SqliteReadingStore, UnmatchedPolicy, Value,
};
use chrono::NaiveDate;

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn weather_row(time: &str, temperature: &str) -> RawReading {
    RawReading::weather(row(&[("time", time), ("Temperature", temperature)]))
}

fn window_ending(y: i32, m: u32, d: u32) -> FetchWindow {
    let reference = NaiveDate::from_ymd_opt(y, m, d)
        .expect("valid date")
        .succ_opt()
        .expect("valid successor")
        .and_hms_opt(6, 0, 0)
        .expect("valid time");
    window_from(reference, 13, 1)
}

#[test]
fn two_entities_one_weather_hour_yield_two_single_row_partitions() {
    let store = InMemoryReadingStore::new(
        vec![
            row(&[("stationId", "BIKE1"), ("timestamp", "2023-09-10T08:00:00")]),
            row(&[("stationId", "STATION1"), ("timestamp", "2023-09-10T08:00:00")]),
        ],
        10,
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = LocalObjectStore::new(dir.path());
    let config = PipelineConfig::default();
    let window = window_ending(2023, 9, 10);

    let outcome = run_fusion(
        &config,
        &window,
        &store,
        vec![weather_row("2023-09-10T08:00:00", "15")],
        &objects,
    )
    .expect("fusion should succeed");

    assert_eq!(outcome.partitions.len(), 2);
    for name in PartitionName::ALL {
        let part = &outcome.partitions[&name];
        assert_eq!(part.len(), 1, "{name}");
        let record = &part.dataset.records[0];
        assert_eq!(record.value("Temperature"), Value::Int(15));

        let range = part.date_range.expect("non-empty partition has a range");
        let day = NaiveDate::from_ymd_opt(2023, 9, 10).unwrap();
        assert_eq!((range.min_date, range.max_date), (day, day));
    }
    assert_eq!(
        outcome.partitions[&PartitionName::SingleBikes].dataset.records[0].entity_id,
        "BIKE1"
    );
    assert!(outcome.report.notices.is_empty());

    let bytes = objects
        .get(
            "bikeprep",
            "processed_data/single_bikes/2023-09-10-2023-09-10/SingleBikes.csv",
        )
        .expect("partition csv persisted");
    let rows = decode_csv_rows(&bytes).expect("csv decodes");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["stationId"], "BIKE1");
    assert_eq!(rows[0]["Temperature"], "15");
    assert_eq!(rows[0]["IsWeekend"], "1");
    assert!(!rows[0].contains_key("timestamp_x"));
    assert!(!rows[0].contains_key("Time_of_Day"));

    let manifest: PartitionManifest = serde_json::from_slice(
        &objects
            .get(
                "bikeprep",
                "processed_data/station_bikes/2023-09-10-2023-09-10/manifest.json",
            )
            .expect("manifest persisted"),
    )
    .expect("manifest parses");
    assert_eq!(manifest.rows, 1);
    assert_eq!(manifest.schema_fingerprint.len(), 64);

    assert!(objects
        .get(
            "bikeprep",
            "graphs_data/station_bikes/2023-09-10-2023-09-10/data.json"
        )
        .is_ok());
}

#[test]
fn empty_window_is_a_notice_and_writes_nothing() {
    let store = InMemoryReadingStore::new(
        vec![row(&[("stationId", "S1"), ("timestamp", "2020-01-01T00:00:00")])],
        10,
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = LocalObjectStore::new(dir.path());

    let outcome = run_fusion(
        &PipelineConfig::default(),
        &window_ending(2023, 9, 10),
        &store,
        Vec::new(),
        &objects,
    )
    .expect("no data is not an error");

    assert_eq!(outcome.report.notices, vec![EmptyResultNotice::NoBikeReadings]);
    assert!(outcome.partitions.is_empty());
    assert!(!dir.path().join("bikeprep").exists());
}

#[test]
fn missing_weather_and_empty_partition_are_reported() {
    let store = InMemoryReadingStore::new(
        vec![row(&[("stationId", "S1"), ("timestamp", "2023-09-09T10:15:00")])],
        10,
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = LocalObjectStore::new(dir.path());

    let outcome = run_fusion(
        &PipelineConfig::default(),
        &window_ending(2023, 9, 10),
        &store,
        Vec::new(),
        &objects,
    )
    .expect("fusion should succeed");

    assert_eq!(
        outcome.report.notices,
        vec![
            EmptyResultNotice::NoWeatherReadings,
            EmptyResultNotice::EmptyPartition(PartitionName::SingleBikes),
        ]
    );
    let stations = &outcome.partitions[&PartitionName::Stations];
    assert_eq!(stations.dataset.records[0].value("Temperature"), Value::Null);
}

#[test]
fn drop_policy_removes_rows_without_weather() {
    let store = InMemoryReadingStore::new(
        vec![
            row(&[("stationId", "S1"), ("timestamp", "2023-09-10T08:10:00")]),
            row(&[("stationId", "S2"), ("timestamp", "2023-09-10T11:10:00")]),
        ],
        1,
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = LocalObjectStore::new(dir.path());
    let config = PipelineConfig {
        unmatched: UnmatchedPolicy::Drop,
        ..PipelineConfig::default()
    };

    let outcome = run_fusion(
        &config,
        &window_ending(2023, 9, 10),
        &store,
        vec![weather_row("2023-09-10T08:00", "12.5")],
        &objects,
    )
    .expect("fusion should succeed");

    let stations = &outcome.partitions[&PartitionName::Stations];
    assert_eq!(stations.len(), 1);
    assert_eq!(stations.dataset.records[0].entity_id, "S1");
    assert_eq!(outcome.report.merge.as_ref().map(|m| m.dropped_rows), Some(1));
}

fn sqlite_fixture(dir: &std::path::Path) -> SqliteReadingStore {
    let mut store =
        SqliteReadingStore::open(&dir.join("readings.sqlite"), 3).expect("sqlite store opens");
    let mut readings = Vec::new();
    for day in 1..=10u32 {
        for (idx, station) in ["STATION1", "STATION2", "BIKE9"].iter().enumerate() {
            let mut attributes = BTreeMap::new();
            let ids: Vec<String> = (0..(day as usize + idx)).map(|n| format!("b{n}")).collect();
            attributes.insert(
                "BikeIds".to_string(),
                format!("[{}]", ids.iter().map(|id| format!("'{id}'")).collect::<Vec<_>>().join(", ")),
            );
            attributes.insert("AvailableBikes".to_string(), (day + idx as u32).to_string());
            readings.push(RawReading {
                entity_id: station.to_string(),
                timestamp: Some(format!("2023-09-{day:02}T07:30:00")),
                attributes,
            });
        }
    }
    store.upsert_readings(&readings).expect("fixture inserts");
    store
}

fn fixture_weather() -> Vec<RawReading> {
    (1..=10u32)
        .map(|day| weather_row(&format!("2023-09-{day:02}T07:00"), &format!("{}.5", 10 + day)))
        .collect()
}

#[test]
fn sqlite_store_feeds_fusion_and_seeded_split() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = sqlite_fixture(dir.path());
    let objects = LocalObjectStore::new(dir.path().join("objects"));
    let config = PipelineConfig::default();
    let window = window_ending(2023, 9, 10);

    let outcome = run_fusion(&config, &window, &store, fixture_weather(), &objects)
        .expect("fusion should succeed");
    let stations = &outcome.partitions[&PartitionName::Stations];
    assert_eq!(stations.len(), 20);
    assert_eq!(stations.dataset.records[0].total_available_bikes, Some(1));
    assert_eq!(stations.dataset.records[0].value("Temperature"), Value::Float(11.5));

    let first = run_training_split(&config, &outcome.partitions, &objects).expect("split runs");
    let second = run_training_split(&config, &outcome.partitions, &objects).expect("split runs");
    assert_eq!(first, second);

    let station_split = first
        .persisted
        .iter()
        .find(|split| split.name == PartitionName::Stations)
        .expect("stations split persisted");
    assert_eq!((station_split.train_rows, station_split.test_rows), (16, 4));

    let y_test = decode_csv_rows(
        &objects
            .get(
                "bikeprep",
                "training/test/2023-09-01-2023-09-10/station_bikes/y_test.csv",
            )
            .expect("y_test persisted"),
    )
    .expect("csv decodes");
    assert_eq!(y_test.len(), 4);
    assert!(y_test[0].contains_key("TotalAvailableBikes"));

    let x_train = decode_csv_rows(
        &objects
            .get(
                "bikeprep",
                "training/train/2023-09-01-2023-09-10/station_bikes/X_train.csv",
            )
            .expect("X_train persisted"),
    )
    .expect("csv decodes");
    assert_eq!(x_train.len(), 16);
    assert!(!x_train[0].contains_key("TotalAvailableBikes"));
}

#[test]
fn persisted_partition_reloads_with_typed_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = sqlite_fixture(dir.path());
    let objects = LocalObjectStore::new(dir.path().join("objects"));
    let config = PipelineConfig::default();

    let outcome = run_fusion(&config, &window_ending(2023, 9, 10), &store, fixture_weather(), &objects)
        .expect("fusion should succeed");
    let persisted_part = &outcome.partitions[&PartitionName::SingleBikes];
    let range = persisted_part.date_range.expect("bikes present");

    let reloaded =
        load_partition(&config, &objects, PartitionName::SingleBikes, range).expect("reloads");
    assert_eq!(reloaded.len(), persisted_part.len());
    assert_eq!(reloaded.dataset.header(), persisted_part.dataset.header());
    for (a, b) in reloaded.dataset.records.iter().zip(&persisted_part.dataset.records) {
        assert_eq!(a.entity_id, b.entity_id);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.is_weekend, b.is_weekend);
        assert_eq!(a.total_available_bikes, b.total_available_bikes);
    }
}

#[test]
fn split_requires_target_column() {
    let store = InMemoryReadingStore::new(
        vec![
            row(&[("stationId", "S1"), ("timestamp", "2023-09-10T08:00:00")]),
            row(&[("stationId", "S2"), ("timestamp", "2023-09-10T09:00:00")]),
        ],
        10,
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = LocalObjectStore::new(dir.path());
    let config = PipelineConfig::default();

    let outcome = run_fusion(&config, &window_ending(2023, 9, 10), &store, Vec::new(), &objects)
        .expect("fusion should succeed");
    let err = run_training_split(&config, &outcome.partitions, &objects)
        .expect_err("no BikeIds means no target column");
    assert!(matches!(
        err,
        PipelineError::Split(bikeprep::SplitError::Schema(SchemaError::MissingColumn { .. }))
    ));
}

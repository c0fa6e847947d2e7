//! End-to-end queries against an on-disk dataset fixture.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Value as Json, json};
use soundscape::store::{Column, TableView, write_table};
use soundscape::umap::ScalerConfig;
use soundscape::{Catalogue, CatalogueOptions, Dispatcher, Payload};

const HOUR: i64 = 3_600_000_000;
/// 2023-01-01T00:00:00Z in microseconds
const DAY0: i64 = 1_672_531_200_000_000;

fn table(fields: Vec<(&str, Column)>) -> TableView {
    TableView::new(fields.into_iter().map(|(n, c)| (n.to_string(), c)).collect()).unwrap()
}

fn utc(values: Vec<i64>) -> Column {
    Column::Timestamp {
        values: values.into_iter().map(Some).collect(),
        tz: Some("UTC".into()),
    }
}

fn strings(values: &[&str]) -> Column {
    Column::Utf8(values.iter().map(|s| Some(s.to_string())).collect())
}

fn write_species(root: &Path) {
    let species = table(vec![
        ("scientific_name", strings(&["Turdus merula", "Erithacus rubecula", "Parus major"])),
        ("common_name", strings(&["Blackbird", "Robin", "Great Tit"])),
        ("trophic_niche", strings(&["Omnivore", "Invertivore", "Invertivore"])),
        ("habitat_type", strings(&["Woodland", "Woodland", "Forest"])),
    ]);
    write_table(&root.join("species_table.parquet"), &species).unwrap();
}

/// Dataset `X`: two sites, three days, one clip per site per day.
fn write_dataset(dir: &Path) {
    std::fs::create_dir_all(dir.join("umap")).unwrap();
    std::fs::write(
        dir.join("config"),
        "[Dataset]\nname = X\nid = x-001\naudio_path = /audio/x\n\n\
         [Site Hierarchy]\nsitelevel_1 = Region\n",
    )
    .unwrap();

    let locations = table(vec![
        ("site_id", Column::Int64(vec![Some(1), Some(2)])),
        ("site_name", strings(&["site_a", "site_b"])),
        ("latitude", Column::Float64(vec![Some(50.1), Some(50.2)])),
        ("longitude", Column::Float64(vec![Some(-3.5), Some(-3.6)])),
        ("timezone", strings(&["UTC", "UTC"])),
    ]);
    write_table(&dir.join("locations_table.parquet"), &locations).unwrap();

    // site 1 records at 06:00, site 2 at 07:00, on Jan 1-3
    let mut stamps = Vec::new();
    let mut sites = Vec::new();
    for day in 0..3 {
        for (site, hour) in [(1, 6), (2, 7)] {
            stamps.push(DAY0 + day * 24 * HOUR + hour * HOUR);
            sites.push(Some(site));
        }
    }
    let ids: Vec<Option<i64>> = (1..=6).map(Some).collect();
    let files = table(vec![
        ("file_id", Column::Int64(ids.clone())),
        ("site_id", Column::Int64(sites.clone())),
        (
            "file_path",
            Column::Utf8((1..=6).map(|i| Some(format!("/audio/x/{i}.wav"))).collect()),
        ),
        ("timestamp", utc(stamps.clone())),
        ("sample_rate", Column::Int64(vec![Some(48_000); 6])),
        // file 6 is a 30 s clip
        (
            "duration",
            Column::Float64(vec![Some(60.0), Some(60.0), Some(60.0), Some(60.0), Some(60.0), Some(30.0)]),
        ),
        ("valid", Column::Boolean(vec![Some(true); 6])),
    ]);
    write_table(&dir.join("files_table.parquet"), &files).unwrap();

    let weather = table(vec![
        ("site_id", Column::Int64(sites.clone())),
        ("timestamp", utc(stamps.clone())),
        (
            "temperature_2m",
            Column::Float64(vec![Some(1.5), Some(2.0), Some(-0.5), Some(3.25), Some(4.0), Some(0.0)]),
        ),
        ("rain", Column::Float64(vec![Some(0.0), Some(0.2), Some(0.0), Some(1.0), None, Some(0.0)])),
    ]);
    write_table(&dir.join("weather_table.parquet"), &weather).unwrap();

    // two segments per clip
    let mut f_ids = Vec::new();
    let mut segments = Vec::new();
    let mut bai = Vec::new();
    let mut aci = Vec::new();
    for id in 1..=6i64 {
        for seg in 0..2i64 {
            f_ids.push(Some(id));
            segments.push(Some(seg));
            bai.push(Some((id * 2 + seg) as f64 / 8.0));
            aci.push(Some(100.0 + (id * seg) as f64));
        }
    }
    let features = table(vec![
        ("file_id", Column::Int64(f_ids)),
        ("segment_id", Column::Int64(segments)),
        ("bioacoustic index", Column::Float64(bai)),
        ("aci", Column::Float64(aci)),
    ]);
    write_table(&dir.join("recording_acoustic_features_table.parquet"), &features).unwrap();

    let detections: &[(i64, f64, &str, f64)] = &[
        (1, 0.0, "Turdus merula", 0.95),
        (1, 0.0, "Turdus merula", 0.85),
        (1, 3.0, "Erithacus rubecula", 0.6),
        (2, 0.0, "Parus major", 0.9),
        (2, 0.0, "Turdus merula", 0.55),
        (3, 6.0, "Erithacus rubecula", 0.82),
        (4, 0.0, "Parus major", 0.51),
        (5, 3.0, "Turdus merula", 0.99),
        (6, 0.0, "Erithacus rubecula", 0.7),
    ];
    let detections = table(vec![
        ("file_id", Column::Int64(detections.iter().map(|d| Some(d.0)).collect())),
        ("start_time", Column::Float64(detections.iter().map(|d| Some(d.1)).collect())),
        ("end_time", Column::Float64(detections.iter().map(|d| Some(d.1 + 3.0)).collect())),
        ("species", Column::Utf8(detections.iter().map(|d| Some(d.2.to_string())).collect())),
        ("confidence", Column::Float64(detections.iter().map(|d| Some(d.3)).collect())),
    ]);
    write_table(&dir.join("birdnet_species_probs_table.parquet"), &detections).unwrap();

    let scaler = ScalerConfig {
        feature_names: vec!["aci".into(), "bioacoustic index".into()],
        center: vec![100.0, 0.5],
        scale: vec![2.0, 0.25],
    };
    std::fs::write(dir.join("umap/config"), scaler.to_pickle().unwrap()).unwrap();
    std::fs::write(
        dir.join("umap/encoder.json"),
        r#"{"layers": [
            {"weights": [[1.0, 0.5], [-0.5, 1.0], [0.2, 0.2]], "bias": [0.0, 0.1, 0.0], "activation": "relu"},
            {"weights": [[1.0, 0.0, 1.0], [0.0, 1.0, -1.0]], "bias": [0.0, 0.0]}
        ]}"#,
    )
    .unwrap();
}

fn fixture() -> (tempfile::TempDir, Dispatcher) {
    let root = tempfile::tempdir().unwrap();
    write_species(root.path());
    write_dataset(&root.path().join("x"));
    let catalogue = Catalogue::open(root.path(), CatalogueOptions::default()).unwrap();
    (root, Dispatcher::new(Arc::new(catalogue)))
}

fn payload(value: Json) -> Payload {
    match value {
        Json::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

fn rows(value: &Json) -> &Vec<Json> {
    value.as_array().expect("expected a list of records")
}

fn column_set(rows: &[Json], column: &str) -> BTreeSet<String> {
    rows.iter().map(|r| r[column].to_string()).collect()
}

fn set_of(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_empty_root_lists_no_datasets() {
    let root = tempfile::tempdir().unwrap();
    let catalogue = Catalogue::discover(root.path(), CatalogueOptions::default()).unwrap();
    let d = Dispatcher::new(Arc::new(catalogue));
    assert_eq!(d.dispatch("fetch_datasets", Json::Null, &Payload::new()), json!([]));
}

#[test]
fn test_fetch_datasets() {
    let (_root, d) = fixture();
    assert_eq!(d.dispatch("fetch_datasets", Json::Null, &Payload::new()), json!(["X"]));
    assert_eq!(
        d.dispatch("set_current_dataset", Json::Null, &payload(json!({"dataset_name": "X"}))),
        json!("X")
    );
}

#[test]
fn test_dataset_config_exposes_site_hierarchy() {
    let (_root, d) = fixture();
    let config = d.dispatch("fetch_dataset_config", Json::Null, &payload(json!({"dataset_name": "X"})));
    assert_eq!(config["Site Hierarchy"]["sitelevel_1"], "Region");
    assert_eq!(config["Dataset"]["id"], "x-001");
}

#[test]
fn test_fetch_files_by_dates_and_location() {
    let (_root, d) = fixture();
    let result = d.dispatch(
        "fetch_files",
        Json::Null,
        &payload(json!({
            "dataset_name": "X",
            "dates": ["2023-01-01", "2023-01-02"],
            "locations": ["X/site_a"],
        })),
    );
    let rows = rows(&result);
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row["site_name"], "site_a");
        let date = row["date"].as_str().unwrap();
        assert!(("2023-01-01"..="2023-01-02").contains(&date), "{date}");
        assert!(row["timestamp"].as_str().unwrap().starts_with(date));
    }
}

#[test]
fn test_files_view_joins_weather_at_nearest_hour() {
    let (_root, d) = fixture();
    let result = d.dispatch(
        "fetch_files",
        Json::Null,
        &payload(json!({"dataset_name": "X", "columns": ["file_id", "temperature_2m"]})),
    );
    let temps: Vec<&Json> = rows(&result).iter().map(|r| &r["temperature_2m"]).collect();
    assert_eq!(temps, vec![&json!(1.5), &json!(2.0), &json!(-0.5), &json!(3.25), &json!(4.0), &json!(0.0)]);

    let weather = d.dispatch(
        "fetch_file_weather",
        Json::Null,
        &payload(json!({"dataset_name": "X", "file_id": 4})),
    );
    assert_eq!(weather["temperature_2m"], json!(3.25));
    assert_eq!(weather["rain"], json!(1.0));
}

#[test]
fn test_weather_filter_keeps_missing_readings() {
    let (_root, d) = fixture();
    let result = d.dispatch(
        "fetch_files",
        Json::Null,
        &payload(json!({"dataset_name": "X", "weather_filters": {"rain": [0.0, 0.5]}})),
    );
    let ids = column_set(rows(&result), "file_id");
    // file 4 has 1.0mm of rain; file 5 has no reading
    assert_eq!(ids, set_of(&["1", "2", "3", "5", "6"]));
}

#[test]
fn test_site_filter_soundness() {
    let (_root, d) = fixture();
    let locations = d.dispatch("fetch_locations", Json::Null, &payload(json!({"dataset_name": "X"})));
    let allowed: BTreeSet<String> = rows(&locations)
        .iter()
        .filter(|r| r["site"] == "X/site_b")
        .map(|r| r["site_id"].to_string())
        .collect();
    let files = d.dispatch(
        "fetch_files",
        Json::Null,
        &payload(json!({"dataset_name": "X", "locations": ["X/site_b"]})),
    );
    let seen = column_set(rows(&files), "site_id");
    assert!(!seen.is_empty());
    assert!(seen.is_subset(&allowed));

    // the dataset root selects every site
    let all = d.dispatch(
        "fetch_files",
        Json::Null,
        &payload(json!({"dataset_name": "X", "locations": ["X"]})),
    );
    assert_eq!(rows(&all).len(), 6);
}

#[test]
fn test_file_exclusions() {
    let (_root, d) = fixture();
    let result = d.dispatch(
        "fetch_files",
        Json::Null,
        &payload(json!({"dataset_name": "X", "file_filters": {"sel-1": [2, 3], "sel-2": [3]}})),
    );
    let ids = column_set(rows(&result), "file_id");
    // any exclusion also drops clips shorter than a minute (file 6)
    assert_eq!(ids, set_of(&["1", "4", "5"]));
}

#[test]
fn test_umap_projection_matches_filtered_features() {
    let (root, d) = fixture();
    let p = payload(json!({
        "dataset_name": "X",
        "current_feature": ["bioacoustic index", [0.0, 1.0]],
    }));
    let features = d.dispatch("fetch_acoustic_features", json!([]), &p);
    let projected = d.dispatch("fetch_acoustic_features_umap", json!([]), &p);
    let features = rows(&features);
    let projected = rows(&projected);
    assert!(!features.is_empty());
    assert!(features.len() < 12);
    assert_eq!(projected.len(), features.len());
    for row in projected {
        assert!(row["x"].is_f64());
        assert!(row["y"].is_f64());
        assert!(row["bioacoustic index"].as_f64().unwrap() <= 1.0);
    }

    let spilled: Vec<_> = std::fs::read_dir(root.path().join("x/views"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("umap_projection_"))
        .collect();
    assert_eq!(spilled.len(), 1);
}

#[test]
fn test_umap_without_model_returns_default() {
    let (root, d) = fixture();
    std::fs::remove_dir_all(root.path().join("x/umap")).unwrap();
    let p = payload(json!({"dataset_name": "X"}));
    assert_eq!(d.dispatch("fetch_acoustic_features_umap", json!("none"), &p), json!("none"));
}

#[test]
fn test_richness_is_monotone_in_threshold() {
    let (_root, d) = fixture();
    // the only dataset may be left implicit
    let at = |threshold: f64| {
        let result = d.dispatch(
            "species_richness",
            Json::Null,
            &payload(json!({"threshold": threshold, "group_by": ["hour_continuous"]})),
        );
        rows(&result)
            .iter()
            .map(|r| (r["hour_continuous"].as_i64().unwrap(), r["richness"].as_i64().unwrap()))
            .collect::<std::collections::BTreeMap<_, _>>()
    };
    let low = at(0.5);
    let high = at(0.8);
    assert_eq!(low.get(&6), Some(&2));
    assert_eq!(low.get(&7), Some(&3));
    for (hour, r2) in &high {
        assert!(low[hour] >= *r2, "hour {hour}");
    }
    assert_eq!(high.get(&7), Some(&1));
}

#[test]
fn test_abundance_counts_overlapping_detections() {
    let (_root, d) = fixture();
    let result = d.dispatch(
        "species_abundance",
        Json::Null,
        &payload(json!({"dataset_name": "X", "threshold": 0.5, "group_by": ["file_id"]})),
    );
    let by_file: Vec<(i64, i64)> = rows(&result)
        .iter()
        .map(|r| (r["file_id"].as_i64().unwrap(), r["abundance"].as_i64().unwrap()))
        .collect();
    assert_eq!(by_file, vec![(1, 3), (2, 2), (3, 1), (4, 1), (5, 1), (6, 1)]);
}

fn per_file(result: &Json, column: &str) -> Vec<(i64, i64)> {
    rows(result)
        .iter()
        .map(|r| (r["file_id"].as_i64().unwrap(), r[column].as_i64().unwrap()))
        .collect()
}

#[test]
fn test_weather_filter_restricts_detection_views() {
    let (_root, d) = fixture();
    let p = payload(json!({
        "dataset_name": "X",
        "threshold": 0.5,
        "group_by": ["file_id"],
        "weather_filters": {"temperature_2m": [1.0, 3.5]},
    }));
    // files 1, 2 and 4 are between 1.0 and 3.5 degrees
    let richness = d.dispatch("species_richness", Json::Null, &p);
    assert_eq!(per_file(&richness, "richness"), vec![(1, 2), (2, 2), (4, 1)]);
    let abundance = d.dispatch("species_abundance", Json::Null, &p);
    assert_eq!(per_file(&abundance, "abundance"), vec![(1, 3), (2, 2), (4, 1)]);

    let detections = d.dispatch("fetch_birdnet_species", Json::Null, &p);
    assert_eq!(column_set(rows(&detections), "file_id"), set_of(&["1", "2", "4"]));
}

#[test]
fn test_exclusions_restrict_detection_views() {
    let (_root, d) = fixture();
    let p = payload(json!({
        "dataset_name": "X",
        "threshold": 0.5,
        "group_by": ["file_id"],
        "file_filters": {"sel-1": [2]},
    }));
    // file 2 is excluded outright, file 6 is under 60 s
    let richness = d.dispatch("species_richness", Json::Null, &p);
    assert_eq!(per_file(&richness, "richness"), vec![(1, 2), (3, 1), (4, 1), (5, 1)]);
    let abundance = d.dispatch("species_abundance", Json::Null, &p);
    assert_eq!(per_file(&abundance, "abundance"), vec![(1, 3), (3, 1), (4, 1), (5, 1)]);

    // without an exclusion the short clip still counts
    let all = d.dispatch(
        "species_richness",
        Json::Null,
        &payload(json!({"dataset_name": "X", "threshold": 0.5, "group_by": ["file_id"]})),
    );
    assert_eq!(per_file(&all, "richness").len(), 6);
}

#[test]
fn test_cache_stability() {
    let (_root, d) = fixture();
    let p = payload(json!({"dataset_name": "X", "threshold": 0.6, "group_by": ["site_id"]}));
    let first = d.dispatch("species_richness", Json::Null, &p);
    d.dispatch("species_abundance", Json::Null, &p);
    d.dispatch("fetch_files", Json::Null, &payload(json!({"dataset_name": "X"})));
    d.dispatch(
        "species_richness",
        Json::Null,
        &payload(json!({"dataset_name": "X", "threshold": 0.9, "group_by": ["site_id"]})),
    );
    let second = d.dispatch("species_richness", Json::Null, &p);
    assert_eq!(first, second);
    assert!(!rows(&first).is_empty());
}

#[test]
fn test_set_dataset_config_persists_labels() {
    let (root, d) = fixture();
    let p = payload(json!({"dataset_name": "X", "site_labels": ["Region", "Site"]}));
    assert_ne!(d.dispatch("set_dataset_config", Json::Null, &p), Json::Null);

    let config = d.dispatch("fetch_dataset_config", Json::Null, &payload(json!({"dataset_name": "X"})));
    assert_eq!(config["Site Hierarchy"]["sitelevel_1"], "Region");
    assert_eq!(config["Site Hierarchy"]["sitelevel_2"], "Site");

    let on_disk = std::fs::read_to_string(root.path().join("x/config")).unwrap();
    assert!(on_disk.contains("sitelevel_1 = Region"));
    assert!(on_disk.contains("sitelevel_2 = Site"));
}

#[test]
fn test_species_list_round_trip() {
    let (_root, d) = fixture();
    let p = payload(json!({"dataset_name": "X", "species_list": ["Parus major", "Turdus merula"]}));
    d.dispatch("set_species_list", Json::Null, &p);
    let species = d.dispatch("fetch_species", Json::Null, &payload(json!({"dataset_name": "X"})));
    assert_eq!(species["selected"], json!(["Parus major", "Turdus merula"]));
    assert_eq!(rows(&species["species"]).len(), 3);
}

#[test]
fn test_species_filter_applies_to_detections() {
    let (_root, d) = fixture();
    let result = d.dispatch(
        "fetch_birdnet_species",
        Json::Null,
        &payload(json!({"dataset_name": "X", "species": ["Parus major"], "threshold": 0.6})),
    );
    let rows = rows(&result);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["species"], "Parus major");
    assert_eq!(rows[0]["common_name"], "Great Tit");
}

#[test]
fn test_sites_tree() {
    let (_root, d) = fixture();
    let tree = d.dispatch("fetch_dataset_sites_tree", Json::Null, &payload(json!({"dataset_name": "X"})));
    assert_eq!(tree["name"], "X");
    let children: Vec<&str> = tree["children"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(children, vec!["site_a", "site_b"]);
}

#[test]
fn test_option_coverage() {
    let (_root, d) = fixture();
    let p = payload(json!({"dataset_name": "X"}));
    let options = d.dispatch("fetch_dataset_options", Json::Null, &p);
    let files = d.dispatch("fetch_files", Json::Null, &p);
    let files = rows(&files);
    let options = options.as_object().unwrap();
    assert!(options.contains_key("site_name"));
    assert!(options.contains_key("bioacoustic index"));
    assert_eq!(options["sitelevel_1"]["label"], "Region");

    for (column, option) in options {
        if !files[0].as_object().unwrap().contains_key(column) {
            continue;
        }
        let observed: Vec<&Json> = files.iter().map(|r| &r[column]).filter(|v| !v.is_null()).collect();
        match option["type"].as_str().unwrap() {
            "categorical" => {
                let order: BTreeSet<String> = option["order"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(Json::to_string)
                    .collect();
                let seen: BTreeSet<String> = observed.iter().map(|v| v.to_string()).collect();
                assert_eq!(order, seen, "{column}");
                assert_eq!(option["order"].as_array().unwrap().len(), seen.len(), "{column}");
            }
            "continuous" => {
                let values: Vec<f64> = observed.iter().filter_map(|v| v.as_f64()).collect();
                let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let (min, max) = (option["min"].as_f64().unwrap(), option["max"].as_f64().unwrap());
                assert!(min <= lo && lo <= hi && hi <= max, "{column}: {min} {lo} {hi} {max}");
            }
            other => panic!("unexpected option type {other}"),
        }
    }
}

#[test]
fn test_failures_return_default() {
    let (_root, d) = fixture();
    let cases = [
        ("fetch_files", json!({"dataset_name": "X", "locations": ["Y/nowhere"]})),
        ("fetch_files", json!({"dataset_name": "X", "dates": ["2023-02-01", "2023-01-01"]})),
        ("fetch_files", json!({"dataset_name": "Nope"})),
        ("fetch_acoustic_features", json!({"dataset_name": "X", "current_feature": ["ndsi", [0.0, 1.0]]})),
        ("species_richness", json!({"dataset_name": "X", "threshold": 0.5, "group_by": ["no_such_column"]})),
        ("species_richness", json!({"dataset_name": "X"})),
        ("fetch_file_weather", json!({"dataset_name": "X", "file_id": 99})),
        ("no_such_endpoint", json!({})),
    ];
    for (endpoint, p) in cases {
        assert_eq!(
            d.dispatch(endpoint, json!({"default": true}), &payload(p.clone())),
            json!({"default": true}),
            "{endpoint} {p}"
        );
    }
}

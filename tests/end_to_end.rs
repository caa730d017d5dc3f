use std::{fs, path::Path, process::Command};

use ndarray::Array3;
use serde_json::json;
use zarrs_multiscale::{
    Error,
    config::RunConfig,
    convert::{self, ItemMetadata},
    storage::{GroupPath, MANIFEST_NAME, StoreRoot},
};

mod common;
use common::{SPACING, binary, open_array, ramp, tmp_dir, worker_launcher, write_npy};

const SHAPE: [usize; 3] = [32, 32, 4];

/// Write clusters A, B and C as `.npy` files under `dir`.
fn write_clusters(dir: &Path) -> Vec<Array3<u16>> {
    ["A", "B", "C"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let data = ramp(SHAPE, 100 * i as u16);
            write_npy(&dir.join(format!("{name}.npy")), &data);
            data
        })
        .collect()
}

fn source(dir: &Path, name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "path": dir.join(format!("{name}.npy")),
        "spacing": SPACING,
    })
}

fn read_u16(store: &Path, path: &str) -> Vec<u16> {
    let array = open_array(store, path);
    array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data")
}

fn read_u64(store: &Path, path: &str) -> Vec<u64> {
    let array = open_array(store, path);
    array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data")
}

#[test]
fn test_clusters_and_classes() {
    let tmp = tmp_dir();
    let dir = tmp.path();
    let clusters = write_clusters(dir);
    fs::write(dir.join("clusters.csv"), "raw,name\nA.npy,a\n").expect("write manifest");
    let store_dir = dir.join("out.zarr");

    let config: RunConfig = serde_json::from_value(json!({
        "output_dir": store_dir,
        "workers": 2,
        "settings": { "downscale": 2, "cutoff": 16, "chunk_cap": 8 },
        "groups": [{
            "prefix": "clusters",
            "manifest": dir.join("clusters.csv"),
            "sources": [source(dir, "A"), source(dir, "B"), source(dir, "C")],
        }],
        "aggregates": [{
            "prefix": "classes",
            "members": { "class1": ["A", "B"], "class2": ["D", "E"] },
        }],
        "metadata_path": dir.join("catalog.json"),
    }))
    .expect("valid configuration");

    let report = convert::run(&config, worker_launcher()).expect("run succeeds");
    let mut written = report.written.clone();
    written.sort();
    assert_eq!(
        written,
        vec![
            "/classes/class1",
            "/clusters/A",
            "/clusters/B",
            "/clusters/C"
        ]
    );

    let store = StoreRoot::open(&store_dir).expect("open store");
    assert_eq!(
        store.children(&GroupPath::root()).expect("list"),
        vec!["classes", "clusters"]
    );
    let classes = GroupPath::parse("classes").expect("valid");
    assert_eq!(store.children(&classes).expect("list"), vec!["class1"]);
    let a = GroupPath::parse("clusters/A").expect("valid");
    assert_eq!(
        store.children(&a).expect("list"),
        vec!["0.01_0.01_0.2", "0.02_0.02_0.2"]
    );

    for (name, data) in ["A", "B", "C"].iter().zip(clusters.iter()) {
        let stored = read_u16(&store_dir, &format!("/clusters/{name}/0.01_0.01_0.2"));
        assert_eq!(stored, data.iter().copied().collect::<Vec<_>>());
    }
    let class1 = read_u64(&store_dir, "/classes/class1/0.01_0.01_0.2");
    let expected: Vec<u64> = clusters[0]
        .iter()
        .zip(clusters[1].iter())
        .map(|(&a, &b)| a as u64 + b as u64)
        .collect();
    assert_eq!(class1, expected);
    let smaller = open_array(&store_dir, "/classes/class1/0.02_0.02_0.2");
    assert_eq!(smaller.shape(), &[16, 16, 4]);

    assert_eq!(
        fs::read(store_dir.join("clusters").join(MANIFEST_NAME)).expect("manifest copied"),
        fs::read(dir.join("clusters.csv")).expect("read manifest")
    );

    let catalog: std::collections::BTreeMap<String, ItemMetadata> =
        serde_json::from_slice(&fs::read(dir.join("catalog.json")).expect("read catalog"))
            .expect("parse catalog");
    assert_eq!(catalog.len(), 4);
    assert_eq!(catalog["/classes/class1"].paths.len(), 2);
    assert!((catalog["/clusters/C"].z_mm - 0.2).abs() < 1e-12);
}

#[test]
fn test_failures_are_reported_and_siblings_written() {
    let tmp = tmp_dir();
    let dir = tmp.path();
    write_clusters(dir);
    let mut odd = source(dir, "C");
    odd["spacing"] = json!([0.02, 0.01, 0.2]);
    let store_dir = dir.join("out.zarr");

    let config: RunConfig = serde_json::from_value(json!({
        "output_dir": store_dir,
        "workers": 3,
        "groups": [{
            "sources": [source(dir, "A"), source(dir, "B"), odd, source(dir, "missing")],
        }],
        "aggregates": [{
            "prefix": "classes",
            "members": { "good": ["A", "B"], "bad": ["A", "C"] },
        }],
    }))
    .expect("valid configuration");

    let failures = match convert::run(&config, worker_launcher()) {
        Err(Error::WorkersFailed(failures)) => failures,
        other => panic!("expected failed workers, got {other:?}"),
    };
    let mut items: Vec<_> = failures.iter().map(|f| f.item.as_str()).collect();
    items.sort();
    assert_eq!(items, vec!["/classes/bad", "/missing"]);
    let bad = failures
        .iter()
        .find(|f| f.item == "/classes/bad")
        .expect("bad composite");
    assert!(bad.cause.contains("cannot sum"), "{}", bad.cause);

    let store = StoreRoot::open(&store_dir).expect("open store");
    assert_eq!(
        store.children(&GroupPath::root()).expect("list"),
        vec!["A", "B", "C", "classes"]
    );
    let classes = GroupPath::parse("classes").expect("valid");
    assert_eq!(store.children(&classes).expect("list"), vec!["good"]);
}

#[test]
fn test_invalid_configuration_touches_nothing() {
    let tmp = tmp_dir();
    let dir = tmp.path();
    write_clusters(dir);
    let store_dir = dir.join("out.zarr");
    fs::create_dir(&store_dir).expect("create dir");
    fs::write(store_dir.join("keep.txt"), "x").expect("write file");

    let config: RunConfig = serde_json::from_value(json!({
        "output_dir": store_dir,
        "clobber": true,
        "groups": [{ "sources": [source(dir, "A"), source(dir, "A")] }],
    }))
    .expect("parses");
    assert!(matches!(
        convert::run(&config, worker_launcher()),
        Err(Error::DuplicateName(_))
    ));

    let config: RunConfig = serde_json::from_value(json!({
        "output_dir": store_dir,
        "clobber": true,
        "settings": { "chunk_cap": 0 },
        "groups": [{ "sources": [source(dir, "A")] }],
    }))
    .expect("parses");
    assert!(matches!(
        convert::run(&config, worker_launcher()),
        Err(Error::Config(_))
    ));
    assert!(store_dir.join("keep.txt").exists());
}

#[test]
fn test_metadata_only_writes_nothing() {
    let tmp = tmp_dir();
    let dir = tmp.path();
    let store_dir = dir.join("out.zarr");
    let mut a = source(dir, "A");
    a["orientation"] = json!([[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);

    let config: RunConfig = serde_json::from_value(json!({
        "output_dir": store_dir,
        "workers": 1,
        "settings": { "only_metadata": true },
        "groups": [{ "prefix": "clusters", "sources": [a] }],
    }))
    .expect("valid configuration");
    let report = convert::run(&config, worker_launcher()).expect("run succeeds");
    assert!(!store_dir.exists());
    let metadata = &report.metadata["/clusters/A"];
    assert_eq!(
        metadata.rotation_matrix,
        Some([[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]])
    );
    assert_eq!(metadata.paths, vec![dir.join("A.npy")]);
}

#[test]
fn test_binary_exit_status() {
    let tmp = tmp_dir();
    let dir = tmp.path();
    write_clusters(dir);
    fs::write(
        dir.join("run.json"),
        serde_json::to_vec(&json!({
            "output_dir": "out.zarr",
            "workers": 2,
            "groups": [{ "sources": [
                { "name": "A", "path": "A.npy", "spacing": SPACING },
                { "name": "B", "path": "B.npy", "spacing": SPACING },
            ] }],
        }))
        .expect("serialize"),
    )
    .expect("write config");
    let run = |extra: &[&str]| {
        Command::new(binary())
            .arg("convert")
            .arg(dir.join("run.json"))
            .args(extra)
            .status()
            .expect("run binary")
    };

    assert!(run(&[]).success());
    assert!(dir.join("out.zarr/B/0.01_0.01_0.2/zarr.json").is_file());
    // store exists
    assert!(!run(&[]).success());
    assert!(run(&["--clobber", "-w", "1"]).success());

    fs::remove_file(dir.join("B.npy")).expect("remove source");
    assert!(!run(&["--clobber"]).success());
    assert!(dir.join("out.zarr/A/zarr.json").is_file());
}

use std::fs;

use ndarray::Array3;
use zarrs::group::Group;
use zarrs_multiscale::{
    Error,
    chunk::ChunkPlan,
    codec::{CodecConfig, Compression},
    config::Settings,
    convert::{WorkUnit, WorkerContext, process_unit},
    metadata::{CoordinateTransform, parse_ome, parse_scales},
    pyramid::GaussianPyramid,
    source::{NpyLoader, SourceArray, SourceRef, VoxelArray, default_axes},
    storage::{GroupPath, MANIFEST_NAME, StoreRoot},
    writer::GroupWriter,
};

mod common;
use common::{SPACING, open_array, ramp, tmp_dir, write_npy};

#[test]
fn test_existing_root_is_kept_without_clobber() {
    let tmp = tmp_dir();
    let root = tmp.path().join("store");
    fs::create_dir(&root).expect("create dir");
    fs::write(root.join("precious.txt"), "keep me").expect("write file");

    match StoreRoot::create(&root, false) {
        Err(Error::StoreExists(p)) => assert_eq!(p, root),
        other => panic!("expected store exists, got {other:?}"),
    }
    assert!(root.join("precious.txt").exists());
}

#[test]
fn test_clobber_recreates_root() {
    let tmp = tmp_dir();
    let root = tmp.path().join("store");
    fs::create_dir(&root).expect("create dir");
    fs::write(root.join("stale.txt"), "old").expect("write file");

    let store = StoreRoot::create(&root, true).expect("clobber");
    assert!(!root.join("stale.txt").exists());
    assert!(root.join("zarr.json").is_file());
    assert!(store.children(&GroupPath::root()).expect("list").is_empty());
}

#[test]
fn test_duplicate_group_name() {
    let tmp = tmp_dir();
    let store = StoreRoot::create(tmp.path().join("store"), false).expect("create");
    let root = GroupPath::root();
    let clusters = store
        .create_group(&root, "clusters", Default::default())
        .expect("first group");
    assert_eq!(clusters.as_str(), "/clusters");

    match store.create_group(&root, "clusters", Default::default()) {
        Err(Error::DuplicateName(name)) => assert_eq!(name, "/clusters"),
        other => panic!("expected duplicate name, got {other:?}"),
    }
    // same name under another parent is fine
    let nested = store
        .create_group(&clusters, "clusters", Default::default())
        .expect("nested group");
    assert_eq!(nested.as_str(), "/clusters/clusters");
    assert_eq!(store.children(&root).expect("list"), vec!["clusters"]);
}

#[test]
fn test_group_paths() {
    let p = GroupPath::parse("a/b").expect("valid");
    assert_eq!(p.as_str(), "/a/b");
    assert_eq!(p.name(), Some("b"));
    assert_eq!(GroupPath::parse("/").expect("valid"), GroupPath::root());
    assert_eq!(GroupPath::root().name(), None);
    for bad in ["", "..", "a/b", "__zarr"] {
        assert!(GroupPath::root().child(bad).is_err(), "{bad:?} accepted");
    }
}

#[test]
fn test_manifest_copied_once() {
    let tmp = tmp_dir();
    let manifest = tmp.path().join("input.csv");
    fs::write(&manifest, "raw,name\nc1.npy,L2/3 IT\n").expect("write manifest");
    let store = StoreRoot::create(tmp.path().join("store"), false).expect("create");
    let group = store
        .create_group(&GroupPath::root(), "clusters", Default::default())
        .expect("group");

    let dest = store.copy_manifest(&group, &manifest).expect("first copy");
    assert_eq!(dest, tmp.path().join("store/clusters").join(MANIFEST_NAME));
    assert_eq!(
        fs::read(&dest).expect("read copy"),
        fs::read(&manifest).expect("read original")
    );
    assert!(store.copy_manifest(&group, &manifest).is_err());
}

#[test]
fn test_round_trip() {
    let tmp = tmp_dir();
    let store = StoreRoot::create(tmp.path().join("store"), false).expect("create");
    let spacing = [0.01, 0.02, 0.5];
    let base = Array3::<f64>::from_shape_fn((16, 8, 4), |(i, j, k)| {
        (i * 100 + j * 10 + k) as f64 + 0.1
    });
    let source = SourceArray::new(base.clone(), spacing, "vol");
    let pyramid = GaussianPyramid::new(2, 4);
    let node = GroupWriter::new(&store, CodecConfig::default())
        .with_downscaling("gaussian")
        .write_source(&GroupPath::root(), "vol", source, &pyramid, 64)
        .expect("write");
    assert_eq!(node.as_str(), "/vol");

    let group = Group::open(store.store(), "/vol").expect("open group");
    let ome = parse_ome(group.attributes()).expect("ome attributes");
    let multiscale = &ome.multiscales[0];
    assert_eq!(multiscale.kind.as_deref(), Some("gaussian"));
    let axes: Vec<_> = multiscale.axes.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(axes, vec!["x", "y", "z"]);
    let keys: Vec<_> = multiscale.datasets.iter().map(|d| d.path.as_str()).collect();
    assert_eq!(keys, vec!["0.01_0.02_0.5", "0.02_0.04_0.5", "0.04_0.08_0.5"]);
    let CoordinateTransform::Scale { scale } =
        &multiscale.datasets[1].coordinate_transformations[0];
    assert_eq!(scale, &vec![0.02, 0.04, 0.5]);

    let scales = parse_scales(group.attributes()).expect("scale attributes");
    let sizes: Vec<_> = scales.iter().map(|s| s.size).collect();
    assert_eq!(sizes, vec![[16, 8, 4], [8, 4, 4], [4, 2, 4]]);
    assert!(scales.iter().all(|s| s.chunk_sizes == vec![[4, 2, 1]]));
    assert!(scales.iter().all(|s| s.encoding == "gzip"));

    let array = open_array(store.path(), "/vol/0.01_0.02_0.5");
    assert_eq!(array.shape(), &[16, 8, 4]);
    let data: Vec<f32> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data");
    let expected: Vec<f32> = base.iter().map(|&v| v as f32).collect();
    assert_eq!(data, expected);

    let smallest = open_array(store.path(), "/vol/0.04_0.08_0.5");
    assert_eq!(smallest.shape(), &[4, 2, 4]);
}

#[test]
fn test_duplicate_node_is_not_overwritten() {
    let tmp = tmp_dir();
    let store = StoreRoot::create(tmp.path().join("store"), false).expect("create");
    let codec = CodecConfig {
        compression: Compression::Zstd {
            level: 1,
            checksum: false,
        },
        concurrent_target: 2,
    };
    let writer = GroupWriter::new(&store, codec);
    let pyramid = GaussianPyramid::new(2, 8);
    let first = SourceArray::new(ramp([8, 8, 2], 1), SPACING, "first");
    let second = SourceArray::new(ramp([8, 8, 2], 50), SPACING, "second");
    writer
        .write_source(&GroupPath::root(), "A", first, &pyramid, 64)
        .expect("first write");
    match writer.write_source(&GroupPath::root(), "A", second, &pyramid, 64) {
        Err(Error::DuplicateName(name)) => assert_eq!(name, "/A"),
        other => panic!("expected duplicate name, got {other:?}"),
    }

    let array = open_array(store.path(), "/A/0.01_0.01_0.2");
    let data: Vec<u16> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data");
    assert_eq!(data, ramp([8, 8, 2], 1).iter().copied().collect::<Vec<_>>());
}

#[test]
fn test_double_levels_stored_as_single() {
    let tmp = tmp_dir();
    let store = StoreRoot::create(tmp.path().join("store"), false).expect("create");
    let base = Array3::<f64>::from_shape_fn((4, 4, 2), |(i, j, k)| {
        (i + 4 * j) as f64 + 0.25 * k as f64
    });
    let plan = ChunkPlan::new(&[4, 4, 2], &SPACING, 64, &[]).expect("valid plan");
    GroupWriter::new(&store, CodecConfig::raw())
        .write(
            &GroupPath::root(),
            "v",
            &default_axes(),
            &[VoxelArray::Float64(base.clone())],
            &plan,
        )
        .expect("write");

    let key = &plan.level_keys()[0];
    let metadata: serde_json::Value = serde_json::from_slice(
        &fs::read(store.path().join("v").join(key).join("zarr.json")).expect("read metadata"),
    )
    .expect("parse metadata");
    assert_eq!(metadata["data_type"], "float32");

    let array = open_array(store.path(), &format!("/v/{key}"));
    let data: Vec<f32> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data");
    let expected: Vec<f32> = base.iter().map(|&v| v as f32).collect();
    assert_eq!(data, expected);
}

#[test]
fn test_recorded_method_follows_pyramid() {
    let tmp = tmp_dir();
    let store_dir = tmp.path().join("store");
    StoreRoot::create(&store_dir, false).expect("create");
    let npy = tmp.path().join("a.npy");
    write_npy(&npy, &ramp([8, 8, 2], 0));

    for (downscale, name, method, levels) in [(1, "one", "identity", 1), (2, "two", "gaussian", 2)] {
        let context = WorkerContext {
            store: store_dir.clone(),
            settings: Settings {
                downscale,
                cutoff: 4,
                ..Default::default()
            },
        };
        let unit = WorkUnit::new(GroupPath::root(), name, vec![SourceRef::new(&npy, SPACING)]);
        process_unit(&context, &unit, &NpyLoader).expect("write");

        let store = StoreRoot::open(&store_dir).expect("open store");
        let group = Group::open(store.store(), &format!("/{name}")).expect("open group");
        let ome = parse_ome(group.attributes()).expect("ome attributes");
        assert_eq!(ome.multiscales[0].kind.as_deref(), Some(method));
        assert_eq!(ome.multiscales[0].datasets.len(), levels);
    }
}

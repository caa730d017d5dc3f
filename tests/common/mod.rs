#![allow(dead_code)]
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use ndarray::Array3;
use npyz::WriterBuilder;
use tempfile::TempDir;
use zarrs_multiscale::pool::CommandLauncher;

pub const SPACING: [f64; 3] = [0.01, 0.01, 0.2];

pub fn init() {
    env_logger::try_init().ok();
}

pub fn tmp_dir() -> TempDir {
    init();
    tempfile::tempdir().expect("should be able to create temp dir")
}

/// Launches worker processes from the compiled binary.
pub fn worker_launcher() -> CommandLauncher {
    CommandLauncher::new(env!("CARGO_BIN_EXE_multiscale"), ["worker"])
}

/// Launches tiled-export workers from the compiled binary.
pub fn export_launcher() -> CommandLauncher {
    CommandLauncher::new(env!("CARGO_BIN_EXE_multiscale"), ["export-worker"])
}

pub fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_multiscale"))
}

/// A volume whose voxels are `offset + i + 2j + 3k`.
pub fn ramp(shape: [usize; 3], offset: u16) -> Array3<u16> {
    Array3::from_shape_fn(shape, |(i, j, k)| offset + (i + 2 * j + 3 * k) as u16)
}

pub fn write_npy<T: npyz::AutoSerialize + Copy>(path: &Path, array: &Array3<T>) {
    let mut f = BufWriter::new(File::create(path).expect("create npy file"));
    let shape: Vec<u64> = array.shape().iter().map(|&n| n as u64).collect();
    let mut writer = npyz::WriteOptions::new()
        .default_dtype()
        .shape(&shape)
        .writer(&mut f)
        .begin_nd()
        .expect("begin npy");
    writer.extend(array.iter().copied()).expect("write npy data");
    writer.finish().expect("finish npy");
}

pub fn open_array(
    store_dir: &Path,
    path: &str,
) -> zarrs::array::Array<zarrs::filesystem::FilesystemStore> {
    let store = std::sync::Arc::new(
        zarrs::filesystem::FilesystemStore::new(store_dir).expect("open store"),
    );
    zarrs::array::Array::open(store, path).expect("open array")
}

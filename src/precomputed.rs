//! Flat tiled export of one volume: an `info` file plus raw chunk files named
//! by the voxel extents they cover, `x0-x1_y0-y1_z0-z1`, one directory per scale.
//!
//! Every level is a zarr array with reversed dimensions (`[z, y, x]`), so that
//! x varies fastest within a chunk, and a chunk key encoding which names
//! chunks by their extents. No zarr metadata is stored alongside.
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Arc,
    time::Instant,
};

use log::{debug, info};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use zarrs::{
    array::{
        Array, ArrayMetadata, ArraySubset, ChunkKeyEncoding, ChunkKeyEncodingTraits,
        chunk_key_encoding::{self as cke, api::ChunkKeyEncodingPlugin},
    },
    filesystem::FilesystemStore,
    metadata::v3::MetadataV3,
    plugin::PluginConfigurationInvalidError,
};

use crate::{
    chunk::ChunkPlan,
    codec::CodecConfig,
    config::PrecomputedConfig,
    metadata::{ScaleInfo, bounded_array_metadata, resolution_key},
    pool::{self, Launcher, Partition, WorkItem, WorkerPool},
    pyramid::{AxisMask, PyramidBuilder},
    source::{
        NpyLoader, SourceArray, SourceLoader, Voxel, VoxelArray, VoxelType, read_npy_header,
    },
    storage::prepare_root,
    with_voxels,
};

/// Name of the layer description file.
pub const INFO_NAME: &str = "info";

const NM_PER_MM: f64 = 1e6;

/// Names chunks of a `[z, y, x]` array by their `x0-x1_y0-y1_z0-z1` extents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecomputedChunkKeyEncoding {
    chunk_shape: Vec<u64>,
    shape: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecomputedChunkKeyEncodingConfiguration {
    /// In array order.
    pub chunk_shape: Vec<u64>,
    /// Array shape, used to truncate extents at the edges.
    pub shape: Vec<u64>,
}

zarrs::plugin::impl_extension_aliases!(
    PrecomputedChunkKeyEncoding,
    v3: "zarrs_multiscale.precomputed",
    ["zarrs_multiscale.precomputed", "precomputed"]
);
inventory::submit! {
    ChunkKeyEncodingPlugin::new::<PrecomputedChunkKeyEncoding>()
}

impl PrecomputedChunkKeyEncoding {
    pub fn new(
        chunk_shape: Vec<u64>,
        shape: Vec<u64>,
    ) -> Result<Self, PluginConfigurationInvalidError> {
        if chunk_shape.len() != shape.len() || chunk_shape.contains(&0) {
            return Err(PluginConfigurationInvalidError::new(format!(
                "chunk shape {chunk_shape:?} does not fit array shape {shape:?}"
            )));
        }
        Ok(Self { chunk_shape, shape })
    }

    /// Metadata selecting this encoding for an array of `shape`.
    pub fn metadata(chunk_shape: &[u64], shape: &[u64]) -> crate::Result<MetadataV3> {
        let out = MetadataV3::new_with_serializable_configuration(
            "zarrs_multiscale.precomputed".to_string(),
            &PrecomputedChunkKeyEncodingConfiguration {
                chunk_shape: chunk_shape.to_vec(),
                shape: shape.to_vec(),
            },
        )?;
        Ok(out)
    }

    /// Half-open extents of a chunk, in array order.
    pub fn extents(&self, chunk_grid_indices: &[u64]) -> Vec<(u64, u64)> {
        chunk_grid_indices
            .iter()
            .zip(self.chunk_shape.iter().zip(self.shape.iter()))
            .map(|(&idx, (&c, &n))| {
                let start = idx * c;
                (start, (start + c).min(n))
            })
            .collect()
    }
}

impl ChunkKeyEncodingTraits for PrecomputedChunkKeyEncoding {
    fn create(
        metadata: &MetadataV3,
    ) -> Result<cke::api::ChunkKeyEncoding, zarrs::plugin::PluginCreateError>
    where
        Self: Sized,
    {
        match metadata.name() {
            "zarrs_multiscale.precomputed" | "precomputed" => {}
            _ => {
                return Err(zarrs::plugin::PluginCreateError::NameInvalid {
                    name: metadata.name().into(),
                });
            }
        }
        let configuration: PrecomputedChunkKeyEncodingConfiguration =
            metadata.to_typed_configuration()?;
        let encoding = Self::new(configuration.chunk_shape, configuration.shape)
            .map_err(zarrs::plugin::PluginCreateError::ConfigurationInvalid)?;
        Ok(ChunkKeyEncoding::new(encoding))
    }

    fn configuration(&self) -> zarrs::metadata::Configuration {
        let mut map = serde_json::Map::new();
        map.insert("chunk_shape".into(), serde_json::json!(self.chunk_shape));
        map.insert("shape".into(), serde_json::json!(self.shape));
        map.into()
    }

    fn encode(&self, chunk_grid_indices: &[u64]) -> zarrs::storage::StoreKey {
        let mut s = String::with_capacity(chunk_grid_indices.len() * 8);
        for (i, (start, end)) in self.extents(chunk_grid_indices).iter().rev().enumerate() {
            if i > 0 {
                s.push('_');
            }
            s.push_str(&format!("{start}-{end}"));
        }
        zarrs::storage::StoreKey::new(s).expect("chunk key should be valid")
    }
}

/// Contents of the layer `info` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecomputedInfo {
    pub data_type: String,
    pub num_channels: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub scales: Vec<ScaleInfo>,
}

impl PrecomputedInfo {
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let f = File::open(path.as_ref().join(INFO_NAME))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(f))?)
    }
}

fn nanometers(scale: &[f64; 3]) -> [f64; 3] {
    // drop float noise from the unit conversion
    scale.map(|s| (s * NM_PER_MM * 1e3).round() / 1e3)
}

/// Describe the layer of a volume without touching any data.
///
/// `voxel_type` is the type as stored, after narrowing.
pub fn layer_info(
    shape: [usize; 3],
    spacing: &[f64; 3],
    voxel_type: VoxelType,
    pyramid: &dyn PyramidBuilder,
    chunk_cap: u64,
) -> crate::Result<PrecomputedInfo> {
    let level_shapes = pyramid.level_shapes(shape);
    let plan = ChunkPlan::new(&shape, spacing, chunk_cap, &level_shapes)?;
    let scales = level_shapes
        .iter()
        .zip(plan.scales.iter())
        .map(|(&level, scale)| {
            let resolution = nanometers(scale);
            ScaleInfo {
                key: resolution_key(&resolution),
                encoding: "raw".into(),
                resolution,
                size: level.map(|n| n as u64),
                chunk_sizes: vec![plan.chunk_shape],
                voxel_offset: [0; 3],
            }
        })
        .collect();
    Ok(PrecomputedInfo {
        data_type: voxel_type.name().into(),
        num_channels: 1,
        kind: "image".into(),
        scales,
    })
}

fn write_info(layer_dir: &Path, info: &PrecomputedInfo) -> crate::Result<()> {
    let mut w = BufWriter::new(File::create(layer_dir.join(INFO_NAME))?);
    serde_json::to_writer_pretty(&mut w, info)?;
    w.flush()?;
    Ok(())
}

/// Export a volume and its pyramid as a tiled layer under `layer_dir`.
///
/// Volume dimensions are taken as x, y, z. Resolutions are written in
/// nanometers. An existing `layer_dir` is replaced if `clobber` is set,
/// otherwise this fails with [crate::Error::StoreExists].
pub fn export(
    layer_dir: &Path,
    source: SourceArray,
    pyramid: &dyn PyramidBuilder,
    chunk_cap: u64,
    clobber: bool,
) -> crate::Result<PrecomputedInfo> {
    let data = source.data.narrowed();
    let info = layer_info(
        data.shape(),
        &source.spacing,
        data.voxel_type(),
        pyramid,
        chunk_cap,
    )?;
    prepare_root(layer_dir, clobber)?;
    write_slab(layer_dir, &info, data, 0, pyramid)?;
    write_info(layer_dir, &info)?;
    info!(
        "exported {} scale(s) to {}",
        info.scales.len(),
        layer_dir.display()
    );
    Ok(info)
}

/// Whole chunk rows `z0..z1` along the last dimension, exported by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slab {
    pub z0: usize,
    pub z1: usize,
}

impl WorkItem for Slab {
    fn id(&self) -> String {
        format!("z{}-{}", self.z0, self.z1)
    }
}

/// Split `depth` slices into slabs of `chunk_depth`.
///
/// Slabs are only independent when the pyramid keeps the last dimension,
/// otherwise the whole volume is a single slab.
pub fn slabs(depth: usize, chunk_depth: u64, axes: AxisMask) -> Vec<Slab> {
    if depth == 0 {
        return Vec::new();
    }
    if axes.0[2] {
        return vec![Slab { z0: 0, z1: depth }];
    }
    let step = (chunk_depth as usize).max(1);
    (0..depth)
        .step_by(step)
        .map(|z0| Slab {
            z0,
            z1: (z0 + step).min(depth),
        })
        .collect()
}

/// Shared by every slab of an export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportContext {
    pub config: PrecomputedConfig,
    pub info: PrecomputedInfo,
}

/// Build and write the pyramid of one slab of the (narrowed) base volume.
///
/// `slab` holds base slices `z0..`; every level is written at that offset.
pub fn write_slab(
    layer_dir: &Path,
    info: &PrecomputedInfo,
    slab: VoxelArray,
    z0: usize,
    pyramid: &dyn PyramidBuilder,
) -> crate::Result<()> {
    let levels = pyramid.build(slab);
    if levels.len() != info.scales.len() {
        return Err(crate::Error::general(format!(
            "{} pyramid levels but {} scales",
            levels.len(),
            info.scales.len()
        )));
    }
    let store = Arc::new(FilesystemStore::new(layer_dir).map_err(crate::Error::wrap)?);
    for (level, scale) in levels.iter().zip(info.scales.iter()) {
        debug!("exporting scale {} from z {z0}", scale.key);
        with_voxels!(level, a => write_scale(&store, scale, a, z0 as u64))?;
    }
    Ok(())
}

/// Export one slab; the worker side of [export_with_pool].
pub fn export_slab(
    context: &ExportContext,
    slab: &Slab,
    loader: &dyn SourceLoader,
) -> crate::Result<()> {
    let source = loader.load(&context.config.source)?;
    let data = source.data.narrowed().slab(slab.z0, slab.z1);
    let pyramid = context.config.pyramid_builder();
    write_slab(
        &context.config.output_dir,
        &context.info,
        data,
        slab.z0,
        pyramid.as_ref(),
    )
}

/// Worker-process entry point for a job file written by [export_with_pool].
pub fn run_export_worker(job: &Path) -> crate::Result<()> {
    pool::run_job::<ExportContext, Slab, (), _>(job, |context, slab| {
        export_slab(context, slab, &NpyLoader)
    })
}

/// Export the configured volume with slabs dealt round-robin across workers.
///
/// Slabs cover disjoint chunk files. The `info` file is only written once
/// every slab succeeded; otherwise this fails with [crate::Error::WorkersFailed].
pub fn export_with_pool<L: Launcher>(
    config: &PrecomputedConfig,
    pool: &WorkerPool<L>,
) -> crate::Result<PrecomputedInfo> {
    config.validate()?;
    let start = Instant::now();
    let (voxel_type, shape) = read_npy_header(&config.source.path)?;
    let pyramid = config.pyramid_builder();
    let info = layer_info(
        shape,
        &config.source.spacing,
        voxel_type.narrowed(),
        pyramid.as_ref(),
        config.chunk_cap,
    )?;
    let chunk_depth = info.scales[0].chunk_sizes[0][2];
    let items = slabs(shape[2], chunk_depth, config.axes);

    prepare_root(&config.output_dir, config.clobber)?;
    info!(
        "exporting {} slab(s) of {} to {}",
        items.len(),
        config.source.path.display(),
        config.output_dir.display()
    );
    let context = ExportContext {
        config: config.clone(),
        info,
    };
    pool::check_disjoint(&items)?;
    pool.run::<_, _, ()>(&context, items, Partition::RoundRobin)?
        .into_result()?;

    write_info(&config.output_dir, &context.info)?;
    info!(
        "exported {} scale(s) to {} in {:.2?}",
        context.info.scales.len(),
        config.output_dir.display(),
        start.elapsed()
    );
    Ok(context.info)
}

/// Write a level, or the part of it from base slice `z0`, in `[z, y, x]` order.
fn write_scale<T: Voxel>(
    store: &Arc<FilesystemStore>,
    scale: &ScaleInfo,
    level: &Array3<T>,
    z0: u64,
) -> crate::Result<()> {
    let chunk_shape = scale
        .chunk_sizes
        .first()
        .ok_or_else(|| crate::Error::general(format!("scale {} has no chunk size", scale.key)))?;
    let shape: Vec<u64> = scale.size.iter().rev().copied().collect();
    let chunk: Vec<u64> = chunk_shape.iter().rev().copied().collect();
    let metadata = bounded_array_metadata(
        &shape,
        &chunk,
        T::TYPE,
        &CodecConfig::raw(),
        PrecomputedChunkKeyEncoding::metadata(&chunk, &shape)?,
    )?;
    let array = Array::new_with_metadata(
        store.clone(),
        &format!("/{}", scale.key),
        ArrayMetadata::V3(metadata),
    )?;

    let reversed = level.view().reversed_axes();
    let ranges: Vec<_> = reversed
        .shape()
        .iter()
        .enumerate()
        .map(|(d, &n)| {
            let offset = if d == 0 { z0 } else { 0 };
            offset..offset + n as u64
        })
        .collect();
    let elements: Vec<T> = reversed.iter().copied().collect();
    array.store_array_subset_opt(
        &ArraySubset::new_with_ranges(&ranges),
        &elements,
        &CodecConfig::raw().codec_options(),
    )?;
    Ok(())
}

use log::debug;
use ndarray::Array3;
use zarrs::array::{Array, ArrayMetadata};

use crate::{
    chunk::ChunkPlan,
    codec::CodecConfig,
    metadata::{ScaleInfo, level_array_metadata, multiscale_attributes},
    pyramid::PyramidBuilder,
    source::{SPACING_UNIT, SourceArray, Voxel, VoxelArray},
    storage::{GroupPath, StoreRoot},
    with_voxels,
};

/// Writes multiscale nodes into a [StoreRoot].
#[derive(Debug, Clone)]
pub struct GroupWriter<'a> {
    root: &'a StoreRoot,
    codec: CodecConfig,
    downscaling: Option<String>,
}

impl<'a> GroupWriter<'a> {
    pub fn new(root: &'a StoreRoot, codec: CodecConfig) -> Self {
        Self {
            root,
            codec,
            downscaling: None,
        }
    }

    /// Name of the downscaling method recorded in the node metadata.
    pub fn with_downscaling(mut self, method: impl Into<String>) -> Self {
        self.downscaling = Some(method.into());
        self
    }

    /// Write every level of a pyramid as a new child `name` of `parent`.
    ///
    /// `levels` and `plan.scales` correspond one to one, level 0 first.
    /// 64-bit float levels are stored as 32-bit floats.
    /// Fails with [crate::Error::DuplicateName] if `parent` already has a child `name`.
    pub fn write(
        &self,
        parent: &GroupPath,
        name: &str,
        axes: &[String; 3],
        levels: &[VoxelArray],
        plan: &ChunkPlan,
    ) -> crate::Result<GroupPath> {
        if levels.len() != plan.scales.len() {
            return Err(crate::Error::general(format!(
                "{} pyramid levels but {} coordinate transforms",
                levels.len(),
                plan.scales.len()
            )));
        }
        let keys = plan.level_keys();
        let infos: Vec<ScaleInfo> = levels
            .iter()
            .zip(plan.scales.iter())
            .zip(keys)
            .map(|((level, scale), key)| ScaleInfo {
                key,
                encoding: self.codec.compression.encoding().into(),
                resolution: *scale,
                size: level.shape().map(|n| n as u64),
                chunk_sizes: vec![plan.chunk_shape],
                voxel_offset: [0; 3],
            })
            .collect();

        let attributes = multiscale_attributes(
            name,
            axes,
            SPACING_UNIT,
            self.downscaling.as_deref(),
            &infos,
        )?;
        let node = self.root.create_group(parent, name, attributes)?;

        for (level, info) in levels.iter().zip(infos.iter()) {
            let path = node.child(&info.key)?;
            debug!("writing {path} with shape {:?}", info.size);
            let narrowed = level.narrowed_copy();
            let level = narrowed.as_ref().unwrap_or(level);
            with_voxels!(level, a => self.write_level(&path, a, &plan.chunk_shape))?;
        }
        Ok(node)
    }

    /// Narrow, plan, build and write a whole source as child `name` of `parent`.
    pub fn write_source(
        &self,
        parent: &GroupPath,
        name: &str,
        source: SourceArray,
        pyramid: &dyn PyramidBuilder,
        chunk_cap: u64,
    ) -> crate::Result<GroupPath> {
        let shape = source.shape();
        let level_shapes = pyramid.level_shapes(shape);
        let plan = ChunkPlan::new(&shape, &source.spacing, chunk_cap, &level_shapes)?;
        let levels = pyramid.build(source.data.narrowed());
        self.write(parent, name, &source.axes, &levels, &plan)
    }

    fn write_level<T: Voxel>(
        &self,
        path: &GroupPath,
        level: &Array3<T>,
        chunk_shape: &[u64; 3],
    ) -> crate::Result<()> {
        let shape: Vec<u64> = level.shape().iter().map(|&n| n as u64).collect();
        let metadata = level_array_metadata(&shape, chunk_shape, T::TYPE, &self.codec)?;
        let array = Array::new_with_metadata(
            self.root.store(),
            path.as_str(),
            ArrayMetadata::V3(metadata),
        )?;
        array.store_metadata()?;
        let elements: Vec<T> = level.iter().copied().collect();
        array.store_array_subset_opt(
            &array.subset_all(),
            &elements,
            &self.codec.codec_options(),
        )?;
        Ok(())
    }
}

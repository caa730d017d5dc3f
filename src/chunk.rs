use crate::metadata::resolution_key;

/// Chunk shape and per-level coordinate scales for one volume.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    /// Shared by every pyramid level.
    pub chunk_shape: [u64; 3],
    /// One scale vector per level, level 0 first.
    pub scales: Vec<[f64; 3]>,
}

impl ChunkPlan {
    /// Plan chunking for a volume of `shape` with voxel spacing `scale`.
    ///
    /// `level_shapes` are the shapes of every pyramid level, level 0 first,
    /// as produced by [crate::pyramid::PyramidBuilder::level_shapes].
    /// Each chunk dimension is a quarter of the extent, capped at `chunk_cap` and never 0.
    pub fn new(
        shape: &[usize],
        scale: &[f64],
        chunk_cap: u64,
        level_shapes: &[[usize; 3]],
    ) -> crate::Result<Self> {
        if shape.len() < 3 {
            return Err(crate::Error::config(format!(
                "expected 3 spatial dimensions, got shape {shape:?}"
            )));
        }
        if scale.len() < 3 {
            return Err(crate::Error::config(format!(
                "expected 3 scale components, got {scale:?}"
            )));
        }
        if let Some(bad) = scale.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(crate::Error::config(format!(
                "voxel spacing must be positive, got {bad} in {scale:?}"
            )));
        }
        if chunk_cap == 0 {
            return Err(crate::Error::config("chunk cap must be positive"));
        }
        if shape.iter().take(3).any(|&n| n == 0) {
            return Err(crate::Error::config(format!(
                "array extents must be positive, got {shape:?}"
            )));
        }

        let base = [shape[0], shape[1], shape[2]];
        let base_scale = [scale[0], scale[1], scale[2]];
        let chunk_shape = base.map(|n| (n as u64 / 4).min(chunk_cap).max(1));

        let level_shapes = if level_shapes.is_empty() {
            &[base][..]
        } else {
            level_shapes
        };
        if level_shapes[0] != base {
            return Err(crate::Error::config(format!(
                "level 0 shape {:?} differs from array shape {base:?}",
                level_shapes[0]
            )));
        }

        let mut scales = Vec::with_capacity(level_shapes.len());
        for level in level_shapes {
            if level.contains(&0) {
                return Err(crate::Error::config(format!(
                    "pyramid level has empty shape {level:?}"
                )));
            }
            scales.push(level_scale(base, base_scale, *level));
        }

        Ok(Self {
            chunk_shape,
            scales,
        })
    }

    /// Store key of each level, derived from its scale.
    pub fn level_keys(&self) -> Vec<String> {
        self.scales.iter().map(resolution_key).collect()
    }
}

/// Physical voxel size of a level so that it covers the same extent as level 0.
pub fn level_scale(base: [usize; 3], base_scale: [f64; 3], level: [usize; 3]) -> [f64; 3] {
    std::array::from_fn(|d| {
        if level[d] == base[d] {
            base_scale[d]
        } else {
            base_scale[d] * base[d] as f64 / level[d] as f64
        }
    })
}

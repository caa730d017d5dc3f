//! Multiresolution pyramids with Gaussian anti-aliasing and integer decimation.
//!
//! Every step smooths the previous level along the reduced axes, then keeps
//! every `factor`-th voxel starting at index 0, so a reduced extent `n`
//! becomes `n / factor`. Building stops as soon as the largest reduced extent
//! is at or below the cutoff, or when a reduced extent can no longer be
//! divided into a non-empty one. Axes which are not reduced keep their extent.
use ndarray::{Array1, Array3, ArrayView1, ArrayViewMut1, Axis, Slice, Zip};
use serde::{Deserialize, Serialize};

use crate::source::{Voxel, VoxelArray};
use crate::with_voxels;

/// A strategy for producing pyramid levels from a base volume.
pub trait PyramidBuilder {
    /// Shapes of every level, level 0 first, without touching any data.
    fn level_shapes(&self, base: [usize; 3]) -> Vec<[usize; 3]>;

    /// Materialise every level, level 0 first.
    ///
    /// Level 0 is the input unchanged.
    fn build(&self, base: VoxelArray) -> Vec<VoxelArray>;

    /// Downscaling method recorded in node metadata.
    fn method(&self) -> &'static str;
}

/// Which array dimensions a pyramid step reduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMask(pub [bool; 3]);

impl AxisMask {
    /// The first two dimensions; the slicing axis keeps its extent.
    pub const PLANAR: AxisMask = AxisMask([true, true, false]);
    pub const ALL: AxisMask = AxisMask([true, true, true]);
}

impl Default for AxisMask {
    fn default() -> Self {
        Self::PLANAR
    }
}

/// Selects a [PyramidBuilder] implementation from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidKind {
    /// Gaussian smoothing followed by decimation.
    #[default]
    Gaussian,
    /// Only level 0 is written.
    Identity,
}

impl PyramidKind {
    pub fn builder(
        &self,
        factor: usize,
        cutoff: usize,
        axes: AxisMask,
    ) -> Box<dyn PyramidBuilder + Send + Sync> {
        match self {
            PyramidKind::Gaussian if factor > 1 => {
                Box::new(GaussianPyramid::new(factor, cutoff).with_axes(axes))
            }
            _ => Box::new(IdentityPyramid),
        }
    }
}

/// Produces only level 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPyramid;

impl PyramidBuilder for IdentityPyramid {
    fn level_shapes(&self, base: [usize; 3]) -> Vec<[usize; 3]> {
        vec![base]
    }

    fn build(&self, base: VoxelArray) -> Vec<VoxelArray> {
        vec![base]
    }

    fn method(&self) -> &'static str {
        "identity"
    }
}

#[derive(Debug, Clone)]
pub struct GaussianPyramid {
    factor: usize,
    cutoff: usize,
    axes: AxisMask,
}

impl GaussianPyramid {
    /// A `factor` of 1 or less never reduces anything.
    pub fn new(factor: usize, cutoff: usize) -> Self {
        Self {
            factor,
            cutoff,
            axes: AxisMask::default(),
        }
    }

    pub fn with_axes(mut self, axes: AxisMask) -> Self {
        self.axes = axes;
        self
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// The shape after one more step, or None if building stops at `shape`.
    fn next_shape(&self, shape: [usize; 3]) -> Option<[usize; 3]> {
        if self.factor <= 1 {
            return None;
        }
        let reduced: Vec<usize> = (0..3)
            .filter(|&d| self.axes.0[d])
            .map(|d| shape[d])
            .collect();
        let largest = reduced.iter().copied().max()?;
        if largest <= self.cutoff || reduced.iter().any(|&n| n < self.factor) {
            return None;
        }
        let mut next = shape;
        for d in 0..3 {
            if self.axes.0[d] {
                next[d] = shape[d] / self.factor;
            }
        }
        Some(next)
    }

    fn reduce<T: Voxel>(&self, level: &Array3<T>, target: [usize; 3]) -> Array3<T> {
        let mut work = level.mapv(Voxel::to_f64);
        let kernel = gaussian_kernel(self.sigma());
        for d in 0..3 {
            if self.axes.0[d] {
                work = smooth_axis(&work, Axis(d), &kernel);
            }
        }
        let factor = self.factor as isize;
        let decimated = work.slice_each_axis(|ax| {
            let d = ax.axis.index();
            if self.axes.0[d] {
                Slice::new(0, Some((target[d] * self.factor) as isize), factor)
            } else {
                Slice::from(..)
            }
        });
        decimated.mapv(T::from_f64)
    }

    fn sigma(&self) -> f64 {
        2.0 * self.factor as f64 / 6.0
    }

    fn build_typed<T: Voxel>(&self, base: Array3<T>) -> Vec<VoxelArray> {
        let shapes = self.level_shapes(dims(&base));
        let mut levels = Vec::with_capacity(shapes.len());
        let mut previous = base;
        for target in shapes.into_iter().skip(1) {
            let next = self.reduce(&previous, target);
            levels.push(T::into_voxels(std::mem::replace(&mut previous, next)));
        }
        levels.push(T::into_voxels(previous));
        levels
    }
}

impl PyramidBuilder for GaussianPyramid {
    fn level_shapes(&self, base: [usize; 3]) -> Vec<[usize; 3]> {
        let mut shapes = vec![base];
        let mut current = base;
        while let Some(next) = self.next_shape(current) {
            shapes.push(next);
            current = next;
        }
        shapes
    }

    fn build(&self, base: VoxelArray) -> Vec<VoxelArray> {
        with_voxels!(base, a => self.build_typed(a))
    }

    fn method(&self) -> &'static str {
        "gaussian"
    }
}

fn dims<T>(array: &Array3<T>) -> [usize; 3] {
    let (a, b, c) = array.dim();
    [a, b, c]
}

/// Normalised 1-D Gaussian, truncated at 4 sigma.
fn gaussian_kernel(sigma: f64) -> Array1<f64> {
    let radius = (4.0 * sigma).ceil().max(1.0) as isize;
    let mut kernel = Array1::from_iter(
        (-radius..=radius).map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp()),
    );
    let total = kernel.sum();
    kernel /= total;
    kernel
}

/// Mirror an out-of-range index back into `0..len` (`d c b a | a b c d`).
fn reflect(mut idx: isize, len: isize) -> usize {
    let period = 2 * len;
    idx = idx.rem_euclid(period);
    if idx >= len {
        idx = period - 1 - idx;
    }
    idx as usize
}

fn smooth_axis(input: &Array3<f64>, axis: Axis, kernel: &Array1<f64>) -> Array3<f64> {
    let mut out = Array3::<f64>::zeros(input.raw_dim());
    Zip::from(out.lanes_mut(axis))
        .and(input.lanes(axis))
        .for_each(|o, i| convolve_lane(i, o, kernel));
    out
}

fn convolve_lane(input: ArrayView1<f64>, mut output: ArrayViewMut1<f64>, kernel: &Array1<f64>) {
    let len = input.len() as isize;
    let radius = (kernel.len() / 2) as isize;
    for (pos, out) in output.iter_mut().enumerate() {
        let centre = pos as isize;
        *out = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * input[reflect(centre + k as isize - radius, len)])
            .sum();
    }
}

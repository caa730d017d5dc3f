//! In-memory volumes and the loading of them.
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use ndarray::{Array3, Axis, ShapeBuilder, Slice};
use serde::{Deserialize, Serialize};

/// Physical unit of voxel spacing throughout the crate.
pub const SPACING_UNIT: &str = "millimeter";

/// Element type of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoxelType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl VoxelType {
    pub fn name(&self) -> &'static str {
        match self {
            VoxelType::Uint8 => "uint8",
            VoxelType::Int8 => "int8",
            VoxelType::Uint16 => "uint16",
            VoxelType::Int16 => "int16",
            VoxelType::Uint32 => "uint32",
            VoxelType::Int32 => "int32",
            VoxelType::Uint64 => "uint64",
            VoxelType::Int64 => "int64",
            VoxelType::Float32 => "float32",
            VoxelType::Float64 => "float64",
        }
    }

    /// The type actually stored for this element type.
    pub fn narrowed(self) -> Self {
        match self {
            VoxelType::Float64 => VoxelType::Float32,
            other => other,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, VoxelType::Float32 | VoxelType::Float64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            VoxelType::Int8 | VoxelType::Int16 | VoxelType::Int32 | VoxelType::Int64
        )
    }

    pub fn zarr_data_type(&self) -> zarrs::array::DataType {
        use zarrs::array::data_type;
        match self {
            VoxelType::Uint8 => data_type::uint8(),
            VoxelType::Int8 => data_type::int8(),
            VoxelType::Uint16 => data_type::uint16(),
            VoxelType::Int16 => data_type::int16(),
            VoxelType::Uint32 => data_type::uint32(),
            VoxelType::Int32 => data_type::int32(),
            VoxelType::Uint64 => data_type::uint64(),
            VoxelType::Int64 => data_type::int64(),
            VoxelType::Float32 => data_type::float32(),
            VoxelType::Float64 => data_type::float64(),
        }
    }

    /// Parse a numpy type descriptor such as `<u2` or `|u1`.
    fn from_npy_descr(descr: &str) -> crate::Result<Self> {
        let code = descr.trim_start_matches(['<', '>', '|', '=']);
        let out = match code {
            "u1" => VoxelType::Uint8,
            "i1" => VoxelType::Int8,
            "u2" => VoxelType::Uint16,
            "i2" => VoxelType::Int16,
            "u4" => VoxelType::Uint32,
            "i4" => VoxelType::Int32,
            "u8" => VoxelType::Uint64,
            "i8" => VoxelType::Int64,
            "f4" => VoxelType::Float32,
            "f8" => VoxelType::Float64,
            _ => {
                return Err(crate::Error::general(format!(
                    "unsupported npy data type: {descr}"
                )));
            }
        };
        Ok(out)
    }
}

/// Scalar element of a volume.
pub trait Voxel:
    Copy + Send + Sync + std::fmt::Debug + num_traits::Zero + zarrs::array::Element + 'static
{
    const TYPE: VoxelType;

    fn to_f64(self) -> f64;
    /// Saturates at the bounds of `i64`.
    fn to_i64(self) -> i64;
    /// Saturates at the bounds of `u64`.
    fn to_u64(self) -> u64;
    /// Saturating conversion; integral types round to nearest first.
    fn from_f64(value: f64) -> Self;
    fn into_voxels(array: Array3<Self>) -> VoxelArray;
}

macro_rules! impl_voxel {
    ($t:ty, $variant:ident, integral) => {
        impl_voxel!($t, $variant, |v: f64| v.round() as $t);
    };
    ($t:ty, $variant:ident, float) => {
        impl_voxel!($t, $variant, |v: f64| v as $t);
    };
    ($t:ty, $variant:ident, $from:expr) => {
        impl Voxel for $t {
            const TYPE: VoxelType = VoxelType::$variant;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_i64(self) -> i64 {
                num_traits::ToPrimitive::to_i64(&self).unwrap_or(if Voxel::to_f64(self) < 0.0 {
                    i64::MIN
                } else {
                    i64::MAX
                })
            }

            fn to_u64(self) -> u64 {
                num_traits::ToPrimitive::to_u64(&self).unwrap_or(if Voxel::to_f64(self) < 0.0 {
                    0
                } else {
                    u64::MAX
                })
            }

            fn from_f64(value: f64) -> Self {
                // `as` saturates at the type bounds
                ($from)(value)
            }

            fn into_voxels(array: Array3<Self>) -> VoxelArray {
                VoxelArray::$variant(array)
            }
        }
    };
}

impl_voxel!(u8, Uint8, integral);
impl_voxel!(i8, Int8, integral);
impl_voxel!(u16, Uint16, integral);
impl_voxel!(i16, Int16, integral);
impl_voxel!(u32, Uint32, integral);
impl_voxel!(i32, Int32, integral);
impl_voxel!(u64, Uint64, integral);
impl_voxel!(i64, Int64, integral);
impl_voxel!(f32, Float32, float);
impl_voxel!(f64, Float64, float);

/// A typed 3-D volume, indexed `[d0, d1, d2]`.
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelArray {
    Uint8(Array3<u8>),
    Int8(Array3<i8>),
    Uint16(Array3<u16>),
    Int16(Array3<i16>),
    Uint32(Array3<u32>),
    Int32(Array3<i32>),
    Uint64(Array3<u64>),
    Int64(Array3<i64>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

/// Evaluate `$body` with `$arr` bound to the typed array inside a [VoxelArray].
#[macro_export]
macro_rules! with_voxels {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            $crate::source::VoxelArray::Uint8($arr) => $body,
            $crate::source::VoxelArray::Int8($arr) => $body,
            $crate::source::VoxelArray::Uint16($arr) => $body,
            $crate::source::VoxelArray::Int16($arr) => $body,
            $crate::source::VoxelArray::Uint32($arr) => $body,
            $crate::source::VoxelArray::Int32($arr) => $body,
            $crate::source::VoxelArray::Uint64($arr) => $body,
            $crate::source::VoxelArray::Int64($arr) => $body,
            $crate::source::VoxelArray::Float32($arr) => $body,
            $crate::source::VoxelArray::Float64($arr) => $body,
        }
    };
}

impl VoxelArray {
    pub fn voxel_type(&self) -> VoxelType {
        match self {
            VoxelArray::Uint8(_) => VoxelType::Uint8,
            VoxelArray::Int8(_) => VoxelType::Int8,
            VoxelArray::Uint16(_) => VoxelType::Uint16,
            VoxelArray::Int16(_) => VoxelType::Int16,
            VoxelArray::Uint32(_) => VoxelType::Uint32,
            VoxelArray::Int32(_) => VoxelType::Int32,
            VoxelArray::Uint64(_) => VoxelType::Uint64,
            VoxelArray::Int64(_) => VoxelType::Int64,
            VoxelArray::Float32(_) => VoxelType::Float32,
            VoxelArray::Float64(_) => VoxelType::Float64,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = with_voxels!(self, a => a.shape());
        [s[0], s[1], s[2]]
    }

    /// A narrowed copy of 64-bit floats, or None if no narrowing is needed.
    pub fn narrowed_copy(&self) -> Option<Self> {
        match self {
            VoxelArray::Float64(a) => Some(VoxelArray::Float32(a.mapv(|v| v as f32))),
            _ => None,
        }
    }

    /// Only the dimension-2 indices `z0..z1`.
    pub fn slab(&self, z0: usize, z1: usize) -> Self {
        with_voxels!(self, a => a.slice_axis(Axis(2), Slice::from(z0..z1)).to_owned().into())
    }

    /// Narrow 64-bit floats to 32-bit; every other type is returned unchanged.
    ///
    /// Viewers cannot display 64-bit floats, so nothing wider than 32 bits
    /// of float precision is ever written.
    pub fn narrowed(self) -> Self {
        match self {
            VoxelArray::Float64(a) => VoxelArray::Float32(a.mapv(|v| v as f32)),
            other => other,
        }
    }

    /// Convert every element to `f64`.
    pub fn to_f64(&self) -> Array3<f64> {
        with_voxels!(self, a => a.mapv(Voxel::to_f64))
    }
}

impl<T: Voxel> From<Array3<T>> for VoxelArray {
    fn from(value: Array3<T>) -> Self {
        T::into_voxels(value)
    }
}

/// A volume with its physical voxel spacing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceArray {
    pub data: VoxelArray,
    /// Voxel spacing along each array dimension, in [SPACING_UNIT]s.
    pub spacing: [f64; 3],
    /// Spatial axis name of each array dimension.
    pub axes: [String; 3],
    /// Where the volume came from, for error messages.
    pub label: String,
}

impl SourceArray {
    pub fn new(data: impl Into<VoxelArray>, spacing: [f64; 3], label: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            spacing,
            axes: default_axes(),
            label: label.into(),
        }
    }

    pub fn with_axes(mut self, axes: [String; 3]) -> Self {
        self.axes = axes;
        self
    }

    pub fn shape(&self) -> [usize; 3] {
        self.data.shape()
    }
}

pub fn default_axes() -> [String; 3] {
    ["x".into(), "y".into(), "z".into()]
}

/// Where to find a volume and how it sits in physical space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: PathBuf,
    /// Voxel spacing along each array dimension, in [SPACING_UNIT]s.
    pub spacing: [f64; 3],
    #[serde(default = "default_axes")]
    pub axes: [String; 3],
    /// Rotation matrix of the volume, carried through to collected metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<[[f64; 3]; 3]>,
}

impl SourceRef {
    pub fn new(path: impl Into<PathBuf>, spacing: [f64; 3]) -> Self {
        Self {
            path: path.into(),
            spacing,
            axes: default_axes(),
            orientation: None,
        }
    }
}

/// Turns a [SourceRef] into an in-memory [SourceArray].
pub trait SourceLoader {
    fn load(&self, source: &SourceRef) -> crate::Result<SourceArray>;
}

/// Loads 3-D `.npy` files, taking spacing and axes from the reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyLoader;

impl SourceLoader for NpyLoader {
    fn load(&self, source: &SourceRef) -> crate::Result<SourceArray> {
        let data = read_npy(&source.path)?;
        Ok(SourceArray {
            data,
            spacing: source.spacing,
            axes: source.axes.clone(),
            label: source.path.display().to_string(),
        })
    }
}

fn npy_header<R: std::io::Read>(
    npy: &npyz::NpyFile<R>,
    path: &Path,
) -> crate::Result<(VoxelType, [usize; 3])> {
    let shape = npy.shape();
    if shape.len() != 3 {
        return Err(crate::Error::config(format!(
            "{} has {} dimensions, expected 3",
            path.display(),
            shape.len()
        )));
    }
    let voxel_type = VoxelType::from_npy_descr(&npy.dtype().descr())?;
    Ok((
        voxel_type,
        [shape[0] as usize, shape[1] as usize, shape[2] as usize],
    ))
}

/// Element type and shape of a 3-D `.npy` file, without reading its data.
pub fn read_npy_header(path: &Path) -> crate::Result<(VoxelType, [usize; 3])> {
    let npy = npyz::NpyFile::new(BufReader::new(File::open(path)?))?;
    npy_header(&npy, path)
}

/// Read a 3-D `.npy` file of any supported element type.
pub fn read_npy(path: &Path) -> crate::Result<VoxelArray> {
    let reader = BufReader::new(File::open(path)?);
    let npy = npyz::NpyFile::new(reader)?;
    let (voxel_type, [a, b, c]) = npy_header(&npy, path)?;
    let dims = (a, b, c);
    let fortran = matches!(npy.order(), npyz::Order::Fortran);

    macro_rules! typed {
        ($t:ty) => {{
            let data = npy.into_vec::<$t>()?;
            let array = if fortran {
                Array3::from_shape_vec(dims.f(), data)
            } else {
                Array3::from_shape_vec(dims, data)
            }
            .map_err(crate::Error::wrap)?;
            VoxelArray::from(array)
        }};
    }

    let out = match voxel_type {
        VoxelType::Uint8 => typed!(u8),
        VoxelType::Int8 => typed!(i8),
        VoxelType::Uint16 => typed!(u16),
        VoxelType::Int16 => typed!(i16),
        VoxelType::Uint32 => typed!(u32),
        VoxelType::Int32 => typed!(i32),
        VoxelType::Uint64 => typed!(u64),
        VoxelType::Int64 => typed!(i64),
        VoxelType::Float32 => typed!(f32),
        VoxelType::Float64 => typed!(f64),
    };
    Ok(out)
}

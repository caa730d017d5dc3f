use std::{borrow::Cow, num::NonZeroU64};

use serde::{Deserialize, Serialize};
use zarrs::{
    array::{
        ArrayMetadataV3, FillValueMetadata,
        chunk_grid::{RegularBoundedChunkGrid, RegularBoundedChunkGridConfiguration},
    },
    metadata::v3::MetadataV3,
    plugin::ExtensionAliasesV3,
};

use crate::{codec::CodecConfig, source::VoxelType};

/// OME-NGFF version written to multiscale nodes.
pub const OME_VERSION: &str = "0.5";

/// Attribute key of the per-level sidecar listing.
pub const SCALES_ATTRIBUTE: &str = "scales";

/// Contents of the `ome` attribute of a multiscale node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeMetadata {
    pub version: String,
    pub multiscales: Vec<Multiscale>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub axes: Vec<AxisMetadata>,
    /// Ordered from highest to lowest resolution.
    pub datasets: Vec<Dataset>,
    /// Downscaling method.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AxisMetadata {
    pub fn space(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "space".into(),
            unit: Some(unit.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CoordinateTransform {
    Scale { scale: Vec<f64> },
}

/// One pyramid level as listed in a scale sidecar.
///
/// The same shape is used by the multiscale node attributes and the
/// precomputed `info` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleInfo {
    /// Store key of the level.
    pub key: String,
    /// Chunk encoding, e.g. `raw` or `gzip`.
    pub encoding: String,
    /// Physical size of one voxel along each dimension.
    pub resolution: [f64; 3],
    /// Voxel extent of the level.
    pub size: [u64; 3],
    pub chunk_sizes: Vec<[u64; 3]>,
    #[serde(default)]
    pub voxel_offset: [i64; 3],
}

/// Decimal places kept in resolution keys.
const KEY_DECIMALS: i32 = 9;

/// Resolution key of a level: the scale components joined by `_`.
///
/// Components are rounded to [KEY_DECIMALS] places so float noise from
/// scale arithmetic never reaches a node name.
pub fn resolution_key(scale: &[f64; 3]) -> String {
    let factor = 10f64.powi(KEY_DECIMALS);
    let [x, y, z] = scale.map(|s| (s * factor).round() / factor);
    format!("{x}_{y}_{z}")
}

/// Build the attributes of a multiscale node.
pub fn multiscale_attributes(
    name: &str,
    axes: &[String; 3],
    unit: &str,
    downscaling: Option<&str>,
    levels: &[ScaleInfo],
) -> crate::Result<serde_json::Map<String, serde_json::Value>> {
    let ome = OmeMetadata {
        version: OME_VERSION.into(),
        multiscales: vec![Multiscale {
            name: Some(name.into()),
            axes: axes.iter().map(|a| AxisMetadata::space(a, unit)).collect(),
            datasets: levels
                .iter()
                .map(|l| Dataset {
                    path: l.key.clone(),
                    coordinate_transformations: vec![CoordinateTransform::Scale {
                        scale: l.resolution.to_vec(),
                    }],
                })
                .collect(),
            kind: downscaling.map(String::from),
        }],
    };
    let mut attributes = serde_json::Map::new();
    attributes.insert("ome".into(), serde_json::to_value(ome)?);
    attributes.insert(SCALES_ATTRIBUTE.into(), serde_json::to_value(levels)?);
    Ok(attributes)
}

/// Recover the OME metadata of a multiscale node from its attributes.
pub fn parse_ome(
    attributes: &serde_json::Map<String, serde_json::Value>,
) -> crate::Result<OmeMetadata> {
    let value = attributes
        .get("ome")
        .ok_or_else(|| crate::Error::general("no `ome` attribute"))?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Recover the scale sidecar of a multiscale node from its attributes.
pub fn parse_scales(
    attributes: &serde_json::Map<String, serde_json::Value>,
) -> crate::Result<Vec<ScaleInfo>> {
    let value = attributes
        .get(SCALES_ATTRIBUTE)
        .ok_or_else(|| crate::Error::general(format!("no `{SCALES_ATTRIBUTE}` attribute")))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn non_zero_shape(chunk_shape: &[u64]) -> crate::Result<Vec<NonZeroU64>> {
    chunk_shape
        .iter()
        .map(|&n| NonZeroU64::new(n).ok_or_else(|| crate::Error::config("zero chunk size")))
        .collect()
}

/// Regular chunk grid; edge chunks are stored padded to full size.
fn regular_chunk_grid(chunk_shape: &[u64]) -> crate::Result<MetadataV3> {
    let chunk_shape = non_zero_shape(chunk_shape)?;
    let out = MetadataV3::new_with_serializable_configuration(
        "regular".to_string(),
        &serde_json::json!({ "chunk_shape": chunk_shape }),
    )?;
    Ok(out)
}

/// Regular bounded chunk grid; edge chunks are stored truncated to the array.
fn bounded_chunk_grid(chunk_shape: &[u64]) -> crate::Result<MetadataV3> {
    let chunk_shape = non_zero_shape(chunk_shape)?;
    let out = MetadataV3::new_with_serializable_configuration(
        RegularBoundedChunkGrid::aliases_v3()
            .default_name
            .clone()
            .to_string(),
        &RegularBoundedChunkGridConfiguration { chunk_shape },
    )?;
    Ok(out)
}

fn convert_data_type(voxel_type: VoxelType) -> MetadataV3 {
    let data_type = voxel_type.zarr_data_type();
    let data_type_name = data_type
        .name_v3()
        .map_or_else(String::new, Cow::into_owned);
    let data_type_configuration = data_type.configuration_v3();
    if data_type_configuration.is_empty() {
        MetadataV3::new(data_type_name)
    } else {
        MetadataV3::new_with_configuration(data_type_name, data_type_configuration)
    }
}

fn convert_fill_value() -> FillValueMetadata {
    FillValueMetadata::Number(serde_json::Number::from(0))
}

/// Array metadata for one level of a multiscale node.
pub fn level_array_metadata(
    shape: &[u64],
    chunk_shape: &[u64],
    voxel_type: VoxelType,
    codec: &CodecConfig,
) -> crate::Result<ArrayMetadataV3> {
    let out = ArrayMetadataV3::new(
        shape.to_vec(),
        regular_chunk_grid(chunk_shape)?,
        convert_data_type(voxel_type),
        convert_fill_value(),
        codec.codec_chain()?,
    );
    Ok(out)
}

/// Array metadata for a chunk layout with truncated edge chunks and a custom key encoding.
pub fn bounded_array_metadata(
    shape: &[u64],
    chunk_shape: &[u64],
    voxel_type: VoxelType,
    codec: &CodecConfig,
    chunk_key_encoding: MetadataV3,
) -> crate::Result<ArrayMetadataV3> {
    let out = ArrayMetadataV3::new(
        shape.to_vec(),
        bounded_chunk_grid(chunk_shape)?,
        convert_data_type(voxel_type),
        convert_fill_value(),
        codec.codec_chain()?,
    )
    .with_chunk_key_encoding(chunk_key_encoding);
    Ok(out)
}

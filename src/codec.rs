use serde::{Deserialize, Serialize};
use zarrs::{array::CodecOptions, metadata::v3::MetadataV3};

/// Chunk compression configuration.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Compression {
    /// Uncompressed.
    Raw,
    Gzip {
        /// Default 5. Must be in the range 0..=9.
        #[serde(default = "default_gzip_level")]
        level: u32,
    },
    Zstd {
        /// Default 3.
        #[serde(default = "default_zstd_level")]
        level: i32,
        #[serde(default)]
        checksum: bool,
    },
}

fn default_gzip_level() -> u32 {
    5
}

fn default_zstd_level() -> i32 {
    3
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip {
            level: default_gzip_level(),
        }
    }
}

impl Compression {
    /// Name of the encoding as listed in scale sidecars.
    pub fn encoding(&self) -> &'static str {
        match self {
            Compression::Raw => "raw",
            Compression::Gzip { .. } => "gzip",
            Compression::Zstd { .. } => "zstd",
        }
    }

    fn to_metadata(self) -> crate::Result<Option<MetadataV3>> {
        let out = match self {
            Compression::Raw => None,
            Compression::Gzip { level } => {
                if level > 9 {
                    return Err(crate::Error::config(format!(
                        "invalid gzip compression level {level}"
                    )));
                }
                Some(MetadataV3::new_with_serializable_configuration(
                    "gzip".to_string(),
                    &serde_json::json!({ "level": level }),
                )?)
            }
            Compression::Zstd { level, checksum } => {
                Some(MetadataV3::new_with_serializable_configuration(
                    "zstd".to_string(),
                    &serde_json::json!({ "level": level, "checksum": checksum }),
                )?)
            }
        };
        Ok(out)
    }
}

/// How chunks are encoded, and how many threads the codecs may use.
///
/// The concurrency target is passed explicitly to every store operation;
/// set it to 1 when many worker processes already saturate the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub compression: Compression,
    pub concurrent_target: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            concurrent_target: 1,
        }
    }
}

impl CodecConfig {
    pub fn raw() -> Self {
        Self {
            compression: Compression::Raw,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.concurrent_target == 0 {
            return Err(crate::Error::config(
                "codec concurrent target must be positive",
            ));
        }
        self.compression.to_metadata().map(|_| ())
    }

    /// Little-endian bytes codec followed by the configured compressor.
    pub fn codec_chain(&self) -> crate::Result<Vec<MetadataV3>> {
        let bytes = MetadataV3::new_with_serializable_configuration(
            "bytes".to_string(),
            &serde_json::json!({ "endian": "little" }),
        )?;
        let mut chain = vec![bytes];
        chain.extend(self.compression.to_metadata()?);
        Ok(chain)
    }

    pub fn codec_options(&self) -> CodecOptions {
        let mut options = CodecOptions::default();
        options.set_concurrent_target(self.concurrent_target.max(1));
        options
    }
}

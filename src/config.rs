//! JSON run configuration, validated in full before anything is written.
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    codec::CodecConfig,
    pyramid::{AxisMask, PyramidBuilder, PyramidKind},
    source::SourceRef,
    storage::validate_node_name,
};

fn default_downscale() -> usize {
    2
}

fn default_cutoff() -> usize {
    64
}

fn default_chunk_cap() -> u64 {
    64
}

/// One fewer than the available cores, and at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// How each volume is converted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Reduction per pyramid step; 1 writes level 0 only.
    #[serde(default = "default_downscale")]
    pub downscale: usize,
    /// Stop once the largest reduced extent is at or below this.
    #[serde(default = "default_cutoff")]
    pub cutoff: usize,
    #[serde(default = "default_chunk_cap")]
    pub chunk_cap: u64,
    #[serde(default)]
    pub pyramid: PyramidKind,
    #[serde(default)]
    pub axes: AxisMask,
    #[serde(default)]
    pub codec: CodecConfig,
    /// Collect per-item metadata without writing anything.
    #[serde(default)]
    pub only_metadata: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downscale: default_downscale(),
            cutoff: default_cutoff(),
            chunk_cap: default_chunk_cap(),
            pyramid: PyramidKind::default(),
            axes: AxisMask::default(),
            codec: CodecConfig::default(),
            only_metadata: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> crate::Result<()> {
        if self.downscale == 0 {
            return Err(crate::Error::config("downscale factor must be positive"));
        }
        if self.cutoff == 0 {
            return Err(crate::Error::config("cutoff must be positive"));
        }
        if self.chunk_cap == 0 {
            return Err(crate::Error::config("chunk cap must be positive"));
        }
        if !self.axes.0.iter().any(|&a| a) {
            return Err(crate::Error::config("no axes to downscale"));
        }
        self.codec.validate()
    }

    pub fn pyramid_builder(&self) -> Box<dyn PyramidBuilder + Send + Sync> {
        self.pyramid.builder(self.downscale, self.cutoff, self.axes)
    }
}

/// A named volume to convert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Name of the node written for this volume.
    pub name: String,
    #[serde(flatten)]
    pub source: SourceRef,
}

/// Volumes written side by side under one parent group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Sub-group of the root to write into; the root itself if absent.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Copied into the parent group once its volumes are written.
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    pub sources: Vec<SourceEntry>,
}

/// Composites, each the sum of named volumes from the source groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateConfig {
    #[serde(default)]
    pub prefix: Option<String>,
    /// Composite name to the names of its member sources.
    pub members: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Root directory of the store.
    pub output_dir: PathBuf,
    /// Delete an existing store root instead of failing.
    #[serde(default)]
    pub clobber: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub aggregates: Vec<AggregateConfig>,
    /// Where to write the per-item metadata catalog.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
}

/// Read a JSON configuration file.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> crate::Result<T> {
    let f = File::open(path).map_err(|e| {
        crate::Error::config(format!("could not open {}: {e}", path.display()))
    })?;
    serde_json::from_reader(BufReader::new(f))
        .map_err(|e| crate::Error::config(format!("could not parse {}: {e}", path.display())))
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn check_spacing(name: &str, source: &SourceRef) -> crate::Result<()> {
    if source.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(crate::Error::config(format!(
            "{name}: voxel spacing must be positive, got {:?}",
            source.spacing
        )));
    }
    Ok(())
}

impl RunConfig {
    /// Read a configuration; relative paths are taken relative to its directory.
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let mut config: Self = read_json(path)?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.output_dir);
        if let Some(p) = self.metadata_path.as_mut() {
            resolve(base, p);
        }
        for group in self.groups.iter_mut() {
            if let Some(p) = group.manifest.as_mut() {
                resolve(base, p);
            }
            for entry in group.sources.iter_mut() {
                resolve(base, &mut entry.source.path);
            }
        }
    }

    /// Every source by name, across all groups.
    pub fn available_sources(&self) -> BTreeMap<String, SourceRef> {
        self.groups
            .iter()
            .flat_map(|g| g.sources.iter())
            .map(|e| (e.name.clone(), e.source.clone()))
            .collect()
    }

    /// Check everything which can be checked without reading any volume.
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            return Err(crate::Error::config("need at least one worker"));
        }
        self.settings.validate()?;

        let mut prefixes = BTreeSet::new();
        let all_prefixes = self
            .groups
            .iter()
            .map(|g| &g.prefix)
            .chain(self.aggregates.iter().map(|a| &a.prefix));
        for prefix in all_prefixes.flatten() {
            validate_node_name(prefix)?;
            if !prefixes.insert(prefix.as_str()) {
                return Err(crate::Error::DuplicateName(format!("/{prefix}")));
            }
        }

        // (parent, name) of every node written
        let mut targets = BTreeSet::new();
        let mut claim = |prefix: &Option<String>, name: &str| -> crate::Result<()> {
            validate_node_name(name)?;
            let parent = prefix.as_deref().unwrap_or("");
            if prefixes.contains(name) && parent.is_empty() {
                return Err(crate::Error::DuplicateName(format!("/{name}")));
            }
            if !targets.insert((parent.to_string(), name.to_string())) {
                return Err(crate::Error::DuplicateName(format!("{parent}/{name}")));
            }
            Ok(())
        };

        let mut source_names: BTreeMap<&str, usize> = BTreeMap::new();
        for group in &self.groups {
            for entry in &group.sources {
                claim(&group.prefix, &entry.name)?;
                check_spacing(&entry.name, &entry.source)?;
                *source_names.entry(entry.name.as_str()).or_default() += 1;
            }
            if let Some(manifest) = &group.manifest
                && !manifest.is_file()
            {
                return Err(crate::Error::config(format!(
                    "manifest {} does not exist",
                    manifest.display()
                )));
            }
        }
        for aggregate in &self.aggregates {
            for (name, members) in &aggregate.members {
                claim(&aggregate.prefix, name)?;
                for member in members {
                    if source_names.get(member.as_str()).copied().unwrap_or(0) > 1 {
                        return Err(crate::Error::config(format!(
                            "{name}: member {member} names sources in more than one group"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Export of one volume as a tiled layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrecomputedConfig {
    /// Layer directory receiving the `info` file and one directory per scale.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub clobber: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub source: SourceRef,
    #[serde(default = "default_downscale")]
    pub downscale: usize,
    #[serde(default = "default_cutoff")]
    pub cutoff: usize,
    #[serde(default = "default_chunk_cap")]
    pub chunk_cap: u64,
    #[serde(default)]
    pub axes: AxisMask,
}

impl PrecomputedConfig {
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let mut config: Self = read_json(path)?;
        let base = path.parent().unwrap_or(Path::new("."));
        resolve(base, &mut config.output_dir);
        resolve(base, &mut config.source.path);
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let settings = Settings {
            downscale: self.downscale,
            cutoff: self.cutoff,
            chunk_cap: self.chunk_cap,
            axes: self.axes,
            codec: CodecConfig::raw(),
            ..Default::default()
        };
        if self.workers == 0 {
            return Err(crate::Error::config("need at least one worker"));
        }
        settings.validate()?;
        check_spacing("source", &self.source)
    }

    pub fn pyramid_builder(&self) -> Box<dyn PyramidBuilder + Send + Sync> {
        PyramidKind::Gaussian.builder(self.downscale, self.cutoff, self.axes)
    }
}

//! Conversion runs: turning configured sources and composites into store nodes
//! using pools of worker processes.
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    aggregate,
    config::{RunConfig, Settings},
    error::WorkerFailure,
    pool::{self, Launcher, Outcome, Partition, PoolReport, WorkItem, WorkerPool},
    source::{NpyLoader, SourceArray, SourceLoader, SourceRef},
    storage::{GroupPath, StoreRoot},
    writer::GroupWriter,
};

/// One node to write: a single source, or the sum of several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub parent: GroupPath,
    pub name: String,
    pub sources: Vec<SourceRef>,
}

impl WorkUnit {
    pub fn new(parent: GroupPath, name: impl Into<String>, sources: Vec<SourceRef>) -> Self {
        Self {
            parent,
            name: name.into(),
            sources,
        }
    }
}

impl WorkItem for WorkUnit {
    fn id(&self) -> String {
        if self.parent.is_root() {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.parent, self.name)
        }
    }
}

/// Shared by every item of a worker's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub store: PathBuf,
    pub settings: Settings,
}

/// Physical metadata of one written item, collected into the run catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
    pub paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_matrix: Option<[[f64; 3]; 3]>,
}

impl ItemMetadata {
    fn for_sources(sources: &[SourceRef]) -> crate::Result<Self> {
        let first = sources
            .first()
            .ok_or_else(|| crate::Error::general("work unit has no sources"))?;
        let spacing = |axis: &str, fallback: usize| {
            let d = first.axes.iter().position(|a| a == axis).unwrap_or(fallback);
            first.spacing[d]
        };
        Ok(Self {
            x_mm: spacing("x", 0),
            y_mm: spacing("y", 1),
            z_mm: spacing("z", 2),
            paths: sources.iter().map(|s| s.path.clone()).collect(),
            rotation_matrix: first.orientation,
        })
    }
}

/// Load, optionally sum, and write one work unit into the store.
pub fn process_unit(
    context: &WorkerContext,
    unit: &WorkUnit,
    loader: &dyn SourceLoader,
) -> crate::Result<ItemMetadata> {
    let metadata = ItemMetadata::for_sources(&unit.sources)?;
    if context.settings.only_metadata {
        return Ok(metadata);
    }

    let source: SourceArray = if let [single] = unit.sources.as_slice() {
        loader.load(single)?
    } else {
        let loaded = unit
            .sources
            .iter()
            .map(|s| loader.load(s))
            .collect::<crate::Result<Vec<_>>>()?;
        aggregate::sum(loaded)?
    };

    let root = StoreRoot::open(&context.store)?;
    let settings = &context.settings;
    let builder = settings.pyramid_builder();
    GroupWriter::new(&root, settings.codec)
        .with_downscaling(builder.method())
        .write_source(
            &unit.parent,
            &unit.name,
            source,
            builder.as_ref(),
            settings.chunk_cap,
        )?;
    Ok(metadata)
}

/// Worker-process entry point for a job file written by [Converter].
pub fn run_worker(job: &Path) -> crate::Result<()> {
    pool::run_job::<WorkerContext, WorkUnit, ItemMetadata, _>(job, |context, unit| {
        process_unit(context, unit, &NpyLoader)
    })
}

/// Outcome of a conversion run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Identities of the nodes written, in completion order.
    pub written: Vec<String>,
    pub metadata: BTreeMap<String, ItemMetadata>,
    pub failures: Vec<WorkerFailure>,
}

impl RunReport {
    pub fn merge(&mut self, report: PoolReport<ItemMetadata>) {
        for outcome in report.outcomes {
            match outcome.outcome {
                Outcome::Done { value } => {
                    self.written.push(outcome.item.clone());
                    self.metadata.insert(outcome.item, value);
                }
                Outcome::Failed { cause } => self.failures.push(WorkerFailure {
                    item: outcome.item,
                    cause,
                }),
            }
        }
    }

    /// Fail with [crate::Error::WorkersFailed] if any item failed.
    pub fn check(self) -> crate::Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(crate::Error::WorkersFailed(self.failures))
        }
    }

    /// Write the metadata catalog as one JSON object keyed by item.
    pub fn write_catalog(&self, path: &Path) -> crate::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut w, &self.metadata)?;
        w.flush()?;
        Ok(())
    }
}

/// Writes batches of work units into one store root.
#[derive(Debug)]
pub struct Converter<L> {
    pool: WorkerPool<L>,
    context: WorkerContext,
}

impl<L: Launcher> Converter<L> {
    pub fn new(pool: WorkerPool<L>, store: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            pool,
            context: WorkerContext {
                store: store.into(),
                settings,
            },
        }
    }

    /// Write units whose cost is known up front, dealt round-robin.
    pub fn write_sources(&self, units: Vec<WorkUnit>) -> crate::Result<PoolReport<ItemMetadata>> {
        self.write(units, Partition::RoundRobin)
    }

    /// Write composites, whose cost depends on their membership.
    pub fn write_aggregates(
        &self,
        units: Vec<WorkUnit>,
    ) -> crate::Result<PoolReport<ItemMetadata>> {
        self.write(units, Partition::Bounded)
    }

    fn write(
        &self,
        units: Vec<WorkUnit>,
        partition: Partition,
    ) -> crate::Result<PoolReport<ItemMetadata>> {
        pool::check_disjoint(&units)?;
        self.pool.run(&self.context, units, partition)
    }
}

/// Parent group for a prefix, creating it unless only collecting metadata.
fn parent_group(
    root: Option<&StoreRoot>,
    prefix: Option<&str>,
) -> crate::Result<GroupPath> {
    match (root, prefix) {
        (_, None) => Ok(GroupPath::root()),
        (Some(root), Some(prefix)) => {
            root.create_group(&GroupPath::root(), prefix, Default::default())
        }
        (None, Some(prefix)) => GroupPath::root().child(prefix),
    }
}

/// Run a whole conversion: every source group, then every composite.
///
/// The configuration is validated before the store root is touched.
/// Items which fail do not stop their siblings; they are collected and
/// reported as [crate::Error::WorkersFailed] once everything else is done.
pub fn run<L: Launcher>(config: &RunConfig, launcher: L) -> crate::Result<RunReport> {
    config.validate()?;
    let start = Instant::now();
    let settings = &config.settings;

    let root = if settings.only_metadata {
        info!("collecting metadata only");
        None
    } else {
        Some(StoreRoot::create(&config.output_dir, config.clobber)?)
    };
    let pool = WorkerPool::new(launcher, config.workers)?;
    let converter = Converter::new(pool, &config.output_dir, settings.clone());
    let mut report = RunReport::default();

    for group in &config.groups {
        let t = Instant::now();
        let parent = parent_group(root.as_ref(), group.prefix.as_deref())?;
        let units: Vec<WorkUnit> = group
            .sources
            .iter()
            .map(|e| WorkUnit::new(parent.clone(), &e.name, vec![e.source.clone()]))
            .collect();
        info!("writing {} source(s) into {parent}", units.len());
        report.merge(converter.write_sources(units)?);
        if let (Some(root), Some(manifest)) = (root.as_ref(), group.manifest.as_ref()) {
            let dest = root.copy_manifest(&parent, manifest)?;
            info!("copied manifest to {}", dest.display());
        }
        info!("wrote {parent} in {:.2?}", t.elapsed());
    }

    let available = config.available_sources();
    for aggregate in &config.aggregates {
        let t = Instant::now();
        let resolved = aggregate::resolve_groups(&aggregate.members, &available);
        if resolved.is_empty() {
            warn!("no composites with available members");
            continue;
        }
        let parent = parent_group(root.as_ref(), aggregate.prefix.as_deref())?;
        let units: Vec<WorkUnit> = resolved
            .into_iter()
            .map(|(name, sources)| WorkUnit::new(parent.clone(), name, sources))
            .collect();
        info!("writing {} composite(s) into {parent}", units.len());
        report.merge(converter.write_aggregates(units)?);
        info!("wrote composites in {parent} in {:.2?}", t.elapsed());
    }

    if let Some(path) = &config.metadata_path {
        report.write_catalog(path)?;
        info!("wrote metadata for {} item(s) to {}", report.metadata.len(), path.display());
    }
    info!(
        "finished {} item(s) with {} failure(s) in {:.2?}",
        report.written.len(),
        report.failures.len(),
        start.elapsed()
    );
    report.check()
}

//! Bounded pools of worker processes.
//!
//! The parent partitions work items into batches, writes each batch to a job
//! file and launches one process per batch. Workers share no memory with the
//! parent or each other. Each worker records the outcome of every item in a
//! report file; the parent reads it once the worker has exited and checks the
//! exit status, so an item is only ever counted as done if its worker said so.
use std::{
    collections::HashSet,
    ffi::OsString,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::WorkerFailure;

/// Default interval between checks for finished workers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Something a worker can process, identified for logging and retries.
pub trait WorkItem {
    fn id(&self) -> String;
}

/// How items are split between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Item `i` goes to worker `i % max_workers`; all workers start at once.
    RoundRobin,
    /// Contiguous batches of `ceil(len / max_workers)` items, launched while
    /// fewer than `max_workers` are still running.
    Bounded,
}

/// Deal items into at most `n` non-empty buckets, item `i` to bucket `i % n`.
pub fn round_robin<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let n = n.max(1).min(items.len());
    let mut buckets: Vec<Vec<T>> = (0..n).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        buckets[i % n].push(item);
    }
    buckets
}

/// Split items, in order, into batches of `ceil(len / n)`.
pub fn contiguous<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = items.len().div_ceil(n.max(1));
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        out.push(items.by_ref().take(size).collect());
    }
    out
}

impl Partition {
    pub fn split<T>(&self, items: Vec<T>, max_workers: usize) -> Vec<Vec<T>> {
        match self {
            Partition::RoundRobin => round_robin(items, max_workers),
            Partition::Bounded => contiguous(items, max_workers),
        }
    }
}

/// Check that no two items share an identity.
///
/// Items with equal identities would write to the same place concurrently.
pub fn check_disjoint<T: WorkItem>(items: &[T]) -> crate::Result<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        let id = item.id();
        if !seen.insert(id.clone()) {
            return Err(crate::Error::DuplicateName(id));
        }
    }
    Ok(())
}

/// Everything a worker process needs, serialized to its job file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<C, T> {
    pub worker: usize,
    pub context: C,
    pub items: Vec<T>,
    /// Where the worker writes its [Report].
    pub report: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome<R> {
    Done { value: R },
    Failed { cause: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome<R> {
    pub item: String,
    #[serde(flatten)]
    pub outcome: Outcome<R>,
}

/// Outcomes recorded by one worker, in processing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report<R> {
    pub worker: usize,
    pub outcomes: Vec<ItemOutcome<R>>,
}

/// Outcomes of every item of a pool run.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolReport<R> {
    pub outcomes: Vec<ItemOutcome<R>>,
}

impl<R> PoolReport<R> {
    pub fn failures(&self) -> Vec<WorkerFailure> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Failed { cause } => Some(WorkerFailure {
                    item: o.item.clone(),
                    cause: cause.clone(),
                }),
                Outcome::Done { .. } => None,
            })
            .collect()
    }

    /// Values of every item, or [crate::Error::WorkersFailed] if any failed.
    pub fn into_result(self) -> crate::Result<Vec<(String, R)>> {
        let failures = self.failures();
        if !failures.is_empty() {
            return Err(crate::Error::WorkersFailed(failures));
        }
        Ok(self
            .outcomes
            .into_iter()
            .filter_map(|o| match o.outcome {
                Outcome::Done { value } => Some((o.item, value)),
                Outcome::Failed { .. } => None,
            })
            .collect())
    }
}

/// Starts a worker process for a job file.
pub trait Launcher {
    fn launch(&self, job: &Path) -> crate::Result<Child>;
}

/// Runs `program args... <job file>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run the current executable with the given arguments.
    pub fn current_exe<I, S>(args: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, job: &Path) -> crate::Result<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(job)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(child)
    }
}

struct Running {
    worker: usize,
    child: Child,
    items: Vec<String>,
    report: PathBuf,
}

/// Runs batches of work items in at most `max_workers` concurrent processes.
#[derive(Debug, Clone)]
pub struct WorkerPool<L> {
    launcher: L,
    max_workers: usize,
    poll_interval: Duration,
}

impl<L: Launcher> WorkerPool<L> {
    pub fn new(launcher: L, max_workers: usize) -> crate::Result<Self> {
        if max_workers == 0 {
            return Err(crate::Error::config("need at least one worker"));
        }
        Ok(Self {
            launcher,
            max_workers,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Process every item in exactly one worker process.
    ///
    /// Returns once every launched worker has exited. Items a worker failed
    /// on, or never reported on, come back as [Outcome::Failed].
    pub fn run<C, T, R>(
        &self,
        context: &C,
        items: Vec<T>,
        partition: Partition,
    ) -> crate::Result<PoolReport<R>>
    where
        C: Serialize + Clone,
        T: Serialize + WorkItem,
        R: DeserializeOwned,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        if items.is_empty() {
            return Ok(PoolReport { outcomes });
        }
        let scratch = tempfile::Builder::new()
            .prefix("zarrs-multiscale-")
            .tempdir()?;
        let batches = partition.split(items, self.max_workers);
        info!(
            "running {} batch(es) on up to {} worker(s)",
            batches.len(),
            self.max_workers
        );

        let mut running: Vec<Running> = Vec::new();
        for (worker, batch) in batches.into_iter().enumerate() {
            while running.len() >= self.max_workers {
                if let Err(e) = self.reap(&mut running, &mut outcomes) {
                    error!("could not poll workers: {e}");
                    return self.abort(running, &mut outcomes, e);
                }
                if running.len() >= self.max_workers {
                    thread::sleep(self.poll_interval);
                }
            }
            match self.spawn(worker, context, batch, scratch.path()) {
                Ok(r) => running.push(r),
                Err(e) => {
                    error!("could not launch worker {worker}: {e}");
                    return self.abort(running, &mut outcomes, e);
                }
            }
        }
        self.wait_all(running, &mut outcomes)?;
        Ok(PoolReport { outcomes })
    }

    fn spawn<C, T>(
        &self,
        worker: usize,
        context: &C,
        items: Vec<T>,
        scratch: &Path,
    ) -> crate::Result<Running>
    where
        C: Serialize + Clone,
        T: Serialize + WorkItem,
    {
        let job_path = scratch.join(format!("job-{worker}.json"));
        let report = scratch.join(format!("report-{worker}.json"));
        let ids = items.iter().map(WorkItem::id).collect();
        let job = Job {
            worker,
            context: context.clone(),
            items,
            report: report.clone(),
        };
        let mut w = BufWriter::new(File::create(&job_path)?);
        serde_json::to_writer(&mut w, &job)?;
        w.flush()?;

        let child = self.launcher.launch(&job_path)?;
        debug!("launched worker {worker} as pid {}", child.id());
        Ok(Running {
            worker,
            child,
            items: ids,
            report,
        })
    }

    /// Collect every worker which has exited, without blocking.
    fn reap<R: DeserializeOwned>(
        &self,
        running: &mut Vec<Running>,
        outcomes: &mut Vec<ItemOutcome<R>>,
    ) -> crate::Result<()> {
        let mut idx = 0;
        while idx < running.len() {
            match running[idx].child.try_wait()? {
                Some(status) => {
                    let finished = running.swap_remove(idx);
                    outcomes.extend(collect(finished, status));
                }
                None => idx += 1,
            }
        }
        Ok(())
    }

    /// Wait for every running worker, then fail with `err`.
    ///
    /// Scratch files must outlive the workers reading and writing them.
    fn abort<R: DeserializeOwned>(
        &self,
        running: Vec<Running>,
        outcomes: &mut Vec<ItemOutcome<R>>,
        err: crate::Error,
    ) -> crate::Result<PoolReport<R>> {
        if let Err(e) = self.wait_all(running, outcomes) {
            warn!("while stopping workers: {e}");
        }
        Err(err)
    }

    fn wait_all<R: DeserializeOwned>(
        &self,
        running: Vec<Running>,
        outcomes: &mut Vec<ItemOutcome<R>>,
    ) -> crate::Result<()> {
        let mut first_err = None;
        for mut r in running {
            match r.child.wait() {
                Ok(status) => outcomes.extend(collect(r, status)),
                Err(e) => {
                    error!("could not wait for worker {}: {e}", r.worker);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Outcomes of a finished worker, with a failure for every item it did not report.
fn collect<R: DeserializeOwned>(finished: Running, status: ExitStatus) -> Vec<ItemOutcome<R>> {
    let Running {
        worker,
        items,
        report,
        ..
    } = finished;
    let mut reported: Vec<ItemOutcome<R>> = match read_report(&report) {
        Ok(Some(r)) => r.outcomes,
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!("could not read report of worker {worker}: {e}");
            Vec::new()
        }
    };
    let seen: HashSet<String> = reported.iter().map(|o| o.item.clone()).collect();
    let missing: Vec<String> = items.into_iter().filter(|i| !seen.contains(i)).collect();
    if status.success() {
        debug!("worker {worker} finished");
    } else {
        error!(
            "worker {worker} exited with {status}; {} item(s) unreported",
            missing.len()
        );
    }
    for item in missing {
        reported.push(ItemOutcome {
            item,
            outcome: Outcome::Failed {
                cause: format!("worker {worker} exited with {status} before reporting"),
            },
        });
    }
    reported
}

fn read_report<R: DeserializeOwned>(path: &Path) -> crate::Result<Option<Report<R>>> {
    if !path.exists() {
        return Ok(None);
    }
    let report = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    Ok(Some(report))
}

fn write_report<R: Serialize>(path: &Path, report: &Report<R>) -> crate::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut w = BufWriter::new(File::create(&tmp)?);
    serde_json::to_writer(&mut w, report)?;
    w.flush()?;
    drop(w);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Worker-process entry point: run `f` on every item of a job file, in order.
///
/// A failing item is logged and recorded; the remaining items still run.
/// The report is rewritten after every item, so the parent learns about
/// finished items even if this process dies part way through.
pub fn run_job<C, T, R, F>(job_path: &Path, mut f: F) -> crate::Result<()>
where
    C: DeserializeOwned,
    T: DeserializeOwned + WorkItem,
    R: Serialize,
    F: FnMut(&C, &T) -> crate::Result<R>,
{
    let job: Job<C, T> = serde_json::from_reader(BufReader::new(File::open(job_path)?))?;
    let mut report = Report {
        worker: job.worker,
        outcomes: Vec::with_capacity(job.items.len()),
    };
    for item in &job.items {
        let id = item.id();
        let outcome = match f(&job.context, item) {
            Ok(value) => Outcome::Done { value },
            Err(e) => {
                error!("worker {} failed on {id}: {e}", job.worker);
                Outcome::Failed {
                    cause: e.to_string(),
                }
            }
        };
        report.outcomes.push(ItemOutcome { item: id, outcome });
        write_report(&job.report, &report)?;
    }
    Ok(())
}

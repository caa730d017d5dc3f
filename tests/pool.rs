use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::atomic::{AtomicUsize, Ordering},
};

use zarrs_multiscale::{
    Error,
    config::Settings,
    convert::{Converter, ItemMetadata, WorkUnit, WorkerContext},
    pool::{
        CommandLauncher, Launcher, Outcome, Partition, WorkItem, WorkerPool, check_disjoint,
        contiguous, round_robin,
    },
    source::SourceRef,
    storage::GroupPath,
};

mod common;
use common::{SPACING, tmp_dir, worker_launcher};

fn units(parent: &GroupPath, n: usize) -> Vec<WorkUnit> {
    (0..n)
        .map(|i| {
            let mut source = SourceRef::new(format!("c{i}.npy"), SPACING);
            source.spacing[2] = 0.1 * (i + 1) as f64;
            WorkUnit::new(parent.clone(), format!("c{i}"), vec![source])
        })
        .collect()
}

#[test]
fn test_round_robin() {
    assert_eq!(
        round_robin((0..7).collect(), 3),
        vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]
    );
    assert_eq!(round_robin(vec![1, 2], 5), vec![vec![1], vec![2]]);
    assert!(round_robin(Vec::<u8>::new(), 4).is_empty());
}

#[test]
fn test_contiguous() {
    assert_eq!(
        contiguous((0..7).collect(), 3),
        vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
    );
    assert_eq!(
        contiguous((0..4).collect(), 8),
        vec![vec![0], vec![1], vec![2], vec![3]]
    );
    assert!(contiguous(Vec::<u8>::new(), 4).is_empty());
}

#[test]
fn test_partitions_cover_every_item_once() {
    for n in 0..20 {
        for workers in 1..6 {
            for partition in [Partition::RoundRobin, Partition::Bounded] {
                let batches = partition.split((0..n).collect::<Vec<_>>(), workers);
                assert!(batches.iter().all(|b| !b.is_empty()));
                let mut seen: Vec<_> = batches.into_iter().flatten().collect();
                seen.sort();
                assert_eq!(seen, (0..n).collect::<Vec<_>>());
            }
        }
    }
}

#[test]
fn test_colliding_targets_rejected() {
    let root = GroupPath::root();
    let other = root.child("other").expect("valid");
    let mut items = units(&root, 3);
    items.extend(units(&other, 3));
    check_disjoint(&items).expect("same names under different parents");

    items.push(WorkUnit::new(root.clone(), "c1", vec![]));
    match check_disjoint(&items) {
        Err(Error::DuplicateName(id)) => assert_eq!(id, "/c1"),
        other => panic!("expected duplicate name, got {other:?}"),
    }
}

#[test]
fn test_no_workers_rejected() {
    assert!(matches!(
        WorkerPool::new(worker_launcher(), 0),
        Err(Error::Config(_))
    ));
}

#[cfg(unix)]
#[test]
fn test_silent_workers_fail_their_items() {
    let tmp = tmp_dir();
    let context = WorkerContext {
        store: tmp.path().to_path_buf(),
        settings: Settings::default(),
    };
    for program in ["true", "false"] {
        let pool = WorkerPool::new(CommandLauncher::new(program, Vec::<String>::new()), 2)
            .expect("valid pool");
        let report = pool
            .run::<_, _, ItemMetadata>(
                &context,
                units(&GroupPath::root(), 5),
                Partition::Bounded,
            )
            .expect("pool runs");
        assert_eq!(report.outcomes.len(), 5);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| matches!(o.outcome, Outcome::Failed { .. }))
        );
        match report.into_result() {
            Err(Error::WorkersFailed(failures)) => assert_eq!(failures.len(), 5),
            other => panic!("expected failed workers, got {other:?}"),
        }
    }
}

/// Starts one slow worker which leaves a marker file, then refuses to launch more.
#[cfg(unix)]
struct OneSlowWorker {
    marker: PathBuf,
    launched: AtomicUsize,
}

#[cfg(unix)]
impl Launcher for OneSlowWorker {
    fn launch(&self, _job: &Path) -> zarrs_multiscale::Result<Child> {
        if self.launched.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(Error::general("no more workers"));
        }
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("sleep 1 && touch '{}'", self.marker.display()))
            .spawn()?;
        Ok(child)
    }
}

#[cfg(unix)]
#[test]
fn test_failed_launch_waits_for_running_workers() {
    let tmp = tmp_dir();
    let marker = tmp.path().join("finished");
    let launcher = OneSlowWorker {
        marker: marker.clone(),
        launched: AtomicUsize::new(0),
    };
    let pool = WorkerPool::new(launcher, 2).expect("valid pool");
    let context = WorkerContext {
        store: tmp.path().to_path_buf(),
        settings: Settings::default(),
    };
    let result = pool.run::<_, _, ItemMetadata>(
        &context,
        units(&GroupPath::root(), 2),
        Partition::RoundRobin,
    );
    match result {
        Err(Error::General(msg)) => assert_eq!(msg, "no more workers"),
        other => panic!("expected launch failure, got {other:?}"),
    }
    assert!(marker.exists(), "pool returned before its worker finished");
}

#[test]
fn test_every_item_runs_exactly_once() {
    let tmp = tmp_dir();
    let settings = Settings {
        only_metadata: true,
        ..Default::default()
    };
    let parent = GroupPath::root();
    for workers in [1, 3, 8] {
        let pool = WorkerPool::new(worker_launcher(), workers).expect("valid pool");
        let converter = Converter::new(pool, tmp.path(), settings.clone());
        for report in [
            converter.write_sources(units(&parent, 7)),
            converter.write_aggregates(units(&parent, 7)),
        ] {
            let done = report.expect("pool runs").into_result().expect("no failures");
            assert_eq!(done.len(), 7);
            let ids: BTreeSet<_> = done.iter().map(|(id, _)| id.clone()).collect();
            let expected: BTreeSet<_> = units(&parent, 7).iter().map(WorkItem::id).collect();
            assert_eq!(ids, expected);
            for (id, metadata) in &done {
                let i: usize = id.trim_start_matches("/c").parse().expect("numbered item");
                assert!((metadata.z_mm - 0.1 * (i + 1) as f64).abs() < 1e-12);
                assert!((metadata.x_mm - SPACING[0]).abs() < 1e-12);
            }
        }
    }
}

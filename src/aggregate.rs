//! Summing equally-shaped volumes into composites, e.g. per-class totals of per-cluster maps.
use std::collections::BTreeMap;

use log::{info, warn};
use ndarray::{Array3, Zip};

use crate::{
    source::{SourceArray, SourceRef, Voxel, VoxelArray},
    with_voxels,
};

/// Per-axis tolerance for considering two voxel spacings equal.
const SPACING_RTOL: f64 = 1e-5;
const SPACING_ATOL: f64 = 1e-8;

fn spacing_matches(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| (x - y).abs() <= SPACING_ATOL + SPACING_RTOL * y.abs())
}

/// Running elementwise total, at least as wide as every input.
enum Accumulator {
    Unsigned(Array3<u64>),
    Signed(Array3<i64>),
    Float(Array3<f64>),
}

impl Accumulator {
    fn for_sources(sources: &[SourceArray], shape: [usize; 3]) -> Self {
        let types: Vec<_> = sources.iter().map(|s| s.data.voxel_type()).collect();
        if types.iter().any(|t| t.is_float()) {
            Accumulator::Float(Array3::zeros(shape))
        } else if types.iter().any(|t| t.is_signed()) {
            Accumulator::Signed(Array3::zeros(shape))
        } else {
            Accumulator::Unsigned(Array3::zeros(shape))
        }
    }

    fn add(&mut self, data: &VoxelArray) {
        with_voxels!(data, a => self.add_typed(a))
    }

    fn add_typed<T: Voxel>(&mut self, data: &Array3<T>) {
        match self {
            Accumulator::Unsigned(acc) => Zip::from(acc)
                .and(data)
                .for_each(|t, &v| *t = t.saturating_add(v.to_u64())),
            Accumulator::Signed(acc) => Zip::from(acc)
                .and(data)
                .for_each(|t, &v| *t = t.saturating_add(v.to_i64())),
            Accumulator::Float(acc) => Zip::from(acc)
                .and(data)
                .for_each(|t, &v| *t += v.to_f64()),
        }
    }

    fn finish(self) -> VoxelArray {
        match self {
            Accumulator::Unsigned(a) => a.into(),
            Accumulator::Signed(a) => a.into(),
            Accumulator::Float(a) => a.into(),
        }
    }
}

/// Elementwise sum of volumes sharing one shape and voxel spacing.
///
/// Fails with [crate::Error::IncompatibleSources] naming the first source and
/// the first one which disagrees with it.
pub fn sum(sources: Vec<SourceArray>) -> crate::Result<SourceArray> {
    let Some(first) = sources.first() else {
        return Err(crate::Error::general("no sources to sum"));
    };
    let shape = first.shape();
    for other in &sources[1..] {
        if other.shape() != shape {
            return Err(crate::Error::IncompatibleSources {
                first: first.label.clone(),
                second: other.label.clone(),
                reason: format!("shape {:?} differs from {:?}", other.shape(), shape),
            });
        }
        if !spacing_matches(&first.spacing, &other.spacing) {
            return Err(crate::Error::IncompatibleSources {
                first: first.label.clone(),
                second: other.label.clone(),
                reason: format!(
                    "spacing {:?} differs from {:?}",
                    other.spacing, first.spacing
                ),
            });
        }
    }

    let mut acc = Accumulator::for_sources(&sources, shape);
    for source in &sources {
        acc.add(&source.data);
    }
    let label = format!(
        "sum({})",
        sources
            .iter()
            .map(|s| s.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(SourceArray {
        data: acc.finish(),
        spacing: first.spacing,
        axes: first.axes.clone(),
        label,
    })
}

/// Resolve aggregation groups against the available member sources.
///
/// Members missing from `available` are dropped. Groups left with no members
/// are omitted and logged, never returned empty. Output is sorted by group name.
pub fn resolve_groups(
    groups: &BTreeMap<String, Vec<String>>,
    available: &BTreeMap<String, SourceRef>,
) -> Vec<(String, Vec<SourceRef>)> {
    let mut out = Vec::with_capacity(groups.len());
    for (group, members) in groups {
        let sources: Vec<SourceRef> = members
            .iter()
            .filter_map(|m| available.get(m).cloned())
            .collect();
        if sources.is_empty() {
            warn!(
                "skipping {group}: none of its {} members are available",
                members.len()
            );
            continue;
        }
        if sources.len() < members.len() {
            info!(
                "{group}: {} of {} members available",
                sources.len(),
                members.len()
            );
        }
        out.push((group.clone(), sources));
    }
    out
}

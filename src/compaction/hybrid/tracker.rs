//! Running-compaction summary.
//!
//! Rebuilt from the engine's in-flight list on every decision; nothing is
//! tracked incrementally.

use std::ops::Index;

use crate::compaction::{CompactionReason, RunningCompaction};

use super::geometry::HyperLevelMap;

/// Per-hyper-level view of the running jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionDescriptor {
    /// Jobs whose start level belongs to this hyper-level.
    pub n_compactions: usize,

    /// One of them is a rearrange job.
    pub has_rearrange: bool,

    /// Start level of the most recently listed job.
    pub start_level: Option<usize>,
}

/// Descriptors for hyper-levels `0..=cur + 1` plus the global flags.
#[derive(Debug, Clone, Default)]
pub struct RunningDescriptors {
    slots: Vec<CompactionDescriptor>,
    pub manual_compaction_running: bool,
    pub rearrange_running: bool,
}

impl RunningDescriptors {
    /// Classifies `running` against a layout with `num_hyper_levels`
    /// hyper-levels.
    ///
    /// Jobs starting at or below the last level are charged to the top
    /// hyper-level.
    pub fn build(
        map: &HyperLevelMap,
        num_hyper_levels: usize,
        running: &[RunningCompaction],
    ) -> Self {
        let mut out = Self {
            slots: vec![CompactionDescriptor::default(); num_hyper_levels + 2],
            ..Self::default()
        };
        let last_level = map.last_level(num_hyper_levels);
        let safety_slot = out.slots.len() - 1;

        for job in running {
            if job.reason == CompactionReason::ManualCompaction {
                out.manual_compaction_running = true;
            }

            if job.start_level == 0 {
                out.slots[0].n_compactions += 1;
                continue;
            }

            let hyper_level = if job.start_level >= last_level {
                num_hyper_levels
            } else {
                map.hyper_level_num(job.start_level).min(safety_slot)
            };

            let slot = &mut out.slots[hyper_level];
            slot.n_compactions += 1;
            slot.start_level = Some(job.start_level);
            if job.reason == CompactionReason::Rearrange {
                slot.has_rearrange = true;
                out.rearrange_running = true;
            }
        }
        out
    }

    /// Number of slots: hyper-levels `0..=cur` plus one spare.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Index<usize> for RunningDescriptors {
    type Output = CompactionDescriptor;

    fn index(&self, hyper_level: usize) -> &CompactionDescriptor {
        &self.slots[hyper_level]
    }
}

//! Job builders.
//!
//! Every builder returns `None` when its preconditions do not hold; the
//! caller simply moves on to the next strategy.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::compaction::{CompactionInputFiles, CompactionJob, CompactionReason};
use crate::version::{FileMeta, LevelView};

use super::select::{self, intersecting};
use super::{MIN_ESCALATION_SPACE_AMP, PickerState};

/// Largest run of small files merged by one file-count reduction.
const MAX_REDUCE_FILES: usize = 200;

/// Largest total size of a small-file run.
const MAX_REDUCE_RUN_BYTES: u64 = 1 << 30;

/// Upper bound on the parallelism of a top hyper-level compaction.
const MAX_TOP_SUBCOMPACTIONS: usize = 4;

/// Depth of the level that signals a hyper-level filling up.
const RUSH_SIGNAL_OFFSET: usize = 4;

/// Selection budget per sub-compaction, in files.
const BUFFERS_PER_SUBCOMPACTION: usize = 4;

impl PickerState {
    /// Moves every populated level above the deepest hole of `hyper_level`
    /// into that hole.
    pub(super) fn rearrange_level(
        &self,
        hyper_level: usize,
        view: &dyn LevelView,
    ) -> Option<CompactionJob> {
        let mut first_level = self.first_level_in_hyper(hyper_level);
        let last_level = self.last_level_in_hyper(hyper_level);
        if let Some(inbound_output) = self.prev(hyper_level - 1).output_level {
            first_level = inbound_output + 1;
            if first_level >= last_level {
                return None;
            }
        }

        let output_level = (first_level..=last_level)
            .rev()
            .find(|&level| view.level_is_empty(level))?;

        let inputs: Vec<_> = (first_level..output_level)
            .filter(|&level| !view.level_is_empty(level))
            .map(|level| CompactionInputFiles::new(level, view.level_files(level).to_vec()))
            .collect();
        if inputs.is_empty() {
            return None;
        }

        let mut job = CompactionJob::new(inputs, output_level, CompactionReason::Rearrange);
        job.is_trivial_move = job.inputs.len() == 1;
        Some(job)
    }

    /// Adds a hyper-level once the last level outgrows the capacity of
    /// the current layout, moving the last level down to the new bottom.
    pub(super) fn check_db_size(&mut self, view: &dyn LevelView) -> Option<CompactionJob> {
        let old_last_level = self.last_level();
        let actual_db_size = view.num_level_bytes(old_last_level);
        let cur = self.cur_num_hyper_levels;
        let space_amp = self.space_amp_factor.max(MIN_ESCALATION_SPACE_AMP);
        let threshold = self.size_to_compact(cur) as f64 * space_amp;
        let actual = actual_db_size as f64;
        if actual_db_size == 0 || actual <= threshold {
            self.growth_capped = false;
            return None;
        }

        let top_size = self.hyper_level_size(cur, view);
        let first_level = self.first_level_in_hyper(cur);
        let escalate = actual > threshold * 1.2
            || (top_size as f64 * space_amp < actual && !view.level_is_empty(first_level + 3))
            || !view.level_is_empty(first_level + 1);
        if !escalate {
            return None;
        }

        if cur >= self.max_num_hyper_levels {
            if self.growth_capped {
                debug!(cf = %self.name, actual_db_size, "hybrid: growth still capped");
            } else {
                warn!(
                    cf = %self.name,
                    actual_db_size,
                    max_num_hyper_levels = self.max_num_hyper_levels,
                    "hybrid: database outgrew the deepest supported layout"
                );
                self.growth_capped = true;
            }
            return None;
        }

        self.cur_num_hyper_levels += 1;
        self.prev_mut(cur).set_empty();
        let output_level = self.last_level();
        info!(
            cf = %self.name,
            actual_db_size,
            top_size,
            cur_num_hyper_levels = self.cur_num_hyper_levels,
            "hybrid: increasing supported db size"
        );

        let inputs = vec![CompactionInputFiles::new(
            old_last_level,
            view.level_files(old_last_level).to_vec(),
        )];
        let mut job = CompactionJob::new(inputs, output_level, CompactionReason::Rearrange);
        job.is_trivial_move = true;
        Some(job)
    }

    /// Relinks the last level of the previous hyper-level into the deepest
    /// reachable empty level of the top hyper-level.
    pub(super) fn move_sst_to_last_level(&self, view: &dyn LevelView) -> Option<CompactionJob> {
        let cur = self.cur_num_hyper_levels;
        let source = self.last_level_in_hyper(cur - 1);
        if view.level_is_empty(source) {
            return None;
        }

        let output_level = (self.first_level_in_hyper(cur)..=self.last_level_in_hyper(cur))
            .take_while(|&level| view.level_is_empty(level))
            .last()?;

        let inputs = vec![CompactionInputFiles::new(source, view.level_files(source).to_vec())];
        let mut job = CompactionJob::new(inputs, output_level, CompactionReason::Rearrange);
        job.is_trivial_move = true;
        Some(job)
    }

    /// Merges the oldest L0 files into hyper-level 1.
    pub(super) fn pick_level0_compaction(
        &mut self,
        view: &dyn LevelView,
        merge_width: usize,
    ) -> Option<CompactionJob> {
        let l0_files = view.level_files(0);
        if l0_files.len() < merge_width {
            return None;
        }

        let first_level = self.first_level_in_hyper(1);
        if !view.level_is_empty(first_level) {
            return None;
        }
        // Spread out: go as deep as the empty prefix of hyper-level 1 allows.
        let output_level = (first_level..=self.last_level_in_hyper(1))
            .take_while(|&level| view.level_is_empty(level))
            .last()
            .unwrap_or(first_level);

        let max_width = self.map.multiplier(0) * 3 / 2;
        // L0 is newest-first: the oldest files are at the tail.
        let files = if l0_files.len() < max_width {
            l0_files.to_vec()
        } else {
            l0_files[l0_files.len() - max_width..].to_vec()
        };

        let mut job = CompactionJob::new(
            vec![CompactionInputFiles::new(0, files)],
            output_level,
            CompactionReason::LevelL0FilesNum,
        );
        if self.cur_num_hyper_levels <= 2 {
            job.grandparents = view.level_files(self.last_level()).to_vec();
        }
        job.max_subcompactions = if l0_files.len() > max_width { 2 } else { 1 };

        self.prev_mut(0).output_level = Some(output_level);
        Some(job)
    }

    /// Merges a selection out of `hyper_level` into the next one (or into
    /// the last level for the top hyper-level).
    pub(super) fn pick_level_compaction(
        &mut self,
        hyper_level: usize,
        view: &dyn LevelView,
        low_priority: bool,
    ) -> Option<CompactionJob> {
        let last_level_in_hyper = self.last_level_in_hyper(hyper_level);
        debug_assert!(!view.level_is_empty(last_level_in_hyper));

        let cur = self.cur_num_hyper_levels;
        let mut output_level = last_level_in_hyper + 1;
        let mut n_subcompactions = 1;
        let mut output_file_size = self.config.max_output_file_size;
        let mut grandparents = Vec::new();

        if hyper_level != cur {
            let next_end = self.last_level_in_hyper(hyper_level + 1);
            while output_level < next_end && view.level_is_empty(output_level + 1) {
                output_level += 1;
            }

            let outbound = self.prev(hyper_level);
            if let Some(carried) = outbound.output_level
                && let Some(last_file) = view.level_files(last_level_in_hyper).last()
                && outbound
                    .last_key
                    .as_deref()
                    .is_none_or(|key| last_file.largest.as_slice() > key)
            {
                // Keep feeding the level the previous sub-compaction wrote.
                output_level = carried;
            }

            grandparents = view.level_files(self.last_level()).to_vec();
        } else {
            let top_size = self.space_amp_factor * self.hyper_level_size(hyper_level, view) as f64;
            let db_size = view
                .num_level_bytes(self.last_level())
                .max(self.config.write_buffer_size.saturating_mul(8));
            output_file_size = output_file_size.min(db_size / 8);
            if top_size > db_size as f64 {
                let over = (top_size * 10.0 / db_size as f64) as usize;
                n_subcompactions =
                    (n_subcompactions + over.saturating_sub(10)).min(MAX_TOP_SUBCOMPACTIONS);
            }
        }
        if !view.level_is_empty(self.first_level_in_hyper(hyper_level) + RUSH_SIGNAL_OFFSET) {
            // Rush the compaction to avoid a stall.
            n_subcompactions += 1;
        }

        let n_buffers = if low_priority {
            1
        } else {
            n_subcompactions * BUFFERS_PER_SUBCOMPACTION
        };
        let selection = select::select_n_buffers(
            view,
            &self.map,
            hyper_level,
            n_buffers,
            output_level,
            self.last_level(),
            self.prev(hyper_level - 1),
            self.prev(hyper_level),
        )?;
        *self.prev_mut(hyper_level) = selection.bookmark;

        let inputs = selection.inputs;
        let mut job = if inputs.len() == 1 {
            debug_assert!(
                inputs[0]
                    .files
                    .iter()
                    .all(|f| !intersecting(f, view.level_files(output_level)))
            );
            let mut job =
                CompactionJob::new(inputs, output_level, CompactionReason::LevelMaxLevelSize);
            job.is_trivial_move = true;
            job
        } else {
            if hyper_level == cur {
                grandparents = inputs
                    .last()
                    .filter(|input| input.level == output_level)
                    .map(|input| build_grandparents(&input.files, output_file_size))
                    .unwrap_or_default();
            }
            let mut job =
                CompactionJob::new(inputs, output_level, CompactionReason::LevelMaxLevelSize);
            job.grandparents = grandparents;
            job.max_output_file_size = output_file_size;
            job
        };
        job.max_subcompactions = n_subcompactions;
        Some(job)
    }

    /// Merges the longest run of small, same-prefix files of the last level
    /// back into the last level.
    pub(super) fn pick_reduce_num_files(
        &self,
        view: &dyn LevelView,
        min_file_size: u64,
    ) -> Option<CompactionJob> {
        let last_level = self.last_level();
        let files = view.level_files(last_level);
        let prefix_len = self.config.table_prefix_size;

        let mut best_len = 0;
        let mut best_start = 0;
        let mut first = 0;
        while first < files.len() {
            let head = &files[first];
            if head.file_size >= min_file_size {
                first += 1;
                continue;
            }

            let mut total = head.file_size;
            let mut end = first + 1;
            while let Some(next) = files.get(end) {
                if next.file_size > min_file_size
                    || prefix(&next.smallest, prefix_len) != prefix(&head.largest, prefix_len)
                {
                    break;
                }
                total += next.file_size;
                if total > MAX_REDUCE_RUN_BYTES {
                    break;
                }
                end += 1;
            }

            if end - first > best_len {
                best_len = end - first;
                best_start = first;
            }
            first = end;
        }

        if best_len <= 1 {
            return None;
        }
        let best_len = best_len.min(MAX_REDUCE_FILES);

        let inputs = vec![CompactionInputFiles::new(
            last_level,
            files[best_start..best_start + best_len].to_vec(),
        )];
        Some(CompactionJob::new(inputs, last_level, CompactionReason::ReduceNumFiles))
    }
}

fn prefix(key: &[u8], len: usize) -> &[u8] {
    &key[..len.min(key.len())]
}

/// Picks boundary files from `files` every time the accumulated size
/// crosses 3/5 of `desired_size`.
pub(crate) fn build_grandparents(files: &[Arc<FileMeta>], desired_size: u64) -> Vec<Arc<FileMeta>> {
    let min_size = desired_size / 5 * 3;
    let mut acc = 0u64;
    let mut out = Vec::new();
    for file in files {
        acc += file.file_size;
        if acc > min_size {
            out.push(Arc::clone(file));
            acc = 0;
        }
    }
    out
}

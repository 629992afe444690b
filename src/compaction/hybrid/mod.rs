//! # Hybrid Compaction Picker
//!
//! A tiered/leveled hybrid. Numbered levels are grouped into
//! **hyper-levels** of `multiplier` levels each; inside a hyper-level every
//! level is one sorted run, and runs are merged down as a unit once the
//! hyper-level outgrows its budget. The bottom of the tree is a single last
//! level holding most of the data.
//!
//! ## Decision order
//!
//! [`HybridCompactionPicker::pick_compaction`] tries, first success wins:
//!
//! 1. lazy initialisation from the on-disk layout (first call only),
//! 2. bail out while a manual compaction runs,
//! 3. **rearrange**: close holes inside a hyper-level,
//! 4. **size escalation**: grow the number of hyper-levels, or move a
//!    large level of the previous hyper-level into the top one,
//! 5. **L0 drain** into hyper-level 1,
//! 6. **level compaction** of the first over-budget hyper-level,
//! 7. **file-count reduction** in the last level,
//! 8. optionally, low-priority sorted-run reduction.
//!
//! ## Concurrency
//!
//! All mutable state lives in one [`PickerState`] behind an `RwLock`.
//! Picking holds the write lock for the whole decision, so decisions are
//! serialized while the jobs themselves run in parallel elsewhere.
//! [`needs_compaction`](HybridCompactionPicker::needs_compaction) only
//! takes the read lock; it is a trigger, not an admission gate.

#[cfg(test)]
mod tests;

pub mod geometry;
mod jobs;
pub mod select;
pub mod tracker;

use std::sync::RwLock;

use tracing::{debug, info, warn};

pub use geometry::HyperLevelMap;
pub use select::PrevSubCompaction;
pub use tracker::{CompactionDescriptor, RunningDescriptors};

use crate::compaction::{CompactionJob, CompactionPicker, RunningCompaction};
use crate::version::LevelView;
use crate::{
    MAX_LEVELS_TO_MERGE, MIN_LEVELS_TO_MERGE, MIN_NUM_HYPER_LEVELS, PickerConfig, PickerError,
};

/// Largest value the file-count reduction uses as its small-file threshold.
const MAX_SMALL_FILE_SIZE: u64 = 1 << 28;

/// Floor applied to the space-amplification factor by size escalation.
const MIN_ESCALATION_SPACE_AMP: f64 = 1.3;

// ------------------------------------------------------------------------------------------------
// Picker state
// ------------------------------------------------------------------------------------------------

/// Everything the picker mutates. Only touched under the picker's lock.
#[derive(Debug)]
pub(crate) struct PickerState {
    /// Column family name, for logging.
    name: String,

    config: PickerConfig,

    map: HyperLevelMap,

    /// Hyper-levels in use; 0 until the first pick initialises the state.
    cur_num_hyper_levels: usize,

    max_num_hyper_levels: usize,

    /// Byte budget per hyper-level (`write_buffer_size × multiplier^(h+1)`).
    size_to_compact: Vec<u64>,

    space_amp_factor: f64,

    level0_compaction_trigger: usize,

    /// Bookmarks of the last compaction started from each hyper-level.
    prev_sub_compaction: Vec<PrevSubCompaction>,

    /// The last level outgrew the deepest layout and this was reported.
    growth_capped: bool,
}

impl PickerState {
    fn new(name: String, config: PickerConfig) -> Self {
        let map = HyperLevelMap::uniform(effective_multiplier(&config), MIN_NUM_HYPER_LEVELS);
        Self {
            name,
            config,
            map,
            cur_num_hyper_levels: 0,
            max_num_hyper_levels: MIN_NUM_HYPER_LEVELS,
            size_to_compact: Vec::new(),
            space_amp_factor: 0.0,
            level0_compaction_trigger: MIN_LEVELS_TO_MERGE,
            prev_sub_compaction: Vec::new(),
            growth_capped: false,
        }
    }

    fn is_initialized(&self) -> bool {
        self.cur_num_hyper_levels != 0
    }

    /// Derives the geometry and budgets from the configuration and the
    /// current layout.
    fn init(&mut self, view: &dyn LevelView) -> Result<(), PickerError> {
        let pct = self.config.max_size_amplification_percent;
        self.space_amp_factor = 100.0 / f64::from(pct - 100);

        let multiplier = effective_multiplier(&self.config);
        let num_levels = view.num_levels();
        let layout = HyperLevelMap::uniform(multiplier, MIN_NUM_HYPER_LEVELS);
        let max_num_hyper_levels = layout
            .max_hyper_levels_for(num_levels)
            .filter(|&max| max >= MIN_NUM_HYPER_LEVELS)
            .ok_or(PickerError::TooFewLevels {
                required: layout.last_level(MIN_NUM_HYPER_LEVELS) + 1,
                available: num_levels,
            })?;

        self.map = HyperLevelMap::uniform(multiplier, max_num_hyper_levels + 1);
        self.max_num_hyper_levels = max_num_hyper_levels;

        let last_non_empty = (0..num_levels)
            .rev()
            .find(|&level| !view.level_is_empty(level))
            .unwrap_or(0);
        let wanted = if last_non_empty == 0 {
            MIN_NUM_HYPER_LEVELS
        } else {
            // Assume the bulk of the data already sits in the last level.
            MIN_NUM_HYPER_LEVELS.max(self.map.hyper_level_num(last_non_empty - 1))
        };
        if wanted > max_num_hyper_levels {
            warn!(
                cf = %self.name,
                wanted,
                max_num_hyper_levels,
                last_non_empty,
                "hybrid: data found below the deepest supported level"
            );
        }
        self.cur_num_hyper_levels = wanted.min(max_num_hyper_levels);

        let slots = max_num_hyper_levels + 2;
        let mut size = self.config.write_buffer_size;
        self.size_to_compact = (0..slots)
            .map(|h| {
                size = size.saturating_mul(self.map.multiplier(h) as u64);
                size
            })
            .collect();
        self.prev_sub_compaction = vec![PrevSubCompaction::default(); slots];

        self.level0_compaction_trigger = self
            .map
            .multiplier(0)
            .min(self.config.level0_file_num_compaction_trigger);

        info!(
            cf = %self.name,
            cur_num_hyper_levels = self.cur_num_hyper_levels,
            max_num_hyper_levels,
            multiplier,
            space_amp_factor = self.space_amp_factor,
            db_capacity = self.db_capacity(),
            "hybrid: initialised"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Geometry helpers
    // --------------------------------------------------------------------------------------------

    fn last_level(&self) -> usize {
        self.map.last_level(self.cur_num_hyper_levels)
    }

    fn first_level_in_hyper(&self, hyper_level: usize) -> usize {
        self.map.first_level_in_hyper(hyper_level)
    }

    fn last_level_in_hyper(&self, hyper_level: usize) -> usize {
        self.map.last_level_in_hyper(hyper_level)
    }

    fn size_to_compact(&self, hyper_level: usize) -> u64 {
        self.size_to_compact
            .get(hyper_level)
            .or(self.size_to_compact.last())
            .copied()
            .unwrap_or(u64::MAX)
    }

    fn prev(&self, hyper_level: usize) -> &PrevSubCompaction {
        &self.prev_sub_compaction[hyper_level]
    }

    fn prev_mut(&mut self, hyper_level: usize) -> &mut PrevSubCompaction {
        &mut self.prev_sub_compaction[hyper_level]
    }

    /// Bytes the last level may hold with the current hyper-level count.
    fn db_capacity(&self) -> u64 {
        (self.size_to_compact(self.cur_num_hyper_levels) as f64 * self.space_amp_factor) as u64
    }

    fn hyper_level_size(&self, hyper_level: usize, view: &dyn LevelView) -> u64 {
        (self.first_level_in_hyper(hyper_level)..=self.last_level_in_hyper(hyper_level))
            .map(|level| view.num_level_bytes(level))
            .sum()
    }

    // --------------------------------------------------------------------------------------------
    // Predicates
    // --------------------------------------------------------------------------------------------

    /// A hyper-level needs rearranging when, scanning from `first_level`,
    /// an empty level follows a non-empty one.
    fn level_needs_rearrange(
        &self,
        hyper_level: usize,
        view: &dyn LevelView,
        first_level: usize,
    ) -> bool {
        if hyper_level == 0 {
            return false;
        }
        let mut found_non_empty = false;
        for level in first_level..=self.last_level_in_hyper(hyper_level) {
            let empty = view.level_is_empty(level);
            if !found_non_empty {
                found_non_empty = !empty;
            } else if empty {
                return true;
            }
        }
        false
    }

    fn may_run_compaction(&self, hyper_level: usize, running: &RunningDescriptors) -> bool {
        running[hyper_level].n_compactions == 0
            && (hyper_level == self.cur_num_hyper_levels || !running[hyper_level + 1].has_rearrange)
    }

    /// Rearranging waits until no rearrange runs anywhere and the
    /// hyper-level itself is idle.
    fn may_run_rearrange(&self, hyper_level: usize, running: &RunningDescriptors) -> bool {
        hyper_level > 0 && !running.rearrange_running && running[hyper_level].n_compactions == 0
    }

    fn may_start_level_compaction(
        &self,
        hyper_level: usize,
        running: &RunningDescriptors,
        view: &dyn LevelView,
    ) -> bool {
        if running[hyper_level].n_compactions > 0 {
            return false;
        }
        // Without a carried-over output level the job needs a free target.
        !(hyper_level != self.cur_num_hyper_levels
            && self.prev(hyper_level).is_empty()
            && !view.level_is_empty(self.last_level_in_hyper(hyper_level) + 1))
    }

    fn need_to_run_level_compaction(&self, hyper_level: usize, view: &dyn LevelView) -> bool {
        if hyper_level == 0 {
            return view.level_files(0).len() >= self.level0_compaction_trigger;
        }

        let last_level_in_hyper = self.last_level_in_hyper(hyper_level);
        if view.level_is_empty(last_level_in_hyper) {
            return false;
        }

        let force_level = last_level_in_hyper
            .checked_sub(self.map.multiplier(hyper_level) + self.config.force_compaction_slack);
        if force_level.is_some_and(|level| !view.level_is_empty(level)) {
            return true;
        }

        let max_size = if hyper_level == self.cur_num_hyper_levels {
            // 10% slack over the space-amp budget.
            (view.num_level_bytes(self.last_level()) as f64 / (self.space_amp_factor * 1.1)) as u64
        } else {
            self.size_to_compact(hyper_level)
        };
        self.hyper_level_size(hyper_level, view) > max_size
    }

    fn descriptors(&self, running: &[RunningCompaction]) -> RunningDescriptors {
        RunningDescriptors::build(&self.map, self.cur_num_hyper_levels, running)
    }

    // --------------------------------------------------------------------------------------------
    // Decisions
    // --------------------------------------------------------------------------------------------

    fn needs_compaction(&self, view: &dyn LevelView, running: &[RunningCompaction]) -> bool {
        if !self.is_initialized() {
            return true;
        }

        let desc = self.descriptors(running);
        if desc.manual_compaction_running {
            return false;
        }

        for hyper_level in 0..=self.cur_num_hyper_levels {
            let first_level = self.first_level_in_hyper(hyper_level);
            let rearrange_needed = self.level_needs_rearrange(hyper_level, view, first_level);
            if rearrange_needed && self.may_run_rearrange(hyper_level, &desc) {
                return true;
            }
            if !rearrange_needed
                && self.may_start_level_compaction(hyper_level, &desc, view)
                && self.need_to_run_level_compaction(hyper_level, view)
            {
                return true;
            }
        }

        if view.level_files(self.last_level()).len() > self.config.max_open_files / 2 {
            return true;
        }

        self.config.reduce_sorted_runs && running.is_empty() && self.sorted_runs_to_reduce(view)
    }

    /// L0 files needed before an idle tree drains L0 into hyper-level 1.
    fn sorted_run_l0_threshold(&self) -> usize {
        (self.map.multiplier(0) / 2)
            .min(self.level0_compaction_trigger)
            .min(self.config.level0_file_num_compaction_trigger)
    }

    /// Whether [`Self::pick_reduce_sorted_runs`] would find work on an idle
    /// tree.
    ///
    /// An idle pick clears every bookmark without a resume key, so only a
    /// pending sub-compaction that landed on the deepest level of the next
    /// hyper-level keeps that hyper-level off limits.
    fn sorted_runs_to_reduce(&self, view: &dyn LevelView) -> bool {
        let l0_ready = view.level_files(0).len() >= self.sorted_run_l0_threshold()
            && view.level_is_empty(self.first_level_in_hyper(1));
        l0_ready
            || (1..=self.cur_num_hyper_levels).any(|hyper_level| {
                let deepest = self.last_level_in_hyper(hyper_level);
                let inbound = self.prev(hyper_level - 1);
                !view.level_is_empty(deepest)
                    && (inbound.last_key.is_none()
                        || inbound.output_level.is_none_or(|level| level < deepest))
            })
    }

    fn pick(
        &mut self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<Option<CompactionJob>, PickerError> {
        if !self.is_initialized() {
            self.init(view)?;
        }

        let desc = self.descriptors(running);
        if desc.manual_compaction_running {
            debug!(cf = %self.name, "hybrid: manual compaction running");
            return Ok(None);
        }
        debug!(cf = %self.name, lsm_state = ?self.lsm_state(view), "hybrid: picking");

        if let Some(job) = self.pick_rearrange(view, &desc) {
            return Ok(Some(job));
        }
        if let Some(job) = self.pick_size_escalation(view, &desc) {
            return Ok(Some(job));
        }

        if self.may_start_level_compaction(0, &desc, view) {
            let l0_threshold = self
                .level0_compaction_trigger
                .min(self.config.level0_file_num_compaction_trigger);
            if view.level_files(0).len() >= l0_threshold
                && let Some(job) = self.pick_level0_compaction(view, l0_threshold)
            {
                info!(cf = %self.name, output_level = job.output_level, "hybrid: compacting L0");
                return Ok(Some(job));
            }
        }

        for hyper_level in 1..=self.cur_num_hyper_levels {
            if !self.may_start_level_compaction(hyper_level, &desc, view)
                || !self.need_to_run_level_compaction(hyper_level, view)
            {
                continue;
            }
            match self.pick_level_compaction(hyper_level, view, false) {
                Some(job) => {
                    info!(
                        cf = %self.name,
                        hyper_level,
                        start_level = job.start_level(),
                        output_level = job.output_level,
                        trivial = job.is_trivial_move,
                        subcompactions = job.max_subcompactions,
                        "hybrid: compacting hyper level"
                    );
                    return Ok(Some(job));
                }
                None => debug!(cf = %self.name, hyper_level, "hybrid: build compaction failed"),
            }
        }

        if self.may_start_level_compaction(self.cur_num_hyper_levels, &desc, view)
            && view.level_files(self.last_level()).len() > self.config.max_open_files / 2
        {
            let min_file_size =
                (view.num_level_bytes(self.last_level()) / 1024).min(MAX_SMALL_FILE_SIZE);
            if let Some(job) = self.pick_reduce_num_files(view, min_file_size) {
                info!(
                    cf = %self.name,
                    level = job.output_level,
                    files = job.num_input_files(),
                    "hybrid: compacting to reduce number of files"
                );
                return Ok(Some(job));
            }
        }

        if self.config.reduce_sorted_runs
            && let Some(job) = self.pick_reduce_sorted_runs(view, &desc, running)
        {
            return Ok(Some(job));
        }

        debug!(cf = %self.name, "hybrid: nothing to do");
        Ok(None)
    }

    /// Step 3: close holes inside hyper-levels.
    fn pick_rearrange(
        &mut self,
        view: &dyn LevelView,
        desc: &RunningDescriptors,
    ) -> Option<CompactionJob> {
        for hyper_level in 1..=self.cur_num_hyper_levels {
            let feeder = hyper_level - 1;
            if desc[feeder].n_compactions == 0 && self.prev(feeder).last_key.is_none() {
                self.prev_mut(feeder).set_empty();
            }

            let first_level = self.first_level_in_hyper(hyper_level);
            if !self.may_run_rearrange(hyper_level, desc)
                || !self.level_needs_rearrange(hyper_level, view, first_level)
            {
                continue;
            }

            let start_level = if desc[feeder].n_compactions == 0 {
                self.prev_mut(feeder).set_empty();
                first_level
            } else {
                self.prev(feeder).output_level.map_or(first_level, |level| level + 1)
            };
            if !self.level_needs_rearrange(hyper_level, view, start_level) {
                continue;
            }

            match self.rearrange_level(hyper_level, view) {
                Some(job) => {
                    info!(
                        cf = %self.name,
                        hyper_level,
                        start_level = job.start_level(),
                        output_level = job.output_level,
                        "hybrid: rearranging hyper level"
                    );
                    return Some(job);
                }
                None => debug!(cf = %self.name, hyper_level, "hybrid: build rearrange failed"),
            }
        }
        None
    }

    /// Step 4: grow the structure, or move a large level into the top
    /// hyper-level while it still has room.
    fn pick_size_escalation(
        &mut self,
        view: &dyn LevelView,
        desc: &RunningDescriptors,
    ) -> Option<CompactionJob> {
        let cur = self.cur_num_hyper_levels;
        if !self.may_run_compaction(cur, desc) || desc.rearrange_running {
            return None;
        }

        if let Some(job) = self.check_db_size(view) {
            info!(
                cf = %self.name,
                output_level = job.output_level,
                "hybrid: moving last level down"
            );
            return Some(job);
        }

        if cur > 1 && self.may_run_compaction(cur - 1, desc) {
            let source = self.last_level_in_hyper(cur - 1);
            let db_size = view.num_level_bytes(self.last_level());
            let level_size = view.num_level_bytes(source);
            let scaled =
                level_size as f64 * self.map.multiplier(cur) as f64 * self.space_amp_factor;
            if scaled > db_size as f64
                && let Some(job) = self.move_sst_to_last_level(view)
            {
                info!(
                    cf = %self.name,
                    level_size,
                    db_size,
                    source,
                    output_level = job.output_level,
                    "hybrid: moving large level into top hyper level"
                );
                return Some(job);
            }
        }
        None
    }

    /// Step 8: low-priority merging of sorted runs while the tree is idle.
    fn pick_reduce_sorted_runs(
        &mut self,
        view: &dyn LevelView,
        desc: &RunningDescriptors,
        running: &[RunningCompaction],
    ) -> Option<CompactionJob> {
        if desc[0].n_compactions != 0 || !running.is_empty() {
            return None;
        }

        if view.level_files(0).len() >= self.sorted_run_l0_threshold()
            && let Some(job) = self.pick_level0_compaction(view, 1)
        {
            info!(
                cf = %self.name,
                output_level = job.output_level,
                "hybrid: reducing sorted runs from L0"
            );
            return Some(job);
        }

        for hyper_level in 1..=self.cur_num_hyper_levels {
            if view.level_is_empty(self.last_level_in_hyper(hyper_level)) {
                continue;
            }
            if let Some(job) = self.pick_level_compaction(hyper_level, view, true) {
                info!(
                    cf = %self.name,
                    hyper_level,
                    start_level = job.start_level(),
                    output_level = job.output_level,
                    "hybrid: reducing sorted runs"
                );
                return Some(job);
            }
        }
        None
    }

    /// Bytes per hyper-level `0..=cur`, followed by the last level.
    fn lsm_state(&self, view: &dyn LevelView) -> Vec<u64> {
        let mut state: Vec<u64> = (0..=self.cur_num_hyper_levels)
            .map(|h| self.hyper_level_size(h, view))
            .collect();
        state.push(view.num_level_bytes(self.last_level()));
        state
    }
}

/// Multiplier derived from the configured merge widths.
fn effective_multiplier(config: &PickerConfig) -> usize {
    let upper = config.max_merge_width.clamp(MIN_LEVELS_TO_MERGE, MAX_LEVELS_TO_MERGE);
    if (MIN_LEVELS_TO_MERGE..=upper).contains(&config.min_merge_width) {
        config.min_merge_width
    } else {
        upper
    }
}

// ------------------------------------------------------------------------------------------------
// Public handle
// ------------------------------------------------------------------------------------------------

/// Thread-safe hybrid compaction picker for one column family.
#[derive(Debug)]
pub struct HybridCompactionPicker {
    state: RwLock<PickerState>,
}

impl HybridCompactionPicker {
    /// Creates a picker. The layout-dependent state is derived on the first
    /// [`pick_compaction`](Self::pick_compaction).
    ///
    /// # Errors
    ///
    /// Returns [`PickerError::InvalidConfig`] if any parameter is out of range.
    pub fn new(name: impl Into<String>, config: PickerConfig) -> Result<Self, PickerError> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(PickerState::new(name.into(), config)),
        })
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, PickerState>, PickerError> {
        self.state
            .read()
            .map_err(|_| PickerError::Internal("RwLock poisoned".into()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, PickerState>, PickerError> {
        self.state
            .write()
            .map_err(|_| PickerError::Internal("RwLock poisoned".into()))
    }

    /// Returns `true` when a call to [`pick_compaction`](Self::pick_compaction)
    /// is likely to produce a job. Always `true` before initialisation.
    pub fn needs_compaction(
        &self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<bool, PickerError> {
        Ok(self.read_lock()?.needs_compaction(view, running))
    }

    /// Chooses the next compaction, if any.
    ///
    /// The caller is expected to report the returned job in `running`
    /// (see [`RunningCompaction::from`]) until it has been installed.
    ///
    /// # Errors
    ///
    /// Returns [`PickerError::TooFewLevels`] on first use when `view` does
    /// not provision enough levels for a single hyper-level.
    pub fn pick_compaction(
        &self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<Option<CompactionJob>, PickerError> {
        self.write_lock()?.pick(view, running)
    }

    /// Number of hyper-levels currently in use (0 before initialisation).
    pub fn num_hyper_levels(&self) -> Result<usize, PickerError> {
        Ok(self.read_lock()?.cur_num_hyper_levels)
    }

    /// The bottom level of the current layout (`None` before initialisation).
    pub fn last_level(&self) -> Result<Option<usize>, PickerError> {
        let state = self.read_lock()?;
        Ok(state.is_initialized().then(|| state.last_level()))
    }

    /// The hyper-level geometry.
    pub fn hyper_level_map(&self) -> Result<HyperLevelMap, PickerError> {
        Ok(self.read_lock()?.map.clone())
    }

    /// Bytes per hyper-level followed by the bytes of the last level.
    pub fn lsm_state(&self, view: &dyn LevelView) -> Result<Vec<u64>, PickerError> {
        Ok(self.read_lock()?.lsm_state(view))
    }
}

impl CompactionPicker for HybridCompactionPicker {
    fn needs_compaction(
        &self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<bool, PickerError> {
        HybridCompactionPicker::needs_compaction(self, view, running)
    }

    fn pick_compaction(
        &self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<Option<CompactionJob>, PickerError> {
        HybridCompactionPicker::pick_compaction(self, view, running)
    }
}

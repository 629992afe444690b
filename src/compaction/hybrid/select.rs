//! Cross-level input selection.
//!
//! A level compaction starts at the deepest level of a hyper-level, takes a
//! run of files there, and then pulls in every file from the shallower
//! levels of the same hyper-level that falls strictly inside a key **fence**.
//! The fence is what keeps the result ordered: a newer file is only moved
//! down together with all the older data it shadows.
//!
//! The fence protocol is expressed as a [`SelectionContext`] value that is
//! threaded through each step and returned updated.

use std::sync::Arc;

use crate::compaction::CompactionInputFiles;
use crate::version::{FileMeta, LevelView};

use super::geometry::HyperLevelMap;

/// Hard cap on the bytes pulled from the target level by one selection.
const MAX_TARGET_BYTES: u64 = 1 << 30;

/// Below this many selected bytes the write-amp guard applies.
const SMALL_SELECTION_BYTES: u64 = 1 << 26;

/// Maximum accepted `target / selected` ratio once past the buffer cap.
const MAX_WRITE_AMP_RATIO: u64 = 2;

/// Offset of the shallowest level a level compaction may pull from.
const UPPER_LEVEL_OFFSET: usize = 3;

// ------------------------------------------------------------------------------------------------
// State types
// ------------------------------------------------------------------------------------------------

/// Bookmark left by the previous compaction started from a hyper-level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrevSubCompaction {
    /// Output level of that compaction.
    pub output_level: Option<usize>,

    /// Where a follow-up sub-compaction should resume; `None` when the
    /// previous selection consumed the whole candidate level.
    pub last_key: Option<Vec<u8>>,
}

impl PrevSubCompaction {
    pub fn is_empty(&self) -> bool {
        self.output_level.is_none()
    }

    pub fn set_empty(&mut self) {
        self.output_level = None;
        self.last_key = None;
    }
}

/// Key range and fences of a selection in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionContext {
    /// Smallest key of everything selected so far.
    pub smallest: Vec<u8>,

    /// Largest key of everything selected so far.
    pub largest: Vec<u8>,

    /// Exclusive lower fence; `None` is unbounded.
    pub lower_bound: Option<Vec<u8>>,

    /// Exclusive upper fence; `None` is unbounded.
    pub upper_bound: Option<Vec<u8>>,

    /// Every candidate file was taken.
    pub last_file_was_selected: bool,
}

impl SelectionContext {
    fn raise_lower(&mut self, key: &[u8]) {
        if self.lower_bound.as_deref().is_none_or(|lb| key > lb) {
            self.lower_bound = Some(key.to_vec());
        }
    }

    fn lower_upper(&mut self, key: &[u8]) {
        if self.upper_bound.as_deref().is_none_or(|ub| key < ub) {
            self.upper_bound = Some(key.to_vec());
        }
    }

    fn widen(&mut self, files: &[Arc<FileMeta>]) {
        if let (Some(first), Some(last)) = (files.first(), files.last()) {
            if first.smallest < self.smallest {
                self.smallest = first.smallest.clone();
            }
            if last.largest > self.largest {
                self.largest = last.largest.clone();
            }
        }
    }
}

/// Result of [`select_n_buffers`].
#[derive(Debug, Clone)]
pub struct Selection {
    /// Non-empty input groups ordered by level; the output level, when it
    /// contributes files, comes last.
    pub inputs: Vec<CompactionInputFiles>,

    /// Bookmark to store for the hyper-level the selection started in.
    pub bookmark: PrevSubCompaction,
}

// ------------------------------------------------------------------------------------------------
// Primitive helpers
// ------------------------------------------------------------------------------------------------

/// Index of the first file whose largest key is `>= key`, starting at
/// `start`. With no key the search does not move.
pub fn locate_file(files: &[Arc<FileMeta>], key: Option<&[u8]>, start: usize) -> usize {
    match key {
        None => start,
        Some(key) => start + files[start..].partition_point(|f| f.largest.as_slice() < key),
    }
}

/// Returns `true` if `file` overlaps any file of the sorted run `level`.
pub fn intersecting(file: &FileMeta, level: &[Arc<FileMeta>]) -> bool {
    let idx = locate_file(level, Some(&file.smallest), 0);
    idx < level.len() && level[idx].smallest <= file.largest
}

// ------------------------------------------------------------------------------------------------
// Selection steps
// ------------------------------------------------------------------------------------------------

/// Greedily selects a run of files from the head of `level_files`.
///
/// Growth stops at the upper fence, once `max_n_buffers` files are taken
/// while the target level keeps overlapping, or when the overlap with
/// `target_files` would exceed [`MAX_TARGET_BYTES`] or a write-amp ratio of
/// [`MAX_WRITE_AMP_RATIO`].
pub fn select_from_first_level(
    level_files: &[Arc<FileMeta>],
    target_files: &[Arc<FileMeta>],
    max_n_buffers: usize,
) -> Option<(Vec<Arc<FileMeta>>, SelectionContext)> {
    let first = level_files.first()?;
    let mut ctx = SelectionContext {
        smallest: first.smallest.clone(),
        largest: first.largest.clone(),
        last_file_was_selected: true,
        ..SelectionContext::default()
    };

    let target_begin = locate_file(target_files, Some(&ctx.smallest), 0);
    let disjoint = target_begin == target_files.len()
        || ctx.largest < target_files[target_begin].smallest;
    if disjoint {
        // No overlap with the target yet: keep it that way so the job stays
        // cheap and can run next to others.
        if let Some(next) = target_files.get(target_begin) {
            ctx.upper_bound = Some(next.smallest.clone());
            if target_begin > 0 {
                ctx.lower_bound = Some(target_files[target_begin - 1].largest.clone());
            }
        } else if let Some(prev) = target_files.last() {
            ctx.lower_bound = Some(prev.largest.clone());
        }
    } else if target_begin > 0 {
        ctx.lower_bound = Some(target_files[target_begin - 1].largest.clone());
    }

    let mut target_bytes: u64 = 0;
    let mut level_bytes: u64 = first.file_size;

    let mut target_end = target_begin;
    while target_end < target_files.len() && target_files[target_end].smallest <= first.largest {
        target_bytes += target_files[target_end].file_size;
        target_end += 1;
    }

    let mut selected = vec![Arc::clone(first)];
    let mut next = 1;

    while let Some(file) = level_files.get(next) {
        if ctx
            .upper_bound
            .as_deref()
            .is_some_and(|ub| ub < file.largest.as_slice())
        {
            break;
        }

        let expand = match target_files.get(target_end) {
            Some(target) if target.smallest <= file.largest => {
                let grown = target_bytes + target.file_size;
                if selected.len() >= max_n_buffers
                    || grown > MAX_TARGET_BYTES
                    || target.largest < file.smallest
                {
                    false
                } else {
                    target_bytes = grown;
                    target_end += 1;
                    true
                }
            }
            // A file with no new target overlap only costs its own bytes.
            _ => {
                !(selected.len() > max_n_buffers
                    && level_bytes < SMALL_SELECTION_BYTES
                    && target_bytes / level_bytes.max(1) > MAX_WRITE_AMP_RATIO)
            }
        };
        if !expand {
            break;
        }

        level_bytes += file.file_size;
        selected.push(Arc::clone(file));
        next += 1;
    }

    if let Some(last) = selected.last() {
        ctx.largest = last.largest.clone();
    }
    if let Some(target) = target_files.get(target_end) {
        ctx.upper_bound = Some(target.smallest.clone());
    }
    if let Some(rest) = level_files.get(next) {
        ctx.last_file_was_selected = false;
        ctx.lower_upper(&rest.smallest);
    }

    Some((selected, ctx))
}

/// Selects the files of a shallower level that lie strictly inside the
/// fence and start no later than `ctx.largest`, tightening the fence around
/// whatever is left out.
pub fn expand_selection(
    level_files: &[Arc<FileMeta>],
    mut ctx: SelectionContext,
) -> (Vec<Arc<FileMeta>>, SelectionContext) {
    let mut selected = Vec::new();
    let Some(last) = level_files.last() else {
        return (selected, ctx);
    };

    let mut idx = locate_file(level_files, Some(&ctx.smallest), 0);
    if let Some(lb) = ctx.lower_bound.as_deref() {
        while idx < level_files.len() && lb >= level_files[idx].smallest.as_slice() {
            idx += 1;
        }
    }

    if idx == level_files.len() {
        ctx.raise_lower(&last.largest);
        return (selected, ctx);
    }

    if idx > 0 {
        ctx.raise_lower(&level_files[idx - 1].largest);
    }

    while let Some(file) = level_files.get(idx) {
        let past_range = file.smallest > ctx.largest;
        let crosses_fence = ctx
            .upper_bound
            .as_deref()
            .is_some_and(|ub| file.largest.as_slice() >= ub);
        if past_range || crosses_fence {
            break;
        }
        selected.push(Arc::clone(file));
        idx += 1;
    }

    if let Some(rest) = level_files.get(idx) {
        ctx.lower_upper(&rest.smallest);
        if ctx
            .upper_bound
            .as_deref()
            .is_none_or(|ub| rest.largest.as_slice() > ub)
        {
            ctx.last_file_was_selected = false;
        }
    }

    (selected, ctx)
}

/// Picks the inputs of a level compaction out of `hyper_level`.
///
/// `inbound` is the bookmark of the compaction feeding this hyper-level,
/// `outbound` the bookmark left by the previous compaction out of it.
/// Returns `None` when the deepest level is empty or the levels still
/// receiving data leave nothing to select.
#[allow(clippy::too_many_arguments)]
pub fn select_n_buffers(
    view: &dyn LevelView,
    map: &HyperLevelMap,
    hyper_level: usize,
    n_buffers: usize,
    output_level: usize,
    last_level: usize,
    inbound: &PrevSubCompaction,
    outbound: &PrevSubCompaction,
) -> Option<Selection> {
    let lowest_level = map.last_level_in_hyper(hyper_level);
    let lowest_files = view.level_files(lowest_level);
    if lowest_files.is_empty() {
        return None;
    }

    let mut upper_level =
        (map.first_level_in_hyper(hyper_level) + UPPER_LEVEL_OFFSET).min(lowest_level);
    if let Some(inbound_output) = inbound.output_level
        && upper_level <= inbound_output
    {
        upper_level = inbound_output + 1;
        if upper_level > lowest_level {
            return None;
        }
    }

    let (first_selected, mut ctx) =
        select_from_first_level(lowest_files, view.level_files(last_level), n_buffers)?;

    if let Some(resume) = outbound.last_key.as_deref()
        && resume < ctx.smallest.as_slice()
        && ctx.lower_bound.as_deref().is_none_or(|lb| resume > lb)
    {
        ctx.lower_bound = Some(resume.to_vec());
    }

    // Deepest level first while expanding; reversed below.
    let mut upper_inputs = Vec::new();
    for level in (upper_level..lowest_level).rev() {
        let files = view.level_files(level);
        if files.is_empty() {
            continue;
        }
        let (selected, next_ctx) = expand_selection(files, ctx);
        ctx = next_ctx;
        ctx.widen(&selected);
        upper_inputs.push(CompactionInputFiles::new(level, selected));
    }

    let output_files = view.level_files(output_level);
    let output_selected: Vec<_> = output_files[locate_file(output_files, Some(&ctx.smallest), 0)..]
        .iter()
        .take_while(|f| f.smallest <= ctx.largest)
        .cloned()
        .collect();

    let lowest_input = CompactionInputFiles::new(lowest_level, first_selected);
    let only_lowest =
        output_selected.is_empty() && upper_inputs.iter().all(CompactionInputFiles::is_empty);
    let inputs = if only_lowest {
        // Only the deepest level contributes: relink instead of rewriting.
        vec![lowest_input]
    } else {
        let mut inputs: Vec<_> = upper_inputs
            .into_iter()
            .rev()
            .filter(|input| !input.is_empty())
            .collect();
        inputs.push(lowest_input);
        if !output_selected.is_empty() {
            inputs.push(CompactionInputFiles::new(output_level, output_selected));
        }
        inputs
    };

    let bookmark = PrevSubCompaction {
        output_level: Some(output_level),
        last_key: if ctx.last_file_was_selected {
            None
        } else {
            ctx.upper_bound.clone()
        },
    };

    Some(Selection { inputs, bookmark })
}

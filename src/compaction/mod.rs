//! # Compaction Module
//!
//! Describes *what* to compact, never *how*. A picker inspects a
//! [`LevelView`] together with the list of compactions already running and
//! emits at most one [`CompactionJob`]. The execution engine owns the job
//! from then on: it merges (or relinks) the input files, installs the result
//! and finally drops the job from its in-flight list.
//!
//! ## Hybrid Compaction
//!
//! The only strategy shipped today is the [`hybrid`] picker. It groups
//! numbered levels into **hyper-levels** and treats every level inside a
//! hyper-level as one sorted run of a tiered layout. Data moves downwards
//! through the hyper-levels and finally lands in a single bottom level that
//! holds the bulk of the database:
//!
//! ```text
//!   L0                       hyper-level 0 (overlapping flushes)
//!   L1 .. L8                 hyper-level 1 (multiplier 8)
//!   L9 .. L16                hyper-level 2
//!   L17                      last level
//! ```
//!
//! ## Code organization
//!
//! Job value objects and the [`CompactionPicker`] seam live here so that
//! future strategies (e.g., a plain leveled picker) can share them.

pub mod hybrid;

use std::sync::Arc;

use crate::PickerError;
use crate::version::{FileMeta, LevelView};

// ------------------------------------------------------------------------------------------------
// CompactionPicker trait
// ------------------------------------------------------------------------------------------------

/// A uniform interface for compaction pickers.
///
/// - `Ok(Some(job))`: the caller should register the job as running and
///   hand it to a worker.
/// - `Ok(None)`: nothing to do right now (balanced, or blocked by a
///   running job).
pub trait CompactionPicker {
    /// Cheap heuristic trigger. May race with [`pick_compaction`](Self::pick_compaction);
    /// a `true` only means a pick is worth attempting.
    fn needs_compaction(
        &self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<bool, PickerError>;

    /// Chooses the next compaction, if any.
    fn pick_compaction(
        &self,
        view: &dyn LevelView,
        running: &[RunningCompaction],
    ) -> Result<Option<CompactionJob>, PickerError>;
}

// ------------------------------------------------------------------------------------------------
// Shared types
// ------------------------------------------------------------------------------------------------

/// Why a job was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionReason {
    /// Level 0 reached its file-count trigger.
    LevelL0FilesNum,

    /// A hyper-level outgrew its size budget.
    LevelMaxLevelSize,

    /// Too many small files in the last level.
    ReduceNumFiles,

    /// Files relocated into empty levels (hole filling, hyper-level growth).
    Rearrange,

    /// User-requested compaction. Never emitted by the hybrid picker, but
    /// a running manual job blocks it.
    ManualCompaction,
}

/// Files taken from one source level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionInputFiles {
    /// Source level.
    pub level: usize,

    /// Files in level order.
    pub files: Vec<Arc<FileMeta>>,
}

impl CompactionInputFiles {
    pub fn new(level: usize, files: Vec<Arc<FileMeta>>) -> Self {
        Self { level, files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of input file sizes.
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }
}

/// Immutable description of one compaction, consumed by the execution
/// engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionJob {
    /// Input files grouped by source level, ordered by level. When the
    /// output level contributes files it is the last entry.
    pub inputs: Vec<CompactionInputFiles>,

    /// Destination level.
    pub output_level: usize,

    /// Cap on each output file; `u64::MAX` leaves outputs uncapped.
    pub max_output_file_size: u64,

    /// Files used to cut output files so that no single output overlaps
    /// too much of the level below.
    pub grandparents: Vec<Arc<FileMeta>>,

    /// Parallelism hint: how many key sub-ranges may run concurrently.
    pub max_subcompactions: usize,

    /// Inputs can be relinked into the output level without rewriting.
    pub is_trivial_move: bool,

    pub reason: CompactionReason,
}

impl CompactionJob {
    /// Single-threaded, uncapped, non-trivial job without grandparents.
    pub fn new(
        inputs: Vec<CompactionInputFiles>,
        output_level: usize,
        reason: CompactionReason,
    ) -> Self {
        Self {
            inputs,
            output_level,
            max_output_file_size: u64::MAX,
            grandparents: Vec::new(),
            max_subcompactions: 1,
            is_trivial_move: false,
            reason,
        }
    }

    /// Level of the first input group.
    pub fn start_level(&self) -> usize {
        self.inputs.first().map_or(self.output_level, |i| i.level)
    }

    pub fn num_input_files(&self) -> usize {
        self.inputs.iter().map(|i| i.files.len()).sum()
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(CompactionInputFiles::bytes).sum()
    }

    /// Number of input groups that carry at least one file.
    pub fn num_input_levels(&self) -> usize {
        self.inputs.iter().filter(|i| !i.is_empty()).count()
    }
}

/// What a picker needs to know about a job that is still executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningCompaction {
    pub start_level: usize,
    pub reason: CompactionReason,
}

impl RunningCompaction {
    pub fn new(start_level: usize, reason: CompactionReason) -> Self {
        Self {
            start_level,
            reason,
        }
    }
}

impl From<&CompactionJob> for RunningCompaction {
    fn from(job: &CompactionJob) -> Self {
        Self {
            start_level: job.start_level(),
            reason: job.reason,
        }
    }
}

//! # AeternusDB Hybrid Compaction
//!
//! The **hybrid compaction picker** of an embedded LSM-tree key-value
//! store: the component that decides *which* groups of sorted files to
//! merge, *when*, and *into which level*. It amortizes write I/O like a
//! tiered layout while bounding space amplification like a leveled one.
//!
//! The picker performs no I/O. It reads an immutable [`LevelView`] plus
//! the list of compactions the engine is currently running and emits at
//! most one [`CompactionJob`] per call. Executing the job (merging files,
//! writing tables, installing the new version) is the engine's business.
//!
//! ## Quick Start
//!
//! ```rust
//! use aeternusdb_hybrid::{
//!     CompactionReason, FileMeta, HybridCompactionPicker, LevelSnapshot, PickerConfig,
//!     RunningCompaction,
//! };
//!
//! let picker = HybridCompactionPicker::new("default", PickerConfig::default()).unwrap();
//!
//! // Four flushed files in L0, nothing else.
//! let mut version = LevelSnapshot::new(32);
//! for id in 0..4u64 {
//!     let key = format!("key-{id}");
//!     version.add_file(0, FileMeta::new(id, key.clone(), key, 1 << 20)).unwrap();
//! }
//!
//! let mut running: Vec<RunningCompaction> = Vec::new();
//! assert!(picker.needs_compaction(&version, &running).unwrap());
//!
//! let job = picker.pick_compaction(&version, &running).unwrap().unwrap();
//! assert_eq!(job.reason, CompactionReason::LevelL0FilesNum);
//! assert_eq!(job.start_level(), 0);
//!
//! // The engine keeps the job registered until it has been installed.
//! running.push(RunningCompaction::from(&job));
//! ```
//!
//! ## Features
//!
//! - **Hyper-levels**: consecutive levels grouped into tiered sorted runs.
//! - **Hole filling**: rearrange jobs keep every hyper-level densely packed.
//! - **Automatic growth**: new hyper-levels are added as the data grows.
//! - **Bounded write amplification**: input selection refuses selections
//!   that drag in disproportionate downstream overlap.
//! - **Trivial moves**: non-overlapping inputs are relinked, not rewritten.

pub mod compaction;
pub mod version;

use thiserror::Error;

pub use compaction::hybrid::{HybridCompactionPicker, HyperLevelMap};
pub use compaction::{
    CompactionInputFiles, CompactionJob, CompactionPicker, CompactionReason, RunningCompaction,
};
pub use version::{FileMeta, LevelSnapshot, LevelView, VersionError};

/// Smallest number of levels a hyper-level may group.
pub const MIN_LEVELS_TO_MERGE: usize = 8;

/// Largest number of levels a hyper-level may group.
pub const MAX_LEVELS_TO_MERGE: usize = 16;

/// Hyper-levels in use on an empty database.
pub const MIN_NUM_HYPER_LEVELS: usize = 1;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`HybridCompactionPicker`].
///
/// All fields have sensible defaults via [`PickerConfig::default()`].
/// The configuration is validated by [`HybridCompactionPicker::new`].
///
/// # Example
///
/// ```rust
/// use aeternusdb_hybrid::PickerConfig;
///
/// let config = PickerConfig {
///     write_buffer_size: 16 * 1024 * 1024,
///     max_size_amplification_percent: 150,
///     ..PickerConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PickerConfig {
    /// Size of one flushed write buffer in bytes. Hyper-level budgets are
    /// `write_buffer_size × multiplier^(h+1)`.
    ///
    /// Default: 64 MiB. Must be ≥ 1024.
    pub write_buffer_size: u64,

    /// Maximum tolerated space amplification, in percent of live data.
    ///
    /// Default: 200. Must be in `110..=200`.
    pub max_size_amplification_percent: u32,

    /// Preferred number of levels per hyper-level. Used when it lies in
    /// `[MIN_LEVELS_TO_MERGE, max_merge_width]`; otherwise
    /// `max_merge_width` is used.
    ///
    /// Default: 8.
    pub min_merge_width: usize,

    /// Upper bound for the number of levels per hyper-level.
    ///
    /// Default: 16. Must be in `[MIN_LEVELS_TO_MERGE, MAX_LEVELS_TO_MERGE]`.
    pub max_merge_width: usize,

    /// Number of L0 files that triggers an L0 compaction (capped by the
    /// hyper-level multiplier).
    ///
    /// Default: 4. Must be ≥ 1.
    pub level0_file_num_compaction_trigger: usize,

    /// Open-file budget of the engine. The last level is compacted to fewer
    /// files once it holds more than half of it.
    ///
    /// Default: 10000. Must be ≥ 2.
    pub max_open_files: usize,

    /// Length of the key prefix that groups files during file-count
    /// reduction; 0 disables grouping.
    ///
    /// Default: 0.
    pub table_prefix_size: usize,

    /// Cap on output files of level compactions.
    ///
    /// Default: 1 GiB. Must be ≥ 1 MiB.
    pub max_output_file_size: u64,

    /// Distance (beyond one multiplier) above a hyper-level's last level of
    /// the level whose contents force a compaction of that hyper-level.
    ///
    /// Default: 6.
    pub force_compaction_slack: usize,

    /// Enables low-priority merging of sorted runs while nothing else runs.
    ///
    /// Default: false.
    pub reduce_sorted_runs: bool,
}

impl Default for PickerConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024 * 1024,
            max_size_amplification_percent: 200,
            min_merge_width: MIN_LEVELS_TO_MERGE,
            max_merge_width: MAX_LEVELS_TO_MERGE,
            level0_file_num_compaction_trigger: 4,
            max_open_files: 10_000,
            table_prefix_size: 0,
            max_output_file_size: 1 << 30,
            force_compaction_slack: 6,
            reduce_sorted_runs: false,
        }
    }
}

impl PickerConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), PickerError> {
        if self.write_buffer_size < 1024 {
            return Err(PickerError::InvalidConfig(
                "write_buffer_size must be >= 1024".into(),
            ));
        }
        if !(110..=200).contains(&self.max_size_amplification_percent) {
            return Err(PickerError::InvalidConfig(
                "max_size_amplification_percent must be in 110..=200".into(),
            ));
        }
        if !(MIN_LEVELS_TO_MERGE..=MAX_LEVELS_TO_MERGE).contains(&self.max_merge_width) {
            return Err(PickerError::InvalidConfig(format!(
                "max_merge_width must be in {MIN_LEVELS_TO_MERGE}..={MAX_LEVELS_TO_MERGE}"
            )));
        }
        if self.level0_file_num_compaction_trigger < 1 {
            return Err(PickerError::InvalidConfig(
                "level0_file_num_compaction_trigger must be >= 1".into(),
            ));
        }
        if self.max_open_files < 2 {
            return Err(PickerError::InvalidConfig(
                "max_open_files must be >= 2".into(),
            ));
        }
        if self.max_output_file_size < 1024 * 1024 {
            return Err(PickerError::InvalidConfig(
                "max_output_file_size must be >= 1 MiB".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by the picker.
///
/// "Nothing to compact" is not an error: pickers return `Ok(None)`.
#[derive(Debug, Error)]
pub enum PickerError {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The level view cannot hold the minimum hyper-level layout.
    #[error("too few levels: need {required}, have {available}")]
    TooFewLevels { required: usize, available: usize },

    /// Error originating from the version snapshot.
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

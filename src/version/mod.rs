//! # Level View
//!
//! The picker never touches files directly. It reads an immutable snapshot
//! of the level structure through the [`LevelView`] trait:
//!
//! - **Level 0** holds freshly flushed files. Their key ranges may overlap
//!   and the list is ordered **newest-first**.
//! - **Levels ≥ 1** are sorted runs: files are ordered by key and never
//!   overlap each other within the same level.
//!
//! Higher level numbers hold older data. Any level number past
//! [`LevelView::num_levels`] reads as an empty level, so callers may query
//! arbitrary levels without bounds checks.
//!
//! [`LevelSnapshot`] is the owned in-memory implementation used by engines
//! that keep their version metadata in memory, and by the test-suite to
//! replay picked jobs.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::compaction::CompactionJob;

// ------------------------------------------------------------------------------------------------
// File metadata
// ------------------------------------------------------------------------------------------------

/// Descriptor of one immutable sorted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Unique file number.
    pub id: u64,

    /// Smallest user key stored in the file (inclusive).
    pub smallest: Vec<u8>,

    /// Largest user key stored in the file (inclusive).
    pub largest: Vec<u8>,

    /// On-disk size in bytes.
    pub file_size: u64,
}

impl FileMeta {
    /// Creates a new file descriptor.
    pub fn new(
        id: u64,
        smallest: impl Into<Vec<u8>>,
        largest: impl Into<Vec<u8>>,
        file_size: u64,
    ) -> Self {
        Self {
            id,
            smallest: smallest.into(),
            largest: largest.into(),
            file_size,
        }
    }

    /// Returns `true` if the key ranges of `self` and `other` intersect.
    pub fn overlaps(&self, other: &FileMeta) -> bool {
        self.smallest <= other.largest && other.smallest <= self.largest
    }
}

// ------------------------------------------------------------------------------------------------
// LevelView trait
// ------------------------------------------------------------------------------------------------

/// Read-only access to a version of the level structure.
pub trait LevelView {
    /// Number of levels provisioned by the engine.
    fn num_levels(&self) -> usize;

    /// Files of `level`, in level order. Empty for out-of-range levels.
    fn level_files(&self, level: usize) -> &[Arc<FileMeta>];

    /// Total bytes stored in `level`.
    fn num_level_bytes(&self, level: usize) -> u64 {
        self.level_files(level).iter().map(|f| f.file_size).sum()
    }

    /// Returns `true` if `level` holds no files.
    fn level_is_empty(&self, level: usize) -> bool {
        self.level_files(level).is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors raised while mutating a [`LevelSnapshot`].
#[derive(Debug, Error)]
pub enum VersionError {
    /// The level number is not provisioned.
    #[error("level {level} out of range (num_levels = {num_levels})")]
    LevelOutOfRange { level: usize, num_levels: usize },

    /// A file would overlap an existing file in a sorted level.
    #[error("file {id} overlaps file {existing} on level {level}")]
    Overlap { id: u64, existing: u64, level: usize },

    /// A job input is not present in the snapshot.
    #[error("input file {id} not found on level {level}")]
    MissingInput { id: u64, level: usize },

    /// The job cannot be installed as requested.
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

// ------------------------------------------------------------------------------------------------
// LevelSnapshot
// ------------------------------------------------------------------------------------------------

/// Owned, in-memory level structure.
#[derive(Debug, Clone, Default)]
pub struct LevelSnapshot {
    levels: Vec<Vec<Arc<FileMeta>>>,
}

impl LevelSnapshot {
    /// Creates a snapshot with `num_levels` empty levels.
    pub fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); num_levels],
        }
    }

    /// Adds a file to `level`.
    ///
    /// Level 0 files are prepended (newest-first). Files on sorted levels
    /// are inserted at their key position and must not overlap.
    pub fn add_file(&mut self, level: usize, file: FileMeta) -> Result<(), VersionError> {
        self.insert(level, Arc::new(file))
    }

    /// Total bytes across all levels.
    pub fn total_bytes(&self) -> u64 {
        (0..self.levels.len()).map(|l| self.num_level_bytes(l)).sum()
    }

    /// Total number of files across all levels.
    pub fn num_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Installs a finished compaction: every input file is removed and
    /// `outputs` are placed on the job's output level.
    ///
    /// The snapshot is left untouched when any step fails.
    pub fn apply(
        &mut self,
        job: &CompactionJob,
        outputs: Vec<FileMeta>,
    ) -> Result<(), VersionError> {
        let mut next = self.clone();
        next.check_level(job.output_level)?;
        next.remove_inputs(job)?;
        for file in outputs {
            next.insert(job.output_level, Arc::new(file))?;
        }
        *self = next;
        trace!(
            output_level = job.output_level,
            reason = ?job.reason,
            "snapshot: applied compaction"
        );
        Ok(())
    }

    /// Installs a trivial move: input files are relinked, unchanged, into
    /// the output level. All-or-nothing, like [`apply`](Self::apply).
    pub fn apply_move(&mut self, job: &CompactionJob) -> Result<(), VersionError> {
        if !job.is_trivial_move {
            return Err(VersionError::InvalidJob(
                "apply_move called on a non-trivial job".into(),
            ));
        }
        let mut next = self.clone();
        next.check_level(job.output_level)?;
        let moved = next.remove_inputs(job)?;
        for file in moved {
            next.insert(job.output_level, file)?;
        }
        *self = next;
        Ok(())
    }

    fn check_level(&self, level: usize) -> Result<(), VersionError> {
        if level >= self.levels.len() {
            return Err(VersionError::LevelOutOfRange {
                level,
                num_levels: self.levels.len(),
            });
        }
        Ok(())
    }

    fn remove_inputs(&mut self, job: &CompactionJob) -> Result<Vec<Arc<FileMeta>>, VersionError> {
        let mut removed = Vec::with_capacity(job.num_input_files());
        for input in &job.inputs {
            self.check_level(input.level)?;
            for file in &input.files {
                let files = &mut self.levels[input.level];
                let pos = files
                    .iter()
                    .position(|f| f.id == file.id)
                    .ok_or(VersionError::MissingInput {
                        id: file.id,
                        level: input.level,
                    })?;
                removed.push(files.remove(pos));
            }
        }
        Ok(removed)
    }

    fn insert(&mut self, level: usize, file: Arc<FileMeta>) -> Result<(), VersionError> {
        self.check_level(level)?;
        let files = &mut self.levels[level];

        if level == 0 {
            files.insert(0, file);
            return Ok(());
        }

        let pos = files.partition_point(|f| f.smallest < file.smallest);
        for neighbour in [pos.checked_sub(1), Some(pos)].into_iter().flatten() {
            if let Some(existing) = files.get(neighbour)
                && existing.overlaps(&file)
            {
                return Err(VersionError::Overlap {
                    id: file.id,
                    existing: existing.id,
                    level,
                });
            }
        }
        files.insert(pos, file);
        Ok(())
    }
}

impl LevelView for LevelSnapshot {
    fn num_levels(&self) -> usize {
        self.levels.len()
    }

    fn level_files(&self, level: usize) -> &[Arc<FileMeta>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }
}

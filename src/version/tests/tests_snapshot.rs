//! In-memory level snapshot tests.
//!
//! Coverage:
//! - L0 newest-first ordering and sorted insertion on deeper levels
//! - Overlap rejection within a sorted level
//! - Installing merged and relinked compactions
//! - Error paths: missing inputs, out-of-range levels, non-trivial relinks
//! - Failed installs leave the snapshot untouched

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::compaction::{CompactionInputFiles, CompactionJob, CompactionReason};
    use crate::version::{FileMeta, LevelSnapshot, LevelView, VersionError};

    fn meta(id: u64, lo: &str, hi: &str, size: u64) -> FileMeta {
        FileMeta::new(id, lo, hi, size)
    }

    fn ids(view: &LevelSnapshot, level: usize) -> Vec<u64> {
        view.level_files(level).iter().map(|f| f.id).collect()
    }

    fn job_for(
        view: &LevelSnapshot,
        level: usize,
        file_ids: &[u64],
        output_level: usize,
    ) -> CompactionJob {
        let files: Vec<Arc<FileMeta>> = view
            .level_files(level)
            .iter()
            .filter(|f| file_ids.contains(&f.id))
            .cloned()
            .collect();
        CompactionJob::new(
            vec![CompactionInputFiles::new(level, files)],
            output_level,
            CompactionReason::LevelMaxLevelSize,
        )
    }

    // ----------------------------------------------------------------
    // Insertion
    // ----------------------------------------------------------------

    /// # Scenario
    /// Files are added to L0 and L1 out of key order.
    ///
    /// # Expected behavior
    /// L0 keeps insertion order reversed (newest first); L1 is sorted by key.
    #[test]
    fn add_file_ordering() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(0, meta(1, "a", "z", 10)).unwrap();
        snap.add_file(0, meta(2, "a", "z", 10)).unwrap();
        snap.add_file(1, meta(3, "m", "p", 10)).unwrap();
        snap.add_file(1, meta(4, "a", "c", 10)).unwrap();
        snap.add_file(1, meta(5, "x", "z", 10)).unwrap();

        assert_eq!(ids(&snap, 0), vec![2, 1]);
        assert_eq!(ids(&snap, 1), vec![4, 3, 5]);
        assert_eq!(snap.num_files(), 5);
        assert_eq!(snap.total_bytes(), 50);
        assert_eq!(snap.num_level_bytes(1), 30);
    }

    /// # Scenario
    /// A file overlapping its would-be neighbour on a sorted level.
    #[test]
    fn overlap_rejected() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(2, meta(1, "c", "f", 10)).unwrap();
        snap.add_file(2, meta(2, "h", "k", 10)).unwrap();

        let err = snap.add_file(2, meta(3, "e", "g", 10)).unwrap_err();
        assert!(matches!(
            err,
            VersionError::Overlap {
                id: 3,
                existing: 1,
                level: 2
            }
        ));

        let err = snap.add_file(2, meta(4, "g", "h", 10)).unwrap_err();
        assert!(matches!(err, VersionError::Overlap { existing: 2, .. }));

        // Overlap is fine on L0.
        snap.add_file(0, meta(5, "a", "z", 10)).unwrap();
        snap.add_file(0, meta(6, "a", "z", 10)).unwrap();
        assert_eq!(ids(&snap, 2), vec![1, 2]);
    }

    /// # Scenario
    /// Probing levels past the provisioned range.
    ///
    /// # Expected behavior
    /// Reads see an empty level; writes are rejected.
    #[test]
    fn out_of_range_levels() {
        let mut snap = LevelSnapshot::new(3);

        assert!(snap.level_files(7).is_empty());
        assert!(snap.level_is_empty(7));
        assert_eq!(snap.num_level_bytes(7), 0);

        let err = snap.add_file(3, meta(1, "a", "b", 10)).unwrap_err();
        assert!(matches!(
            err,
            VersionError::LevelOutOfRange {
                level: 3,
                num_levels: 3
            }
        ));
    }

    // ----------------------------------------------------------------
    // Installing jobs
    // ----------------------------------------------------------------

    /// # Scenario
    /// A merge of two L1 files and one L2 file into L2.
    ///
    /// # Expected behavior
    /// Inputs disappear, the single output takes their place.
    #[test]
    fn apply_merge() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();
        snap.add_file(1, meta(2, "d", "f", 10)).unwrap();
        snap.add_file(1, meta(3, "x", "z", 10)).unwrap();
        snap.add_file(2, meta(4, "b", "e", 20)).unwrap();

        let l1: Vec<_> = snap.level_files(1)[..2].to_vec();
        let l2 = snap.level_files(2).to_vec();
        let job = CompactionJob::new(
            vec![CompactionInputFiles::new(1, l1), CompactionInputFiles::new(2, l2)],
            2,
            CompactionReason::LevelMaxLevelSize,
        );

        snap.apply(&job, vec![meta(10, "a", "f", 35)]).unwrap();

        assert_eq!(ids(&snap, 1), vec![3]);
        assert_eq!(ids(&snap, 2), vec![10]);
        assert_eq!(snap.total_bytes(), 45);
    }

    /// # Scenario
    /// Relinking a non-overlapping file one level down.
    #[test]
    fn apply_trivial_move() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();
        snap.add_file(2, meta(2, "x", "z", 10)).unwrap();

        let mut job = job_for(&snap, 1, &[1], 2);
        job.is_trivial_move = true;
        snap.apply_move(&job).unwrap();

        assert!(snap.level_is_empty(1));
        assert_eq!(ids(&snap, 2), vec![1, 2]);
    }

    #[test]
    fn apply_move_requires_trivial_job() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();

        let job = job_for(&snap, 1, &[1], 2);
        let err = snap.apply_move(&job).unwrap_err();

        assert!(matches!(err, VersionError::InvalidJob(_)));
        assert_eq!(ids(&snap, 1), vec![1]);
    }

    /// # Scenario
    /// The same job is installed twice.
    ///
    /// # Expected behavior
    /// The second attempt reports the first input as missing.
    #[test]
    fn apply_missing_input() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();

        let job = job_for(&snap, 1, &[1], 2);
        snap.apply(&job, vec![meta(2, "a", "c", 10)]).unwrap();

        let err = snap.apply(&job, vec![meta(3, "a", "c", 10)]).unwrap_err();
        assert!(matches!(err, VersionError::MissingInput { id: 1, level: 1 }));
    }

    #[test]
    fn apply_rejects_output_out_of_range() {
        let mut snap = LevelSnapshot::new(2);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();

        let job = job_for(&snap, 1, &[1], 5);
        let err = snap.apply(&job, Vec::new()).unwrap_err();

        assert!(matches!(err, VersionError::LevelOutOfRange { level: 5, .. }));
        assert_eq!(ids(&snap, 1), vec![1]);
    }

    // ----------------------------------------------------------------
    // Failed installs
    // ----------------------------------------------------------------

    fn layout(view: &LevelSnapshot) -> Vec<Vec<u64>> {
        (0..view.num_levels()).map(|level| ids(view, level)).collect()
    }

    /// # Scenario
    /// A job listing one real L1 file followed by a file that is not in the
    /// snapshot.
    ///
    /// # Expected behavior
    /// `MissingInput` is reported and the real file is still on L1.
    #[test]
    fn failed_apply_keeps_inputs() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();
        snap.add_file(2, meta(2, "x", "z", 10)).unwrap();
        let before = layout(&snap);

        let mut files = snap.level_files(1).to_vec();
        files.push(Arc::new(meta(99, "d", "f", 10)));
        let job = CompactionJob::new(
            vec![CompactionInputFiles::new(1, files)],
            2,
            CompactionReason::LevelMaxLevelSize,
        );

        let err = snap.apply(&job, vec![meta(3, "a", "f", 20)]).unwrap_err();

        assert!(matches!(err, VersionError::MissingInput { id: 99, level: 1 }));
        assert_eq!(layout(&snap), before);
        assert_eq!(snap.total_bytes(), 20);
    }

    /// # Scenario
    /// The inputs are removed cleanly, but the output collides with a file
    /// the job did not consume.
    ///
    /// # Expected behavior
    /// `Overlap` is reported; inputs and the colliding file are unchanged.
    #[test]
    fn failed_apply_on_output_overlap() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();
        snap.add_file(2, meta(2, "b", "d", 10)).unwrap();
        let before = layout(&snap);

        let job = job_for(&snap, 1, &[1], 2);
        let err = snap.apply(&job, vec![meta(3, "a", "c", 10)]).unwrap_err();

        assert!(matches!(
            err,
            VersionError::Overlap {
                id: 3,
                existing: 2,
                level: 2
            }
        ));
        assert_eq!(layout(&snap), before);
    }

    /// # Scenario
    /// A relink whose file overlaps the destination level.
    #[test]
    fn failed_apply_move_keeps_source() {
        let mut snap = LevelSnapshot::new(4);
        snap.add_file(1, meta(1, "a", "c", 10)).unwrap();
        snap.add_file(1, meta(2, "m", "p", 10)).unwrap();
        snap.add_file(2, meta(3, "n", "o", 10)).unwrap();
        let before = layout(&snap);

        let mut job = job_for(&snap, 1, &[1, 2], 2);
        job.is_trivial_move = true;
        let err = snap.apply_move(&job).unwrap_err();

        assert!(matches!(
            err,
            VersionError::Overlap {
                id: 2,
                existing: 3,
                ..
            }
        ));
        assert_eq!(layout(&snap), before);
    }
}

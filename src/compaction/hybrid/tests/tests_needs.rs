//! Trigger and predicate tests: `needs_compaction`, hole detection and
//! admission checks.

#[cfg(test)]
mod tests {
    use crate::compaction::hybrid::HybridCompactionPicker;
    use crate::compaction::hybrid::tests::helpers::*;
    use crate::compaction::{CompactionReason, RunningCompaction};
    use crate::version::LevelSnapshot;

    fn with_levels(levels: &[usize]) -> LevelSnapshot {
        let mut snap = empty_snapshot();
        for (i, &level) in levels.iter().enumerate() {
            snap.add_file(level, file(i as u64 + 1, 0, 99, MIB)).unwrap();
        }
        snap
    }

    // --------------------------------------------------------------------------------------------
    // level_needs_rearrange
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// Various fill patterns of hyper-level 1 (L1–L8).
    ///
    /// # Expected behavior
    /// A hole is reported only when an empty level follows a non-empty one
    /// inside the scanned range.
    #[test]
    fn rearrange_detects_holes() {
        let state = init_state(test_config(), &empty_snapshot());

        assert!(state.level_needs_rearrange(1, &with_levels(&[1, 2]), 1));
        assert!(state.level_needs_rearrange(1, &with_levels(&[2]), 1));
        assert!(!state.level_needs_rearrange(1, &empty_snapshot(), 1));
        assert!(!state.level_needs_rearrange(1, &with_levels(&[1, 2, 3, 4, 5, 6, 7, 8]), 1));
        assert!(!state.level_needs_rearrange(1, &with_levels(&[3, 4, 5, 6, 7, 8]), 1));
        assert!(!state.level_needs_rearrange(1, &with_levels(&[1, 2]), 3));
        assert!(!state.level_needs_rearrange(0, &with_levels(&[0, 1]), 0));
    }

    // --------------------------------------------------------------------------------------------
    // needs_compaction
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// A fresh picker that has never picked.
    ///
    /// # Expected behavior
    /// Always reports work, so the first pick gets to initialise the state.
    #[test]
    fn cold_start_needs_compaction() {
        let picker = HybridCompactionPicker::new("test", test_config()).unwrap();

        assert!(picker.needs_compaction(&empty_snapshot(), &[]).unwrap());
        assert_eq!(picker.num_hyper_levels().unwrap(), 0);
        assert_eq!(picker.last_level().unwrap(), None);
    }

    #[test]
    fn empty_tree_is_balanced() {
        let snap = empty_snapshot();
        let state = init_state(test_config(), &snap);

        assert!(!state.needs_compaction(&snap, &[]));
    }

    /// # Scenario
    /// L0 below and at the trigger of 4 files.
    #[test]
    fn level0_trigger() {
        let mut snap = empty_snapshot();
        for id in 0..3 {
            snap.add_file(0, file(id, 0, 99, MIB)).unwrap();
        }
        let state = init_state(test_config(), &snap);
        assert!(!state.needs_compaction(&snap, &[]));

        snap.add_file(0, file(3, 0, 99, MIB)).unwrap();
        assert!(state.needs_compaction(&snap, &[]));
        // Repeated queries do not change the answer.
        assert!(state.needs_compaction(&snap, &[]));
    }

    /// # Scenario
    /// L0 is over the trigger but an L0 compaction is already running.
    ///
    /// # Expected behavior
    /// No new work is reported.
    #[test]
    fn level0_busy() {
        let mut snap = empty_snapshot();
        for id in 0..6 {
            snap.add_file(0, file(id, 0, 99, MIB)).unwrap();
        }
        let state = init_state(test_config(), &snap);
        let running = [RunningCompaction::new(0, CompactionReason::LevelL0FilesNum)];

        assert!(!state.needs_compaction(&snap, &running));
    }

    /// # Scenario
    /// Plenty of work, but a manual compaction is in flight.
    ///
    /// # Expected behavior
    /// The picker stays out of the way.
    #[test]
    fn manual_compaction_blocks_trigger() {
        let mut snap = with_levels(&[1, 2]);
        for id in 10..16 {
            snap.add_file(0, file(id, 0, 99, MIB)).unwrap();
        }
        let state = init_state(test_config(), &snap);
        let running = [RunningCompaction::new(20, CompactionReason::ManualCompaction)];

        assert!(state.needs_compaction(&snap, &[]));
        assert!(!state.needs_compaction(&snap, &running));
    }

    /// # Scenario
    /// Hyper-level 1 has a hole (L1, L2 set, L3 empty).
    ///
    /// # Expected behavior
    /// Reported while idle, suppressed while any rearrange runs.
    #[test]
    fn hole_triggers_rearrange() {
        let snap = with_levels(&[1, 2]);
        let state = init_state(test_config(), &snap);

        assert!(state.needs_compaction(&snap, &[]));

        let running = [RunningCompaction::new(12, CompactionReason::Rearrange)];
        assert!(!state.needs_compaction(&snap, &running));
    }

    /// # Scenario
    /// Hyper-level 1 holds 80 MiB against a 64 MiB budget.
    #[test]
    fn oversized_hyper_level() {
        let mut snap = empty_snapshot();
        fill_level(&mut snap, 8, 1, 0, 100, 8, 10 * MIB);
        let state = init_state(test_config(), &snap);

        assert!(state.needs_compaction(&snap, &[]));

        let running = [RunningCompaction::new(8, CompactionReason::LevelMaxLevelSize)];
        assert!(!state.needs_compaction(&snap, &running));
    }

    /// # Scenario
    /// The last level holds more files than half the open-file budget.
    #[test]
    fn too_many_files_in_last_level() {
        let mut config = test_config();
        config.max_open_files = 20;
        let mut snap = empty_snapshot();
        fill_level(&mut snap, 9, 1, 0, 10, 11, 64 * MIB);
        let state = init_state(config, &snap);

        assert!(state.needs_compaction(&snap, &[]));
    }

    // --------------------------------------------------------------------------------------------
    // need_to_run_level_compaction
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// Hyper-level 2 (L9–L16) is small but its last level is populated.
    ///
    /// # Expected behavior
    /// Only the byte budget decides; a non-empty level far above the
    /// hyper-level forces the compaction regardless of size.
    #[test]
    fn force_level_overrides_budget() {
        let mut snap = empty_snapshot();
        snap.add_file(16, file(1, 0, 99, MIB)).unwrap();
        snap.add_file(17, file(2, 0, 99, 600 * MIB)).unwrap();
        let state = init_state(test_config(), &snap);
        assert_eq!(state.cur_num_hyper_levels, 2);

        assert!(!state.need_to_run_level_compaction(2, &snap));

        // last(2) - (8 + 6) = L2.
        snap.add_file(2, file(3, 0, 99, MIB)).unwrap();
        assert!(state.need_to_run_level_compaction(2, &snap));
    }

    #[test]
    fn empty_last_level_in_hyper_never_runs() {
        let mut snap = empty_snapshot();
        fill_level(&mut snap, 5, 1, 0, 100, 8, 20 * MIB);
        let state = init_state(test_config(), &snap);

        assert!(!state.need_to_run_level_compaction(1, &snap));
    }

    // --------------------------------------------------------------------------------------------
    // may_start_level_compaction
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// Hyper-level 1 is not the top one, has no bookmark and the level right
    /// below it (L9) already holds data.
    ///
    /// # Expected behavior
    /// Refused until a bookmark names an output level to keep feeding.
    #[test]
    fn level_compaction_needs_free_target() {
        let mut snap = empty_snapshot();
        snap.add_file(8, file(1, 0, 99, MIB)).unwrap();
        snap.add_file(9, file(2, 0, 99, MIB)).unwrap();
        snap.add_file(17, file(3, 0, 99, 600 * MIB)).unwrap();
        let mut state = init_state(test_config(), &snap);
        assert_eq!(state.cur_num_hyper_levels, 2);

        let desc = state.descriptors(&[]);
        assert!(!state.may_start_level_compaction(1, &desc, &snap));
        // The top hyper-level always writes to the last level.
        assert!(state.may_start_level_compaction(2, &desc, &snap));

        state.prev_mut(1).output_level = Some(9);
        assert!(state.may_start_level_compaction(1, &desc, &snap));
    }
}

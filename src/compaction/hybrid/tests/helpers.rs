use crate::PickerConfig;
use crate::compaction::hybrid::PickerState;
use crate::version::{FileMeta, LevelSnapshot};
use tracing_subscriber::EnvFilter;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Levels provisioned by the default test snapshot (room for 4 hyper-levels
/// of 8 levels each).
pub const NUM_LEVELS: usize = 40;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 1 MiB write buffer, factor-1.0 space amp, multiplier 8, L0 trigger 4.
///
/// Budgets: hyper-level 1 = 64 MiB, hyper-level 2 = 512 MiB.
pub fn test_config() -> PickerConfig {
    init_tracing();
    PickerConfig {
        write_buffer_size: MIB,
        max_size_amplification_percent: 200,
        min_merge_width: 8,
        max_merge_width: 16,
        level0_file_num_compaction_trigger: 4,
        max_open_files: 10_000,
        table_prefix_size: 0,
        max_output_file_size: 1 << 30,
        force_compaction_slack: 6,
        reduce_sorted_runs: false,
    }
}

/// Zero-padded key, so bytewise order matches numeric order.
pub fn key(i: u64) -> Vec<u8> {
    format!("k{i:06}").into_bytes()
}

/// File covering `key(lo)..=key(hi)`.
pub fn file(id: u64, lo: u64, hi: u64, size: u64) -> FileMeta {
    FileMeta::new(id, key(lo), key(hi), size)
}

/// Adds `count` adjacent files of `width` keys each, starting at key
/// `start`. File ids start at `first_id`.
pub fn fill_level(
    snapshot: &mut LevelSnapshot,
    level: usize,
    first_id: u64,
    start: u64,
    width: u64,
    count: u64,
    size: u64,
) {
    for i in 0..count {
        let lo = start + i * width;
        snapshot
            .add_file(level, file(first_id + i, lo, lo + width - 1, size))
            .unwrap();
    }
}

pub fn empty_snapshot() -> LevelSnapshot {
    LevelSnapshot::new(NUM_LEVELS)
}

/// A state initialised against `snapshot`.
pub fn init_state(config: PickerConfig, snapshot: &LevelSnapshot) -> PickerState {
    let mut state = PickerState::new("test".into(), config);
    state.init(snapshot).unwrap();
    state
}

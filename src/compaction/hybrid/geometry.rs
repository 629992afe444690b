//! Hyper-level geometry.
//!
//! Maps hyper-level numbers to the contiguous range of numbered levels they
//! own. The mapping is a pure function of the multiplier table:
//!
//! - hyper-level 0 is level 0 alone (`multiplier[0]` is the L0 merge width),
//! - hyper-level `h ≥ 1` owns `multiplier[h]` consecutive levels starting
//!   right after hyper-level `h - 1`,
//! - the last level sits one past the top hyper-level.

/// Multiplier table and the level arithmetic derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLevelMap {
    multipliers: Vec<usize>,
}

impl HyperLevelMap {
    /// Builds a map from per-hyper-level multipliers.
    ///
    /// Entries past the end of the table repeat the last multiplier.
    /// Every multiplier must be at least 1.
    pub fn new(multipliers: Vec<usize>) -> Self {
        debug_assert!(!multipliers.is_empty());
        debug_assert!(multipliers.iter().all(|&m| m >= 1));
        Self { multipliers }
    }

    /// Same multiplier for every hyper-level.
    pub fn uniform(multiplier: usize, num_hyper_levels: usize) -> Self {
        Self::new(vec![multiplier; num_hyper_levels + 1])
    }

    /// Number of levels merged into one step of hyper-level `h`.
    pub fn multiplier(&self, hyper_level: usize) -> usize {
        self.multipliers
            .get(hyper_level)
            .or(self.multipliers.last())
            .copied()
            .unwrap_or(1)
    }

    /// First numbered level owned by `hyper_level`.
    pub fn first_level_in_hyper(&self, hyper_level: usize) -> usize {
        if hyper_level == 0 {
            return 0;
        }
        1 + (1..hyper_level).map(|h| self.multiplier(h)).sum::<usize>()
    }

    /// Last numbered level owned by `hyper_level`.
    pub fn last_level_in_hyper(&self, hyper_level: usize) -> usize {
        if hyper_level == 0 {
            return 0;
        }
        self.first_level_in_hyper(hyper_level) + self.multiplier(hyper_level) - 1
    }

    /// Hyper-level owning `level`.
    pub fn hyper_level_num(&self, level: usize) -> usize {
        if level == 0 {
            return 0;
        }
        let mut hyper_level = 1;
        let mut last = self.multiplier(1);
        while level > last {
            hyper_level += 1;
            last += self.multiplier(hyper_level);
        }
        hyper_level
    }

    /// The bottom level when `num_hyper_levels` hyper-levels are in use.
    pub fn last_level(&self, num_hyper_levels: usize) -> usize {
        self.last_level_in_hyper(num_hyper_levels) + 1
    }

    /// Largest hyper-level count whose last level fits in `num_levels`.
    /// Returns `None` when not even one hyper-level fits.
    pub fn max_hyper_levels_for(&self, num_levels: usize) -> Option<usize> {
        let mut best = None;
        let mut hyper_level = 1;
        while self.last_level(hyper_level) < num_levels {
            best = Some(hyper_level);
            hyper_level += 1;
        }
        best
    }
}

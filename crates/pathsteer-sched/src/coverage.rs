//! Block coverage accounting.
//!
//! Two independent tables: per-module hit counts keyed by module-relative
//! block start, feeding the scheduling metric, and the per-function block
//! coverage table fed by guest annotations, feeding reports.

use std::collections::{BTreeMap, BTreeSet};

/// Per-module map from block start to the number of times a state was
/// scheduled into it.
#[derive(Debug, Default)]
pub struct CoverageMap {
    by_module: BTreeMap<String, BTreeMap<u64, u64>>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for a block, seeding an unseen block at zero.
    pub fn count(&mut self, module: &str, rel_pc: u64) -> u64 {
        *self
            .by_module
            .entry(module.to_string())
            .or_default()
            .entry(rel_pc)
            .or_insert(0)
    }

    /// Whether the block has been seen (seeded or hit) before.
    pub fn is_known(&self, module: &str, rel_pc: u64) -> bool {
        self.by_module
            .get(module)
            .is_some_and(|blocks| blocks.contains_key(&rel_pc))
    }

    /// Record one completed execution of a block and return the new count.
    pub fn hit(&mut self, module: &str, rel_pc: u64) -> u64 {
        let slot = self
            .by_module
            .entry(module.to_string())
            .or_default()
            .entry(rel_pc)
            .or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Overwrite a block's count.
    pub fn set(&mut self, module: &str, rel_pc: u64, value: u64) {
        self.by_module
            .entry(module.to_string())
            .or_default()
            .insert(rel_pc, value);
    }

    /// Count without seeding.
    pub fn get(&self, module: &str, rel_pc: u64) -> Option<u64> {
        self.by_module
            .get(module)
            .and_then(|blocks| blocks.get(&rel_pc))
            .copied()
    }

    /// Number of distinct blocks seen in `module`.
    pub fn blocks_seen(&self, module: &str) -> usize {
        self.by_module.get(module).map_or(0, BTreeMap::len)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_module.keys().map(String::as_str)
    }
}

/// Coverage record for one instrumented function.
#[derive(Debug, Clone, Default)]
pub struct BlockCoverageRecord {
    /// Total basic blocks in the function, as reported by instrumentation.
    pub total_blocks: i64,
    /// Distinct block indexes observed.
    pub touched: BTreeSet<i64>,
}

impl BlockCoverageRecord {
    pub fn percent(&self) -> f64 {
        if self.total_blocks <= 0 {
            return 0.0;
        }
        self.touched.len() as f64 * 100.0 / self.total_blocks as f64
    }
}

/// Per-function block coverage across all states.
#[derive(Debug, Default)]
pub struct BlockCoverage {
    by_function: BTreeMap<String, BlockCoverageRecord>,
}

impl BlockCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed block. Instrumentation reports the function's
    /// total on every visit, so `total_blocks` overwrites.
    pub fn record(&mut self, function: &str, total_blocks: i64, block_index: i64) {
        let rec = self.by_function.entry(function.to_string()).or_default();
        rec.total_blocks = total_blocks;
        rec.touched.insert(block_index);
    }

    pub fn get(&self, function: &str) -> Option<&BlockCoverageRecord> {
        self.by_function.get(function)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BlockCoverageRecord)> + '_ {
        self.by_function.iter().map(|(name, rec)| (name.as_str(), rec))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_function.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_function.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_seeds_at_zero() {
        let mut cov = CoverageMap::new();
        assert!(!cov.is_known("drv", 0x10));
        assert_eq!(cov.count("drv", 0x10), 0);
        assert!(cov.is_known("drv", 0x10));
        assert_eq!(cov.get("drv", 0x10), Some(0));
        assert_eq!(cov.get("drv", 0x20), None);
    }

    #[test]
    fn test_hit_increments() {
        let mut cov = CoverageMap::new();
        assert_eq!(cov.hit("drv", 0x10), 1);
        assert_eq!(cov.hit("drv", 0x10), 2);
        assert_eq!(cov.blocks_seen("drv"), 1);
        assert_eq!(cov.blocks_seen("other"), 0);
    }

    #[test]
    fn test_set_overwrites() {
        let mut cov = CoverageMap::new();
        cov.hit("drv", 0x10);
        cov.set("drv", 0x10, 0);
        assert_eq!(cov.get("drv", 0x10), Some(0));
    }

    #[test]
    fn test_modules_are_independent() {
        let mut cov = CoverageMap::new();
        cov.hit("a", 0x10);
        cov.hit("b", 0x10);
        cov.hit("b", 0x10);
        assert_eq!(cov.get("a", 0x10), Some(1));
        assert_eq!(cov.get("b", 0x10), Some(2));
        let modules: Vec<&str> = cov.modules().collect();
        assert_eq!(modules, ["a", "b"]);
    }

    #[test]
    fn test_block_record_tracks_distinct_indexes() {
        let mut bc = BlockCoverage::new();
        bc.record("probe", 10, 3);
        bc.record("probe", 10, 3);
        bc.record("probe", 10, 4);
        let rec = bc.get("probe").unwrap();
        assert_eq!(rec.total_blocks, 10);
        assert_eq!(rec.touched.len(), 2);
        assert!((rec.percent() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_block_record_total_overwrites() {
        let mut bc = BlockCoverage::new();
        bc.record("probe", 10, 0);
        bc.record("probe", 12, 1);
        assert_eq!(bc.get("probe").unwrap().total_blocks, 12);
    }

    #[test]
    fn test_percent_with_zero_total() {
        let rec = BlockCoverageRecord::default();
        assert_eq!(rec.percent(), 0.0);
    }
}

//! Resume-candidate selection.
//!
//! [`SelectionState`] keeps the sticky-selection clock and the coverage
//! policy's round-robin mode counter; the `pick_*` functions each scan
//! the registry for one kind of interesting state and return `None` when
//! nothing qualifies, letting the scheduler fall through to the next
//! stage.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::annotation::{StateAnnotation, StateId};
use crate::registry::StateRegistry;

/// Round-robin selection modes under the coverage policy. Mode 1 falls
/// through to the random pick.
pub const MODE_COUNT: u8 = 8;

/// Metric threshold under which the registry head counts as barely
/// explored and wins selection outright.
const LOW_METRIC_BELOW: u64 = 2;

/// Clock, sticky window, and RNG for `select_next`.
#[derive(Debug)]
pub struct SelectionState {
    mode: u8,
    last: Option<StateId>,
    last_start: u64,
    clock: u64,
    rng: ChaCha8Rng,
}

impl SelectionState {
    pub fn new(seed: u64) -> Self {
        Self {
            mode: 1,
            last: None,
            last_start: 0,
            clock: 0,
            // Domain-separated seed for the selection RNG.
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(0x5053_454c_4543)),
        }
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.clock
    }

    #[inline]
    pub fn tick(&mut self) {
        self.clock += 1;
    }

    #[inline]
    pub fn mode(&self) -> u8 {
        self.mode
    }

    #[inline]
    pub fn last(&self) -> Option<StateId> {
        self.last
    }

    /// True while the previous selection is still inside its sticky
    /// window of `budget` ticks.
    pub fn within_budget(&self, budget: u64) -> bool {
        self.last.is_some() && self.clock - self.last_start < budget
    }

    /// Record a selection; returns true when it differs from the
    /// previous one. Re-selecting the same state does not extend its
    /// window.
    pub fn note_selected(&mut self, id: StateId) -> bool {
        if self.last == Some(id) {
            return false;
        }
        self.last = Some(id);
        self.last_start = self.clock;
        true
    }

    /// Drop the sticky window so the next selection starts fresh.
    pub fn reset_sticky(&mut self) {
        self.last = None;
    }

    /// Forget a terminated state if it was the sticky selection.
    pub fn forget(&mut self, id: StateId) {
        if self.last == Some(id) {
            self.last = None;
        }
    }

    /// Step the round robin, wrapping back to mode 1 past [`MODE_COUNT`].
    pub fn advance_mode(&mut self) {
        self.mode += 1;
        if self.mode > MODE_COUNT {
            self.mode = 1;
        }
    }

    /// Uniform pick over the registry.
    pub fn pick_random(&mut self, registry: &StateRegistry) -> Option<StateId> {
        if registry.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..registry.len());
        registry.iter().nth(index)
    }
}

/// Registry head when it sits on barely-explored code, else the first
/// state whose metric is exactly zero.
pub fn pick_low_metric(
    registry: &StateRegistry,
    annotations: &BTreeMap<StateId, StateAnnotation>,
) -> Option<StateId> {
    if let Some(id) = registry.head() {
        if let Some(ann) = annotations.get(&id) {
            if ann.metric_valid && ann.metric < LOW_METRIC_BELOW {
                return Some(id);
            }
        }
    }
    registry.iter().find(|id| {
        annotations
            .get(id)
            .is_some_and(|ann| ann.metric_valid && ann.metric == 0)
    })
}

/// State with the greatest valid metric, i.e. the one deepest into
/// already-covered code.
pub fn pick_hot_metric(
    registry: &StateRegistry,
    annotations: &BTreeMap<StateId, StateAnnotation>,
) -> Option<StateId> {
    let mut best = None;
    let mut best_metric = 0u64;
    for id in registry.iter() {
        let Some(ann) = annotations.get(&id) else {
            continue;
        };
        if ann.metric_valid && ann.metric > best_metric {
            best_metric = ann.metric;
            best = Some(id);
        }
    }
    best
}

/// First state currently inside a rarely-entered tracked function.
/// Rarity is by global entry count, scanned in function-name order.
pub fn pick_rare_function(
    registry: &StateRegistry,
    annotations: &BTreeMap<StateId, StateAnnotation>,
    function_counts: &BTreeMap<String, u64>,
    rare_below: u64,
) -> Option<StateId> {
    let rare = function_counts
        .iter()
        .find(|(_, count)| **count < rare_below)
        .map(|(name, _)| name.as_str())?;
    registry.iter().find(|id| {
        annotations
            .get(id)
            .is_some_and(|ann| ann.call_stack_fns.iter().any(|f| f == rare))
    })
}

/// State whose call stack overlaps the designated primary functions the
/// most, counting every frame/entry pair.
pub fn pick_primary_match(
    registry: &StateRegistry,
    annotations: &BTreeMap<StateId, StateAnnotation>,
    primary_fns: &[String],
) -> Option<StateId> {
    let mut best = None;
    let mut best_matches = 0u64;
    for id in registry.iter() {
        let Some(ann) = annotations.get(&id) else {
            continue;
        };
        let matches: u64 = ann
            .call_stack_fns
            .iter()
            .map(|frame| primary_fns.iter().filter(|p| *p == frame).count() as u64)
            .sum();
        if matches > best_matches {
            best_matches = matches;
            best = Some(id);
        }
    }
    best
}

/// State with the greatest (or least) success-path score. The contest
/// starts from zero, so only states that beat zero qualify.
pub fn pick_success_extreme(
    registry: &StateRegistry,
    annotations: &BTreeMap<StateId, StateAnnotation>,
    greatest: bool,
) -> Option<StateId> {
    let mut best = None;
    let mut best_value = 0i64;
    for id in registry.iter() {
        let Some(ann) = annotations.get(&id) else {
            continue;
        };
        let wins = if greatest {
            ann.success_path > best_value
        } else {
            ann.success_path < best_value
        };
        if wins {
            best_value = ann.success_path;
            best = Some(id);
        }
    }
    best
}

/// State with the greatest (or least) driver call-stack depth, contested
/// from zero like [`pick_success_extreme`]. Depths are never negative,
/// so the `least` direction cannot produce a winner and always falls
/// through to the random pick.
pub fn pick_stack_extreme(
    registry: &StateRegistry,
    annotations: &BTreeMap<StateId, StateAnnotation>,
    greatest: bool,
) -> Option<StateId> {
    let mut best = None;
    let mut best_depth = 0i64;
    for id in registry.iter() {
        let Some(ann) = annotations.get(&id) else {
            continue;
        };
        let wins = if greatest {
            ann.driver_call_stack > best_depth
        } else {
            ann.driver_call_stack < best_depth
        };
        if wins {
            best_depth = ann.driver_call_stack;
            best = Some(id);
        }
    }
    best
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

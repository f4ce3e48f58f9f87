//! Priority-ordered registry of schedulable states.
//!
//! Sort keys are materialized: every state is indexed under an immutable
//! [`RankKey`] snapshot of its ranking inputs. Any operation that changes
//! those inputs must remove the state first and re-insert it afterwards;
//! mutating the inputs of an indexed state leaves the order undefined.

use std::collections::{BTreeMap, BTreeSet};

use crate::annotation::{StateAnnotation, StateId};

/// Which ranking the registry currently applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Higher accumulated priority first.
    FavorSuccessful,
    /// States whose upcoming block is rarest first, unmappable states last.
    MaximizeCoverage,
}

/// Materialized sort key. Lexicographic order equals scheduling order; the
/// first key in the set is the best candidate, ties go to the lower state
/// id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RankKey {
    a: i64,
    b: u64,
    id: StateId,
}

impl RankKey {
    fn for_state(policy: Policy, id: StateId, ann: &StateAnnotation) -> Self {
        match policy {
            // priority_change is capped far below i64::MIN's magnitude, so
            // the negation cannot overflow.
            Policy::FavorSuccessful => Self {
                a: -ann.priority_change,
                b: 0,
                id,
            },
            Policy::MaximizeCoverage => Self {
                a: i64::from(!ann.metric_valid),
                b: ann.metric,
                id,
            },
        }
    }

    #[inline]
    pub fn id(self) -> StateId {
        self.id
    }
}

/// Ordered set of registered states plus the key each is indexed under.
#[derive(Debug, Default)]
pub struct StateRegistry {
    keys: BTreeSet<RankKey>,
    by_id: BTreeMap<StateId, RankKey>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `id` under its current ranking inputs. Re-inserting a state
    /// whose key is unchanged is a no-op.
    pub fn insert(&mut self, policy: Policy, id: StateId, ann: &StateAnnotation) {
        let key = RankKey::for_state(policy, id, ann);
        if let Some(old) = self.by_id.get(&id) {
            if *old == key {
                return;
            }
            debug_assert!(false, "state {id} re-indexed without an erase");
            self.keys.remove(old);
        }
        self.keys.insert(key);
        self.by_id.insert(id, key);
    }

    /// Drop `id` from the registry. Unknown ids are ignored.
    pub fn remove(&mut self, id: StateId) -> bool {
        match self.by_id.remove(&id) {
            Some(key) => {
                self.keys.remove(&key);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn contains(&self, id: StateId) -> bool {
        self.by_id.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Best-ranked state, if any.
    pub fn head(&self) -> Option<StateId> {
        self.keys.iter().next().map(|key| key.id)
    }

    /// States in scheduling order, best first.
    pub fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        self.keys.iter().map(|key| key.id)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.by_id.clear();
    }

    /// Re-key every registered state, keeping membership. Used when the
    /// ranking policy flips.
    pub fn rebuild(&mut self, policy: Policy, annotations: &BTreeMap<StateId, StateAnnotation>) {
        let ids: Vec<StateId> = self.by_id.keys().copied().collect();
        self.clear();
        for id in ids {
            if let Some(ann) = annotations.get(&id) {
                self.insert(policy, id, ann);
            }
        }
    }

    /// Structural self-check: the key set and the id index agree, the
    /// order is strict, and every key matches the state it ranks.
    pub fn verify_invariants(
        &self,
        policy: Policy,
        annotations: &BTreeMap<StateId, StateAnnotation>,
    ) -> Result<(), String> {
        if self.keys.len() != self.by_id.len() {
            return Err(format!(
                "key set has {} entries, index has {}",
                self.keys.len(),
                self.by_id.len()
            ));
        }
        for (id, key) in &self.by_id {
            if key.id != *id {
                return Err(format!("index entry {id} holds the key of state {}", key.id));
            }
            if !self.keys.contains(key) {
                return Err(format!("state {id} is indexed but its key is missing"));
            }
            let Some(ann) = annotations.get(id) else {
                return Err(format!("state {id} is indexed but has no annotation"));
            };
            if *key != RankKey::for_state(policy, *id, ann) {
                return Err(format!("state {id} is indexed under a stale key"));
            }
        }
        let mut prev: Option<&RankKey> = None;
        for key in &self.keys {
            if let Some(p) = prev {
                if p >= key {
                    return Err(format!("keys out of order around state {}", key.id));
                }
            }
            prev = Some(key);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(priority: i64, metric: u64, valid: bool) -> StateAnnotation {
        let mut a = StateAnnotation::new();
        a.priority_change = priority;
        a.metric = metric;
        a.metric_valid = valid;
        a
    }

    fn build(
        policy: Policy,
        states: &[(u64, StateAnnotation)],
    ) -> (StateRegistry, BTreeMap<StateId, StateAnnotation>) {
        let mut registry = StateRegistry::new();
        let mut annotations = BTreeMap::new();
        for (id, a) in states {
            registry.insert(policy, StateId(*id), a);
            annotations.insert(StateId(*id), a.clone());
        }
        (registry, annotations)
    }

    #[test]
    fn test_favor_orders_by_priority_descending() {
        let (registry, annotations) = build(
            Policy::FavorSuccessful,
            &[
                (1, ann(0, 0, true)),
                (2, ann(1000, 0, true)),
                (3, ann(-500, 0, true)),
            ],
        );
        let order: Vec<StateId> = registry.iter().collect();
        assert_eq!(order, [StateId(2), StateId(1), StateId(3)]);
        assert_eq!(registry.head(), Some(StateId(2)));
        registry
            .verify_invariants(Policy::FavorSuccessful, &annotations)
            .unwrap();
    }

    #[test]
    fn test_ties_break_by_state_id() {
        let (registry, _) = build(
            Policy::FavorSuccessful,
            &[(9, ann(7, 0, true)), (2, ann(7, 0, true)), (5, ann(7, 0, true))],
        );
        let order: Vec<StateId> = registry.iter().collect();
        assert_eq!(order, [StateId(2), StateId(5), StateId(9)]);
    }

    #[test]
    fn test_maxcov_orders_by_metric_with_invalid_last() {
        let (registry, annotations) = build(
            Policy::MaximizeCoverage,
            &[
                (1, ann(0, 3, true)),
                (2, ann(0, 0, true)),
                (3, ann(0, 0, false)),
            ],
        );
        let order: Vec<StateId> = registry.iter().collect();
        assert_eq!(order, [StateId(2), StateId(1), StateId(3)]);
        registry
            .verify_invariants(Policy::MaximizeCoverage, &annotations)
            .unwrap();
    }

    #[test]
    fn test_reinsert_same_key_is_noop() {
        let a = ann(10, 0, true);
        let mut registry = StateRegistry::new();
        registry.insert(Policy::FavorSuccessful, StateId(1), &a);
        registry.insert(Policy::FavorSuccessful, StateId(1), &a);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_tolerated() {
        let mut registry = StateRegistry::new();
        assert!(!registry.remove(StateId(42)));
        registry.insert(Policy::FavorSuccessful, StateId(1), &ann(0, 0, true));
        assert!(registry.remove(StateId(1)));
        assert!(!registry.remove(StateId(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_erase_mutate_insert_updates_order() {
        let mut annotations = BTreeMap::new();
        annotations.insert(StateId(1), ann(0, 0, true));
        annotations.insert(StateId(2), ann(100, 0, true));
        let mut registry = StateRegistry::new();
        for (id, a) in &annotations {
            registry.insert(Policy::FavorSuccessful, *id, a);
        }
        assert_eq!(registry.head(), Some(StateId(2)));

        registry.remove(StateId(1));
        annotations.get_mut(&StateId(1)).unwrap().priority_change = 500;
        registry.insert(Policy::FavorSuccessful, StateId(1), &annotations[&StateId(1)]);
        assert_eq!(registry.head(), Some(StateId(1)));
        registry
            .verify_invariants(Policy::FavorSuccessful, &annotations)
            .unwrap();
    }

    #[test]
    fn test_rebuild_applies_new_policy() {
        let (mut registry, annotations) = build(
            Policy::FavorSuccessful,
            &[(1, ann(1000, 9, true)), (2, ann(0, 1, true))],
        );
        assert_eq!(registry.head(), Some(StateId(1)));
        registry.rebuild(Policy::MaximizeCoverage, &annotations);
        assert_eq!(registry.head(), Some(StateId(2)));
        registry
            .verify_invariants(Policy::MaximizeCoverage, &annotations)
            .unwrap();
    }

    #[test]
    fn test_stale_key_detected() {
        let mut annotations = BTreeMap::new();
        annotations.insert(StateId(1), ann(0, 0, true));
        let mut registry = StateRegistry::new();
        registry.insert(Policy::FavorSuccessful, StateId(1), &annotations[&StateId(1)]);
        annotations.get_mut(&StateId(1)).unwrap().priority_change = 7;
        assert!(registry
            .verify_invariants(Policy::FavorSuccessful, &annotations)
            .is_err());
    }

    #[test]
    fn test_head_of_empty_registry() {
        let registry = StateRegistry::new();
        assert_eq!(registry.head(), None);
        assert_eq!(registry.iter().count(), 0);
    }
}

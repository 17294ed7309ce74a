//! Replica Repair Planning
//!
//! Turns the per-node outcomes of a replicated read into the writes and
//! deletes that bring the key back to its replication target.
//!
//! Nodes are walked in pool order with a running replica count:
//!
//! ```text
//! holder            → count += 1; count > max  ⇒ Trim(node)
//! active, no copy   → count < max             ⇒ Write(node), count += 1
//! unreachable       → skipped
//! ```
//!
//! with `max = min(replicate_to, active nodes)`. Earlier nodes are preferred
//! replica holders. Planning is separate from execution so concurrent probes
//! always lead to the same decisions as a sequential scan.

use bytes::Bytes;

/// What a replicated read learned about one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Node answered with a non-empty value
    Holding(Bytes),
    /// Node answered without a value
    Missing,
    /// Node never answered within `attempts_max` attempts
    Unreachable,
}

impl ProbeOutcome {
    pub fn is_active(&self) -> bool {
        !matches!(self, ProbeOutcome::Unreachable)
    }

    pub fn is_holding(&self) -> bool {
        matches!(self, ProbeOutcome::Holding(_))
    }
}

/// One corrective step on a node (by pool index)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Copy the value onto an under-replicated node
    Write(usize),
    /// Remove an excess copy
    Trim(usize),
}

/// Repair decisions for one key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairPlan {
    pub actions: Vec<RepairAction>,
    /// Nodes holding a copy before repair
    pub holders: usize,
    /// Nodes that answered
    pub active: usize,
    /// `min(replicate_to, active)`
    pub max_replication: usize,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn writes(&self) -> impl Iterator<Item = usize> + '_ {
        self.actions.iter().filter_map(|a| match a {
            RepairAction::Write(i) => Some(*i),
            RepairAction::Trim(_) => None,
        })
    }

    pub fn trims(&self) -> impl Iterator<Item = usize> + '_ {
        self.actions.iter().filter_map(|a| match a {
            RepairAction::Trim(i) => Some(*i),
            RepairAction::Write(_) => None,
        })
    }
}

/// Value of the earliest node holding a copy
pub fn first_hit(outcomes: &[ProbeOutcome]) -> Option<Bytes> {
    outcomes.iter().find_map(|outcome| match outcome {
        ProbeOutcome::Holding(value) => Some(value.clone()),
        _ => None,
    })
}

/// Plan the repair pass for a replicated read.
///
/// Nothing is planned when no node holds the key or when the replica count
/// already equals its target.
pub fn plan_repair(outcomes: &[ProbeOutcome], replicate_to: usize) -> RepairPlan {
    let holders = outcomes.iter().filter(|o| o.is_holding()).count();
    let active = outcomes.iter().filter(|o| o.is_active()).count();
    let max_replication = replicate_to.min(active);

    let mut plan = RepairPlan {
        actions: Vec::new(),
        holders,
        active,
        max_replication,
    };
    if holders == 0 || holders == max_replication {
        return plan;
    }

    let mut replicated = 0usize;
    for (index, outcome) in outcomes.iter().enumerate() {
        match outcome {
            ProbeOutcome::Holding(_) => {
                replicated += 1;
                if replicated > max_replication {
                    plan.actions.push(RepairAction::Trim(index));
                }
            }
            ProbeOutcome::Missing if replicated < max_replication => {
                plan.actions.push(RepairAction::Write(index));
                replicated += 1;
            }
            ProbeOutcome::Missing | ProbeOutcome::Unreachable => {}
        }
    }
    plan
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hold() -> ProbeOutcome {
        ProbeOutcome::Holding(Bytes::from_static(b"v"))
    }

    use ProbeOutcome::{Missing, Unreachable};

    #[test]
    fn test_first_hit_prefers_earliest_node() {
        let outcomes = vec![
            Missing,
            ProbeOutcome::Holding(Bytes::from_static(b"first")),
            ProbeOutcome::Holding(Bytes::from_static(b"second")),
        ];
        assert_eq!(first_hit(&outcomes), Some(Bytes::from_static(b"first")));
        assert_eq!(first_hit(&[Missing, Unreachable]), None);
    }

    #[test]
    fn test_backfills_cleared_preferred_node() {
        let plan = plan_repair(&[Missing, hold(), Missing], 2);
        assert_eq!(plan.actions, vec![RepairAction::Write(0)]);
        assert_eq!(plan.holders, 1);
        assert_eq!(plan.max_replication, 2);
    }

    #[test]
    fn test_shrinks_over_replication() {
        let plan = plan_repair(&[hold(), hold(), hold()], 1);
        assert_eq!(
            plan.actions,
            vec![RepairAction::Trim(1), RepairAction::Trim(2)]
        );
    }

    #[test]
    fn test_skips_unreachable_nodes() {
        let plan = plan_repair(&[Unreachable, hold(), Missing], 2);
        assert_eq!(plan.actions, vec![RepairAction::Write(2)]);
        assert_eq!(plan.active, 2);
    }

    #[test]
    fn test_saturates_at_active_nodes() {
        let plan = plan_repair(&[hold(), Unreachable, Unreachable], 3);
        assert_eq!(plan.max_replication, 1);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_nothing_to_do_at_target() {
        assert!(plan_repair(&[hold(), hold(), Missing], 2).is_empty());
        assert!(plan_repair(&[Missing, Missing], 2).is_empty());
    }

    #[test]
    fn test_mixed_trim_and_write() {
        // Node 0 gets a copy, nodes 3 and 4 lose theirs
        let plan = plan_repair(&[Missing, hold(), Unreachable, hold(), hold()], 2);
        assert_eq!(
            plan.actions,
            vec![
                RepairAction::Write(0),
                RepairAction::Trim(3),
                RepairAction::Trim(4)
            ]
        );

        let plan = plan_repair(&[Missing, hold(), Missing, Missing], 3);
        assert_eq!(plan.writes().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(plan.trims().count(), 0);
    }

    fn outcome_strategy() -> impl Strategy<Value = ProbeOutcome> {
        prop_oneof![Just(hold()), Just(Missing), Just(Unreachable)]
    }

    proptest! {
        #[test]
        fn prop_repair_converges_to_target(
            outcomes in prop::collection::vec(outcome_strategy(), 0..10),
            replicate_to in 0usize..12,
        ) {
            let plan = plan_repair(&outcomes, replicate_to);
            let holders = outcomes.iter().filter(|o| o.is_holding()).count();

            let mut after: Vec<bool> = outcomes.iter().map(|o| o.is_holding()).collect();
            for action in &plan.actions {
                match *action {
                    RepairAction::Write(i) => {
                        prop_assert_eq!(&outcomes[i], &Missing);
                        after[i] = true;
                    }
                    RepairAction::Trim(i) => {
                        prop_assert!(outcomes[i].is_holding());
                        after[i] = false;
                    }
                }
            }

            let final_holders = after.iter().filter(|h| **h).count();
            if holders == 0 {
                prop_assert!(plan.is_empty());
            } else {
                prop_assert_eq!(final_holders, plan.max_replication);
            }
        }

        #[test]
        fn prop_never_touches_unreachable(
            outcomes in prop::collection::vec(outcome_strategy(), 0..10),
            replicate_to in 0usize..12,
        ) {
            let plan = plan_repair(&outcomes, replicate_to);
            for action in plan.actions {
                let (RepairAction::Write(i) | RepairAction::Trim(i)) = action;
                prop_assert!(outcomes[i].is_active());
            }
        }
    }
}

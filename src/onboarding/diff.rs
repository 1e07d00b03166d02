//! Role diff engine: turns a selection into the minimal group patch.

use std::collections::BTreeSet;

use serde::Serialize;

use super::model::GroupId;

/// Minimal patch reconciling a member's controlled groups with a selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    pub to_add: BTreeSet<GroupId>,
    pub to_remove: BTreeSet<GroupId>,
    pub is_first_time: bool,
}

impl ReconciliationPlan {
    /// True when applying the plan would not change any group.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Apply the plan to a group set, as the platform would.
    pub fn apply_to(&self, groups: &BTreeSet<GroupId>) -> BTreeSet<GroupId> {
        groups
            .iter()
            .filter(|g| !self.to_remove.contains(*g))
            .chain(self.to_add.iter())
            .cloned()
            .collect()
    }
}

/// Inputs of [`compute_plan`].
#[derive(Debug, Clone, Copy)]
pub struct DiffInput<'a> {
    /// Options currently selected in the session.
    pub selected: &'a BTreeSet<GroupId>,
    /// Every group this system may touch.
    pub all_controlled: &'a BTreeSet<GroupId>,
    /// The member's current groups, controlled or not.
    pub actual: &'a BTreeSet<GroupId>,
    /// Mandatory groups granted on the first commit.
    pub defaults: &'a BTreeSet<GroupId>,
    /// Whether the member still holds the onboarding marker.
    pub has_marker: bool,
}

/// Compute the add/remove sets that replace the member's controlled groups
/// with the desired ones. Groups outside `all_controlled` are never touched.
pub fn compute_plan(input: DiffInput<'_>) -> ReconciliationPlan {
    let controlled_actual: BTreeSet<GroupId> = input
        .actual
        .intersection(input.all_controlled)
        .cloned()
        .collect();

    let mut desired = input.selected.clone();
    if input.has_marker {
        desired.extend(input.defaults.iter().cloned());
    }

    ReconciliationPlan {
        to_add: desired.difference(&controlled_actual).cloned().collect(),
        to_remove: controlled_actual.difference(&desired).cloned().collect(),
        is_first_time: input.has_marker,
    }
}

//! Onboarding state machine: the lifecycle phases of a member.
//!
//! Phases are not stored anywhere: they are derived from the member's current
//! groups each time an operation runs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::model::{GroupId, MemberRecord};

/// Lifecycle of one member.
///
/// JoinedPending → Presented → Committed, with Committed → Committed for later
/// updates and Presented → Presented when a prompt is re-sent. Any phase may
/// end in Aborted when the member leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingPhase {
    JoinedPending,
    Presented,
    Committed,
    Aborted,
}

impl OnboardingPhase {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: OnboardingPhase) -> bool {
        use OnboardingPhase::*;
        matches!(
            (self, target),
            (JoinedPending, Presented)
                | (Presented, Presented)
                | (Presented, Committed)
                | (Committed, Committed)
                | (JoinedPending | Presented | Committed, Aborted)
        )
    }

    /// Derive the phase of a member from their record.
    ///
    /// `governed` is every group the onboarding flow grants (catalog options
    /// plus defaults). A member who cleared the gate but holds none of them and
    /// no marker is still considered pending: the presentation step was missed.
    pub fn classify(
        member: &MemberRecord,
        marker: &GroupId,
        governed: &BTreeSet<GroupId>,
    ) -> OnboardingPhase {
        if member.pending {
            Self::JoinedPending
        } else if member.groups.contains(marker) {
            Self::Presented
        } else if !member.groups.is_disjoint(governed) {
            Self::Committed
        } else {
            Self::JoinedPending
        }
    }
}

impl std::fmt::Display for OnboardingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::JoinedPending => "joined_pending",
            Self::Presented => "presented",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

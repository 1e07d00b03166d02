//! Onboarding system: option selection, role reconciliation and the
//! periodic repair sweep.
//!
//! A member who clears the platform's join gate gets a marker group, a
//! welcome message and a selection prompt. Committing the prompt diffs the
//! selection against the member's actual groups and applies the minimal
//! patch. The sweep re-runs the presentation step for members whose events
//! were missed.

pub mod catalog;
pub mod diff;
pub mod locks;
pub mod manager;
pub mod messages;
pub mod model;
pub mod routes;
pub mod session;
pub mod state;
pub mod sweep;

pub use catalog::{GroupOption, OptionCatalog};
pub use diff::{DiffInput, ReconciliationPlan, compute_plan};
pub use manager::{
    CommitKind, CommitOutcome, GateOutcome, InteractionOutcome, InteractionReply, Onboarding,
    ToggleOutcome,
};
pub use messages::Messages;
pub use model::{
    ChannelId, Control, GroupId, MemberRecord, MembershipSnapshot, OutgoingMessage, Recipient,
    SessionId, Surface, UserId,
};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use session::{SelectionSession, SessionStore};
pub use state::OnboardingPhase;
pub use sweep::{SweepReport, spawn_sweep_ticker};

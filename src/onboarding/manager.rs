//! Onboarding service. Coordinates sessions, membership snapshots, the diff engine
//! and the platform for every per-user transition.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::diff::{DiffInput, ReconciliationPlan, compute_plan};
use super::locks::UserLocks;
use super::messages::{TemplateVars, render};
use super::model::{
    Control, GroupId, MemberRecord, MembershipSnapshot, OutgoingMessage, Recipient, SessionId,
    Surface, UserId,
};
use super::session::{Lookup, SelectionSession, SessionStore};
use super::state::OnboardingPhase;
use crate::config::OnboardingConfig;
use crate::error::{OnboardingError, PlatformError, Result};
use crate::platform::Platform;

const REASON_STARTED: &str = "Onboarding started";
const REASON_SELECTION: &str = "Onboarding dialogue";
const REASON_FINISHED: &str = "Onboarding finished";

/// How the adapter should answer the interaction that triggered an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionReply {
    /// Redraw the interacted surface in place.
    Refresh { surface: Surface },
    /// Replace the interacted surface with a notice.
    Notice { content: String },
    /// Answer with a message only the member sees; the surface stays.
    Ephemeral {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        surface: Option<Surface>,
    },
}

/// Result of a gate-cleared event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateOutcome {
    /// Marker granted, welcome and prompt delivered.
    Presented { session_id: SessionId },
    /// Member was already onboarding; only a fresh prompt was sent.
    Represented { session_id: SessionId },
    /// Member already completed onboarding; nothing was changed.
    AlreadyCommitted,
    /// Member left before anything could be done.
    Aborted,
}

/// Result of toggling an option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    /// New state of the option; `None` when the session had expired.
    pub selected: Option<bool>,
    pub reply: InteractionReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    /// First commit: selection and defaults granted, marker stripped.
    Activated,
    /// Later commit that changed groups.
    Updated,
    /// Later commit with nothing to change.
    Unchanged,
    /// The session had expired; a fresh prompt was sent instead.
    Represented,
    /// The member left; nothing was changed.
    Aborted,
    /// The member holds neither the marker nor any governed group, so there
    /// is no onboarding to finish; nothing was changed.
    Refused,
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub kind: CommitKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ReconciliationPlan>,
    pub reply: InteractionReply,
}

/// Result of any control interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum InteractionOutcome {
    Toggle(ToggleOutcome),
    Commit(CommitOutcome),
}

/// The onboarding service exposed to the adapter.
pub struct Onboarding {
    config: Arc<OnboardingConfig>,
    platform: Arc<dyn Platform>,
    pub(super) sessions: SessionStore,
    pub(super) locks: UserLocks,
}

impl Onboarding {
    pub fn new(config: Arc<OnboardingConfig>, platform: Arc<dyn Platform>) -> Self {
        Self {
            config,
            platform,
            sessions: SessionStore::new(),
            locks: UserLocks::new(),
        }
    }

    pub fn config(&self) -> &OnboardingConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub(super) fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// A live session, for adapters that need to redraw it.
    pub async fn session(&self, session_id: SessionId) -> Result<SelectionSession> {
        match self.sessions.lookup(session_id).await {
            Lookup::Live(session) => Ok(session),
            Lookup::Expired(_) => Err(OnboardingError::ExpiredSession(session_id)),
            Lookup::Missing => Err(OnboardingError::UnknownSession(session_id)),
        }
    }

    // ── Events ──────────────────────────────────────────────────────

    /// The member cleared the platform's join gate.
    pub async fn on_gate_cleared(&self, user_id: &UserId) -> Result<GateOutcome> {
        let _guard = self.locks.acquire(user_id).await;

        let mut record = match self.fetch(user_id).await {
            Ok(record) => record,
            Err(OnboardingError::UserNotFound(_)) => {
                self.abort(user_id).await;
                return Ok(GateOutcome::Aborted);
            }
            Err(e) => return Err(e),
        };
        // The event is authoritative even if the platform still reports the gate.
        record.pending = false;

        match self.phase_of(&record) {
            OnboardingPhase::JoinedPending => {
                let session_id = self.present_locked(&record, true).await?;
                Ok(GateOutcome::Presented { session_id })
            }
            OnboardingPhase::Presented => {
                let session_id = self.present_locked(&record, false).await?;
                Ok(GateOutcome::Represented { session_id })
            }
            OnboardingPhase::Committed | OnboardingPhase::Aborted => {
                debug!(user_id = %user_id, "Gate cleared for member who already finished onboarding");
                Ok(GateOutcome::AlreadyCommitted)
            }
        }
    }

    /// Member update from the platform. Fires [`on_gate_cleared`](Self::on_gate_cleared)
    /// only on the pending → cleared edge.
    pub async fn on_member_update(
        &self,
        before: &MemberRecord,
        after: &MemberRecord,
    ) -> Result<Option<GateOutcome>> {
        if before.pending && !after.pending {
            self.on_gate_cleared(&after.user_id).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// The member clicked the entry-point button in the onboarding channel.
    pub async fn on_entry_point(&self, user_id: &UserId) -> Result<InteractionReply> {
        let _guard = self.locks.acquire(user_id).await;

        let record = match self.fetch(user_id).await {
            Ok(record) => record,
            Err(OnboardingError::UserNotFound(_)) => {
                self.abort(user_id).await;
                return Ok(self.not_present_reply(""));
            }
            Err(e) => return Err(e),
        };

        // A member who cleared the gate but missed the marker grant starts
        // onboarding here, so their commit grants the defaults.
        let from = self.phase_of(&record);
        if from == OnboardingPhase::JoinedPending && !record.pending {
            self.grant_marker_locked(&record).await?;
            info!(
                user_id = %user_id,
                from = %from,
                to = %OnboardingPhase::Presented,
                "Entry point started onboarding"
            );
        }

        let session = SelectionSession::new(
            record.user_id.clone(),
            &self.config.catalog,
            self.config.session_ttl,
        );
        let surface = session.surface(&self.config.commit_label);
        info!(user_id = %user_id, session_id = %session.id, "Entry point opened a selection prompt");
        self.sessions.insert(session).await;

        Ok(InteractionReply::Ephemeral {
            content: self.text(&self.config.messages.prompt, &record.display_name),
            surface: Some(surface),
        })
    }

    /// Toggle one option of a session.
    pub async fn on_toggle(&self, session_id: SessionId, option_id: &GroupId) -> Result<ToggleOutcome> {
        match self.sessions.lookup(session_id).await {
            Lookup::Missing => Err(OnboardingError::UnknownSession(session_id)),
            Lookup::Expired(user_id) => {
                let (reply, _) = self.represent_after_expiry(&user_id).await?;
                Ok(ToggleOutcome {
                    selected: None,
                    reply,
                })
            }
            Lookup::Live(_) if !self.config.catalog.contains(option_id) => {
                Err(OnboardingError::UnknownOption {
                    session: session_id,
                    option: option_id.clone(),
                })
            }
            Lookup::Live(_) => {
                let (session, flag) = self
                    .sessions
                    .toggle(session_id, option_id)
                    .await
                    .ok_or(OnboardingError::UnknownSession(session_id))?;
                let selected = flag.ok_or_else(|| OnboardingError::UnknownOption {
                    session: session_id,
                    option: option_id.clone(),
                })?;
                debug!(session_id = %session_id, option = %option_id, selected, "Option toggled");
                Ok(ToggleOutcome {
                    selected: Some(selected),
                    reply: InteractionReply::Refresh {
                        surface: session.surface(&self.config.commit_label),
                    },
                })
            }
        }
    }

    /// Commit the session's selection: snapshot → diff → apply, under the
    /// member's lock. Repeated commits yield an empty plan.
    pub async fn on_commit(&self, session_id: SessionId) -> Result<CommitOutcome> {
        let user_id = match self.sessions.lookup(session_id).await {
            Lookup::Missing => return Err(OnboardingError::UnknownSession(session_id)),
            Lookup::Expired(user_id) => return self.commit_on_expired(&user_id).await,
            Lookup::Live(session) => session.user_id,
        };

        let guard = self.locks.acquire(&user_id).await;

        // Re-read under the lock so toggles that landed while waiting count.
        let session = match self.sessions.lookup(session_id).await {
            Lookup::Live(session) => session,
            Lookup::Expired(_) => {
                drop(guard);
                return self.commit_on_expired(&user_id).await;
            }
            Lookup::Missing => return Err(OnboardingError::UnknownSession(session_id)),
        };

        let record = match self.fetch(&user_id).await {
            Ok(record) => record,
            Err(OnboardingError::UserNotFound(_)) => {
                self.abort(&user_id).await;
                return Ok(CommitOutcome {
                    kind: CommitKind::Aborted,
                    plan: None,
                    reply: self.not_present_reply(""),
                });
            }
            Err(e) => return Err(e),
        };

        let from = self.phase_of(&record);
        if !from.can_transition_to(OnboardingPhase::Committed) {
            warn!(
                user_id = %user_id,
                session_id = %session_id,
                from = %from,
                "Commit refused for member who never started onboarding"
            );
            self.sessions.mark_committed(session_id).await;
            return Ok(CommitOutcome {
                kind: CommitKind::Refused,
                plan: None,
                reply: InteractionReply::Ephemeral {
                    content: self.text(&self.config.messages.unchanged, &record.display_name),
                    surface: None,
                },
            });
        }
        let snapshot = MembershipSnapshot::from_record(record, &self.config.marker_group);

        let plan = self.plan_for(&session, &snapshot);
        if !plan.is_empty() {
            self.apply_diff(&user_id, &plan.to_add, &plan.to_remove, REASON_SELECTION)
                .await?;
        }
        if plan.is_first_time {
            let marker = BTreeSet::from([self.config.marker_group.clone()]);
            self.apply_diff(&user_id, &BTreeSet::new(), &marker, REASON_FINISHED)
                .await?;
        }
        self.sessions.mark_committed(session_id).await;

        let messages = &self.config.messages;
        let (kind, template) = if plan.is_first_time {
            (CommitKind::Activated, &messages.activated)
        } else if plan.is_empty() {
            (CommitKind::Unchanged, &messages.unchanged)
        } else {
            (CommitKind::Updated, &messages.updated)
        };
        info!(
            user_id = %user_id,
            session_id = %session_id,
            kind = ?kind,
            added = plan.to_add.len(),
            removed = plan.to_remove.len(),
            "Selection committed"
        );

        Ok(CommitOutcome {
            kind,
            reply: InteractionReply::Ephemeral {
                content: self.text(template, &snapshot.display_name),
                surface: None,
            },
            plan: Some(plan),
        })
    }

    /// Dispatch a control interaction.
    pub async fn on_interaction(
        &self,
        session_id: SessionId,
        control: &Control,
    ) -> Result<InteractionOutcome> {
        match control {
            Control::Selectable(option_id) => self
                .on_toggle(session_id, option_id)
                .await
                .map(InteractionOutcome::Toggle),
            Control::Commit => self.on_commit(session_id).await.map(InteractionOutcome::Commit),
        }
    }

    /// Purge the onboarding channel and post the entry-point button to it.
    /// Returns false when no onboarding channel is configured.
    pub async fn publish_entry_point(&self) -> std::result::Result<bool, PlatformError> {
        let Some(channel) = self.config.onboarding_channel.clone() else {
            return Ok(false);
        };
        if let Err(e) = self.platform.clear_channel(&channel).await {
            warn!(channel = %channel, error = %e, "Failed to clear onboarding channel");
        }
        let message = OutgoingMessage::text(self.text(&self.config.messages.entry_point, ""))
            .with_surface(Surface::EntryPoint {
                label: self.config.entry_label.clone(),
            });
        self.platform
            .send_message(&Recipient::Channel(channel.clone()), message)
            .await?;
        info!(channel = %channel, "Published onboarding entry point");
        Ok(true)
    }

    // ── Transitions (caller holds the member's lock) ────────────────

    /// JoinedPending → Presented (with `welcome`) or Presented → Presented.
    pub(super) async fn present_locked(
        &self,
        record: &MemberRecord,
        welcome: bool,
    ) -> Result<SessionId> {
        let user_id = &record.user_id;
        let from = self.phase_of(record);
        if !from.can_transition_to(OnboardingPhase::Presented) {
            warn!(user_id = %user_id, from = %from, "Refusing to present a prompt");
            return Err(OnboardingError::InvalidTransition {
                user_id: user_id.clone(),
                from,
                to: OnboardingPhase::Presented,
            });
        }

        if welcome {
            self.grant_marker_locked(record).await?;
            let welcome_text = self.text(&self.config.messages.welcome, &record.display_name);
            if let Err(e) = self.send_to(user_id, OutgoingMessage::text(welcome_text)).await {
                warn!(user_id = %user_id, error = %e, "Failed to deliver welcome message");
            }
        }

        let session_id = self.send_prompt_locked(record).await?;
        info!(
            user_id = %user_id,
            session_id = %session_id,
            from = %from,
            to = %OnboardingPhase::Presented,
            "Selection prompt presented"
        );
        Ok(session_id)
    }

    /// Open a session and DM its prompt. The session is dropped again when
    /// the prompt cannot be delivered.
    async fn send_prompt_locked(&self, record: &MemberRecord) -> Result<SessionId> {
        let user_id = &record.user_id;
        let session = SelectionSession::new(
            user_id.clone(),
            &self.config.catalog,
            self.config.session_ttl,
        );
        let session_id = session.id;
        let prompt = OutgoingMessage::text(self.text(&self.config.messages.prompt, &record.display_name))
            .with_surface(session.surface(&self.config.commit_label));
        self.sessions.insert(session).await;

        if let Err(e) = self.send_to(user_id, prompt).await {
            self.sessions.remove(session_id).await;
            return Err(e);
        }
        Ok(session_id)
    }

    /// Grant the marker unless the member already holds it.
    async fn grant_marker_locked(&self, record: &MemberRecord) -> Result<()> {
        if record.groups.contains(&self.config.marker_group) {
            return Ok(());
        }
        let marker = BTreeSet::from([self.config.marker_group.clone()]);
        self.apply_diff(&record.user_id, &marker, &BTreeSet::new(), REASON_STARTED)
            .await
    }

    // ── Helpers ─────────────────────────────────────────────────────

    pub(super) fn phase_of(&self, record: &MemberRecord) -> OnboardingPhase {
        OnboardingPhase::classify(
            record,
            &self.config.marker_group,
            &self.config.governed_groups(),
        )
    }

    fn plan_for(&self, session: &SelectionSession, snapshot: &MembershipSnapshot) -> ReconciliationPlan {
        // Defaults are only governed on the first commit, so later updates
        // never revoke them.
        let mut all_controlled = self.config.catalog.group_ids();
        if snapshot.has_marker_group {
            all_controlled.extend(self.config.default_groups.iter().cloned());
        }
        compute_plan(DiffInput {
            selected: &session.selected_options(),
            all_controlled: &all_controlled,
            actual: &snapshot.actual_groups,
            defaults: &self.config.default_groups,
            has_marker: snapshot.has_marker_group,
        })
    }

    /// Re-present after an interaction on an expired prompt. The flag is false
    /// when the member has left.
    async fn represent_after_expiry(&self, user_id: &UserId) -> Result<(InteractionReply, bool)> {
        let _guard = self.locks.acquire(user_id).await;
        let record = match self.fetch(user_id).await {
            Ok(record) => record,
            Err(OnboardingError::UserNotFound(_)) => {
                self.abort(user_id).await;
                return Ok((self.not_present_reply(""), false));
            }
            Err(e) => return Err(e),
        };
        // Finished members get a fresh update prompt without re-entering
        // onboarding.
        if self.phase_of(&record) == OnboardingPhase::Committed {
            let session_id = self.send_prompt_locked(&record).await?;
            debug!(user_id = %user_id, session_id = %session_id, "Re-sent update prompt");
        } else {
            self.present_locked(&record, false).await?;
        }
        let reply = InteractionReply::Notice {
            content: self.text(&self.config.messages.expired, &record.display_name),
        };
        Ok((reply, true))
    }

    async fn commit_on_expired(&self, user_id: &UserId) -> Result<CommitOutcome> {
        let (reply, present) = self.represent_after_expiry(user_id).await?;
        Ok(CommitOutcome {
            kind: if present {
                CommitKind::Represented
            } else {
                CommitKind::Aborted
            },
            plan: None,
            reply,
        })
    }

    /// Any phase → Aborted: forget the member's sessions, touch no groups.
    async fn abort(&self, user_id: &UserId) {
        let dropped = self.sessions.remove_user(user_id).await;
        info!(
            user_id = %user_id,
            sessions_dropped = dropped,
            to = %OnboardingPhase::Aborted,
            "Member is no longer present"
        );
    }

    fn not_present_reply(&self, name: &str) -> InteractionReply {
        InteractionReply::Notice {
            content: self.text(&self.config.messages.not_present, name),
        }
    }

    fn text(&self, template: &str, name: &str) -> String {
        render(
            template,
            &TemplateVars {
                name,
                community: &self.config.community_name,
                start_channel: &self.config.start_channel,
            },
        )
    }

    pub(super) async fn fetch(&self, user_id: &UserId) -> Result<MemberRecord> {
        self.call("fetch_membership", user_id, self.platform.fetch_membership(user_id))
            .await
    }

    async fn send_to(&self, user_id: &UserId, message: OutgoingMessage) -> Result<()> {
        let recipient = Recipient::User(user_id.clone());
        self.call("send_message", user_id, self.platform.send_message(&recipient, message))
            .await
    }

    /// Apply a group change, retrying once on failure. Partial application is
    /// left for the next sweep.
    async fn apply_diff(
        &self,
        user_id: &UserId,
        to_add: &BTreeSet<GroupId>,
        to_remove: &BTreeSet<GroupId>,
        reason: &str,
    ) -> Result<()> {
        let mut retried = false;
        loop {
            let result = self
                .call(
                    "apply_membership_diff",
                    user_id,
                    self.platform
                        .apply_membership_diff(user_id, to_add, to_remove, reason),
                )
                .await;
            match result {
                Err(OnboardingError::Apply { reason: cause, .. }) if !retried => {
                    warn!(user_id = %user_id, error = %cause, "Group change failed, retrying once");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    /// Run a platform call under the configured timeout.
    async fn call<T, F>(&self, operation: &'static str, user_id: &UserId, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, PlatformError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result.map_err(|e| OnboardingError::from_platform(user_id, e)),
            Err(_) => Err(OnboardingError::Timeout {
                operation,
                user_id: user_id.clone(),
                timeout: self.config.call_timeout,
            }),
        }
    }
}

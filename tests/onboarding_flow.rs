//! End-to-end tests of the onboarding flow against the in-memory platform.
//!
//! Each test builds an `Onboarding` over a `MemoryPlatform`, drives it through
//! the public event API and checks the resulting group state and messages.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::time::timeout;

use role_gate::config::OnboardingConfig;
use role_gate::error::OnboardingError;
use role_gate::onboarding::{
    ChannelId, CommitKind, Control, GateOutcome, GroupId, GroupOption, InteractionOutcome, InteractionReply,
    MemberRecord, Onboarding, OptionCatalog, SessionId, Surface, UserId,
};
use role_gate::platform::MemoryPlatform;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const MARKER: &str = "marker";
const DEFAULT: &str = "member";

fn ids(list: &[&str]) -> BTreeSet<GroupId> {
    list.iter().map(|g| GroupId::from(*g)).collect()
}

fn config() -> OnboardingConfig {
    let catalog = OptionCatalog::from_options(vec![
        GroupOption::new("First semester", "sem1"),
        GroupOption::new("Higher semester", "sem2"),
        GroupOption::new("Graduate", "grad"),
        GroupOption::new("Master", "master"),
    ])
    .unwrap();
    let mut config = OnboardingConfig::new(catalog, GroupId::from(MARKER), ids(&[DEFAULT]));
    config.not_before = Utc.with_ymd_and_hms(2021, 8, 25, 0, 0, 0).unwrap();
    config.community_name = "CS Students".into();
    config
}

fn service(config: OnboardingConfig, platform: &Arc<MemoryPlatform>) -> Onboarding {
    Onboarding::new(Arc::new(config), Arc::clone(platform) as _)
}

fn recent_joiner(id: &str) -> MemberRecord {
    MemberRecord::new(id, format!("user {id}"))
        .with_joined_at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
}

async fn present(onboarding: &Onboarding, user: &str) -> SessionId {
    match onboarding.on_gate_cleared(&UserId::from(user)).await.unwrap() {
        GateOutcome::Presented { session_id } | GateOutcome::Represented { session_id } => session_id,
        other => panic!("expected a presented prompt, got {other:?}"),
    }
}

fn selected(list: &[&str]) -> Vec<Control> {
    list.iter()
        .map(|g| Control::Selectable(GroupId::from(*g)))
        .collect()
}

async fn toggle_all(onboarding: &Onboarding, session_id: SessionId, controls: &[Control]) {
    for control in controls {
        onboarding.on_interaction(session_id, control).await.unwrap();
    }
}

// ── Gate ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn gate_cleared_grants_marker_and_sends_prompt() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let user = UserId::from("u1");

    let session_id = present(&onboarding, "u1").await;

    assert_eq!(platform.groups_of(&user), ids(&[MARKER]));
    let sent = platform.sent_to(&user);
    assert_eq!(sent.len(), 2, "welcome + prompt");
    assert!(sent[0].content.contains("CS Students"));
    assert!(sent[0].surface.is_none());
    match &sent[1].surface {
        Some(Surface::Selection { session_id: id, controls }) => {
            assert_eq!(*id, session_id);
            assert_eq!(controls.len(), 5);
            assert_eq!(controls.last().unwrap().control, Control::Commit);
        }
        other => panic!("expected a selection surface, got {other:?}"),
    }
}

#[tokio::test]
async fn gate_cleared_twice_only_represents() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);

    present(&onboarding, "u1").await;
    let outcome = onboarding.on_gate_cleared(&UserId::from("u1")).await.unwrap();

    assert!(matches!(outcome, GateOutcome::Represented { .. }));
    // One marker grant, and no second welcome.
    assert_eq!(platform.applied().len(), 1);
    assert_eq!(platform.sent_to(&UserId::from("u1")).len(), 3);
}

#[tokio::test]
async fn gate_cleared_leaves_committed_member_alone() {
    let platform = Arc::new(MemoryPlatform::with_members([
        recent_joiner("u1").with_groups([DEFAULT, "sem1"]),
    ]));
    let onboarding = service(config(), &platform);

    let outcome = onboarding.on_gate_cleared(&UserId::from("u1")).await.unwrap();

    assert_eq!(outcome, GateOutcome::AlreadyCommitted);
    assert!(platform.applied().is_empty());
    assert!(platform.sent().is_empty());
}

#[tokio::test]
async fn member_update_fires_only_on_gate_edge() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let pending = recent_joiner("u1").with_pending(true);
    let cleared = recent_joiner("u1");

    let renamed = onboarding.on_member_update(&pending, &pending).await.unwrap();
    assert!(renamed.is_none());

    let outcome = onboarding.on_member_update(&pending, &cleared).await.unwrap();
    assert!(matches!(outcome, Some(GateOutcome::Presented { .. })));
}

#[tokio::test]
async fn undelivered_prompt_is_discarded() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    platform.fail_send_for("u1");
    let onboarding = service(config(), &platform);

    let err = onboarding.on_gate_cleared(&UserId::from("u1")).await.unwrap_err();

    assert!(matches!(err, OnboardingError::Delivery { .. }));
    // The marker was granted and the undelivered session discarded.
    assert!(platform.groups_of(&UserId::from("u1")).contains(&GroupId::from(MARKER)));
    assert!(onboarding.sessions().is_empty().await);
}

// ── Commit ────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_commit_grants_selection_and_defaults_and_strips_marker() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let session_id = present(&onboarding, "u1").await;
    toggle_all(&onboarding, session_id, &selected(&["sem1", "grad"])).await;

    let outcome = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(outcome.kind, CommitKind::Activated);
    let plan = outcome.plan.unwrap();
    assert!(plan.is_first_time);
    assert_eq!(plan.to_add, ids(&["sem1", "grad", DEFAULT]));
    assert!(plan.to_remove.is_empty());
    assert_eq!(
        platform.groups_of(&UserId::from("u1")),
        ids(&["sem1", "grad", DEFAULT])
    );
    assert!(matches!(outcome.reply, InteractionReply::Ephemeral { .. }));
}

#[tokio::test]
async fn duplicate_commit_yields_empty_plan() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let session_id = present(&onboarding, "u1").await;
    toggle_all(&onboarding, session_id, &selected(&["sem2"])).await;

    onboarding.on_commit(session_id).await.unwrap();
    let applied_before = platform.applied().len();
    let second = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(second.kind, CommitKind::Unchanged);
    assert!(second.plan.unwrap().is_empty());
    assert_eq!(platform.applied().len(), applied_before);
}

#[tokio::test]
async fn later_commit_updates_only_catalog_groups() {
    let platform = Arc::new(MemoryPlatform::with_members([
        recent_joiner("u1").with_groups([DEFAULT, "sem1", "moderator"]),
    ]));
    let onboarding = service(config(), &platform);
    let user = UserId::from("u1");

    let reply = onboarding.on_entry_point(&user).await.unwrap();
    let session_id = match reply {
        InteractionReply::Ephemeral {
            surface: Some(Surface::Selection { session_id, .. }),
            ..
        } => session_id,
        other => panic!("expected an ephemeral prompt, got {other:?}"),
    };
    toggle_all(&onboarding, session_id, &selected(&["master"])).await;

    let outcome = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(outcome.kind, CommitKind::Updated);
    let plan = outcome.plan.unwrap();
    assert!(!plan.is_first_time);
    assert_eq!(plan.to_add, ids(&["master"]));
    assert_eq!(plan.to_remove, ids(&["sem1"]));
    // Defaults and foreign groups survive updates.
    assert_eq!(platform.groups_of(&user), ids(&[DEFAULT, "master", "moderator"]));
}

#[tokio::test]
async fn commit_after_member_left_aborts_without_changes() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let session_id = present(&onboarding, "u1").await;
    toggle_all(&onboarding, session_id, &selected(&["sem1"])).await;
    platform.remove(&UserId::from("u1"));
    let applied_before = platform.applied().len();

    let outcome = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(outcome.kind, CommitKind::Aborted);
    assert!(outcome.plan.is_none());
    assert!(matches!(outcome.reply, InteractionReply::Notice { .. }));
    assert_eq!(platform.applied().len(), applied_before);
    assert!(onboarding.sessions().is_empty().await);
}

#[tokio::test]
async fn concurrent_commits_apply_once() {
    timeout(TEST_TIMEOUT, async {
        let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
        platform.set_apply_delay(Duration::from_millis(20));
        let onboarding = Arc::new(service(config(), &platform));
        let session_id = present(&onboarding, "u1").await;
        toggle_all(&onboarding, session_id, &selected(&["grad"])).await;
        let applied_before = platform.applied().len();

        let a = tokio::spawn({
            let onboarding = Arc::clone(&onboarding);
            async move { onboarding.on_commit(session_id).await }
        });
        let b = tokio::spawn({
            let onboarding = Arc::clone(&onboarding);
            async move { onboarding.on_commit(session_id).await }
        });
        let mut kinds = vec![a.await.unwrap().unwrap().kind, b.await.unwrap().unwrap().kind];
        kinds.sort_by_key(|k| *k == CommitKind::Unchanged);

        assert_eq!(kinds, vec![CommitKind::Activated, CommitKind::Unchanged]);
        // Selection grant + marker removal, exactly once.
        assert_eq!(platform.applied().len() - applied_before, 2);
        assert_eq!(platform.groups_of(&UserId::from("u1")), ids(&["grad", DEFAULT]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn apply_failure_is_retried_once() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    platform.fail_apply_for("u1");
    let onboarding = service(config(), &platform);

    let err = onboarding.on_gate_cleared(&UserId::from("u1")).await.unwrap_err();

    assert!(matches!(err, OnboardingError::Apply { .. }));
    assert!(platform.applied().is_empty());
    assert!(platform.sent().is_empty());
}

// ── Toggle & sessions ─────────────────────────────────────────────────

#[tokio::test]
async fn toggle_flips_and_unknown_option_is_rejected() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let session_id = present(&onboarding, "u1").await;

    let on = onboarding.on_toggle(session_id, &GroupId::from("sem1")).await.unwrap();
    assert_eq!(on.selected, Some(true));
    match on.reply {
        InteractionReply::Refresh {
            surface: Surface::Selection { controls, .. },
        } => assert!(controls[0].label.ends_with('\u{2705}')),
        other => panic!("expected a refresh, got {other:?}"),
    }
    let off = onboarding.on_toggle(session_id, &GroupId::from("sem1")).await.unwrap();
    assert_eq!(off.selected, Some(false));

    let err = onboarding
        .on_toggle(session_id, &GroupId::from(MARKER))
        .await
        .unwrap_err();
    assert!(matches!(err, OnboardingError::UnknownOption { .. }));
    let session = onboarding.session(session_id).await.unwrap();
    assert!(session.selected_options().is_empty());
}

#[tokio::test]
async fn unknown_session_is_an_error() {
    let onboarding = service(config(), &Arc::new(MemoryPlatform::new()));
    let err = onboarding.on_commit(SessionId::new()).await.unwrap_err();
    assert!(matches!(err, OnboardingError::UnknownSession(_)));
}

#[tokio::test]
async fn expired_session_is_represented() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let mut config = config();
    config.session_ttl = Duration::ZERO;
    let onboarding = service(config, &platform);
    let user = UserId::from("u1");
    let session_id = present(&onboarding, "u1").await;
    let sent_before = platform.sent_to(&user).len();

    let outcome = onboarding
        .on_interaction(session_id, &Control::Commit)
        .await
        .unwrap();

    match outcome {
        InteractionOutcome::Commit(commit) => {
            assert_eq!(commit.kind, CommitKind::Represented);
            assert!(commit.plan.is_none());
        }
        other => panic!("expected a commit outcome, got {other:?}"),
    }
    // A fresh prompt went out and the marker is still in place.
    assert_eq!(platform.sent_to(&user).len(), sent_before + 1);
    assert!(platform.groups_of(&user).contains(&GroupId::from(MARKER)));
    assert!(matches!(
        onboarding.session(session_id).await,
        Err(OnboardingError::UnknownSession(_))
    ));
}

// ── Entry point ───────────────────────────────────────────────────────

#[tokio::test]
async fn entry_point_is_published_to_onboarding_channel() {
    let platform = Arc::new(MemoryPlatform::new());
    let mut config = config();
    assert!(!service(config.clone(), &platform).publish_entry_point().await.unwrap());

    assert!(platform.cleared().is_empty());

    config.onboarding_channel = Some("welcome".into());
    let onboarding = service(config, &platform);
    assert!(onboarding.publish_entry_point().await.unwrap());
    // A restart purges the old button before posting a new one.
    assert!(onboarding.publish_entry_point().await.unwrap());

    let channel = ChannelId::from("welcome");
    assert_eq!(platform.cleared(), vec![channel.clone(), channel.clone()]);
    let sent = platform.sent_to_channel(&channel);
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        sent[0].surface,
        Some(Surface::EntryPoint { ref label }) if label == "Unlock"
    ));
}

fn entry_session(reply: InteractionReply) -> SessionId {
    match reply {
        InteractionReply::Ephemeral {
            surface: Some(Surface::Selection { session_id, .. }),
            ..
        } => session_id,
        other => panic!("expected an ephemeral prompt, got {other:?}"),
    }
}

#[tokio::test]
async fn entry_point_starts_onboarding_for_member_without_marker() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    let user = UserId::from("u1");

    let session_id = entry_session(onboarding.on_entry_point(&user).await.unwrap());
    assert_eq!(platform.groups_of(&user), ids(&[MARKER]));
    assert_eq!(platform.applied()[0].reason, "Onboarding started");

    toggle_all(&onboarding, session_id, &selected(&["sem1"])).await;
    let outcome = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(outcome.kind, CommitKind::Activated);
    assert!(outcome.plan.unwrap().is_first_time);
    assert_eq!(platform.groups_of(&user), ids(&[DEFAULT, "sem1"]));
    let report = onboarding.run_sweep().await;
    assert_eq!(report.granted, 0);
    assert_eq!(report.represented, 0);
}

#[tokio::test]
async fn commit_without_started_onboarding_is_refused() {
    // Still behind the gate, so the entry point grants nothing.
    let platform = Arc::new(MemoryPlatform::with_members([
        recent_joiner("u1").with_pending(true),
    ]));
    let onboarding = service(config(), &platform);
    let user = UserId::from("u1");

    let session_id = entry_session(onboarding.on_entry_point(&user).await.unwrap());
    toggle_all(&onboarding, session_id, &selected(&["sem1"])).await;
    let outcome = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(outcome.kind, CommitKind::Refused);
    assert!(outcome.plan.is_none());
    assert!(platform.applied().is_empty());
    assert!(platform.groups_of(&user).is_empty());
}

#[tokio::test]
async fn expired_update_prompt_is_resent_to_finished_member() {
    let platform = Arc::new(MemoryPlatform::with_members([
        recent_joiner("u1").with_groups([DEFAULT, "sem1"]),
    ]));
    let mut config = config();
    config.session_ttl = Duration::ZERO;
    let onboarding = service(config, &platform);
    let user = UserId::from("u1");

    let session_id = entry_session(onboarding.on_entry_point(&user).await.unwrap());
    let outcome = onboarding.on_commit(session_id).await.unwrap();

    assert_eq!(outcome.kind, CommitKind::Represented);
    assert_eq!(platform.sent_to(&user).len(), 1);
    // No marker: the member stays finished.
    assert!(platform.applied().is_empty());
    assert_eq!(platform.groups_of(&user), ids(&[DEFAULT, "sem1"]));
}

// ── Sweep ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_repairs_missed_grants_in_isolation() {
    timeout(TEST_TIMEOUT, async {
        let members = (0..100).map(|i| recent_joiner(&format!("u{i:03}")));
        let platform = Arc::new(MemoryPlatform::with_members(members));
        platform.fail_apply_for("u042");
        let onboarding = service(config(), &platform);

        let report = onboarding.run_sweep().await;

        assert_eq!(report.scanned, 100);
        assert_eq!(report.granted, 99);
        assert_eq!(report.failed, 1);
        assert!(!report.deadline_reached);
        assert!(!platform.groups_of(&UserId::from("u042")).contains(&GroupId::from(MARKER)));
        assert!(platform.groups_of(&UserId::from("u043")).contains(&GroupId::from(MARKER)));

        // The failed member is picked up again once the platform recovers.
        platform.clear_failures();
        let report = onboarding.run_sweep().await;
        assert_eq!(report.granted, 1);
        assert_eq!(report.represented, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sweep_skips_pending_old_and_committed_members() {
    let platform = Arc::new(MemoryPlatform::with_members([
        recent_joiner("pending").with_pending(true),
        MemberRecord::new("old", "Old Timer")
            .with_joined_at(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
        MemberRecord::new("unknown", "No Join Date"),
        recent_joiner("done").with_groups([DEFAULT, "sem2"]),
    ]));
    let onboarding = service(config(), &platform);

    let report = onboarding.run_sweep().await;

    assert_eq!(report.scanned, 4);
    assert_eq!(report.granted, 0);
    assert_eq!(report.represented, 0);
    assert!(platform.applied().is_empty());
    assert!(platform.sent().is_empty());
}

#[tokio::test]
async fn sweep_represents_expired_prompts() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let mut config = config();
    config.session_ttl = Duration::ZERO;
    let onboarding = service(config, &platform);
    present(&onboarding, "u1").await;
    let user = UserId::from("u1");
    let sent_before = platform.sent_to(&user).len();

    let report = onboarding.run_sweep().await;

    assert_eq!(report.sessions_expired, 1);
    assert_eq!(report.represented, 1);
    assert_eq!(platform.sent_to(&user).len(), sent_before + 1);
}

#[tokio::test]
async fn sweep_leaves_live_prompts_alone() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let onboarding = service(config(), &platform);
    present(&onboarding, "u1").await;
    let sent_before = platform.sent().len();

    let report = onboarding.run_sweep().await;

    assert_eq!(report.represented, 0);
    assert_eq!(platform.sent().len(), sent_before);
}

#[tokio::test]
async fn sweep_stops_at_deadline() {
    let platform = Arc::new(MemoryPlatform::with_members([recent_joiner("u1")]));
    let mut config = config();
    config.sweep_deadline = Some(Duration::ZERO);
    let onboarding = service(config, &platform);

    let report = onboarding.run_sweep().await;

    assert!(report.deadline_reached);
    assert_eq!(report.scanned, 0);
}

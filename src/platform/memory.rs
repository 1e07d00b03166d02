//! In-process platform: holds members in memory and records every call.
//! Used by the test suite and for local dry runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use super::{MemberStream, Platform};
use crate::error::PlatformError;
use crate::onboarding::model::{ChannelId, GroupId, MemberRecord, OutgoingMessage, Recipient, UserId};

/// A recorded `apply_membership_diff` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDiff {
    pub user_id: UserId,
    pub to_add: BTreeSet<GroupId>,
    pub to_remove: BTreeSet<GroupId>,
    pub reason: String,
}

#[derive(Default)]
struct State {
    members: BTreeMap<UserId, MemberRecord>,
    sent: Vec<(Recipient, OutgoingMessage)>,
    applied: Vec<AppliedDiff>,
    cleared: Vec<ChannelId>,
    failing_apply: HashSet<UserId>,
    failing_send: HashSet<UserId>,
    apply_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I>(members: I) -> Self
    where
        I: IntoIterator<Item = MemberRecord>,
    {
        let platform = Self::new();
        for member in members {
            platform.upsert(member);
        }
        platform
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upsert(&self, member: MemberRecord) {
        self.state().members.insert(member.user_id.clone(), member);
    }

    pub fn remove(&self, user_id: &UserId) -> Option<MemberRecord> {
        self.state().members.remove(user_id)
    }

    pub fn member(&self, user_id: &UserId) -> Option<MemberRecord> {
        self.state().members.get(user_id).cloned()
    }

    pub fn groups_of(&self, user_id: &UserId) -> BTreeSet<GroupId> {
        self.member(user_id).map(|m| m.groups).unwrap_or_default()
    }

    /// Make every group change for `user_id` fail without touching their groups.
    pub fn fail_apply_for(&self, user_id: impl Into<UserId>) {
        self.state().failing_apply.insert(user_id.into());
    }

    pub fn fail_send_for(&self, user_id: impl Into<UserId>) {
        self.state().failing_send.insert(user_id.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_apply.clear();
        state.failing_send.clear();
    }

    /// Delay every group change, widening the fetch → apply window.
    pub fn set_apply_delay(&self, delay: Duration) {
        self.state().apply_delay = Some(delay);
    }

    pub fn sent(&self) -> Vec<(Recipient, OutgoingMessage)> {
        self.state().sent.clone()
    }

    pub fn sent_to(&self, user_id: &UserId) -> Vec<OutgoingMessage> {
        self.state()
            .sent
            .iter()
            .filter(|(r, _)| matches!(r, Recipient::User(id) if id == user_id))
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn sent_to_channel(&self, channel: &ChannelId) -> Vec<OutgoingMessage> {
        self.state()
            .sent
            .iter()
            .filter(|(r, _)| matches!(r, Recipient::Channel(id) if id == channel))
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn applied(&self) -> Vec<AppliedDiff> {
        self.state().applied.clone()
    }

    /// Channels purged so far, in call order.
    pub fn cleared(&self) -> Vec<ChannelId> {
        self.state().cleared.clone()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_membership(&self, user_id: &UserId) -> Result<MemberRecord, PlatformError> {
        self.member(user_id)
            .ok_or_else(|| PlatformError::UserNotFound(user_id.clone()))
    }

    async fn apply_membership_diff(
        &self,
        user_id: &UserId,
        to_add: &BTreeSet<GroupId>,
        to_remove: &BTreeSet<GroupId>,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let delay = self.state().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.failing_apply.contains(user_id) {
            return Err(PlatformError::Apply {
                user_id: user_id.clone(),
                reason: "injected failure".into(),
            });
        }
        let member = state
            .members
            .get_mut(user_id)
            .ok_or_else(|| PlatformError::UserNotFound(user_id.clone()))?;
        member.groups.retain(|g| !to_remove.contains(g));
        member.groups.extend(to_add.iter().cloned());
        state.applied.push(AppliedDiff {
            user_id: user_id.clone(),
            to_add: to_add.clone(),
            to_remove: to_remove.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn send_message(
        &self,
        recipient: &Recipient,
        message: OutgoingMessage,
    ) -> Result<(), PlatformError> {
        let mut state = self.state();
        if let Recipient::User(id) = recipient
            && state.failing_send.contains(id)
        {
            return Err(PlatformError::Send(format!("cannot message {id}")));
        }
        state.sent.push((recipient.clone(), message));
        Ok(())
    }

    async fn clear_channel(&self, channel: &ChannelId) -> Result<(), PlatformError> {
        let mut state = self.state();
        state
            .sent
            .retain(|(r, _)| !matches!(r, Recipient::Channel(id) if id == channel));
        state.cleared.push(channel.clone());
        Ok(())
    }

    fn list_members(&self) -> MemberStream<'_> {
        let members: Vec<_> = self.state().members.values().cloned().map(Ok).collect();
        Box::pin(stream::iter(members))
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn ids(list: &[&str]) -> BTreeSet<GroupId> {
        list.iter().map(|g| GroupId::from(*g)).collect()
    }

    #[tokio::test]
    async fn apply_changes_groups_and_records_call() {
        let platform = MemoryPlatform::with_members([MemberRecord::new("u1", "Alice").with_groups(["x", "a"])]);
        let user = UserId::from("u1");
        platform
            .apply_membership_diff(&user, &ids(&["b"]), &ids(&["a"]), "test")
            .await
            .unwrap();
        assert_eq!(platform.groups_of(&user), ids(&["b", "x"]));
        assert_eq!(platform.applied().len(), 1);
        assert_eq!(platform.applied()[0].reason, "test");
    }

    #[tokio::test]
    async fn injected_failure_leaves_groups() {
        let platform = MemoryPlatform::with_members([MemberRecord::new("u1", "Alice")]);
        platform.fail_apply_for("u1");
        let user = UserId::from("u1");
        let err = platform
            .apply_membership_diff(&user, &ids(&["a"]), &ids(&[]), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Apply { .. }));
        assert!(platform.groups_of(&user).is_empty());
    }

    #[tokio::test]
    async fn unknown_user_not_found() {
        let platform = MemoryPlatform::new();
        let err = platform.fetch_membership(&UserId::from("ghost")).await.unwrap_err();
        assert!(matches!(err, PlatformError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn clear_channel_drops_only_that_channel() {
        let platform = MemoryPlatform::new();
        let lobby = ChannelId::from("lobby");
        platform
            .send_message(&Recipient::Channel(lobby.clone()), OutgoingMessage::text("old"))
            .await
            .unwrap();
        platform
            .send_message(&Recipient::User(UserId::from("u1")), OutgoingMessage::text("dm"))
            .await
            .unwrap();

        platform.clear_channel(&lobby).await.unwrap();

        assert!(platform.sent_to_channel(&lobby).is_empty());
        assert_eq!(platform.sent_to(&UserId::from("u1")).len(), 1);
        assert_eq!(platform.cleared(), vec![lobby]);
    }

    #[tokio::test]
    async fn list_members_is_restartable() {
        let platform = MemoryPlatform::with_members([
            MemberRecord::new("u1", "Alice"),
            MemberRecord::new("u2", "Bob"),
        ]);
        let first: Vec<_> = platform.list_members().try_collect().await.unwrap();
        let second: Vec<_> = platform.list_members().try_collect().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }
}

//! Platform abstraction: the calls the onboarding core makes into the chat
//! platform. The adapter owning the real-time connection implements these.

pub mod http;
pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::PlatformError;
use crate::onboarding::model::{ChannelId, GroupId, MemberRecord, OutgoingMessage, Recipient, UserId};

pub use http::HttpPlatform;
pub use memory::MemoryPlatform;

/// Lazy, finite sequence of members. A fresh stream is requested per sweep.
pub type MemberStream<'a> = BoxStream<'a, Result<MemberRecord, PlatformError>>;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Read a member's current groups. Fails with `UserNotFound` if they left.
    async fn fetch_membership(&self, user_id: &UserId) -> Result<MemberRecord, PlatformError>;

    /// Add and remove groups in one logical step. May be partially applied
    /// when it fails.
    async fn apply_membership_diff(
        &self,
        user_id: &UserId,
        to_add: &BTreeSet<GroupId>,
        to_remove: &BTreeSet<GroupId>,
        reason: &str,
    ) -> Result<(), PlatformError>;

    /// Deliver a message, optionally carrying an interactive surface.
    async fn send_message(
        &self,
        recipient: &Recipient,
        message: OutgoingMessage,
    ) -> Result<(), PlatformError>;

    /// Delete every message in a channel.
    async fn clear_channel(&self, channel: &ChannelId) -> Result<(), PlatformError>;

    /// Every member of the community.
    fn list_members(&self) -> MemberStream<'_>;
}

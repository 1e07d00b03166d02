//! HTTP platform: talks to the adapter process that owns the chat connection.
//!
//! The adapter exposes a small REST API:
//!
//! - `GET  /members/{user_id}` → `MemberRecord` (404 when the user left)
//! - `POST /members/{user_id}/groups` with `{ add, remove, reason }`
//! - `POST /messages` with `{ recipient, message }`
//! - `GET  /members?limit=N[&after=ID]` → `{ members, has_more }`
//! - `DELETE /channels/{channel_id}/messages` purges a channel
//!
//! Ids are percent-encoded as single path segments.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{MemberStream, Platform};
use crate::error::PlatformError;
use crate::onboarding::model::{ChannelId, GroupId, MemberRecord, OutgoingMessage, Recipient, UserId};

/// Members requested per listing page.
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Serialize)]
struct GroupChangeBody<'a> {
    add: &'a BTreeSet<GroupId>,
    remove: &'a BTreeSet<GroupId>,
    reason: &'a str,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    recipient: &'a Recipient,
    message: &'a OutgoingMessage,
}

/// One page of the member listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemberPage {
    pub members: Vec<MemberRecord>,
    #[serde(default)]
    pub has_more: bool,
}

/// Platform backed by the adapter's REST API.
pub struct HttpPlatform {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
    page_size: usize,
}

impl HttpPlatform {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `base_url/<collection>/<id>/<tail..>` with `id` as one encoded segment.
    fn resource_url(&self, collection: &str, id: &str, tail: &[&str]) -> Result<Url, PlatformError> {
        let mut url = Url::parse(&self.url(collection)).map_err(|e| PlatformError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| PlatformError::Http(format!("{} cannot be a base URL", self.base_url)))?
            .push(id)
            .extend(tail);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn fetch_page(&self, after: Option<&UserId>) -> Result<MemberPage, PlatformError> {
        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let resp = self
            .authorize(self.client.get(self.url("/members")).query(&query))
            .send()
            .await
            .map_err(|e| PlatformError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::List(format!("{status}: {body}")));
        }
        resp.json::<MemberPage>()
            .await
            .map_err(|e| PlatformError::List(e.to_string()))
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_membership(&self, user_id: &UserId) -> Result<MemberRecord, PlatformError> {
        let url = self.resource_url("/members", user_id.as_str(), &[])?;
        let resp = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| PlatformError::Http(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(PlatformError::UserNotFound(user_id.clone())),
            status if status.is_success() => resp
                .json::<MemberRecord>()
                .await
                .map_err(|e| PlatformError::Http(e.to_string())),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(PlatformError::Http(format!("fetch {user_id} failed ({status}): {body}")))
            }
        }
    }

    async fn apply_membership_diff(
        &self,
        user_id: &UserId,
        to_add: &BTreeSet<GroupId>,
        to_remove: &BTreeSet<GroupId>,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let body = GroupChangeBody {
            add: to_add,
            remove: to_remove,
            reason,
        };
        let url = self.resource_url("/members", user_id.as_str(), &["groups"])?;
        let resp = self
            .authorize(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| PlatformError::Apply {
                user_id: user_id.clone(),
                reason: e.to_string(),
            })?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(PlatformError::UserNotFound(user_id.clone())),
            status if status.is_success() => Ok(()),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(PlatformError::Apply {
                    user_id: user_id.clone(),
                    reason: format!("{status}: {body}"),
                })
            }
        }
    }

    async fn send_message(
        &self,
        recipient: &Recipient,
        message: OutgoingMessage,
    ) -> Result<(), PlatformError> {
        let body = MessageBody {
            recipient,
            message: &message,
        };
        let resp = self
            .authorize(self.client.post(self.url("/messages")).json(&body))
            .send()
            .await
            .map_err(|e| PlatformError::Send(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::Send(format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn clear_channel(&self, channel: &ChannelId) -> Result<(), PlatformError> {
        let url = self.resource_url("/channels", channel.as_str(), &["messages"])?;
        let resp = self
            .authorize(self.client.delete(url))
            .send()
            .await
            .map_err(|e| PlatformError::Send(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::Send(format!("clear {channel} failed ({status}): {body}")));
        }
        Ok(())
    }

    fn list_members(&self) -> MemberStream<'_> {
        // Cursor is the last user id of the previous page; `None` once done.
        let pages = stream::try_unfold(Some(None::<UserId>), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok(None);
            };
            let page = self.fetch_page(after.as_ref()).await?;
            let next = match page.members.last() {
                Some(last) if page.has_more => Some(Some(last.user_id.clone())),
                _ => None,
            };
            Ok::<_, PlatformError>(Some((page.members, next)))
        });

        pages
            .map_ok(|members| stream::iter(members.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}

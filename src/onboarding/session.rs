//! Selection tracker: per-prompt toggle state, independent of rendering.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::catalog::{GroupOption, OptionCatalog};
use super::model::{Control, ControlStyle, ControlView, GroupId, SessionId, Surface, UserId};

/// Suffix appended to the label of a selected option.
const SELECTED_MARK: &str = " \u{2705}";

/// One option of a session and whether it is currently selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionEntry {
    pub option: GroupOption,
    pub selected: bool,
}

/// Toggle state of one presented prompt.
#[derive(Debug, Clone)]
pub struct SelectionSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub options: Vec<SelectionEntry>,
    /// True until the first commit of this session went through.
    pub commit_pending: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SelectionSession {
    /// Create a session mirroring the catalog, with nothing selected.
    pub fn new(user_id: UserId, catalog: &OptionCatalog, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            id: SessionId::new(),
            user_id,
            options: catalog
                .options()
                .iter()
                .map(|option| SelectionEntry {
                    option: option.clone(),
                    selected: false,
                })
                .collect(),
            commit_pending: true,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Flip exactly one option. Returns the new flag, or `None` (leaving the
    /// session untouched) if the option is not part of this session.
    pub fn toggle(&mut self, option_id: &GroupId) -> Option<bool> {
        let entry = self
            .options
            .iter_mut()
            .find(|e| &e.option.group_id == option_id)?;
        entry.selected = !entry.selected;
        Some(entry.selected)
    }

    pub fn selected_options(&self) -> BTreeSet<GroupId> {
        self.options
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.option.group_id.clone())
            .collect()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Controls as they should currently be drawn: options in catalog order,
    /// then the commit control.
    pub fn render(&self, commit_label: &str) -> Vec<ControlView> {
        self.options
            .iter()
            .map(|e| ControlView {
                control: Control::Selectable(e.option.group_id.clone()),
                label: if e.selected {
                    format!("{}{SELECTED_MARK}", e.option.label)
                } else {
                    e.option.label.clone()
                },
                style: if e.selected {
                    ControlStyle::Success
                } else {
                    ControlStyle::Secondary
                },
            })
            .chain(std::iter::once(ControlView {
                control: Control::Commit,
                label: commit_label.to_string(),
                style: ControlStyle::Danger,
            }))
            .collect()
    }

    pub fn surface(&self, commit_label: &str) -> Surface {
        Surface::Selection {
            session_id: self.id,
            controls: self.render(commit_label),
        }
    }
}

/// Result of looking up a session for an interaction.
#[derive(Debug, Clone)]
pub enum Lookup {
    Live(SelectionSession),
    /// The session exists but its surface has expired; it has been dropped.
    Expired(UserId),
    Missing,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SelectionSession>,
    latest: HashMap<UserId, SessionId>,
}

/// In-memory store of live sessions, with a per-user index of the most
/// recently presented one.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<Inner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session and make it the user's latest one.
    pub async fn insert(&self, session: SelectionSession) {
        let mut inner = self.inner.write().await;
        inner.latest.insert(session.user_id.clone(), session.id);
        inner.sessions.insert(session.id, session);
    }

    /// Fetch a session, dropping it if it has expired.
    pub async fn lookup(&self, id: SessionId) -> Lookup {
        let mut inner = self.inner.write().await;
        let user_id = match inner.sessions.get(&id) {
            None => return Lookup::Missing,
            Some(session) if !session.is_expired() => return Lookup::Live(session.clone()),
            Some(session) => session.user_id.clone(),
        };
        remove_locked(&mut inner, id);
        debug!(session_id = %id, user_id = %user_id, "Dropped expired session");
        Lookup::Expired(user_id)
    }

    /// Toggle one option of a live session and return the updated session.
    pub async fn toggle(
        &self,
        id: SessionId,
        option_id: &GroupId,
    ) -> Option<(SelectionSession, Option<bool>)> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(&id)?;
        let flag = session.toggle(option_id);
        Some((session.clone(), flag))
    }

    pub async fn mark_committed(&self, id: SessionId) {
        if let Some(session) = self.inner.write().await.sessions.get_mut(&id) {
            session.commit_pending = false;
        }
    }

    pub async fn remove(&self, id: SessionId) -> Option<SelectionSession> {
        let mut inner = self.inner.write().await;
        remove_locked(&mut inner, id)
    }

    /// Drop every session of a user.
    pub async fn remove_user(&self, user_id: &UserId) -> usize {
        let mut inner = self.inner.write().await;
        inner.latest.remove(user_id);
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| &s.user_id != user_id);
        before - inner.sessions.len()
    }

    /// The user's most recently presented session, if it is still live.
    pub async fn latest_for(&self, user_id: &UserId) -> Option<SelectionSession> {
        let inner = self.inner.read().await;
        let id = inner.latest.get(user_id)?;
        inner
            .sessions
            .get(id)
            .filter(|s| !s.is_expired())
            .cloned()
    }

    /// Drop every expired session. Returns the number dropped.
    pub async fn expire_old(&self) -> usize {
        let mut inner = self.inner.write().await;
        let expired: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|s| s.is_expired())
            .map(|s| s.id)
            .collect();
        for id in &expired {
            remove_locked(&mut inner, *id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired selection sessions");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }
}

fn remove_locked(inner: &mut Inner, id: SessionId) -> Option<SelectionSession> {
    let session = inner.sessions.remove(&id)?;
    if inner.latest.get(&session.user_id) == Some(&id) {
        inner.latest.remove(&session.user_id);
    }
    Some(session)
}

//! Error types for role-gate.

use std::time::Duration;

use crate::onboarding::model::{GroupId, SessionId, UserId};
use crate::onboarding::state::OnboardingPhase;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse option catalog {path}: {reason}")]
    CatalogParse { path: String, reason: String },

    #[error("Option catalog is empty")]
    EmptyCatalog,

    #[error("Duplicate group id in option catalog: {0}")]
    DuplicateOption(GroupId),

    #[error("Option with group id {0} has an empty label")]
    EmptyLabel(GroupId),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by a `Platform` implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Group change for {user_id} failed: {reason}")]
    Apply { user_id: UserId, reason: String },

    #[error("Message delivery failed: {0}")]
    Send(String),

    #[error("Member listing failed: {0}")]
    List(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Per-user errors raised by the onboarding state machine.
///
/// None of these are fatal: they are contained to the user whose operation
/// raised them.
#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("Option {option} is not part of session {session}")]
    UnknownOption { session: SessionId, option: GroupId },

    #[error("Session {0} not found")]
    UnknownSession(SessionId),

    #[error("User {0} is no longer present")]
    UserNotFound(UserId),

    #[error("Applying group changes for {user_id} failed: {reason}")]
    Apply { user_id: UserId, reason: String },

    #[error("Session {0} has expired")]
    ExpiredSession(SessionId),

    #[error("Message delivery to {user_id} failed: {reason}")]
    Delivery { user_id: UserId, reason: String },

    #[error("Platform call {operation} for {user_id} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        user_id: UserId,
        timeout: Duration,
    },

    #[error("User {user_id} cannot move from {from} to {to}")]
    InvalidTransition {
        user_id: UserId,
        from: OnboardingPhase,
        to: OnboardingPhase,
    },

    #[error("Platform error: {0}")]
    Platform(PlatformError),
}

impl OnboardingError {
    /// Map a platform failure onto the error taxonomy of the given user.
    pub fn from_platform(user_id: &UserId, err: PlatformError) -> Self {
        match err {
            PlatformError::UserNotFound(id) => Self::UserNotFound(id),
            PlatformError::Apply { user_id, reason } => Self::Apply { user_id, reason },
            PlatformError::Send(reason) => Self::Delivery {
                user_id: user_id.clone(),
                reason,
            },
            other => Self::Platform(other),
        }
    }
}

/// Result type alias for onboarding operations.
pub type Result<T> = std::result::Result<T, OnboardingError>;

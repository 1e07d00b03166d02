//! Role Gate: onboarding selection tracking and role reconciliation for a
//! chat community.

pub mod config;
pub mod error;
pub mod onboarding;
pub mod platform;

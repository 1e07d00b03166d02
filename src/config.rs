//! Configuration types.
//!
//! Everything is read once at startup into an immutable [`OnboardingConfig`]
//! which is then shared by reference. Nothing reads the environment later.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::onboarding::catalog::OptionCatalog;
use crate::onboarding::messages::Messages;
use crate::onboarding::model::{ChannelId, GroupId};

/// Onboarding configuration shared by the state machine and the sweep.
#[derive(Debug, Clone)]
pub struct OnboardingConfig {
    /// Selectable options.
    pub catalog: Arc<OptionCatalog>,
    /// Group held only while onboarding is in progress.
    pub marker_group: GroupId,
    /// Mandatory groups granted on the first commit.
    pub default_groups: BTreeSet<GroupId>,
    /// Only members who joined after this instant are picked up by the sweep.
    pub not_before: DateTime<Utc>,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Best-effort deadline of one sweep run.
    pub sweep_deadline: Option<Duration>,
    /// Members processed concurrently during a sweep.
    pub sweep_concurrency: usize,
    /// Lifetime of a presented selection surface.
    pub session_ttl: Duration,
    /// Timeout applied to every platform call.
    pub call_timeout: Duration,
    /// Community name used in the welcome text.
    pub community_name: String,
    /// How the start channel is referenced in texts.
    pub start_channel: String,
    /// Channel that carries the entry-point button, if any.
    pub onboarding_channel: Option<ChannelId>,
    pub entry_label: String,
    pub commit_label: String,
    pub messages: Messages,
}

impl OnboardingConfig {
    /// Build a config with defaults for everything but the catalog, marker and
    /// default groups.
    pub fn new(
        catalog: OptionCatalog,
        marker_group: GroupId,
        default_groups: BTreeSet<GroupId>,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            marker_group,
            default_groups,
            not_before: DateTime::<Utc>::MIN_UTC,
            sweep_interval: Duration::from_secs(300), // 5 minutes
            sweep_deadline: Some(Duration::from_secs(240)),
            sweep_concurrency: 4,
            session_ttl: Duration::from_secs(900), // 15 minutes
            call_timeout: Duration::from_secs(10),
            community_name: "the community".to_string(),
            start_channel: "#start-here".to_string(),
            onboarding_channel: None,
            entry_label: "Unlock".to_string(),
            commit_label: "Confirm".to_string(),
            messages: Messages::default(),
        }
    }

    /// Load from `ROLE_GATE_*` environment variables plus the catalog file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let catalog_path = get("ROLE_GATE_CATALOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/options.json"));
        let (catalog, messages) = OptionCatalog::load(&catalog_path)?;

        let marker_group = get("ROLE_GATE_MARKER_GROUP")
            .map(|v| GroupId::from(v.trim()))
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "ROLE_GATE_MARKER_GROUP".into(),
                hint: "Set it to the group held during onboarding.".into(),
            })?;

        let default_groups: BTreeSet<GroupId> = get("ROLE_GATE_DEFAULT_GROUPS")
            .map(|v| parse_group_list(&v))
            .unwrap_or_default();
        if default_groups.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "ROLE_GATE_DEFAULT_GROUPS".into(),
                hint: "At least one group id is needed to start.".into(),
            });
        }
        if default_groups.contains(&marker_group) {
            return Err(ConfigError::InvalidValue {
                key: "ROLE_GATE_DEFAULT_GROUPS".into(),
                message: "must not contain the marker group".into(),
            });
        }

        let mut config = Self::new(catalog, marker_group, default_groups);
        if let Some(messages) = messages {
            config.messages = messages;
        }

        config.not_before = parse_not_before(
            &get("ROLE_GATE_NOT_BEFORE").unwrap_or_else(|| "25.08.2021".to_string()),
        )?;
        config.sweep_interval =
            Duration::from_secs(parse_num(&get, "ROLE_GATE_SWEEP_INTERVAL_SECS", 300)?.max(1));
        config.sweep_deadline = match parse_num(&get, "ROLE_GATE_SWEEP_DEADLINE_SECS", 240)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        config.sweep_concurrency = parse_num(&get, "ROLE_GATE_SWEEP_CONCURRENCY", 4)?.max(1) as usize;
        config.session_ttl = match parse_num(&get, "ROLE_GATE_SESSION_TTL_SECS", 900)? {
            0 => {
                return Err(ConfigError::InvalidValue {
                    key: "ROLE_GATE_SESSION_TTL_SECS".into(),
                    message: "sessions must live at least one second".into(),
                });
            }
            secs => Duration::from_secs(secs),
        };
        config.call_timeout =
            Duration::from_secs(parse_num(&get, "ROLE_GATE_CALL_TIMEOUT_SECS", 10)?.max(1));

        if let Some(name) = get("ROLE_GATE_COMMUNITY_NAME") {
            config.community_name = name;
        }
        if let Some(channel) = get("ROLE_GATE_START_CHANNEL") {
            config.start_channel = channel;
        }
        config.onboarding_channel = get("ROLE_GATE_ONBOARDING_CHANNEL").map(ChannelId::from);
        if let Some(label) = get("ROLE_GATE_ENTRY_LABEL") {
            config.entry_label = label;
        }
        if let Some(label) = get("ROLE_GATE_COMMIT_LABEL") {
            config.commit_label = label;
        }

        Ok(config)
    }

    /// Every group the onboarding flow grants: catalog options plus defaults.
    pub fn governed_groups(&self) -> BTreeSet<GroupId> {
        let mut groups = self.catalog.group_ids();
        groups.extend(self.default_groups.iter().cloned());
        groups
    }
}

/// Settings of the binary around the onboarding core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub platform_url: String,
    pub platform_token: Option<SecretString>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("ROLE_GATE_PORT") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "ROLE_GATE_PORT".into(),
                message: format!("'{v}' is not a port number"),
            })?,
            Err(_) => 8080,
        };
        let platform_url = std::env::var("ROLE_GATE_PLATFORM_URL")
            .map_err(|_| ConfigError::MissingEnvVar("ROLE_GATE_PLATFORM_URL".into()))?;
        let platform_token = std::env::var("ROLE_GATE_PLATFORM_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);
        Ok(Self {
            port,
            platform_url,
            platform_token,
        })
    }
}

/// Split a whitespace- or comma-separated list of group ids.
pub fn parse_group_list(raw: &str) -> BTreeSet<GroupId> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(GroupId::from)
        .collect()
}

/// Parse a join cutoff given as `dd.mm.yyyy` or `yyyy-mm-dd` (midnight UTC).
pub fn parse_not_before(raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%d.%m.%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "ROLE_GATE_NOT_BEFORE".into(),
            message: format!("'{raw}' is neither dd.mm.yyyy nor yyyy-mm-dd"),
        })
}

fn parse_num<F>(get: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{v}' is not a non-negative integer"),
        }),
        None => Ok(default),
    }
}

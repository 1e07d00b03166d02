//! User-facing texts of the onboarding flow.
//!
//! Templates may use `{name}`, `{community}` and `{start_channel}`; unknown
//! placeholders are left as-is.

use serde::{Deserialize, Serialize};

/// Text templates, overridable from the `messages` section of the catalog file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Messages {
    /// Direct message sent when a member clears the gate.
    pub welcome: String,
    /// Text above the selection buttons.
    pub prompt: String,
    /// Reply to the first successful commit.
    pub activated: String,
    /// Reply to a later commit that changed groups.
    pub updated: String,
    /// Reply to a later commit that changed nothing.
    pub unchanged: String,
    /// Reply when the member has left.
    pub not_present: String,
    /// Reply to an interaction on an expired prompt.
    pub expired: String,
    /// Text above the entry-point button in the onboarding channel.
    pub entry_point: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            welcome: "Hey {name}, welcome to {community}!\n\
                      Have a look at {start_channel} for a short overview.\n\
                      If you have any questions, feel free to reach out to the moderators."
                .to_string(),
            prompt: "Please pick everything that applies to you.\n\
                     Ignore this message if you already did this on the server :)"
                .to_string(),
            activated: "You are now unlocked! Have a look at {start_channel} :)".to_string(),
            updated: "Your roles have been updated.".to_string(),
            unchanged: "You already completed the setup.\nNo changes were made.".to_string(),
            not_present: "You are no longer a member of the server.".to_string(),
            expired: "This prompt has expired. A new one has been sent to you.".to_string(),
            entry_point: "Click the button and pick the options that apply to you.\n\
                          If something goes wrong, please contact the moderators :)"
                .to_string(),
        }
    }
}

/// Values substituted into the templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub name: &'a str,
    pub community: &'a str,
    pub start_channel: &'a str,
}

/// Substitute the known placeholders in `template` in a single pass, so
/// substituted values are never expanded again.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    let placeholders = [
        ("{name}", vars.name),
        ("{community}", vars.community),
        ("{start_channel}", vars.start_channel),
    ];
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match placeholders.iter().find(|(key, _)| tail.starts_with(*key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

//! Post-creation actions configured as a comma separated list.
//!
//! An entry is either a required action name (`VERIFY_EMAIL`) or a custom
//! email template, optionally carrying the action its link performs:
//! `welcome.ftl` or `welcome.ftl(UPDATE_PASSWORD)`.

use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;

/// Required actions an action link can ask the user to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequiredAction {
    VerifyEmail,
    UpdateProfile,
    ConfigureTotp,
    UpdatePassword,
    TermsAndConditions,
}

impl RequiredAction {
    pub const ALL: [RequiredAction; 5] = [
        Self::VerifyEmail,
        Self::UpdateProfile,
        Self::ConfigureTotp,
        Self::UpdatePassword,
        Self::TermsAndConditions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifyEmail => "VERIFY_EMAIL",
            Self::UpdateProfile => "UPDATE_PROFILE",
            Self::ConfigureTotp => "CONFIGURE_TOTP",
            Self::UpdatePassword => "UPDATE_PASSWORD",
            Self::TermsAndConditions => "TERMS_AND_CONDITIONS",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }
}

impl fmt::Display for RequiredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the post-creation action list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetAction {
    /// Built-in "execute actions" email.
    Known(RequiredAction),
    /// Email rendered from a custom template file.
    Template {
        template: String,
        action: Option<RequiredAction>,
    },
}

fn action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\((.*?)\)").expect("action pattern is valid"))
}

impl ResetAction {
    /// Parse one entry; `None` when it is neither a known action nor a
    /// `.ftl` template with a known (or no) action.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if let Some(action) = RequiredAction::parse(entry) {
            return Some(Self::Known(action));
        }
        if !entry.contains(".ftl") {
            return None;
        }
        match action_pattern().captures(entry) {
            Some(caps) => {
                let action = RequiredAction::parse(caps[1].trim())?;
                let template = entry.replace(&caps[0], "").trim().to_string();
                Some(Self::Template {
                    template,
                    action: Some(action),
                })
            }
            None => Some(Self::Template {
                template: entry.to_string(),
                action: None,
            }),
        }
    }

    /// Actions carried by the link sent for this entry.
    pub fn required_actions(&self) -> Vec<RequiredAction> {
        match self {
            Self::Known(action) => vec![*action],
            Self::Template { action, .. } => action.iter().copied().collect(),
        }
    }
}

impl fmt::Display for ResetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(action) => write!(f, "{}", action),
            Self::Template {
                template,
                action: Some(action),
            } => write!(f, "{}({})", template, action),
            Self::Template {
                template,
                action: None,
            } => f.write_str(template),
        }
    }
}

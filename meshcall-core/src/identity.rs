//! User identity
//!
//! Users are identified by the opaque id the workspace assigns them. The id is
//! totally ordered so both ends of a call can agree on tie-breaks without
//! exchanging extra messages.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Identifier of a workspace user
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` makes the first offer when both sides call each other
    /// at the same instant. The lower id always offers.
    pub fn wins_glare_against(&self, other: &UserId) -> bool {
        self < other
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("user id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Public profile of a call party as reported by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// User id
    pub user_id: UserId,
    /// Name shown in call UI
    pub display_name: String,
    /// Avatar URL, if the user has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ParticipantInfo {
    /// Profile without an avatar
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar: None,
        }
    }

    /// Profile with the display name defaulted to the id
    pub fn anonymous(user_id: UserId) -> Self {
        Self {
            display_name: user_id.to_string(),
            user_id,
            avatar: None,
        }
    }
}

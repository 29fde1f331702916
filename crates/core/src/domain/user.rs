use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Employment status carried by the chat platform's directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Departed,
}

impl UserStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            UserStatus::Active => 0,
            UserStatus::Departed => 1,
        }
    }

    pub fn from_i16(value: i16) -> UserStatus {
        if value == 0 {
            UserStatus::Active
        } else {
            UserStatus::Departed
        }
    }
}

/// A sales representative. `id` is the chat platform's cross-application
/// union identifier and is stable across bots and pages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub orgname: String,
    pub status: UserStatus,
    pub avatar_url: Option<String>,
    /// Last time the user opened the bot chat; drives the once-a-day
    /// greeting.
    pub start_lark: Option<DateTime<Utc>>,
}

impl User {
    /// Placeholder row created on first contact, before the directory has
    /// been consulted.
    pub fn placeholder(user_id: &str) -> User {
        User {
            id: user_id.to_string(),
            name: user_id.to_string(),
            phone: None,
            orgname: String::new(),
            status: UserStatus::Active,
            avatar_url: None,
            start_lark: None,
        }
    }
}

/// Profile attributes fetched from the platform directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub mobile: Option<String>,
    pub orgname: String,
    pub status: UserStatus,
    pub avatar_url: Option<String>,
}

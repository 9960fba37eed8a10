use crate::models::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of outbox event names written by this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Login,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Login => "login",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `login` outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginNotificationParams {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub username: String,
    #[serde(rename = "loginAt")]
    pub login_at: DateTime<Utc>,
}

impl LoginNotificationParams {
    pub fn for_user(user: &User, login_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.to_string(),
            email: user.email.clone(),
            username: user.username.clone(),
            login_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(rename = "eventID")]
    pub event_id: String,
    pub event_name: String,
    pub published_at: i64,
}

/// Body of the `login` task consumed by the notification sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginEvent {
    pub event_metadata: EventMetadata,
    pub user_id: String,
    pub email: String,
    pub username: String,
    pub login_at: DateTime<Utc>,
}

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// The authenticated user's identity and settings, as returned by
/// `GET /auth/me/`. The backend omits `is_staff` for regular accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub daily_notification_time: Option<NaiveTime>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
}

/// Partial settings update for `PATCH /auth/me/`. Absent fields are left
/// unchanged by the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_notification_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

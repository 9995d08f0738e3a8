//! Identity records the auth engine reads and updates
//!
//! Only identity, role, active flag, password hash and last-login are owned
//! here. Profile data is written once at registration alongside the user.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    /// Always stored normalized (trimmed, lower-case)
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub last_login_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn new(email: &str, password_hash: String, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            password_hash,
            role: Role::User,
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub timezone: String,
    pub locale: String,
}

impl UserProfile {
    pub fn new(user_id: Uuid, first_name: &str, last_name: &str) -> Self {
        Self {
            user_id,
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            avatar_url: None,
            phone: None,
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
        }
    }
}

/// Client-visible view of a user. Never carries the password hash.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SafeUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
}

impl From<&User> for SafeUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            is_active: user.is_active,
            created_at: user.created_at,
            updated_at: user.updated_at,
            last_login_at: user.last_login_at,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_text() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("USER".parse::<Role>().unwrap(), Role::User);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_new_user_normalizes_email() {
        let user = User::new("  Alice@Example.COM ", "hash".into(), OffsetDateTime::now_utc());
        assert_eq!(user.email, "alice@example.com");
        assert!(user.is_active);
        assert_eq!(user.role, Role::User);
    }

    #[test]
    fn test_safe_user_omits_password_hash() {
        let user = User::new("a@x.com", "secret-hash".into(), OffsetDateTime::now_utc());
        let json = serde_json::to_string(&SafeUser::from(&user)).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(json.contains("\"role\":\"user\""));
    }
}

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::subscription::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Team,
    Admin,
    Moderator,
    Other,
}

impl UserRole {
    /// Team, admin and moderator roles get PRO without a subscription.
    pub fn is_elevated(self) -> bool {
        matches!(self, UserRole::Team | UserRole::Admin | UserRole::Moderator)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Team => "team",
            UserRole::Admin => "admin",
            UserRole::Moderator => "moderator",
            UserRole::Other => "other",
        }
    }
}

impl FromStr for UserRole {
    type Err = UnknownVariant;

    /// Unrecognised stored roles read as `Other`, never as elevated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "team" => UserRole::Team,
            "admin" => UserRole::Admin,
            "moderator" => UserRole::Moderator,
            _ => UserRole::Other,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub language_code: Option<String>,
}

/// Profile fields taken from verified Telegram initData.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramProfile {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    pub invited_count: i64,
    pub converted_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: Option<UserRole>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramLoginRequest {
    pub init_data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_staff_roles_are_elevated() {
        assert!(UserRole::Team.is_elevated());
        assert!(UserRole::Admin.is_elevated());
        assert!(UserRole::Moderator.is_elevated());
        assert!(!UserRole::Other.is_elevated());
        assert_eq!("support".parse::<UserRole>(), Ok(UserRole::Other));
    }
}

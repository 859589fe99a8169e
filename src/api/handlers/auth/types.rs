//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Account role. `admin` is never self-assignable; registration only accepts
/// `teacher` and `student`.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    /// Parse a stored/submitted role string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    /// Roles a user may pick for themselves at registration.
    #[must_use]
    pub fn self_assignable(self) -> bool {
        matches!(self, Role::Teacher | Role::Student)
    }

    /// Post-login landing page for the web client.
    #[must_use]
    pub fn dashboard_path(self) -> &'static str {
        match self {
            Role::Admin => "/admin/dashboard",
            Role::Teacher | Role::Student => "/dashboard",
        }
    }
}

/// User projection returned by auth endpoints. Never includes the password
/// hash or token columns.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct UserResponse {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
    pub role: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub remember: bool,
    pub user: UserResponse,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResendActivationRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerificationLinkRequest {
    pub email: String,
    pub first_name: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CheckVerifiedRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CheckVerifiedResponse {
    pub verified: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CompleteGoogleRequest {
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn role_serializes_lowercase() -> Result<()> {
        assert_eq!(serde_json::to_value(Role::Teacher)?, "teacher");
        assert_eq!(serde_json::to_value(Role::Admin)?, "admin");
        let decoded: Role = serde_json::from_value(serde_json::json!("student"))?;
        assert_eq!(decoded, Role::Student);
        Ok(())
    }

    #[test]
    fn role_parse_and_self_assignable() {
        assert_eq!(Role::parse("teacher"), Some(Role::Teacher));
        assert_eq!(Role::parse("superuser"), None);
        assert!(Role::Student.self_assignable());
        assert!(!Role::Admin.self_assignable());
    }

    #[test]
    fn dashboard_paths_by_role() {
        assert_eq!(Role::Admin.dashboard_path(), "/admin/dashboard");
        assert_eq!(Role::Teacher.dashboard_path(), "/dashboard");
        assert_eq!(Role::Student.dashboard_path(), "/dashboard");
    }

    #[test]
    fn login_request_remember_defaults_false() -> Result<()> {
        let decoded: LoginRequest = serde_json::from_value(serde_json::json!({
            "email": "alice@example.com",
            "password": "secret-password",
        }))?;
        assert!(!decoded.remember);
        Ok(())
    }

    #[test]
    fn user_response_omits_absent_picture() -> Result<()> {
        let user = UserResponse {
            id: Uuid::new_v4(),
            first_name: "Alice".to_string(),
            last_name: "Doe".to_string(),
            name: "Alice Doe".to_string(),
            email: "alice@example.com".to_string(),
            role: Role::Teacher,
            is_active: true,
            email_verified: true,
            profile_picture: None,
        };
        let value = serde_json::to_value(&user)?;
        assert!(value.get("profile_picture").is_none());
        let email = value
            .get("email")
            .and_then(serde_json::Value::as_str)
            .context("missing email")?;
        assert_eq!(email, "alice@example.com");
        Ok(())
    }
}

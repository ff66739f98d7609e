//! Caller identity carried by query requests.
//!
//! The identity is trusted as-is: it has been authenticated by the API
//! gateway in front of this service, which injects it either into the JSON
//! body or, for requests without a body, as a JSON-encoded query parameter.

use crate::errors::QueryRouterError;
use serde::Deserialize;
use serde_json::Value;

/// Name of the body field and query parameter holding the identity
pub const LOGGED_USER_FIELD: &str = "loggedUser";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Manager,
    User,
    #[serde(other)]
    Unrecognized,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggedUser {
    pub id: Option<String>,
    pub role: Role,
}

impl LoggedUser {
    pub fn is_plain_user(&self) -> bool {
        self.role == Role::User
    }
}

/// Resolves the caller identity, the body field taking precedence over the
/// query parameter. A value that is present but cannot be decoded is an error,
/// never an anonymous caller.
pub fn extract_logged_user(
    body: Option<&Value>,
    query_value: Option<&str>,
) -> Result<Option<LoggedUser>, QueryRouterError> {
    if let Some(value) = body.and_then(|b| b.get(LOGGED_USER_FIELD))
        && !value.is_null()
    {
        return LoggedUser::deserialize(value)
            .map(Some)
            .map_err(|e| QueryRouterError::MalformedIdentity(e.to_string()));
    }

    match query_value {
        Some(encoded) => serde_json::from_str::<Option<LoggedUser>>(encoded)
            .map_err(|e| QueryRouterError::MalformedIdentity(e.to_string())),
        None => Ok(None),
    }
}

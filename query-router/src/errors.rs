use crate::config::ValidationError;
use crate::storage::StorageError;
use hyper::StatusCode;
use thiserror::Error;

const INTERNAL_SERVER_ERROR_MESSAGE: &str = "Internal server error";

/// Errors that can occur while routing a query request.
///
/// Every variant maps to exactly one HTTP status through [`QueryRouterError::status_code`],
/// which is what the router writes back to the caller.
#[derive(Error, Debug)]
pub enum QueryRouterError {
    /// Freeze was requested without a caller identity
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Non-sandbox dataset queried anonymously
    #[error("API key / authentication required")]
    AuthenticationRequired,

    /// Non-sandbox dataset queried by a caller whose role may not access it
    #[error("Forbidden")]
    Forbidden,

    #[error("Dataset could not be resolved: {0}")]
    DatasetUnresolved(String),

    /// The `loggedUser` value could not be decoded
    #[error("Malformed loggedUser: {0}")]
    MalformedIdentity(String),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("No route matched for request")]
    NoRouteMatched,

    /// The query adapter answered with a non-success status
    #[error("Upstream responded with {status}: {message}")]
    UpstreamStatus { status: StatusCode, message: String },

    #[error("Upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("Upstream timeout for {0}")]
    UpstreamTimeout(String),

    #[error("Failed to read response body: {0}")]
    ResponseBodyError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryRouterError {
    /// The HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueryRouterError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            QueryRouterError::AuthenticationRequired
            | QueryRouterError::Forbidden
            | QueryRouterError::DatasetUnresolved(_)
            | QueryRouterError::MalformedIdentity(_) => StatusCode::FORBIDDEN,
            QueryRouterError::RequestBodyError(_) => StatusCode::BAD_REQUEST,
            QueryRouterError::NoRouteMatched => StatusCode::NOT_FOUND,
            QueryRouterError::UpstreamStatus { status, .. } => *status,
            QueryRouterError::UpstreamRequestFailed(..)
            | QueryRouterError::UpstreamTimeout(_)
            | QueryRouterError::ResponseBodyError(_)
            | QueryRouterError::Storage(_)
            | QueryRouterError::InvalidConfig(_)
            | QueryRouterError::InternalError(_)
            | QueryRouterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            QueryRouterError::NotAuthenticated
            | QueryRouterError::AuthenticationRequired
            | QueryRouterError::Forbidden => self.to_string(),
            QueryRouterError::DatasetUnresolved(_) | QueryRouterError::MalformedIdentity(_) => {
                QueryRouterError::Forbidden.to_string()
            }
            QueryRouterError::RequestBodyError(detail) => detail.clone(),
            QueryRouterError::NoRouteMatched => "Not Found".to_string(),
            QueryRouterError::UpstreamStatus { message, .. } => message.clone(),
            _ => INTERNAL_SERVER_ERROR_MESSAGE.to_string(),
        }
    }

    /// Whether the request was refused by the authorization checks.
    pub fn is_authorization_denied(&self) -> bool {
        matches!(
            self,
            QueryRouterError::NotAuthenticated
                | QueryRouterError::AuthenticationRequired
                | QueryRouterError::Forbidden
                | QueryRouterError::DatasetUnresolved(_)
                | QueryRouterError::MalformedIdentity(_)
        )
    }

    /// Short tag used when reporting denials in metrics.
    pub fn denial_reason(&self) -> &'static str {
        match self {
            QueryRouterError::NotAuthenticated => "not_authenticated",
            QueryRouterError::AuthenticationRequired => "authentication_required",
            QueryRouterError::Forbidden => "forbidden_role",
            QueryRouterError::DatasetUnresolved(_) => "dataset_unresolved",
            QueryRouterError::MalformedIdentity(_) => "malformed_identity",
            _ => "none",
        }
    }
}

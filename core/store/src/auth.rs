//! Request authentication.
//!
//! Requests arrive through a gateway that has already authenticated the
//! user and forwards the id in `X-User-Id`. When an API key is configured,
//! the gateway must also present it as `Authorization: Bearer <key>`.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, warn};
use user_memory_schemas::UserId;

use crate::api::error_response;
use crate::database::MemoryStore;
use crate::error::MemoryError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Expected API key, if any. Without one, bearer checks are skipped.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyConfig {
    key_bytes: Option<Arc<[u8]>>,
}

impl ApiKeyConfig {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key_bytes: key
                .filter(|k| !k.trim().is_empty())
                .map(|k| Arc::from(k.into_bytes().into_boxed_slice())),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.key_bytes.is_some()
    }

    /// Constant-time comparison.
    fn verify(&self, provided: &[u8]) -> bool {
        let Some(ref expected) = self.key_bytes else {
            return true;
        };
        if expected.len() != provided.len() {
            return false;
        }
        let mut result: u8 = 0;
        for (a, b) in expected.iter().zip(provided.iter()) {
            result |= a ^ b;
        }
        result == 0
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        if !self.is_enabled() {
            return Ok(());
        }
        match extract_bearer_token(headers) {
            Some(token) if self.verify(token.as_bytes()) => Ok(()),
            Some(_) => {
                warn!("Invalid API key provided");
                Err(AuthRejection::InvalidApiKey)
            }
            None => {
                warn!("Missing Authorization header");
                Err(AuthRejection::MissingApiKey)
            }
        }
    }
}

#[derive(Debug)]
pub enum AuthRejection {
    MissingApiKey,
    InvalidApiKey,
    MissingUserId,
    Store(MemoryError),
    Internal(String),
}

#[derive(Debug, serde::Serialize)]
struct AuthError {
    error: String,
    code: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (error, code) = match self {
            AuthRejection::MissingApiKey => (
                "Missing or invalid Authorization header. Use: Authorization: Bearer <key>",
                "MISSING_API_KEY",
            ),
            AuthRejection::InvalidApiKey => ("Invalid API key", "INVALID_API_KEY"),
            AuthRejection::MissingUserId => ("Missing X-User-Id header", "MISSING_USER_ID"),
            AuthRejection::Store(err) => return error_response(err).into_response(),
            AuthRejection::Internal(message) => {
                error!("User registration task failed: {}", message);
                return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
            }
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                error: error.into(),
                code,
            }),
        )
            .into_response()
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn extract_user_id(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::from)
}

/// The authenticated user of a request. Extracting it registers the user in
/// the local directory.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    ApiKeyConfig: FromRef<S>,
    Arc<MemoryStore>: FromRef<S>,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        ApiKeyConfig::from_ref(state).check(&parts.headers)?;

        let user_id = extract_user_id(&parts.headers).ok_or(AuthRejection::MissingUserId)?;
        let store = Arc::<MemoryStore>::from_ref(state);
        let registered = user_id.clone();
        tokio::task::spawn_blocking(move || store.register_user(&registered))
            .await
            .map_err(|e| AuthRejection::Internal(e.to_string()))?
            .map_err(AuthRejection::Store)?;

        Ok(AuthUser(user_id))
    }
}

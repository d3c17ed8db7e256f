use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Identity of the authenticated reader, inserted into request extensions
/// by [`authenticate`].
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

/// Identity of the authenticated publisher account, inserted into request
/// extensions by [`authenticate_publisher`].
#[derive(Debug, Clone, Copy)]
pub struct AuthPublisher(pub Uuid);

/// Optional viewer identity for public endpoints that personalize their
/// output when a valid token happens to be present. A missing or invalid
/// token is not an error here.
#[derive(Debug, Clone, Copy)]
pub struct MaybeUser(pub Option<Uuid>);

pub fn create_token(subject: &str, jwt_secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(24))
        .map(|at| at.timestamp() as usize)
        .unwrap_or(usize::MAX); // 24 hours
    let claims = Claims {
        sub: subject.to_string(),
        exp: expiration,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
}

pub fn validate_token(token: &str, jwt_secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims.sub)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn subject_id(headers: &HeaderMap, secret: &str) -> Result<Uuid, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;
    let subject = validate_token(token, secret)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
    Uuid::parse_str(&subject)
        .map_err(|_| ApiError::Unauthorized("Invalid token subject".to_string()))
}

pub async fn authenticate(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = subject_id(&headers, &state.config.jwt_secret)?;
    log::debug!("Authenticated user {user_id}");
    request.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(request).await)
}

pub async fn authenticate_publisher(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let publisher_id = subject_id(&headers, &state.config.publisher_jwt_secret)?;
    log::debug!("Authenticated publisher {publisher_id}");
    request.extensions_mut().insert(AuthPublisher(publisher_id));
    Ok(next.run(request).await)
}

#[axum::async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let viewer = bearer_token(&parts.headers)
            .and_then(|token| validate_token(token, &state.config.jwt_secret).ok())
            .and_then(|subject| Uuid::parse_str(&subject).ok());
        Ok(MaybeUser(viewer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_round_trips_subject() {
        let subject = Uuid::new_v4().to_string();
        let token = create_token(&subject, "test-secret").unwrap();
        assert_eq!(validate_token(&token, "test-secret").unwrap(), subject);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = create_token("someone", "secret-a").unwrap();
        assert!(validate_token(&token, "secret-b").is_err());
    }

    #[test]
    fn bearer_token_requires_scheme_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        let mut bare = HeaderMap::new();
        bare.insert("Authorization", HeaderValue::from_static("abc.def"));
        assert_eq!(bearer_token(&bare), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}

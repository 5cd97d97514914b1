//! Caller identity from the headers set by the trusted auth gateway.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use gubae_shared::constants::{HEADER_USER_ID, HEADER_USER_NAME, HEADER_USER_ROLE};
use gubae_shared::{Caller, Role};

use crate::error::ApiError;

/// The authenticated caller of a request. Rejects with 401 when the user id
/// header is missing or empty.
#[derive(Debug, Clone)]
pub struct Identity(pub Caller);

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = header_str(headers, HEADER_USER_ID)
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::Unauthenticated)?;
        let display_name = header_str(headers, HEADER_USER_NAME).unwrap_or_default();
        let role = match header_str(headers, HEADER_USER_ROLE) {
            Some(raw) if !raw.is_empty() => raw
                .parse::<Role>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
            _ => Role::default(),
        };

        Ok(Self(Caller::new(user_id, display_name, role)))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}

/// Header value as UTF-8 so non-Latin display names survive.
fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_missing_id_is_unauthenticated() {
        let headers = HeaderMap::new();
        assert!(matches!(
            Identity::from_headers(&headers),
            Err(ApiError::Unauthenticated)
        ));
    }

    #[test]
    fn test_full_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("u-42"));
        headers.insert(
            HEADER_USER_NAME,
            HeaderValue::from_bytes("አበበ".as_bytes()).unwrap(),
        );
        headers.insert(HEADER_USER_ROLE, HeaderValue::from_static("owner"));

        let Identity(caller) = Identity::from_headers(&headers).unwrap();
        assert_eq!(caller.user_id.as_str(), "u-42");
        assert_eq!(caller.display_name, "አበበ");
        assert_eq!(caller.role, Role::Owner);
    }

    #[test]
    fn test_role_defaults_to_member_and_rejects_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("u-1"));
        assert_eq!(Identity::from_headers(&headers).unwrap().0.role, Role::Member);

        headers.insert(HEADER_USER_ROLE, HeaderValue::from_static("bishop"));
        assert!(matches!(
            Identity::from_headers(&headers),
            Err(ApiError::BadRequest(_))
        ));
    }
}

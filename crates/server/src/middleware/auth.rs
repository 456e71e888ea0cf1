use crate::api::ApiError;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use rustmake_core::UserId;

/// Header carrying the caller's identity, set by the fronting auth layer
pub const USER_HEADER: &str = "x-user-id";

/// Extract the user id from request headers
pub fn extract_user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    let value = headers.get(USER_HEADER)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(UserId::new(value))
    }
}

/// The authenticated caller; rejects the request with 401 when absent
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_user_from_headers(&parts.headers)
            .map(CurrentUser)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {} header", USER_HEADER)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_user_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(extract_user_from_headers(&headers).is_none());

        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert!(extract_user_from_headers(&headers).is_none());

        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(extract_user_from_headers(&headers), Some(UserId::new("alice")));
    }
}

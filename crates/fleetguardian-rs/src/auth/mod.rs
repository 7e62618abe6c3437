use axum::http::HeaderMap;
use constant_time_eq::constant_time_eq;

use crate::error::{ApiError, ApiResult};
use crate::validation::parse_agent_uuid;

/// Admin and Scanner surfaces authenticate with an `X-API-KEY` header.
/// Comparison is constant-time; key material never reaches the logs.
pub fn verify_api_key(headers: &HeaderMap, expected: &str) -> ApiResult<()> {
    let presented = headers
        .get("X-API-KEY")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::unauthorized("missing API key")
                .with_field("X-API-KEY", "required header is missing")
        })?;
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid API key")
            .with_field("X-API-KEY", "API key is not valid"))
    }
}

/// Agent surface authenticates with a long-lived bearer token.
pub fn verify_agent_token(headers: &HeaderMap, expected: &str) -> ApiResult<()> {
    let header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::unauthorized("missing authentication token")
                .with_field("Authorization", "required header is missing")
        })?;
    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::unauthorized("invalid authentication format")
            .with_field("Authorization", "must use 'Bearer <token>' format")
    })?;
    if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid authentication token")
            .with_field("Authorization", "token is not valid"))
    }
}

/// The polling endpoints identify the caller with an `X-Agent-ID` header.
pub fn required_agent_id(headers: &HeaderMap) -> ApiResult<String> {
    let agent_id = headers
        .get("X-Agent-ID")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::invalid_request("missing agent ID")
                .with_field("X-Agent-ID", "required header is missing")
        })?;
    if parse_agent_uuid(agent_id).is_none() {
        return Err(ApiError::validation("invalid agent_id format")
            .with_field("X-Agent-ID", "must be a valid UUID"));
    }
    Ok(agent_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn api_key_accepts_exact_match_only() {
        let h = headers(&[("X-API-KEY", "secret")]);
        assert!(verify_api_key(&h, "secret").is_ok());
        assert!(verify_api_key(&h, "other").is_err());
        assert!(verify_api_key(&HeaderMap::new(), "secret").is_err());
    }

    #[test]
    fn bearer_format_is_enforced() {
        let h = headers(&[("Authorization", "Bearer token-1")]);
        assert!(verify_agent_token(&h, "token-1").is_ok());

        let bad = headers(&[("Authorization", "token-1")]);
        assert!(verify_agent_token(&bad, "token-1").is_err());

        let wrong = headers(&[("Authorization", "Bearer nope")]);
        assert!(verify_agent_token(&wrong, "token-1").is_err());
    }

    #[test]
    fn agent_id_header_must_be_uuid() {
        let h = headers(&[("X-Agent-ID", "11111111-1111-4111-8111-111111111111")]);
        assert_eq!(
            required_agent_id(&h).unwrap(),
            "11111111-1111-4111-8111-111111111111"
        );
        let bad = headers(&[("X-Agent-ID", "not-a-uuid")]);
        assert!(required_agent_id(&bad).is_err());
        assert!(required_agent_id(&HeaderMap::new()).is_err());
    }
}

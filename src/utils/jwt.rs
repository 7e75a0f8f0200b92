// src/utils/jwt.rs

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::AppError, models::attempt::AttemptTokenClaims};

/// Learner bearer token claims, minted by the identity service.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Claims {
    /// Subject - Stores the learner id.
    pub sub: String,
    /// Learner's role (e.g., 'learner', 'reviewer').
    pub role: String,
    /// Expiration time as Unix timestamp.
    pub exp: usize,
}

/// Signs a learner bearer token.
///
/// The engine never authenticates learners itself; this exists for the
/// identity service contract and for tests.
pub fn sign_jwt(
    learner_id: &str,
    role: &str,
    secret: &str,
    expiration_seconds: u64,
) -> Result<String, AppError> {
    // Calculate expiration: current time + expiration_seconds
    let expiration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?
        .as_secs() as usize
        + expiration_seconds as usize;

    let claims = Claims {
        sub: learner_id.to_owned(),
        role: role.to_owned(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::InternalServerError(e.to_string()))
}

/// Checks a learner bearer token minted by the identity service.
///
/// Expired or foreign-signed tokens map to `AppError::AuthError`.
pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::AuthError("Invalid learner token".to_string()))?;

    Ok(token_data.claims)
}

/// Signs an attempt token capability.
pub fn sign_attempt_token(claims: &AttemptTokenClaims, secret: &str) -> Result<String, AppError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::InternalServerError(e.to_string()))
}

/// Checks the signature of an attempt token and returns its claims.
///
/// Expiry is deliberately not checked here: the access controller compares
/// `exp` against its own clock so expiry surfaces as `TokenExpired`.
pub fn decode_attempt_token(token: &str, secret: &str) -> Result<AttemptTokenClaims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;

    let token_data = decode::<AttemptTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AppError::AuthError("Invalid attempt token".to_string()))?;

    Ok(token_data.claims)
}

/// Resolves the learner behind every evaluation route.
///
/// The bearer token's `sub` becomes the learner id that every access and
/// session operation is keyed on. Requests without a valid learner token
/// never reach the handlers and get a bare 401.
pub async fn auth_middleware(
    State(config): State<Config>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let learner = verify_jwt(bearer, &config.jwt_secret).map_err(|e| {
        tracing::debug!("Rejected learner token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;
    if learner.sub.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    req.extensions_mut().insert(learner);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn claims() -> AttemptTokenClaims {
        AttemptTokenClaims {
            jti: Uuid::new_v4(),
            sub: "learner-7".to_string(),
            evaluation_id: "eval-1".to_string(),
            record_version: 3,
            // Already in the past: decoding must still succeed.
            exp: 1_000,
        }
    }

    #[test]
    fn test_attempt_token_round_trip_ignores_exp() {
        let original = claims();
        let token = sign_attempt_token(&original, "secret").unwrap();
        let decoded = decode_attempt_token(&token, "secret").unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_attempt_token_wrong_secret_rejected() {
        let token = sign_attempt_token(&claims(), "secret").unwrap();
        assert!(matches!(
            decode_attempt_token(&token, "other"),
            Err(AppError::AuthError(_))
        ));
    }

    #[test]
    fn test_learner_token_verifies() {
        let token = sign_jwt("learner-7", "learner", "secret", 60).unwrap();
        let claims = verify_jwt(&token, "secret").unwrap();
        assert_eq!(claims.sub, "learner-7");
    }

    #[test]
    fn test_learner_token_from_other_issuer_rejected() {
        let token = sign_jwt("learner-7", "learner", "other-secret", 60).unwrap();
        assert!(matches!(
            verify_jwt(&token, "secret"),
            Err(AppError::AuthError(_))
        ));
    }
}

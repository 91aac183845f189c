//! Bearer-token authentication.
//!
//! Every /api route requires a valid HS256 token signed with the shared
//! secret. Fleet-admin mutations additionally require the `admin` role.
//! Token issuance happens elsewhere; the gateway only validates.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use taskgate_common::{GatewayError, Result};

use crate::routes::{ApiError, AppState};

/// Claims the gateway understands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }
}

/// Validate an `Authorization: Bearer <token>` header value.
pub fn verify_bearer(secret: &str, header: Option<&str>) -> Result<Claims> {
    let header = header.ok_or_else(|| GatewayError::Auth("missing bearer token".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| GatewayError::Auth("malformed authorization header".into()))?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| GatewayError::Auth(format!("invalid token: {}", e)))?;

    Ok(data.claims)
}

/// Admin gate for the fleet-mutation endpoints.
pub fn require_admin(claims: &Claims) -> Result<()> {
    if claims.is_admin() {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("admin role required".into()))
    }
}

/// Axum middleware: validate the token and stash the claims for handlers.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match verify_bearer(&state.config.jwt_secret, header.as_deref()) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, role: Option<&str>, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: "tester".into(),
            role: role.map(Into::into),
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_passes() {
        let header = format!("Bearer {}", token("secret", Some("admin"), 3600));
        let claims = verify_bearer("secret", Some(&header)).unwrap();
        assert_eq!(claims.sub, "tester");
        assert!(claims.is_admin());
    }

    #[test]
    fn missing_and_malformed_headers_fail() {
        assert!(matches!(
            verify_bearer("secret", None),
            Err(GatewayError::Auth(_))
        ));
        assert!(matches!(
            verify_bearer("secret", Some("Basic abc")),
            Err(GatewayError::Auth(_))
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = format!("Bearer {}", token("other", None, 3600));
        assert!(matches!(
            verify_bearer("secret", Some(&header)),
            Err(GatewayError::Auth(_))
        ));
    }

    #[test]
    fn expired_token_fails() {
        let header = format!("Bearer {}", token("secret", None, -3600));
        assert!(matches!(
            verify_bearer("secret", Some(&header)),
            Err(GatewayError::Auth(_))
        ));
    }

    #[test]
    fn admin_gate_checks_role() {
        let admin = Claims {
            sub: "a".into(),
            role: Some("admin".into()),
            exp: 0,
        };
        let worker = Claims {
            sub: "w".into(),
            role: Some("worker".into()),
            exp: 0,
        };

        assert!(require_admin(&admin).is_ok());
        assert!(matches!(
            require_admin(&worker),
            Err(GatewayError::Forbidden(_))
        ));
    }
}

//! Bearer-token validation (§4.1 "Token validation").
//!
//! Two token formats are accepted: a 128-hex "legacy" token and a
//! three-segment JWT OAuth token. Detection is by format; if ambiguous,
//! OAuth is tried first, then legacy.

use std::sync::Arc;

use gateway_types::{AuthContext, GatewayError};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::collaborators::UserRepository;

#[derive(Clone)]
pub struct TokenValidatorConfig {
    pub jwt_secret: SecretString,
}

pub struct TokenValidator {
    users: Arc<dyn UserRepository>,
    config: TokenValidatorConfig,
}

#[derive(Debug, Deserialize)]
struct OAuthClaims {
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
}

impl TokenValidator {
    #[must_use]
    pub fn new(users: Arc<dyn UserRepository>, config: TokenValidatorConfig) -> Self {
        Self { users, config }
    }

    /// `authenticate(request) -> Session | Error` (§4.1).
    ///
    /// Returns the validated `AuthContext` plus the raw token (so callers
    /// can compute the mask/derive the session) on success.
    pub async fn authenticate(&self, raw_token: &str) -> Result<AuthContext, GatewayError> {
        let looks_like_jwt = raw_token.splitn(4, '.').count() == 3;
        if looks_like_jwt {
            match self.authenticate_jwt(raw_token).await {
                Ok(ctx) => return Ok(ctx),
                Err(GatewayError::InvalidToken) => {
                    debug!("jwt validation failed, falling back to legacy token format");
                }
                Err(other) => return Err(other),
            }
        }
        self.authenticate_legacy(raw_token).await
    }

    async fn authenticate_legacy(&self, raw_token: &str) -> Result<AuthContext, GatewayError> {
        if raw_token.len() != 128 || !raw_token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GatewayError::InvalidToken);
        }
        let user_id = derive_legacy_user_id(raw_token);
        let user = self
            .users
            .find_by_id(&user_id)
            .await
            .map_err(|e| GatewayError::Internal(e.0))?
            .ok_or(GatewayError::UserNotFound)?;

        self.check_user_status(&user)?;

        Ok(AuthContext {
            user_id: user.user_id,
            token_mask: mask_token(raw_token),
            role: user.role,
            status: user.status,
            permissions: user.permissions,
            preferences: user.user_preferences,
            launch_configs: user.launch_configs,
            authenticated_at_millis: gateway_types::now_millis(),
            expires_at: user.expires_at,
            rate_limit: user.rate_limit,
        })
    }

    async fn authenticate_jwt(&self, raw_token: &str) -> Result<AuthContext, GatewayError> {
        let key = DecodingKey::from_secret(self.config.jwt_secret.expose_secret().as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = jsonwebtoken::decode::<OAuthClaims>(raw_token, &key, &validation)
            .map_err(|_| GatewayError::InvalidToken)?;

        let user = self
            .users
            .find_by_id(&data.claims.sub)
            .await
            .map_err(|e| GatewayError::Internal(e.0))?
            .ok_or(GatewayError::UserNotFound)?;

        self.check_user_status(&user)?;

        Ok(AuthContext {
            user_id: user.user_id,
            token_mask: mask_token(raw_token),
            role: user.role,
            status: user.status,
            permissions: user.permissions,
            preferences: user.user_preferences,
            launch_configs: user.launch_configs,
            authenticated_at_millis: gateway_types::now_millis(),
            expires_at: user.expires_at,
            rate_limit: user.rate_limit,
        })
    }

    fn check_user_status(&self, user: &gateway_types::User) -> Result<(), GatewayError> {
        if user.status != gateway_types::UserStatus::Enabled {
            return Err(GatewayError::UserDisabled);
        }
        let now = chrono::Utc::now().timestamp();
        if user.is_expired(now) {
            return Err(GatewayError::UserExpired);
        }
        Ok(())
    }
}

/// `userId = first-32-hex-of-SHA256(token)` (§4.1).
#[must_use]
pub fn derive_legacy_user_id(raw_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

/// Masks a raw token as `first8…last8`, per §4.1.
#[must_use]
pub fn mask_token(raw_token: &str) -> String {
    if raw_token.len() <= 16 {
        return "*".repeat(raw_token.len());
    }
    format!(
        "{}…{}",
        &raw_token[..8],
        &raw_token[raw_token.len() - 8..]
    )
}

/// Builds the `WWW-Authenticate` header value for a 401 (§4.1, §6).
#[must_use]
pub fn www_authenticate_invalid_token(base_url: &str, realm: &str) -> String {
    format!(
        "Bearer realm=\"{realm}\", error=\"invalid_token\", resource_metadata=\"{base_url}/.well-known/oauth-protected-resource\""
    )
}

/// Parses and structurally validates a raw permissions JSON value, used
/// by session attachment when refreshing an `AuthContext` from the store.
pub fn validate_permissions_value(value: &Value) -> Result<(), GatewayError> {
    gateway_types::schema::PermissionsBlob::parse(value).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::in_memory::InMemoryUserRepository;
    use gateway_types::{schema::*, Role, User, UserStatus};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_user(user_id: &str) -> User {
        User {
            user_id: user_id.to_string(),
            role: Role::User,
            status: UserStatus::Enabled,
            permissions: PermissionsBlob::default(),
            user_preferences: PreferencesBlob::default(),
            launch_configs: LaunchConfigsBlob::default(),
            expires_at: 0,
            rate_limit: 60,
        }
    }

    #[tokio::test]
    async fn legacy_token_round_trip() {
        let raw_token = "a".repeat(128);
        let user_id = derive_legacy_user_id(&raw_token);
        let repo = InMemoryUserRepository::new();
        repo.insert(make_user(&user_id));

        let validator = TokenValidator::new(
            Arc::new(repo),
            TokenValidatorConfig {
                jwt_secret: SecretString::from("secret".to_string()),
            },
        );
        let ctx = validator.authenticate(&raw_token).await.unwrap();
        assert_eq!(ctx.user_id, user_id);
        assert!(ctx.token_mask.contains('…'));
    }

    #[tokio::test]
    async fn legacy_token_rejects_disabled_user() {
        let raw_token = "b".repeat(128);
        let user_id = derive_legacy_user_id(&raw_token);
        let mut user = make_user(&user_id);
        user.status = UserStatus::Disabled;
        let repo = InMemoryUserRepository::new();
        repo.insert(user);

        let validator = TokenValidator::new(
            Arc::new(repo),
            TokenValidatorConfig {
                jwt_secret: SecretString::from("secret".to_string()),
            },
        );
        let err = validator.authenticate(&raw_token).await.unwrap_err();
        assert!(matches!(err, GatewayError::UserDisabled));
    }

    #[tokio::test]
    async fn jwt_token_round_trip() {
        let user_id = "user-jwt-1";
        let repo = InMemoryUserRepository::new();
        repo.insert(make_user(user_id));

        let secret = "jwt-secret";
        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            exp: i64,
        }
        let jwt = encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                sub: user_id.to_string(),
                exp: chrono::Utc::now().timestamp() + 3600,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let validator = TokenValidator::new(
            Arc::new(repo),
            TokenValidatorConfig {
                jwt_secret: SecretString::from(secret.to_string()),
            },
        );
        let ctx = validator.authenticate(&jwt).await.unwrap();
        assert_eq!(ctx.user_id, user_id);
    }

    #[test]
    fn mask_token_keeps_first_and_last_eight() {
        let raw = "0123456789abcdef0123456789abcdef";
        let masked = mask_token(raw);
        assert_eq!(masked, "01234567…89abcdef");
    }
}

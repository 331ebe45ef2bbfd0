//! Caller identity resolution.
//!
//! The bridge never issues credentials. It only maps a presented credential (JWT bearer token or
//! static API key) to an [`Identity`]; both kinds satisfy the same contract so ownership checks do
//! not care which one the caller used.

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::{DateTime, TimeZone as _, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ApiKeyConfig, AuthConfig, JwtAlgorithm, JwtConfig};
use crate::error::BridgeError;
use crate::store::Store;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl Credential {
    /// Extract a credential. `Authorization: Bearer` wins over `X-API-Key`.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        if let Some(token) = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            return Some(Self::Bearer(token.to_string()));
        }
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| Self::ApiKey(k.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    /// JWT `jti`, when the identity came from a token.
    #[serde(skip)]
    pub credential_id: Option<String>,
    #[serde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Map a credential to an identity, or fail with `AuthenticationFailed`.
    async fn resolve(&self, credential: &Credential) -> Result<Identity, BridgeError>;
}

/// Resolve the caller, failing when no credential is present.
pub async fn require_identity(
    provider: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<Identity, BridgeError> {
    let credential = Credential::from_headers(headers)
        .ok_or_else(|| BridgeError::AuthenticationFailed("missing credential".into()))?;
    provider.resolve(&credential).await
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    jti: String,
    exp: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// HMAC-signed JWT bearer tokens with `jti` revocation.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
    store: Arc<dyn Store>,
}

impl JwtIdentityProvider {
    #[must_use]
    pub fn new(cfg: &JwtConfig, store: Arc<dyn Store>) -> Self {
        let algorithm = match cfg.algorithm {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::HS384 => Algorithm::HS384,
            JwtAlgorithm::HS512 => Algorithm::HS512,
        };
        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation,
            store,
        }
    }

    async fn resolve_token(&self, token: &str) -> Result<Identity, BridgeError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| BridgeError::AuthenticationFailed(format!("invalid token: {e}")))?;
        let claims = data.claims;

        let revoked = self
            .store
            .is_credential_revoked(&claims.jti)
            .await
            .map_err(BridgeError::Internal)?;
        if revoked {
            return Err(BridgeError::AuthenticationFailed("token revoked".into()));
        }

        Ok(Identity {
            user_id: claims.sub,
            username: claims.username,
            email: claims.email,
            credential_id: Some(claims.jti),
            expires_at: Utc.timestamp_opt(claims.exp, 0).single(),
        })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, BridgeError> {
        match credential {
            Credential::Bearer(token) => self.resolve_token(token).await,
            Credential::ApiKey(_) => Err(BridgeError::AuthenticationFailed(
                "API keys are not accepted here".into(),
            )),
        }
    }
}

/// Static API keys from config. A bearer token equal to a key is accepted as well.
#[derive(Default)]
pub struct ApiKeyIdentityProvider {
    keys: HashMap<String, Identity>,
}

impl ApiKeyIdentityProvider {
    #[must_use]
    pub fn new(keys: &[ApiKeyConfig]) -> Self {
        let keys = keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    Identity {
                        user_id: k.user_id.clone(),
                        username: k.username.clone(),
                        email: k.email.clone(),
                        credential_id: None,
                        expires_at: None,
                    },
                )
            })
            .collect();
        Self { keys }
    }

    fn lookup(&self, key: &str) -> Option<Identity> {
        self.keys.get(key).cloned()
    }
}

#[async_trait]
impl IdentityProvider for ApiKeyIdentityProvider {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, BridgeError> {
        let (Credential::ApiKey(key) | Credential::Bearer(key)) = credential;
        self.lookup(key)
            .ok_or_else(|| BridgeError::AuthenticationFailed("unknown API key".into()))
    }
}

/// Bearer tokens are matched against static API keys first, then validated as JWTs.
pub struct ChainedIdentityProvider {
    jwt: Option<JwtIdentityProvider>,
    api_keys: ApiKeyIdentityProvider,
}

impl ChainedIdentityProvider {
    #[must_use]
    pub fn from_config(cfg: &AuthConfig, store: Arc<dyn Store>) -> Self {
        Self {
            jwt: cfg.jwt.as_ref().map(|j| JwtIdentityProvider::new(j, store)),
            api_keys: ApiKeyIdentityProvider::new(&cfg.api_keys),
        }
    }
}

#[async_trait]
impl IdentityProvider for ChainedIdentityProvider {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, BridgeError> {
        match credential {
            Credential::Bearer(token) => {
                if let Some(identity) = self.api_keys.lookup(token) {
                    return Ok(identity);
                }
                match &self.jwt {
                    Some(jwt) => jwt.resolve(credential).await,
                    None => Err(BridgeError::AuthenticationFailed(
                        "bearer token not recognized".into(),
                    )),
                }
            }
            Credential::ApiKey(_) => self.api_keys.resolve(credential).await,
        }
    }
}

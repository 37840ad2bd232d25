use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::Error as JwtError, errors::ErrorKind, Algorithm, DecodingKey,
    EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;
use warden_core::{SharedClock, UserId};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token signature does not match")]
    BadSignature,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token issuer: expected {expected}, got {actual}")]
    InvalidIssuer { expected: String, actual: String },

    #[error("Token encoding error: {0}")]
    Encode(#[from] JwtError),
}

pub type TokenResult<T> = Result<T, TokenError>;

impl TokenError {
    fn from_decode(err: JwtError) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => TokenError::BadSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Malformed(err.to_string()),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;
const DEVELOPMENT_SECRET: &str = "development-secret-key-change-in-production";

#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC secret used to sign and verify tokens
    #[validate(length(min = 32, message = "token secret must be at least 32 characters"))]
    pub secret: String,
    /// Issuer tag embedded in and required from every token
    #[validate(length(min = 1))]
    pub issuer: String,
    /// Token lifetime in seconds (default: 24 hours)
    #[validate(range(min = 60, max = 2592000))]
    pub lifetime_secs: i64,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn with_settings(secret: String, issuer: String, lifetime_secs: i64) -> Self {
        Self {
            secret,
            issuer,
            lifetime_secs,
        }
    }

    pub fn uses_development_secret(&self) -> bool {
        self.secret == DEVELOPMENT_SECRET
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: DEVELOPMENT_SECRET.to_string(),
            issuer: "warden".to_string(),
            lifetime_secs: DEFAULT_TOKEN_LIFETIME_SECS,
        }
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("lifetime_secs", &self.lifetime_secs)
            .finish()
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Identity handed over by the password verification step, before a token exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub username: String,
    pub role: String,
}

impl VerifiedIdentity {
    pub fn new(user_id: UserId, username: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID as string)
    pub sub: String,
    /// Expiration time (as Unix timestamp)
    pub exp: i64,
    /// Issued at (as Unix timestamp)
    pub iat: i64,
    /// Issuer
    pub iss: String,
    /// Token ID, distinguishes tokens issued to the same user in the same second
    pub jti: String,
    pub user_id: UserId,
    pub username: String,
    pub role: String,
}

impl TokenClaims {
    fn new(identity: &VerifiedIdentity, now: DateTime<Utc>, config: &TokenConfig) -> Self {
        let exp = now + Duration::seconds(config.lifetime_secs);

        Self {
            sub: identity.user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: config.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            user_id: identity.user_id,
            username: identity.username.clone(),
            role: identity.role.clone(),
        }
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn identity(&self) -> VerifiedIdentity {
        VerifiedIdentity::new(self.user_id, self.username.clone(), self.role.clone())
    }
}

// ============================================================================
// Token Codec
// ============================================================================

/// Issues and verifies HS256 bearer tokens.
///
/// Verification is stateless: revocation lives in the session store.
#[derive(Clone)]
pub struct TokenCodec {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    clock: SharedClock,
}

impl TokenCodec {
    pub fn new(config: TokenConfig, clock: SharedClock) -> Self {
        let secret = config.secret.as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            config,
            clock,
        }
    }

    /// Sign a token for an identity that has already been verified
    pub fn issue(&self, identity: &VerifiedIdentity) -> TokenResult<String> {
        let claims = TokenClaims::new(identity, self.clock.now(), &self.config);
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        tracing::debug!(
            user_id = %identity.user_id,
            token = %fingerprint(&token),
            "Issued bearer token"
        );

        Ok(token)
    }

    /// Verify signature, issuer and expiry, returning the embedded claims
    pub fn verify(&self, token: &str) -> TokenResult<TokenClaims> {
        // Expiry is checked against the injected clock below, not the system time
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;

        let claims = decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(TokenError::from_decode)?
            .claims;

        if claims.iss != self.config.issuer {
            return Err(TokenError::InvalidIssuer {
                expected: self.config.issuer.clone(),
                actual: claims.iss,
            });
        }

        if claims.is_expired_at(self.clock.now()) {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Read a token's expiry without checking its signature.
    ///
    /// Only used to annotate revoked tokens; never trust the result for access decisions.
    pub fn peek_expiry(&self, token: &str) -> Option<DateTime<Utc>> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims = HashSet::new();

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .ok()
            .map(|data| data.claims.expires_at())
    }

    pub fn lifetime(&self) -> Duration {
        Duration::seconds(self.config.lifetime_secs)
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

/// Short, stable identifier of a token that is safe to put in logs
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

// ============================================================================
// Tests
// ============================================================================

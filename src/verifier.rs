//! Bearer token verification against the identity provider's signing keys.

use crate::jwks::{KeyResolutionError, KeyResolver};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clock-skew tolerance applied to expiry checks, in seconds.
const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// ID token: `aud` must equal the registered client id.
    Id,
    /// Access token: Cognito omits the client id as `aud`, so the audience
    /// check is disabled for this kind only.
    Access,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token has expired")]
    TokenExpired,

    #[error("invalid audience")]
    InvalidAudience,

    #[error("invalid issuer")]
    InvalidIssuer,

    #[error("malformed or invalid token")]
    Malformed,

    #[error(transparent)]
    KeyResolution(#[from] KeyResolutionError),
}

/// Verified token payload. Provider-supplied attributes beyond the
/// registered claims are kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone)]
pub struct TokenVerifier {
    resolver: KeyResolver,
    issuer: String,
    client_id: String,
}

impl TokenVerifier {
    pub fn new(resolver: KeyResolver, issuer: String, client_id: String) -> Self {
        Self {
            resolver,
            issuer,
            client_id,
        }
    }

    /// Verify signature, issuer, expiry, and (for ID tokens) audience.
    pub async fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, VerifyError> {
        let header = decode_header(token).map_err(|_| VerifyError::Malformed)?;
        let kid = header.kid.ok_or(VerifyError::Malformed)?;

        let key = self.resolver.resolve(&kid).await?;
        let decoding_key =
            DecodingKey::from_rsa_components(&key.n, &key.e).map_err(|_| VerifyError::Malformed)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[&self.issuer]);
        match kind {
            TokenKind::Id => {
                validation.set_audience(&[&self.client_id]);
                // A token with no audience at all must not pass either.
                validation.set_required_spec_claims(&["exp", "aud"]);
            }
            TokenKind::Access => validation.validate_aud = false,
        }

        let data =
            decode::<Claims>(token, &decoding_key, &validation).map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::TokenExpired,
                ErrorKind::InvalidAudience => VerifyError::InvalidAudience,
                ErrorKind::MissingRequiredClaim(claim) if claim.as_str() == "aud" => {
                    VerifyError::InvalidAudience
                }
                ErrorKind::InvalidIssuer => VerifyError::InvalidIssuer,
                _ => VerifyError::Malformed,
            })?;

        Ok(data.claims)
    }
}

//! Identity provider client. The provider owns the credential lifecycle;
//! this module only speaks its wire protocol and classifies its failures.
//!
//! The concrete implementation targets the Cognito user-pool API
//! (`x-amz-json-1.1` with `X-Amz-Target` operation headers). Everything above
//! it depends on the [`IdentityProvider`] trait so handlers can be exercised
//! against a fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdpError {
    #[error("username already exists")]
    UsernameExists,

    #[error("confirmation code mismatch")]
    CodeMismatch,

    /// Wrong password, unknown user, unconfirmed user, or a revoked refresh
    /// token. Collapsed on purpose: clients never learn which.
    #[error("not authorized")]
    NotAuthorized,

    #[error("identity provider error: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpOutcome {
    pub user_sub: String,
    pub user_confirmed: bool,
}

#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<SignUpOutcome, IdpError>;

    async fn confirm_sign_up(&self, username: &str, code: &str) -> Result<(), IdpError>;

    async fn login(&self, username: &str, password: &str) -> Result<AuthTokens, IdpError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<String, IdpError>;
}

pub struct CognitoIdp {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
}

impl CognitoIdp {
    pub fn new(endpoint: String, client_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            client_id,
        }
    }

    async fn call(&self, operation: &str, body: Value) -> Result<Value, IdpError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/x-amz-json-1.1")
            .header(
                "x-amz-target",
                format!("AWSCognitoIdentityProviderService.{operation}"),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| IdpError::Upstream(e.to_string()))?;

        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| IdpError::Upstream(e.to_string()))?;

        if status.is_success() {
            Ok(value)
        } else {
            Err(classify_error(&value))
        }
    }
}

#[async_trait]
impl IdentityProvider for CognitoIdp {
    async fn sign_up(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<SignUpOutcome, IdpError> {
        let value = self
            .call(
                "SignUp",
                json!({
                    "ClientId": self.client_id,
                    "Username": username,
                    "Password": password,
                    "UserAttributes": [{"Name": "email", "Value": email}],
                }),
            )
            .await?;

        let user_sub = value
            .get("UserSub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| IdpError::Upstream("sign-up response missing UserSub".to_string()))?
            .to_string();
        let user_confirmed = value
            .get("UserConfirmed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(SignUpOutcome {
            user_sub,
            user_confirmed,
        })
    }

    async fn confirm_sign_up(&self, username: &str, code: &str) -> Result<(), IdpError> {
        self.call(
            "ConfirmSignUp",
            json!({
                "ClientId": self.client_id,
                "Username": username,
                "ConfirmationCode": code,
            }),
        )
        .await?;
        Ok(())
    }

    async fn login(&self, username: &str, password: &str) -> Result<AuthTokens, IdpError> {
        let value = self
            .call(
                "InitiateAuth",
                json!({
                    "ClientId": self.client_id,
                    "AuthFlow": "USER_PASSWORD_AUTH",
                    "AuthParameters": {"USERNAME": username, "PASSWORD": password},
                }),
            )
            .await?;

        let result = value
            .get("AuthenticationResult")
            .ok_or_else(|| IdpError::Upstream("auth response missing result".to_string()))?;
        let token = |name: &str| -> Result<String, IdpError> {
            result
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| IdpError::Upstream(format!("auth response missing {name}")))
        };

        Ok(AuthTokens {
            id_token: token("IdToken")?,
            access_token: token("AccessToken")?,
            refresh_token: token("RefreshToken")?,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, IdpError> {
        let value = self
            .call(
                "InitiateAuth",
                json!({
                    "ClientId": self.client_id,
                    "AuthFlow": "REFRESH_TOKEN_AUTH",
                    "AuthParameters": {"REFRESH_TOKEN": refresh_token},
                }),
            )
            .await?;

        value
            .pointer("/AuthenticationResult/AccessToken")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| IdpError::Upstream("refresh response missing AccessToken".to_string()))
    }
}

/// Classify a Cognito error payload by its `__type` field. The type may be
/// namespaced (`com.amazon...#NotAuthorizedException`).
fn classify_error(value: &Value) -> IdpError {
    let code = value.get("__type").and_then(|v| v.as_str()).unwrap_or("");
    let code = code.rsplit('#').next().unwrap_or(code);

    match code {
        "UsernameExistsException" => IdpError::UsernameExists,
        "CodeMismatchException" | "ExpiredCodeException" => IdpError::CodeMismatch,
        "NotAuthorizedException" | "UserNotConfirmedException" | "UserNotFoundException" => {
            IdpError::NotAuthorized
        }
        other => {
            let message = value
                .get("message")
                .or_else(|| value.get("Message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unclassified provider error");
            IdpError::Upstream(format!("{other}: {message}"))
        }
    }
}

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPES: &str =
    "https://www.googleapis.com/auth/firebase.database https://www.googleapis.com/auth/userinfo.email";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("no service account configured")]
    NotConfigured,

    #[error("malformed service account: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("failed to parse private key: {0}")]
    KeyParse(jsonwebtoken::errors::Error),

    #[error("failed to sign assertion: {0}")]
    Sign(jsonwebtoken::errors::Error),

    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint answered {0}")]
    Rejected(reqwest::StatusCode),
}

/// The parts of a service-account key file needed to mint an assertion.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Exchanges the configured service account for a bearer token.
///
/// Returns `None` whenever a token cannot be had; the reason is logged.
/// Callers decide whether to continue without one.
pub async fn get_access_token(http: &reqwest::Client, descriptor: Option<&str>) -> Option<String> {
    match request_access_token(http, descriptor).await {
        Ok(token) => Some(token),
        Err(CredentialError::NotConfigured) => {
            debug!("No service account configured, skipping token exchange");
            None
        }
        Err(err) => {
            error!("Could not obtain access token: {}", err);
            None
        }
    }
}

async fn request_access_token(
    http: &reqwest::Client,
    descriptor: Option<&str>,
) -> Result<String, CredentialError> {
    let account: ServiceAccountKey =
        serde_json::from_str(descriptor.ok_or(CredentialError::NotConfigured)?)?;
    let assertion = sign_assertion(&account, Utc::now().timestamp())?;

    let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
    let response = http.post(&account.token_uri).form(&params).send().await?;
    if !response.status().is_success() {
        return Err(CredentialError::Rejected(response.status()));
    }

    let token: TokenResponse = response.json().await?;
    Ok(token.access_token)
}

/// Builds the RS256-signed JWT presented to the token endpoint, valid for one hour from `now`.
pub fn sign_assertion(account: &ServiceAccountKey, now: i64) -> Result<String, CredentialError> {
    let claims = AssertionClaims {
        iss: account.client_email.clone(),
        scope: SCOPES.to_string(),
        aud: account.token_uri.clone(),
        iat: now,
        exp: now + Duration::hours(1).num_seconds(),
    };

    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(CredentialError::KeyParse)?;
    encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(CredentialError::Sign)
}

//! Challenge collaborators and the HTTP implementation.

use crate::{AuthError, AuthResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// A session issued by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// The two-step challenge against the service.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Prove the service is reachable; returns a single-use connectivity token.
    async fn obtain_connectivity_token(&self) -> AuthResult<String>;

    /// Exchange the connectivity token and the user's credential for a session.
    async fn authenticate(&self, connectivity_token: &str, user_id: &str)
        -> AuthResult<SessionGrant>;
}

/// Supplies the credential the service verifies (an identity token signed
/// over the nonce). Provided by the embedding application.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identity_token(&self, user_id: &str, nonce: &str) -> AuthResult<String>;
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    nonce: &'a str,
    user_id: &'a str,
    identity_token: &'a str,
}

/// [`Authenticator`] against `POST {base}/nonces` and `POST {base}/sessions`.
pub struct HttpAuthenticator {
    client: Client,
    base_url: Url,
    identity: Arc<dyn IdentityProvider>,
}

impl HttpAuthenticator {
    pub fn new(
        base_url: Url,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> AuthResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            identity,
        })
    }

    fn endpoint(&self, path: &str) -> AuthResult<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        Ok(base.join(path)?)
    }
}

fn unreachable(e: reqwest::Error) -> AuthError {
    if e.is_connect() || e.is_timeout() {
        AuthError::ConnectivityUnavailable(e.to_string())
    } else {
        AuthError::Http(e)
    }
}

async fn check_status(response: reqwest::Response) -> AuthResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_server_error() {
        return Err(AuthError::Service(status.as_u16()));
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(AuthError::CredentialsRejected(body))
        }
        _ => Err(AuthError::InvalidResponse(format!("HTTP {status}: {body}"))),
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn obtain_connectivity_token(&self) -> AuthResult<String> {
        let url = self.endpoint("nonces")?;
        debug!(url = %url, "Requesting nonce");

        let response = self.client.post(url).send().await.map_err(unreachable)?;
        let response = check_status(response).await.map_err(|e| match e {
            AuthError::Service(status) => {
                AuthError::ConnectivityUnavailable(format!("nonce endpoint returned {status}"))
            }
            other => other,
        })?;
        let body: NonceResponse = response.json().await?;
        Ok(body.nonce)
    }

    async fn authenticate(
        &self,
        connectivity_token: &str,
        user_id: &str,
    ) -> AuthResult<SessionGrant> {
        let identity_token = self
            .identity
            .identity_token(user_id, connectivity_token)
            .await?;
        let url = self.endpoint("sessions")?;

        let response = self
            .client
            .post(url)
            .json(&SessionRequest {
                nonce: connectivity_token,
                user_id,
                identity_token: &identity_token,
            })
            .send()
            .await
            .map_err(unreachable)?;
        let grant: SessionGrant = check_status(response).await?.json().await?;

        if grant.user_id != user_id {
            return Err(AuthError::InvalidResponse(format!(
                "session issued for {} instead of {user_id}",
                grant.user_id
            )));
        }
        info!(user_id = %grant.user_id, expires_at = %grant.expires_at, "Session issued");
        Ok(grant)
    }
}

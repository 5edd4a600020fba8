//! REST authentication and broker discovery
//!
//! The broker exposes two HTTP endpoints the transport consumes as opaque
//! services: a login endpoint that exchanges application credentials for a
//! bearer access token with an expiry, and a dispatcher discovery endpoint
//! that returns the MQTT host list plus a connection token. The session
//! caches the access token and transparently re-logs-in when it is close
//! to expiry.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::clock;
use crate::config::TransportConfig;

/// Production REST base URL.
pub const PROD_BASE_URL: &str = "https://open-api.settrade.com";
/// UAT REST base URL, selected by the `SANDBOX` broker id.
pub const UAT_BASE_URL: &str = "https://open-api-test.settrade.com";

/// Concrete broker id behind the `SANDBOX` alias.
const SANDBOX_BROKER_ID: &str = "098";

/// Socket-level timeout for both REST endpoints.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from the REST session.
#[derive(Debug)]
pub enum AuthError {
    /// Transport-level HTTP failure
    Http(reqwest::Error),
    /// Login endpoint rejected the credentials
    Login { status: u16, body: String },
    /// Discovery endpoint failure
    Discovery { status: u16, body: String },
    /// Discovery returned an empty host list
    NoHosts,
    /// Application secret is not valid base64 after normalization
    InvalidSecret,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "http error: {}", e),
            Self::Login { status, body } => write!(f, "login rejected ({}): {}", status, body),
            Self::Discovery { status, body } => {
                write!(f, "discovery failed ({}): {}", status, body)
            }
            Self::NoHosts => write!(f, "discovery returned no hosts"),
            Self::InvalidSecret => write!(f, "application secret is not valid base64"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Http(e)
    }
}

/// Access token as returned by the login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    /// Unix seconds
    pub expires_at: u64,
}

/// MQTT endpoint material from the discovery endpoint, combined with the
/// token type of the access token that fetched it.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub hosts: Vec<String>,
    pub token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    hosts: Vec<String>,
    token: String,
}

/// Authenticated REST session against the broker's open API.
pub struct RestSession {
    http: reqwest::Client,
    base_url: String,
    broker_id: String,
    app_id: String,
    app_secret: String,
    app_code: String,
    refresh_lead: Duration,
    token: RwLock<Option<AccessToken>>,
}

impl RestSession {
    pub fn new(config: &TransportConfig) -> Result<Self, AuthError> {
        let (broker_id, default_base) = resolve_environment(&config.broker_id);
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let app_secret = normalize_secret(&config.app_secret)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            broker_id,
            app_id: config.app_id.clone(),
            app_secret,
            app_code: config.app_code.clone(),
            refresh_lead: config.token_refresh_lead,
            token: RwLock::new(None),
        })
    }

    /// Effective broker id after environment resolution.
    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    /// Exchanges application credentials for a fresh access token.
    pub async fn login(&self) -> Result<AccessToken, AuthError> {
        let url = format!(
            "{}/api/oam/v1/{}/broker-apps/{}/login",
            self.base_url, self.broker_id, self.app_code
        );
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::Login {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let token: AccessToken = response.json().await?;
        info!(expires_at = token.expires_at, "access token acquired");
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    /// Returns the cached token while it is still comfortably inside its
    /// lifetime, logging in again once the refresh lead is reached.
    pub async fn ensure_token(&self) -> Result<AccessToken, AuthError> {
        if let Some(token) = self.token.read().clone() {
            if clock::wall_secs() + self.refresh_lead.as_secs() < token.expires_at {
                return Ok(token);
            }
            debug!("access token inside refresh lead; re-authenticating");
        }
        self.login().await
    }

    /// Expiry of the currently cached token, if any (unix seconds).
    pub fn token_deadline(&self) -> Option<u64> {
        self.token.read().as_ref().map(|t| t.expires_at)
    }

    /// Fetches the MQTT host list and connection token. The access token
    /// is refreshed first when needed, so a controlled reconnect always
    /// leaves with current credentials.
    pub async fn discover(&self) -> Result<BrokerEndpoint, AuthError> {
        let token = self.ensure_token().await?;
        let url = format!(
            "{}/api/dispatcher/v3/{}/token",
            self.base_url, self.broker_id
        );
        let response = self
            .http
            .get(&url)
            .header(
                "Authorization",
                format!("{} {}", token.token_type, token.access_token),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Discovery {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let wire: DiscoveryResponse = response.json().await?;
        if wire.hosts.is_empty() {
            return Err(AuthError::NoHosts);
        }
        Ok(BrokerEndpoint {
            hosts: wire.hosts,
            token: wire.token,
            token_type: token.token_type,
        })
    }
}

/// `SANDBOX` (any case) selects the UAT environment under its concrete
/// broker id; anything else is a production broker id.
fn resolve_environment(broker_id: &str) -> (String, &'static str) {
    if broker_id.eq_ignore_ascii_case("sandbox") {
        (SANDBOX_BROKER_ID.to_string(), UAT_BASE_URL)
    } else {
        (broker_id.to_string(), PROD_BASE_URL)
    }
}

/// Strips whitespace from a base64 secret, completes missing `=` padding,
/// and verifies the result actually decodes.
fn normalize_secret(raw: &str) -> Result<String, AuthError> {
    let mut secret: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    while secret.len() % 4 != 0 {
        secret.push('=');
    }
    BASE64
        .decode(secret.as_bytes())
        .map_err(|_| AuthError::InvalidSecret)?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_resolves_to_uat() {
        for alias in ["SANDBOX", "sandbox", "SandBox"] {
            let (broker_id, base) = resolve_environment(alias);
            assert_eq!(broker_id, SANDBOX_BROKER_ID);
            assert_eq!(base, UAT_BASE_URL);
        }
    }

    #[test]
    fn test_real_broker_id_resolves_to_prod() {
        let (broker_id, base) = resolve_environment("042");
        assert_eq!(broker_id, "042");
        assert_eq!(base, PROD_BASE_URL);
    }

    #[test]
    fn test_secret_padding_completed() {
        // "Zm9vYmE" is base64 without its trailing "=" padding
        assert_eq!(normalize_secret("Zm9vYmE").unwrap(), "Zm9vYmE=");
    }

    #[test]
    fn test_secret_whitespace_stripped() {
        assert_eq!(normalize_secret("Zm9v\nYmFy\n").unwrap(), "Zm9vYmFy");
        assert_eq!(normalize_secret("  Zm9v YmE= ").unwrap(), "Zm9vYmE=");
    }

    #[test]
    fn test_invalid_secret_rejected() {
        assert!(matches!(
            normalize_secret("not*base64!"),
            Err(AuthError::InvalidSecret)
        ));
    }

    #[test]
    fn test_base_url_override_wins() {
        let config = TransportConfig {
            broker_id: "SANDBOX".to_string(),
            base_url: Some("https://staging.example.test".to_string()),
            ..TransportConfig::default()
        };
        let session = RestSession::new(&config).unwrap();
        assert_eq!(session.base_url, "https://staging.example.test");
        // The broker id alias still resolves even when the URL is overridden
        assert_eq!(session.broker_id(), SANDBOX_BROKER_ID);
    }
}

//! Third-party identity provider seam.
//!
//! The `discord` handshake delegates OAuth mechanics to an
//! [`IdentityProvider`]. The core only needs one operation: exchange an
//! authorization code for a provider-scoped profile. The bundled
//! [`DiscordIdentity`] implementation performs the code exchange and
//! profile fetch over HTTP; tests substitute a fake.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised by identity providers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No provider has been configured for this deployment.
    #[error("Identity provider not configured")]
    NotConfigured,

    /// The provider rejected the authorization code.
    #[error("Code exchange with {provider} failed: {reason}")]
    ExchangeFailed { provider: String, reason: String },

    /// The provider returned a profile the core could not use.
    #[error("Invalid profile from {provider}: {reason}")]
    InvalidProfile { provider: String, reason: String },

    /// Transport-level failure talking to the provider.
    #[error("Identity request failed: {0}")]
    Http(String),
}

impl IdentityError {
    pub fn is_not_configured(&self) -> bool {
        matches!(self, IdentityError::NotConfigured)
    }
}

/// A profile resolved from an identity provider, ready to be linked to an
/// account record.
#[derive(Debug, Clone)]
pub struct IdentityProfile {
    pub provider: String,
    pub provider_account_id: String,
    pub name: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub image: Option<String>,
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    /// Token lifetime in milliseconds, relative to the exchange.
    pub expires_in_ms: Option<i64>,
}

/// Exchange an authorization code for an identity profile.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The provider's wire name, used as the account linkage key.
    fn provider(&self) -> &str;

    async fn exchange(&self, code: &str) -> Result<IdentityProfile, IdentityError>;
}

/// A provider that refuses every exchange. Used when no identity
/// integration is configured; the `session` handshake still works.
pub struct NullIdentity;

#[async_trait]
impl IdentityProvider for NullIdentity {
    fn provider(&self) -> &str {
        "none"
    }

    async fn exchange(&self, _code: &str) -> Result<IdentityProfile, IdentityError> {
        Err(IdentityError::NotConfigured)
    }
}

/// Discord OAuth configuration, read from the environment by the binary.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Discord implementation of [`IdentityProvider`]: authorization-code
/// exchange followed by a `/users/@me` profile fetch.
pub struct DiscordIdentity {
    config: DiscordConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct DiscordToken {
    access_token: String,
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    verified: Option<bool>,
}

impl DiscordIdentity {
    const TOKEN_URL: &'static str = "https://discord.com/api/oauth2/token";
    const PROFILE_URL: &'static str = "https://discord.com/api/users/@me";

    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for DiscordIdentity {
    fn provider(&self) -> &str {
        "discord"
    }

    async fn exchange(&self, code: &str) -> Result<IdentityProfile, IdentityError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("scope", "identify"),
        ];

        let token: DiscordToken = self
            .client
            .post(Self::TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdentityError::ExchangeFailed {
                provider: "discord".to_string(),
                reason: e.to_string(),
            })?;

        let user: DiscordUser = self
            .client
            .get(Self::PROFILE_URL)
            .header(
                "authorization",
                format!("{} {}", token.token_type, token.access_token),
            )
            .send()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdentityError::InvalidProfile {
                provider: "discord".to_string(),
                reason: e.to_string(),
            })?;

        debug!(provider = "discord", account = %user.id, "identity resolved");

        let image = user
            .avatar
            .as_ref()
            .map(|avatar| format!("https://cdn.discordapp.com/avatars/{}/{avatar}", user.id));

        Ok(IdentityProfile {
            provider: "discord".to_string(),
            provider_account_id: user.id,
            name: user.username,
            email: user.email,
            email_verified: user.verified.unwrap_or(false),
            image,
            access_token: token.access_token,
            token_type: token.token_type,
            refresh_token: token.refresh_token,
            scope: token.scope,
            expires_in_ms: token.expires_in.map(|secs| secs * 1000),
        })
    }
}

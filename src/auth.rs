//! Bearer tokens for authenticated upstream routes.
//!
//! Each account's token is refreshed proactively shortly before expiry and
//! reactively after a 401. Refreshes are serialized per account, and a
//! reactive refresh only happens if the rejected token is still the current
//! one, so concurrent callers that all saw the same 401 trigger one refresh.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use mockable::Clock;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{self, Pool, StoredCredentials};
use crate::error::SyncError;

/// Tokens closer than this to expiry are refreshed before use.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Some providers rotate the refresh token; absent means keep the old one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, SyncError>;
}

#[derive(Clone)]
pub struct SsoClient {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl fmt::Debug for SsoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoClient")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl SsoClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let token_url = Url::parse(&cfg.sso.token_url).context("invalid sso.token_url")?;
        let http = Client::builder()
            .user_agent(cfg.esi.user_agent.clone())
            .timeout(Duration::from_secs(cfg.esi.request_timeout_secs))
            .build()
            .context("building SSO http client")?;
        Ok(Self {
            http,
            token_url,
            client_id: cfg.sso.client_id.clone(),
            client_secret: cfg.sso.client_secret.clone(),
        })
    }

    pub fn build_request(&self, refresh_token: &str) -> anyhow::Result<reqwest::Request> {
        let basic = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        self.http
            .post(self.token_url.clone())
            .header("Authorization", format!("Basic {basic}"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .build()
            .context("failed to build token refresh request")
    }
}

#[async_trait]
impl TokenRefresher for SsoClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, SyncError> {
        let request = self
            .build_request(refresh_token)
            .map_err(|e| SyncError::CredentialRefresh(format!("{e:#}")))?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SyncError::CredentialRefresh(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::CredentialRefresh(format!("{status}: {body}")));
        }
        res.json::<TokenGrant>()
            .await
            .map_err(|e| SyncError::CredentialRefresh(format!("invalid token response: {e}")))
    }
}

/// Anything that can hand out a bearer token for one account.
#[async_trait]
pub trait BearerSource: Send + Sync {
    async fn bearer(&self) -> Result<String, SyncError>;

    async fn refresh_after_rejection(&self, stale: &str) -> Result<String, SyncError>;
}

#[derive(Debug, Clone)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: String,
    expires_at: Option<DateTime<Utc>>,
}

pub struct TokenManager {
    character_id: i64,
    pool: Pool,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    state: Mutex<TokenState>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("character_id", &self.character_id)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Load stored credentials, seeding them from `seed_refresh_token` on
    /// first use. No stored and no seed token is a configuration error.
    pub async fn load(
        pool: Pool,
        character_id: i64,
        seed_refresh_token: Option<&str>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let stored = match db::load_credentials(&pool, character_id).await? {
            Some(stored) => stored,
            None => {
                let seed = seed_refresh_token
                    .filter(|t| !t.trim().is_empty())
                    .with_context(|| format!("no credentials for character {character_id}"))?;
                let creds = StoredCredentials {
                    character_id,
                    access_token: None,
                    refresh_token: seed.to_string(),
                    expires_at: None,
                };
                db::save_credentials(&pool, &creds).await?;
                info!(character_id, "seeded credentials from config");
                creds
            }
        };
        Ok(Self {
            character_id,
            pool,
            refresher,
            clock,
            state: Mutex::new(TokenState {
                access_token: stored.access_token,
                refresh_token: stored.refresh_token,
                expires_at: stored.expires_at,
            }),
        })
    }

    /// A token valid for at least `EXPIRY_MARGIN`, refreshing if needed.
    pub async fn bearer(&self) -> Result<String, SyncError> {
        let mut state = self.state.lock().await;
        if let Some(token) = self.usable(&state) {
            return Ok(token);
        }
        debug!(character_id = self.character_id, "access token missing or expiring, refreshing");
        self.refresh_locked(&mut state).await
    }

    /// Refresh after the upstream rejected `stale`. If another caller already
    /// replaced it, the current token is returned without a second refresh.
    pub async fn refresh_after_rejection(&self, stale: &str) -> Result<String, SyncError> {
        let mut state = self.state.lock().await;
        match &state.access_token {
            Some(current) if current != stale => Ok(current.clone()),
            _ => {
                warn!(character_id = self.character_id, "access token rejected, refreshing");
                self.refresh_locked(&mut state).await
            }
        }
    }

    fn usable(&self, state: &TokenState) -> Option<String> {
        let token = state.access_token.as_ref()?;
        let expires_at = state.expires_at?;
        let margin = chrono::Duration::from_std(EXPIRY_MARGIN).ok()?;
        (expires_at > self.clock.utc() + margin).then(|| token.clone())
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<String, SyncError> {
        let grant = self.refresher.refresh(&state.refresh_token).await?;
        let expires_at = self.clock.utc() + chrono::Duration::seconds(grant.expires_in.max(0));
        state.access_token = Some(grant.access_token.clone());
        state.expires_at = Some(expires_at);
        if let Some(rotated) = grant.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh_token = rotated;
        }
        db::save_credentials(
            &self.pool,
            &StoredCredentials {
                character_id: self.character_id,
                access_token: state.access_token.clone(),
                refresh_token: state.refresh_token.clone(),
                expires_at: state.expires_at,
            },
        )
        .await?;
        info!(character_id = self.character_id, %expires_at, "access token refreshed");
        Ok(grant.access_token)
    }
}

#[async_trait]
impl BearerSource for TokenManager {
    async fn bearer(&self) -> Result<String, SyncError> {
        TokenManager::bearer(self).await
    }

    async fn refresh_after_rejection(&self, stale: &str) -> Result<String, SyncError> {
        TokenManager::refresh_after_rejection(self, stale).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MutableClock;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, SyncError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(!refresh_token.is_empty());
            Ok(TokenGrant {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_in: 1200,
            })
        }
    }

    async fn setup() -> (TokenManager, Arc<CountingRefresher>, Arc<MutableClock>, Pool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(MutableClock::new(
            Utc.with_ymd_and_hms(2026, 4, 4, 4, 0, 0).unwrap(),
        ));
        let manager = TokenManager::load(
            pool.clone(),
            90000001,
            Some("seed"),
            refresher.clone(),
            clock.clone(),
        )
        .await
        .unwrap();
        (manager, refresher, clock, pool)
    }

    #[tokio::test]
    async fn refreshes_proactively_near_expiry() {
        let (manager, refresher, clock, pool) = setup().await;
        assert_eq!(manager.bearer().await.unwrap(), "access-1");
        assert_eq!(manager.bearer().await.unwrap(), "access-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(1200 - 30));
        assert_eq!(manager.bearer().await.unwrap(), "access-2");

        let stored = db::load_credentials(&pool, 90000001).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, "refresh-2");
        assert_eq!(stored.access_token.as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn concurrent_rejections_refresh_once() {
        let (manager, refresher, _clock, _pool) = setup().await;
        let manager = Arc::new(manager);
        let stale = manager.bearer().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let stale = stale.clone();
            tasks.push(tokio::spawn(async move {
                manager.refresh_after_rejection(&stale).await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "access-2");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_credentials_is_an_error() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let result = TokenManager::load(
            pool,
            5,
            None,
            refresher,
            Arc::new(mockable::DefaultClock),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn sso_request_uses_basic_auth_form() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let client = SsoClient::new(&cfg).unwrap();
        let request = client.build_request("rt-1").unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        let auth = request
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap();
        let expected = STANDARD.encode(format!("{}:{}", cfg.sso.client_id, cfg.sso.client_secret));
        assert_eq!(auth, format!("Basic {expected}"));
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let body = std::str::from_utf8(body).unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=rt-1"));
    }
}

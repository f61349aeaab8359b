//! Configuration loader and validator for the ESI -> content store syncer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::EntityType;
use crate::resilience::{BreakerSettings, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub esi: Esi,
    pub sso: Sso,
    pub content_store: ContentStore,
    pub cache: Cache,
    pub breakers: Breakers,
    pub competition: Competition,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub max_concurrency: usize,
    pub run_timeout_secs: u64,
}

/// Upstream (ESI) API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Esi {
    pub base_url: String,
    pub user_agent: String,
    pub max_pages: u32,
    pub low_water_mark: u32,
    pub request_timeout_secs: u64,
    pub retry: Retry,
}

/// Retry policy knobs shared by both outbound APIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// SSO application used to refresh account tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sso {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Content store (WordPress REST) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentStore {
    pub base_url: String,
    pub token: String,
    pub external_id_key: String,
    pub post_types: PostTypes,
    pub retry: Retry,
}

/// Content-store record type per entity type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostTypes {
    pub character: String,
    pub corporation: String,
    pub blueprint: String,
    pub planet: String,
    pub contract: String,
}

/// Cache persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    pub flush_interval_ms: u64,
    pub flush_threshold: usize,
    pub ttl_secs: CacheTtls,
}

/// TTL per logical cache namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheTtls {
    pub esi: u64,
    pub public_contracts: u64,
    pub locations: u64,
    pub structures: u64,
    pub contract_items: u64,
}

/// Circuit breaker settings, one per failure domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breakers {
    pub upstream: Breaker,
    pub content_store: Breaker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breaker {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

/// Undercut policy for contract competition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Competition {
    pub undercut_step: f64,
    pub price_decimals: u32,
}

/// One synced account. The refresh token seeds the credential table on first run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub character_id: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and its cache dir).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.cache_dir())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.data_dir)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.data_dir().join("last_run.json")
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/esi-sync.db", self.app.data_dir))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.app.run_timeout_secs)
    }

    pub fn post_type(&self, entity: EntityType) -> &str {
        self.content_store.post_types.for_entity(entity)
    }

    pub fn upstream_breaker(&self) -> BreakerSettings {
        self.breakers.upstream.settings()
    }

    pub fn content_store_breaker(&self) -> BreakerSettings {
        self.breakers.content_store.settings()
    }
}

impl PostTypes {
    pub fn for_entity(&self, entity: EntityType) -> &str {
        match entity {
            EntityType::Character => &self.character,
            EntityType::Corporation => &self.corporation,
            EntityType::Blueprint => &self.blueprint,
            EntityType::Planet => &self.planet,
            EntityType::Contract => &self.contract,
        }
    }
}

impl Retry {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Breaker {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_concurrency == 0 {
        return Err(ConfigError::Invalid("app.max_concurrency must be > 0"));
    }
    if cfg.app.run_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.run_timeout_secs must be > 0"));
    }

    if reqwest::Url::parse(&cfg.esi.base_url).is_err() {
        return Err(ConfigError::Invalid("esi.base_url must be a valid URL"));
    }
    if cfg.esi.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("esi.user_agent must be non-empty"));
    }
    if cfg.esi.max_pages == 0 {
        return Err(ConfigError::Invalid("esi.max_pages must be > 0"));
    }
    if cfg.esi.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("esi.retry.max_attempts must be > 0"));
    }

    if reqwest::Url::parse(&cfg.sso.token_url).is_err() {
        return Err(ConfigError::Invalid("sso.token_url must be a valid URL"));
    }
    if cfg.sso.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("sso.client_id must be non-empty"));
    }
    if cfg.sso.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("sso.client_secret must be non-empty"));
    }

    let cs = &cfg.content_store;
    if reqwest::Url::parse(&cs.base_url).is_err() {
        return Err(ConfigError::Invalid("content_store.base_url must be a valid URL"));
    }
    if cs.token.trim().is_empty() {
        return Err(ConfigError::Invalid("content_store.token must be non-empty"));
    }
    if cs.external_id_key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "content_store.external_id_key must be non-empty",
        ));
    }
    if cs.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "content_store.retry.max_attempts must be > 0",
        ));
    }
    let pt = &cs.post_types;
    for value in [
        &pt.character,
        &pt.corporation,
        &pt.blueprint,
        &pt.planet,
        &pt.contract,
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "content_store.post_types entries must be non-empty",
            ));
        }
    }

    if cfg.cache.flush_interval_ms == 0 {
        return Err(ConfigError::Invalid("cache.flush_interval_ms must be > 0"));
    }
    if cfg.cache.flush_threshold == 0 {
        return Err(ConfigError::Invalid("cache.flush_threshold must be > 0"));
    }

    if cfg.breakers.upstream.failure_threshold == 0 {
        return Err(ConfigError::Invalid(
            "breakers.upstream.failure_threshold must be > 0",
        ));
    }
    if cfg.breakers.content_store.failure_threshold == 0 {
        return Err(ConfigError::Invalid(
            "breakers.content_store.failure_threshold must be > 0",
        ));
    }

    if !(cfg.competition.undercut_step > 0.0) {
        return Err(ConfigError::Invalid("competition.undercut_step must be > 0"));
    }
    if cfg.competition.price_decimals > 4 {
        return Err(ConfigError::Invalid("competition.price_decimals must be <= 4"));
    }

    for account in &cfg.accounts {
        if account.character_id <= 0 {
            return Err(ConfigError::Invalid("accounts[].character_id must be > 0"));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  max_concurrency: 4
  run_timeout_secs: 900

esi:
  base_url: "https://esi.evetech.net/latest/"
  user_agent: "esi-sync/0.1 (ops@example.invalid)"
  max_pages: 50
  low_water_mark: 20
  request_timeout_secs: 30
  retry:
    max_attempts: 4
    base_delay_ms: 500
    max_delay_ms: 30000

sso:
  token_url: "https://login.eveonline.com/v2/oauth/token"
  client_id: "YOUR_SSO_CLIENT_ID"
  client_secret: "YOUR_SSO_CLIENT_SECRET"

content_store:
  base_url: "https://example.com/wp-json/wp/v2/"
  token: "YOUR_CONTENT_STORE_TOKEN"
  external_id_key: "_eve_external_id"
  post_types:
    character: "eve_character"
    corporation: "eve_corporation"
    blueprint: "eve_blueprint"
    planet: "eve_planet"
    contract: "eve_contract"
  retry:
    max_attempts: 3
    base_delay_ms: 250
    max_delay_ms: 5000

cache:
  flush_interval_ms: 5000
  flush_threshold: 64
  ttl_secs:
    esi: 3600
    public_contracts: 300
    locations: 604800
    structures: 86400
    contract_items: 2592000

breakers:
  upstream:
    failure_threshold: 5
    recovery_timeout_secs: 60
  content_store:
    failure_threshold: 3
    recovery_timeout_secs: 30

competition:
  undercut_step: 1.0
  price_decimals: 2

accounts:
  - character_id: 90000001
    refresh_token: "SEED_REFRESH_TOKEN"
  - character_id: 90000002
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.accounts.len(), 2);
        assert!(cfg.accounts[1].refresh_token.is_none());
    }

    #[test]
    fn invalid_concurrency() {
        let mut cfg = example_cfg();
        cfg.app.max_concurrency = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.max_concurrency")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_sso_credentials() {
        let mut cfg = example_cfg();
        cfg.sso.client_secret = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("sso.client_secret")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_urls_and_post_types() {
        let mut cfg = example_cfg();
        cfg.esi.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.content_store.post_types.planet = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("post_types")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.competition.undercut_step = 0.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn post_type_lookup_follows_entity() {
        let cfg = example_cfg();
        assert_eq!(cfg.post_type(EntityType::Contract), "eve_contract");
        assert_eq!(cfg.post_type(EntityType::Blueprint), "eve_blueprint");
    }

    #[test]
    fn ensure_dirs_creates_cache_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.join("cache").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.accounts[0].character_id, 90000001);
        assert_eq!(cfg.esi.retry.policy().max_attempts, 4);
    }
}

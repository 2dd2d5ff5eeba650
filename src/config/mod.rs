use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
    value::magic::RelativePathBuf,
};
use platform_dirs::AppDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    auth::scope::Scope,
    config::files::SecretFileProvider,
    webhook::model::{EventType, RetryPolicy},
};

pub(crate) mod duration;
pub(crate) mod files;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListenConfig {
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PrometheusConfig {
    pub address: String,
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9080,
        }
    }
}

/// A user known to the built-in account service.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserConfig {
    pub id: u64,
    pub username: String,
    /// Unix crypt style hash, as produced by `pwhash`.
    pub password: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Role per project. The `*` key applies to every project.
    #[serde(default)]
    pub projects: BTreeMap<String, Scope>,
}

/// A long-lived access token. Only the SHA-256 of the token is configured.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccessTokenConfig {
    pub id: String,
    pub user_id: u64,
    pub token_sha256: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthenticationConfig {
    pub realm: String,
    /// HS256 secret shared with the session token issuer.
    pub session_secret: String,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub tokens: Vec<AccessTokenConfig>,
}

const fn default_true() -> bool {
    true
}

const fn default_idle_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(with = "crate::config::duration", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "crate::config::duration", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_workers() -> usize {
    8
}

const fn default_queue_size() -> usize {
    256
}

const fn default_history_max_age() -> Duration {
    Duration::from_secs(60 * 60 * 24 * 7)
}

const fn default_history_max_events() -> usize {
    1000
}

const fn default_history_sweep_interval() -> Duration {
    Duration::from_secs(60 * 10)
}

/// How much finished delivery history is kept. Events still pending or
/// retrying are never pruned.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(with = "crate::config::duration", default = "default_history_max_age")]
    pub max_age: Duration,
    /// Finished events kept per webhook, newest first.
    #[serde(default = "default_history_max_events")]
    pub max_events: usize,
    #[serde(with = "crate::config::duration", default = "default_history_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_age: default_history_max_age(),
            max_events: default_history_max_events(),
            sweep_interval: default_history_sweep_interval(),
        }
    }
}

/// A webhook subscription declared in configuration. Seeded into the
/// webhook store at startup, keyed by project and name.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookSeed {
    pub project: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: Vec<EventType>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(with = "crate::config::duration", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "crate::config::duration", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub subscriptions: Vec<WebhookSeed>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            timeout: default_timeout(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            retry: RetryPolicy::default(),
            history: HistoryConfig::default(),
            subscriptions: vec![],
        }
    }
}

const fn default_gc_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_minimum_age() -> Duration {
    Duration::from_secs(60 * 60 * 12)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GarbageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "crate::config::duration", default = "default_gc_interval")]
    pub interval: Duration,
    /// Blobs that were never referenced are kept at least this long.
    #[serde(with = "crate::config::duration", default = "default_minimum_age")]
    pub minimum_age: Duration,
}

impl Default for GarbageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_gc_interval(),
            minimum_age: default_minimum_age(),
        }
    }
}

/// Tags matching both expressions can be pushed once and never rebound or
/// deleted.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImmutableTagRule {
    #[serde(with = "serde_regex")]
    pub repository: Regex,
    #[serde(with = "serde_regex")]
    pub tag: Regex,
}

impl ImmutableTagRule {
    pub fn matches(&self, repository: &str, tag: &str) -> bool {
        self.repository.is_match(repository) && self.tag.is_match(tag)
    }
}

const fn default_broker_capacity() -> usize {
    64
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Buffer per live subscriber. Events are dropped for subscribers that
    /// fall this far behind.
    #[serde(default = "default_broker_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_broker_capacity(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    pub url: String,
    pub registry: ListenConfig,
    pub prometheus: PrometheusConfig,
    pub authentication: Option<AuthenticationConfig>,
    #[serde(serialize_with = "RelativePathBuf::serialize_original")]
    pub storage: RelativePathBuf,
    pub uploads: UploadConfig,
    pub webhooks: WebhookConfig,
    pub gc: GarbageConfig,
    pub immutable_tags: Vec<ImmutableTagRule>,
    pub events: EventsConfig,
}

impl Configuration {
    pub fn figment(configs: Vec<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let fig = match AppDirs::new(Some("wharf"), true) {
            Some(app_dirs) => {
                let config_path = app_dirs.config_dir.join("config.yaml");
                match config_path.exists() {
                    true => fig.admerge(SecretFileProvider::new(Yaml::file(config_path))),
                    false => fig,
                }
            }
            None => fig,
        };

        let fig = configs.into_iter().fold(fig, |fig, config_path| {
            fig.admerge(SecretFileProvider::new(Yaml::file(config_path)))
        });

        fig.admerge(SecretFileProvider::new(
            Env::prefixed("WHARF_").split("__"),
        ))
    }

    pub fn config(figment: Figment) -> Result<Configuration> {
        let config: Configuration = figment.extract().context("Failed to load configuration")?;

        if config.webhooks.workers == 0 {
            bail!("webhooks.workers must be at least 1");
        }

        if config.webhooks.queue_size == 0 {
            bail!("webhooks.queue_size must be at least 1");
        }

        if config.webhooks.retry.max_attempts == 0 {
            bail!("webhooks.retry.max_attempts must be at least 1");
        }

        if let Some(authentication) = &config.authentication {
            if authentication.session_secret.len() < 16 {
                bail!("authentication.session_secret must be at least 16 bytes");
            }
        }

        Ok(config)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage.relative()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            url: "http://localhost".into(),
            registry: ListenConfig::default(),
            prometheus: PrometheusConfig::default(),
            authentication: None,
            storage: "var".to_string().into(),
            uploads: UploadConfig::default(),
            webhooks: WebhookConfig::default(),
            gc: GarbageConfig::default(),
            immutable_tags: vec![],
            events: EventsConfig::default(),
        }
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use decant_adapters::{ExtractorConfig, RedditCredentials};
use decant_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;

use crate::view::DEFAULT_LOWEST_PER_ITEM;

const DEFAULT_CONFIG_FILE: &str = "decant.yaml";

/// Runtime settings. Loaded from an optional YAML file, then overridden by
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub subreddit: String,
    pub keyword: String,
    pub catalog_path: PathBuf,
    pub listings_path: PathBuf,
    pub lowest_prices_path: PathBuf,
    pub lowest_per_item: usize,
    pub cleanup_enabled: bool,
    pub cleanup_cron: String,
    pub reconnect_backoff_secs: u64,
    pub poll_interval_secs: u64,
    pub extraction_timeout_secs: u64,
    pub extraction_retries: usize,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub reddit_user_agent: String,
    pub reddit_requests_per_minute: u32,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subreddit: "tester_jethya".to_string(),
            keyword: "wts".to_string(),
            catalog_path: PathBuf::from("montagne_official_data.json"),
            listings_path: PathBuf::from("listings.json"),
            lowest_prices_path: PathBuf::from("lowest_prices.json"),
            lowest_per_item: DEFAULT_LOWEST_PER_ITEM,
            cleanup_enabled: true,
            cleanup_cron: "0 15 1 * * *".to_string(),
            reconnect_backoff_secs: 10,
            poll_interval_secs: 5,
            extraction_timeout_secs: 30,
            extraction_retries: 2,
            llm_base_url: "https://api.deepseek.com/v1".to_string(),
            llm_model: "deepseek-chat".to_string(),
            llm_api_key: None,
            reddit_client_id: None,
            reddit_client_secret: None,
            reddit_user_agent: "decant/0.1".to_string(),
            reddit_requests_per_minute: 60,
            http_timeout_secs: 20,
            web_port: 5000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// An explicit `DECANT_CONFIG` must name a readable file. Without it,
    /// `./decant.yaml` is used when present and defaults otherwise.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("DECANT_CONFIG") {
            Some(path) => Self::from_yaml_file(Path::new(&path))
                .with_context(|| format!("loading DECANT_CONFIG={path}"))?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_yaml_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(&lookup);
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = lookup("DECANT_SUBREDDIT") {
            self.subreddit = v;
        }
        if let Some(v) = lookup("DECANT_KEYWORD") {
            self.keyword = v;
        }
        if let Some(v) = lookup("DECANT_CATALOG") {
            self.catalog_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DECANT_LISTINGS") {
            self.listings_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DECANT_LOWEST_PRICES") {
            self.lowest_prices_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DECANT_CLEANUP_ENABLED") {
            self.cleanup_enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = lookup("DECANT_CLEANUP_CRON") {
            self.cleanup_cron = v;
        }
        if let Some(v) = parsed("DECANT_RECONNECT_BACKOFF_SECS") {
            self.reconnect_backoff_secs = v;
        }
        if let Some(v) = parsed("DECANT_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = v;
        }
        if let Some(v) = parsed("DECANT_EXTRACTION_TIMEOUT_SECS") {
            self.extraction_timeout_secs = v;
        }
        if let Some(v) = lookup("DECANT_LLM_BASE_URL") {
            self.llm_base_url = v;
        }
        if let Some(v) = lookup("DECANT_LLM_MODEL") {
            self.llm_model = v;
        }
        if let Some(v) = lookup("DEEPSEEK_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Some(v) = lookup("PRAW_CLIENT_ID") {
            self.reddit_client_id = Some(v);
        }
        if let Some(v) = lookup("PRAW_CLIENT_SECRET") {
            self.reddit_client_secret = Some(v);
        }
        if let Some(v) = lookup("PRAW_USER_AGENT") {
            self.reddit_user_agent = v;
        }
        if let Some(v) = parsed("DECANT_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v;
        }
        if let Some(v) = lookup("PORT").and_then(|v| v.trim().parse().ok()) {
            self.web_port = v;
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn extraction_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.extraction_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            base_url: self.llm_base_url.clone(),
            api_key: self.llm_api_key.clone(),
            model: self.llm_model.clone(),
            timeout: Duration::from_secs(self.extraction_timeout_secs.max(1)),
            ..ExtractorConfig::default()
        }
    }

    /// Client settings for the extraction endpoint. Retries are owned by the
    /// pipeline, so the client itself never retries.
    pub fn llm_http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.extraction_timeout_secs.max(1)),
            backoff: BackoffPolicy::none(),
            global_concurrency: 1,
            ..HttpClientConfig::default()
        }
    }

    pub fn reddit_http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.reddit_user_agent.clone()),
            token_bucket: (self.reddit_requests_per_minute > 0).then(|| TokenBucketConfig {
                capacity: self.reddit_requests_per_minute,
                refill_every: (Duration::from_secs(60) / self.reddit_requests_per_minute)
                    .max(Duration::from_millis(1)),
            }),
            ..HttpClientConfig::default()
        }
    }

    pub fn reddit_credentials(&self) -> Result<RedditCredentials> {
        let client_id = self
            .reddit_client_id
            .clone()
            .context("PRAW_CLIENT_ID is not set")?;
        let client_secret = self
            .reddit_client_secret
            .clone()
            .context("PRAW_CLIENT_SECRET is not set")?;
        Ok(RedditCredentials {
            client_id,
            client_secret,
            user_agent: self.reddit_user_agent.clone(),
        })
    }
}

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use decant_core::RawPost;
use decant_storage::{FetchError, HttpFetcher};
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{LookupError, PostStatus, PostStatusLookup, PostStream, StreamError};

const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";
const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const WEB_BASE: &str = "https://www.reddit.com";

/// Matches the size of the seen-id window kept by common Reddit stream clients.
const SEEN_CAPACITY: usize = 301;

#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_ttl")]
    expires_in: u64,
}

fn default_token_ttl() -> u64 {
    3600
}

/// Application-only OAuth client for the Reddit API.
#[derive(Debug)]
pub struct RedditClient {
    http: Arc<HttpFetcher>,
    credentials: RedditCredentials,
    token: Mutex<Option<CachedToken>>,
    api_base: String,
    token_url: String,
}

impl RedditClient {
    pub fn new(http: Arc<HttpFetcher>, credentials: RedditCredentials) -> Self {
        Self {
            http,
            credentials,
            token: Mutex::new(None),
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }

    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let creds = &self.credentials;
        let response: TokenResponse = self
            .http
            .send_json("reddit_token", |client| {
                client
                    .post(&self.token_url)
                    .basic_auth(&creds.client_id, Some(&creds.client_secret))
                    .header(USER_AGENT, &creds.user_agent)
                    .form(&[("grant_type", "client_credentials")])
            })
            .await?;

        let ttl = Duration::from_secs(response.expires_in.saturating_sub(60).max(60));
        debug!(ttl_secs = ttl.as_secs(), "refreshed reddit access token");
        let access_token = response.access_token.clone();
        *cached = Some(CachedToken {
            access_token: response.access_token,
            expires_at: Instant::now() + ttl,
        });
        Ok(access_token)
    }

    /// GET `path` (relative to the API base) with a bearer token.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.api_base, path);
        let result = self
            .http
            .send_json("reddit_api", |client| {
                client
                    .get(&url)
                    .bearer_auth(&token)
                    .header(USER_AGENT, &self.credentials.user_agent)
            })
            .await;

        if matches!(result, Err(FetchError::HttpStatus { status: 401, .. })) {
            self.token.lock().await.take();
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    #[serde(default = "Vec::new")]
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    data: T,
}

impl<T> Listing<T> {
    fn into_items(self) -> Vec<T> {
        self.data.children.into_iter().map(|t| t.data).collect()
    }
}

/// Subset of a Reddit submission (`t3`) payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionData {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub removed_by_category: Option<String>,
}

impl SubmissionData {
    pub fn into_post(self) -> RawPost {
        let permalink = if self.permalink.is_empty() {
            self.url
        } else {
            format!("{WEB_BASE}{}", self.permalink)
        };
        RawPost {
            id: self.id,
            title: self.title,
            body: self.selftext,
            flair: self.link_flair_text,
            permalink,
            created_at: DateTime::<Utc>::from_timestamp(self.created_utc as i64, 0).unwrap_or_default(),
        }
    }

    pub fn status(&self) -> PostStatus {
        PostStatus {
            flair: self.link_flair_text.clone(),
            removed: self.removed_by_category.is_some(),
        }
    }
}

/// Bounded set of recently seen ids; the oldest id is evicted first.
#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Returns `false` when `id` was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Polls a subreddit's newest submissions and yields unseen posts oldest-first.
///
/// The first successful poll only primes the seen set, so posts that existed
/// before startup are skipped. Ids seen again after a reconnect are dropped.
pub struct RedditSubmissionStream {
    client: Arc<RedditClient>,
    subreddit: String,
    poll_interval: Duration,
    seen: SeenSet,
    pending: VecDeque<RawPost>,
    primed: bool,
}

impl RedditSubmissionStream {
    pub fn new(client: Arc<RedditClient>, subreddit: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client,
            subreddit: subreddit.into(),
            poll_interval,
            seen: SeenSet::new(SEEN_CAPACITY),
            pending: VecDeque::new(),
            primed: false,
        }
    }

    /// Folds one newest-first page into the queue, returning how many posts were queued.
    pub fn absorb(&mut self, newest_first: Vec<SubmissionData>) -> usize {
        let mut queued = 0;
        for submission in newest_first.into_iter().rev() {
            if !self.seen.insert(&submission.id) {
                continue;
            }
            if self.primed {
                self.pending.push_back(submission.into_post());
                queued += 1;
            }
        }
        if !self.primed {
            info!(subreddit = %self.subreddit, skipped = self.seen.len(), "skipping existing submissions");
            self.primed = true;
        }
        queued
    }
}

#[async_trait]
impl PostStream for RedditSubmissionStream {
    async fn next_post(&mut self) -> Result<Option<RawPost>, StreamError> {
        loop {
            if let Some(post) = self.pending.pop_front() {
                return Ok(Some(post));
            }
            if self.primed {
                tokio::time::sleep(self.poll_interval).await;
            }
            let path = format!("/r/{}/new?limit=100&raw_json=1", self.subreddit);
            let listing: Listing<SubmissionData> = self.client.get_json(&path).await?;
            let queued = self.absorb(listing.into_items());
            if queued > 0 {
                debug!(subreddit = %self.subreddit, queued, "queued new submissions");
            }
        }
    }
}

/// Revalidates posts through `/api/info`.
pub struct RedditStatusLookup {
    client: Arc<RedditClient>,
}

impl RedditStatusLookup {
    pub fn new(client: Arc<RedditClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PostStatusLookup for RedditStatusLookup {
    async fn post_status(&self, post_id: &str) -> Result<PostStatus, LookupError> {
        let path = format!("/api/info?id=t3_{post_id}&raw_json=1");
        let listing: Listing<SubmissionData> = self
            .client
            .get_json(&path)
            .await
            .map_err(|err| LookupError::from_fetch(post_id, err))?;

        listing
            .into_items()
            .into_iter()
            .find(|s| s.id == post_id)
            .map(|s| s.status())
            .ok_or_else(|| LookupError::NotFound(post_id.to_string()))
    }
}

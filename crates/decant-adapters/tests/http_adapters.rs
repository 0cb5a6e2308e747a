use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use decant_adapters::{
    ChatCompletionsExtractor, ExtractionError, Extractor, ExtractorConfig, LookupError,
    PostStatusLookup, PostStream, RedditClient, RedditCredentials, RedditStatusLookup,
    RedditSubmissionStream, EXTRACTION_PROMPT,
};
use decant_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::{json, Value};

async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })
        .unwrap(),
    )
}

fn extractor(base_url: String, timeout: Duration) -> ChatCompletionsExtractor {
    ChatCompletionsExtractor::new(
        fetcher(),
        ExtractorConfig {
            base_url,
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            temperature: 0.1,
            timeout,
        },
    )
}

fn completion(content: Value) -> Json<Value> {
    Json(json!({ "choices": [{ "message": { "content": content } }] }))
}

#[tokio::test]
async fn hanging_completion_endpoint_times_out() {
    let router = Router::new().route(
        "/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            completion(json!("[]"))
        }),
    );
    let base = spawn_stub(router).await;

    let err = extractor(base, Duration::from_millis(200))
        .extract("Selling Aventus clone 30ml $25")
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::Timeout(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn prose_reply_yields_no_listings() {
    let router = Router::new().route(
        "/chat/completions",
        post(|| async { completion(json!("Sorry, I could not find any perfumes in this post.")) }),
    );
    let base = spawn_stub(router).await;

    let listings = extractor(base, Duration::from_secs(5))
        .extract("Looking to swap, no prices yet")
        .await
        .unwrap();
    assert!(listings.is_empty());
}

#[tokio::test]
async fn missing_message_content_is_an_empty_response() {
    let router = Router::new().route(
        "/chat/completions",
        post(|| async { completion(Value::Null) }),
    );
    let base = spawn_stub(router).await;

    let err = extractor(base, Duration::from_secs(5))
        .extract("anything")
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::EmptyResponse));
}

#[derive(Default)]
struct CapturedRequest {
    authorization: Option<String>,
    body: Value,
}

#[tokio::test]
async fn completion_request_carries_bearer_and_fixed_prompt() {
    let captured = Arc::new(Mutex::new(CapturedRequest::default()));
    let router = Router::new()
        .route(
            "/chat/completions",
            post(
                |State(captured): State<Arc<Mutex<CapturedRequest>>>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    let mut slot = captured.lock().unwrap();
                    slot.authorization = headers
                        .get(header::AUTHORIZATION)
                        .map(|v| v.to_str().unwrap().to_string());
                    slot.body = body;
                    completion(json!(
                        "```json\n[{\"name\": \"Aventus Clone\", \"quantity\": \"30ml\", \"cost\": \"$25\", \"currency\": \"USD\"}]\n```"
                    ))
                },
            ),
        )
        .with_state(captured.clone());
    // Trailing slash on the base must not produce `//chat/completions`.
    let base = format!("{}/", spawn_stub(router).await);

    let post_text = "WTS Aventus Clone 30ml $25 shipped";
    let listings = extractor(base, Duration::from_secs(5))
        .extract(post_text)
        .await
        .unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].name, "Aventus Clone");
    assert_eq!(listings[0].quantity, "30ml");
    assert_eq!(listings[0].cost, 25.0);

    let seen = captured.lock().unwrap();
    assert_eq!(seen.authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(seen.body["model"], "test-model");
    let messages = seen.body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], EXTRACTION_PROMPT);
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[1]["content"], post_text);
}

/// Minimal stand-in for the Reddit OAuth and listing endpoints.
#[derive(Default)]
struct RedditStub {
    token_requests: AtomicUsize,
    new_requests: AtomicUsize,
    reject_next_api_call: AtomicBool,
    bearer_tokens: Mutex<Vec<String>>,
    new_pages: Vec<Value>,
}

impl RedditStub {
    fn with_pages(new_pages: Vec<Value>) -> Self {
        Self {
            new_pages,
            ..Self::default()
        }
    }

    /// Records the bearer token, or answers 401 once when asked to.
    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        if self.reject_next_api_call.swap(false, Ordering::SeqCst) {
            return Err(StatusCode::UNAUTHORIZED.into_response());
        }
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        match token {
            Some(token) => {
                self.bearer_tokens.lock().unwrap().push(token);
                Ok(())
            }
            None => Err(StatusCode::UNAUTHORIZED.into_response()),
        }
    }
}

fn submission(id: &str, flair: Option<&str>) -> Value {
    json!({
        "data": {
            "id": id,
            "title": format!("[WTS] post {id}"),
            "selftext": "Aventus clone 30ml $25",
            "link_flair_text": flair,
            "permalink": format!("/r/fragranceswap/comments/{id}/post/"),
            "created_utc": 1_700_000_000.0,
            "removed_by_category": null
        }
    })
}

fn listing(children: Vec<Value>) -> Value {
    json!({ "kind": "Listing", "data": { "children": children } })
}

async fn token_handler(State(stub): State<Arc<RedditStub>>, headers: HeaderMap) -> Response {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    if !basic {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = stub.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "access_token": format!("token-{n}"), "expires_in": 3600 })).into_response()
}

async fn info_handler(
    State(stub): State<Arc<RedditStub>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = stub.authorize(&headers) {
        return resp;
    }
    match params.get("id").map(String::as_str) {
        Some("t3_private") => StatusCode::FORBIDDEN.into_response(),
        Some("t3_deleted") => StatusCode::NOT_FOUND.into_response(),
        Some("t3_gone") => Json(listing(Vec::new())).into_response(),
        Some("t3_sold") => Json(listing(vec![submission("sold", Some("Sold"))])).into_response(),
        Some(id) => {
            let id = id.trim_start_matches("t3_");
            Json(listing(vec![submission(id, Some("Available"))])).into_response()
        }
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn new_handler(State(stub): State<Arc<RedditStub>>, headers: HeaderMap) -> Response {
    if let Err(resp) = stub.authorize(&headers) {
        return resp;
    }
    let n = stub.new_requests.fetch_add(1, Ordering::SeqCst);
    let page = stub.new_pages[n.min(stub.new_pages.len() - 1)].clone();
    Json(page).into_response()
}

async fn reddit_client(stub: Arc<RedditStub>) -> Arc<RedditClient> {
    let router = Router::new()
        .route("/api/v1/access_token", post(token_handler))
        .route("/api/info", get(info_handler))
        .route("/r/{subreddit}/new", get(new_handler))
        .with_state(stub);
    let base = spawn_stub(router).await;
    let credentials = RedditCredentials {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        user_agent: "decant-tests/0.1".to_string(),
    };
    Arc::new(
        RedditClient::new(fetcher(), credentials)
            .with_endpoints(base.clone(), format!("{base}/api/v1/access_token")),
    )
}

#[tokio::test]
async fn info_lookup_maps_gone_posts() {
    let stub = Arc::new(RedditStub::default());
    let lookup = RedditStatusLookup::new(reddit_client(stub).await);

    let err = lookup.post_status("gone").await.unwrap_err();
    assert!(matches!(err, LookupError::NotFound(ref id) if id == "gone"));

    let err = lookup.post_status("private").await.unwrap_err();
    assert!(matches!(err, LookupError::Forbidden(_)));
    assert!(err.is_gone());

    let err = lookup.post_status("deleted").await.unwrap_err();
    assert!(matches!(err, LookupError::NotFound(_)));

    let status = lookup.post_status("sold").await.unwrap();
    assert!(status.is_sold());
    assert!(!status.removed);
}

#[tokio::test]
async fn access_token_is_cached_across_calls() {
    let stub = Arc::new(RedditStub::default());
    let lookup = RedditStatusLookup::new(reddit_client(stub.clone()).await);

    let first = lookup.post_status("abc").await.unwrap();
    let second = lookup.post_status("def").await.unwrap();
    assert!(!first.is_sold());
    assert!(!second.is_sold());

    assert_eq!(stub.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(*stub.bearer_tokens.lock().unwrap(), vec!["token-1", "token-1"]);
}

#[tokio::test]
async fn unauthorized_response_forces_a_new_token() {
    let stub = Arc::new(RedditStub::default());
    let lookup = RedditStatusLookup::new(reddit_client(stub.clone()).await);

    lookup.post_status("abc").await.unwrap();
    stub.reject_next_api_call.store(true, Ordering::SeqCst);

    let err = lookup.post_status("abc").await.unwrap_err();
    assert!(matches!(err, LookupError::Transient { .. }));
    assert!(!err.is_gone());

    lookup.post_status("abc").await.unwrap();
    assert_eq!(stub.token_requests.load(Ordering::SeqCst), 2);
    assert_eq!(*stub.bearer_tokens.lock().unwrap(), vec!["token-1", "token-2"]);
}

#[tokio::test]
async fn stream_skips_existing_posts_and_yields_new_ones() {
    let stub = Arc::new(RedditStub::with_pages(vec![
        listing(vec![submission("p2", None), submission("p1", None)]),
        listing(vec![
            submission("p4", Some("Available")),
            submission("p3", None),
            submission("p2", None),
            submission("p1", None),
        ]),
    ]));
    let client = reddit_client(stub.clone()).await;
    let mut stream = RedditSubmissionStream::new(client, "fragranceswap", Duration::from_millis(10));

    let first = stream.next_post().await.unwrap().unwrap();
    let second = stream.next_post().await.unwrap().unwrap();
    assert_eq!(first.id, "p3");
    assert_eq!(second.id, "p4");
    assert_eq!(second.flair.as_deref(), Some("Available"));
    assert_eq!(
        second.permalink,
        "https://www.reddit.com/r/fragranceswap/comments/p4/post/"
    );
    assert_eq!(stub.new_requests.load(Ordering::SeqCst), 2);
    assert_eq!(stub.token_requests.load(Ordering::SeqCst), 1);
}

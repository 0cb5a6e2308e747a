//! Axum + Askama read endpoint over the listing store and lowest-price view.
//!
//! Handlers only read the files the pipeline last wrote; they never touch the
//! in-memory store, so a page always reflects the last complete rewrite.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use decant_core::ListingRecord;
use decant_storage::read_rows;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub const CRATE_NAME: &str = "decant-web";

#[derive(Clone)]
pub struct AppState {
    pub listings_path: PathBuf,
    pub lowest_prices_path: PathBuf,
}

impl AppState {
    pub fn new(listings_path: impl Into<PathBuf>, lowest_prices_path: impl Into<PathBuf>) -> Self {
        Self {
            listings_path: listings_path.into(),
            lowest_prices_path: lowest_prices_path.into(),
        }
    }
}

/// Display-ready row; formatting lives here so templates stay dumb.
#[derive(Debug, Clone)]
struct RowView {
    item_name: String,
    cost: String,
    status: String,
    permalink: String,
    clone_of: String,
    official_link: String,
    availability: &'static str,
    official_price: String,
}

impl From<&ListingRecord> for RowView {
    fn from(r: &ListingRecord) -> Self {
        Self {
            item_name: r.item_name.clone(),
            cost: format!("{:.2}", r.cost),
            status: r.status.clone().unwrap_or_default(),
            permalink: r.permalink.clone(),
            clone_of: r.clone_of.clone().unwrap_or_else(|| "-".to_string()),
            official_link: r.official_link.clone(),
            availability: if r.official_availability { "In stock" } else { "Out of stock" },
            official_price: r
                .official_price
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Template)]
#[template(path = "lowest_prices.html")]
struct LowestPricesTemplate {
    rows: Vec<RowView>,
}

#[derive(Template)]
#[template(path = "listings.html")]
struct ListingsTemplate {
    rows: Vec<RowView>,
    posts: usize,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    listings: bool,
    lowest_prices: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/lowest-prices") }))
        .route("/lowest-prices", get(lowest_prices_handler))
        .route("/listings", get(listings_handler))
        .route("/api/lowest-prices", get(api_lowest_prices_handler))
        .route("/api/listings", get(api_listings_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` flips to `true`.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "read endpoint listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

async fn lowest_prices_handler(State(state): State<Arc<AppState>>) -> Response {
    match read_rows::<ListingRecord>(&state.lowest_prices_path).await {
        Ok(Some(records)) => render_html(LowestPricesTemplate {
            rows: records.iter().map(RowView::from).collect(),
        }),
        Ok(None) => no_data(),
        Err(err) => server_error(err),
    }
}

async fn listings_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_records(&state.listings_path).await {
        Ok(records) => {
            let mut ids: Vec<&str> = records.iter().map(|r| r.post_id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            render_html(ListingsTemplate {
                posts: ids.len(),
                rows: records.iter().map(RowView::from).collect(),
            })
        }
        Err(err) => server_error(err),
    }
}

async fn api_lowest_prices_handler(State(state): State<Arc<AppState>>) -> Response {
    match read_rows::<ListingRecord>(&state.lowest_prices_path).await {
        Ok(Some(records)) => Json(records).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No data available" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn api_listings_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_records(&state.listings_path).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        listings: state.listings_path.exists(),
        lowest_prices: state.lowest_prices_path.exists(),
    })
}

/// The store file not existing yet just means nothing has been ingested.
async fn load_records(path: &Path) -> anyhow::Result<Vec<ListingRecord>> {
    Ok(read_rows(path).await?.unwrap_or_default())
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn no_data() -> Response {
    (StatusCode::NOT_FOUND, "No data available").into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn record(post_id: &str, item: &str, cost: f64, clone_of: Option<&str>) -> ListingRecord {
        ListingRecord {
            post_id: post_id.to_string(),
            status: Some("Available".to_string()),
            item_name: item.to_string(),
            permalink: format!("https://www.reddit.com/comments/{post_id}/"),
            cost,
            clone_of: clone_of.map(str::to_string),
            official_link: "https://montagne.example/perfume-a".to_string(),
            official_availability: true,
            official_price: Some(39.0),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    fn state_in(dir: &Path) -> AppState {
        AppState::new(dir.join("listings.json"), dir.join("lowest_prices.json"))
    }

    #[tokio::test]
    async fn lowest_prices_is_404_before_first_publish() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, body) = get(app(state_in(dir.path())), "/lowest-prices").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "No data available");

        let (status, _, _) = get(app(state_in(dir.path())), "/api/lowest-prices").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lowest_prices_renders_published_view() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        decant_storage::write_rows_atomically(
            &state.lowest_prices_path,
            &[record("p1", "Perfume A", 12.5, Some("Aventus"))],
        )
        .await
        .unwrap();

        let (status, content_type, body) = get(app(state.clone()), "/lowest-prices").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert!(body.contains("Perfume A"));
        assert!(body.contains("12.50"));
        assert!(body.contains("Aventus"));

        let (status, content_type, body) = get(app(state), "/api/lowest-prices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        let rows: Vec<ListingRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn listings_page_tolerates_missing_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, body) = get(app(state_in(dir.path())), "/listings").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("0 posts"));

        let (status, _, body) = get(app(state_in(dir.path())), "/api/listings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn listings_page_counts_distinct_posts() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        decant_storage::write_rows_atomically(
            &state.listings_path,
            &[
                record("p1", "Perfume A", 10.0, None),
                record("p1", "Perfume B", 11.0, None),
                record("p2", "Perfume A", 9.0, None),
            ],
        )
        .await
        .unwrap();

        let (status, _, body) = get(app(state), "/listings").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("2 posts"));
        assert!(body.contains("Perfume B"));
    }

    #[tokio::test]
    async fn corrupt_view_file_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        tokio::fs::write(&state.lowest_prices_path, "not json").await.unwrap();

        let (status, _, body) = get(app(state), "/lowest-prices").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Server error"));
    }

    #[tokio::test]
    async fn health_reports_which_files_exist() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        decant_storage::write_rows_atomically::<ListingRecord>(&state.listings_path, &[])
            .await
            .unwrap();

        let (status, _, body) = get(app(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["listings"], true);
        assert_eq!(health["lowest_prices"], false);
    }

    #[tokio::test]
    async fn root_redirects_to_lowest_prices() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state_in(dir.path()))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[header::LOCATION], "/lowest-prices");
    }
}

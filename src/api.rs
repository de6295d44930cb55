use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::knowledge::{
    GeneratedVariant, HealthStatus, KnowledgeAnswer, KnowledgeQuery, MarketInsightRequest,
    MarketInsightResponse, VariantInput,
};
use crate::model::{CreatedTask, NewTask, TaskSnapshot};
use crate::pager::{PageResponse, PageSource};
use crate::poller::TaskSource;

const USER_AGENT: &str = "adscope/0.1";

/// HTTP client for the dashboard backend: task creation, task status,
/// paginated list endpoints and the knowledge routes.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: with_trailing_slash(base_url),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.api.base_url).context("invalid api.base_url")?;
        Self::new(
            base_url,
            cfg.api.token.clone(),
            Duration::from_millis(cfg.api.timeout_ms),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                FetchError::InvalidRequest(format!("base URL {} cannot be a base", self.base_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    pub fn build_create_request(&self, new_task: &NewTask) -> Result<reqwest::Request, FetchError> {
        let url = self.endpoint(&["tasks"])?;
        Ok(self.request(Method::POST, url).json(new_task).build()?)
    }

    pub fn build_status_request(&self, id: &str) -> Result<reqwest::Request, FetchError> {
        let url = self.endpoint(&["tasks", id])?;
        Ok(self.request(Method::GET, url).build()?)
    }

    pub fn build_list_request(
        &self,
        collection: &str,
        page: u32,
        page_size: u32,
    ) -> Result<reqwest::Request, FetchError> {
        let mut url = self.endpoint(&[collection])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("page_size", &page_size.to_string());
        Ok(self.request(Method::GET, url).build()?)
    }

    pub fn build_variants_request(&self, input: &VariantInput) -> Result<reqwest::Request, FetchError> {
        let url = self.endpoint(&["variants", "generate"])?;
        Ok(self.request(Method::POST, url).json(input).build()?)
    }

    pub fn build_insight_request(
        &self,
        insight: &MarketInsightRequest,
    ) -> Result<reqwest::Request, FetchError> {
        let url = self.endpoint(&["market", "insight"])?;
        Ok(self.request(Method::POST, url).json(insight).build()?)
    }

    pub fn build_query_request(&self, query: &KnowledgeQuery) -> Result<reqwest::Request, FetchError> {
        let url = self.endpoint(&["knowledge", "query"])?;
        Ok(self.request(Method::POST, url).json(query).build()?)
    }

    pub fn build_health_request(&self) -> Result<reqwest::Request, FetchError> {
        let url = self.endpoint(&["health"])?;
        Ok(self.request(Method::GET, url).build()?)
    }

    async fn execute<R: DeserializeOwned>(&self, request: reqwest::Request) -> Result<R, FetchError> {
        debug!(method = %request.method(), url = %request.url(), "sending api request");
        let res = self.http.execute(request).await?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by api: {}", body);
            return Err(FetchError::RateLimited(body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = res.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// `POST /tasks`; the returned id is what the poller watches.
    pub async fn create_task(&self, new_task: &NewTask) -> Result<CreatedTask, FetchError> {
        let request = self.build_create_request(new_task)?;
        let created: CreatedTask = self.execute(request).await?;
        debug!(id = %created.id, kind = %new_task.kind, status = %created.status, "task created");
        Ok(created)
    }

    /// `GET /tasks/{id}`.
    pub async fn task_status(&self, id: &str) -> Result<TaskSnapshot, FetchError> {
        let request = self.build_status_request(id)?;
        match self.execute(request).await {
            Err(FetchError::Status { status: 404, .. }) => Err(FetchError::NotFound(id.to_string())),
            other => other,
        }
    }

    /// `GET /{collection}?page=N&page_size=M`.
    pub async fn list_page<T: DeserializeOwned>(
        &self,
        collection: &str,
        page: u32,
        page_size: u32,
    ) -> Result<PageResponse<T>, FetchError> {
        let request = self.build_list_request(collection, page, page_size)?;
        self.execute(request).await
    }

    /// `POST /variants/generate`: synchronous variant generation for a set of
    /// keywords, ad elements and markets.
    pub async fn generate_variants(
        &self,
        input: &VariantInput,
    ) -> Result<Vec<GeneratedVariant>, FetchError> {
        let request = self.build_variants_request(input)?;
        let variants: Vec<GeneratedVariant> = self.execute(request).await?;
        debug!(
            keywords = input.keywords.len(),
            variants = variants.len(),
            "variants generated"
        );
        Ok(variants)
    }

    /// `POST /market/insight`.
    pub async fn market_insight(
        &self,
        insight: &MarketInsightRequest,
    ) -> Result<MarketInsightResponse, FetchError> {
        let request = self.build_insight_request(insight)?;
        self.execute(request).await
    }

    /// `POST /knowledge/query`.
    pub async fn query_knowledge(&self, query: &KnowledgeQuery) -> Result<KnowledgeAnswer, FetchError> {
        let request = self.build_query_request(query)?;
        self.execute(request).await
    }

    /// `GET /health`. A degraded backend still answers 200.
    pub async fn health(&self) -> Result<HealthStatus, FetchError> {
        let request = self.build_health_request()?;
        let health: HealthStatus = self.execute(request).await?;
        if !health.is_healthy() {
            warn!(unavailable = ?health.unavailable(), "backend is degraded");
        }
        Ok(health)
    }

    /// Page source for one list collection, e.g. the ad library.
    pub fn collection<T>(&self, collection: impl Into<String>) -> CollectionPages<T> {
        CollectionPages {
            client: self.clone(),
            collection: collection.into(),
            _items: PhantomData,
        }
    }
}

#[async_trait]
impl TaskSource for ApiClient {
    async fn fetch_task(&self, id: &str) -> Result<TaskSnapshot, FetchError> {
        self.task_status(id).await
    }
}

pub struct CollectionPages<T> {
    client: ApiClient,
    collection: String,
    _items: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> PageSource<T> for CollectionPages<T> {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<PageResponse<T>, FetchError> {
        self.client.list_page(&self.collection, page, page_size).await
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{AdElement, KeywordData};
    use serde_json::{json, Value};

    fn client(base: &str, token: Option<&str>) -> ApiClient {
        ApiClient::new(
            Url::parse(base).unwrap(),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn create_request_posts_json_with_bearer() {
        let api = client("http://localhost:8000/api", Some("secret"));
        let new_task = NewTask {
            kind: "keyword_variants".into(),
            owner: "user-1".into(),
            metadata: json!({ "keyword": "running shoes" }).as_object().cloned().unwrap(),
        };
        let request = api.build_create_request(&new_task).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/api/tasks");
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()).unwrap(),
            "Bearer secret"
        );
        assert_eq!(
            headers.get("Content-Type").and_then(|h| h.to_str().ok()).unwrap(),
            "application/json"
        );
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let body: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["kind"], "keyword_variants");
        assert_eq!(body["metadata"]["keyword"], "running shoes");
    }

    #[test]
    fn status_request_escapes_task_id() {
        let api = client("http://localhost:8000/", None);
        let request = api.build_status_request("abc/def").unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.url().path(), "/tasks/abc%2Fdef");
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn list_request_carries_paging_query() {
        let api = client("http://localhost:8000", Some(""));
        let request = api.build_list_request("ads", 3, 20).unwrap();
        assert_eq!(request.url().path(), "/ads");
        assert_eq!(request.url().query(), Some("page=3&page_size=20"));
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn variants_request_posts_input() {
        let api = client("http://localhost:8000/api/", Some("secret"));
        let input = VariantInput {
            keywords: vec![KeywordData {
                term: "trail shoes".into(),
                volume: 1200,
                intent: "commercial".into(),
                difficulty: 0.4,
            }],
            elements: vec![AdElement {
                kind: "headline".into(),
                location: "top".into(),
                code: "<h1>{text}</h1>".into(),
                text: "Run further".into(),
            }],
            target_markets: vec!["US".into(), "DE".into()],
        };
        let request = api.build_variants_request(&input).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/api/variants/generate");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let body: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["keywords"][0]["term"], "trail shoes");
        assert_eq!(body["elements"][0]["type"], "headline");
        assert_eq!(body["target_markets"], json!(["US", "DE"]));
    }

    #[test]
    fn insight_request_carries_user_and_filters() {
        let api = client("http://localhost:8000", None);
        let insight = MarketInsightRequest::new("user-1").with_filter("country", json!("US"));
        let request = api.build_insight_request(&insight).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/market/insight");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let body: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body, json!({ "user_id": "user-1", "filters": { "country": "US" } }));
    }

    #[test]
    fn query_request_sends_deep_research_flag() {
        let api = client("http://localhost:8000", Some("secret"));
        let query = KnowledgeQuery {
            query: "who sells trail shoes?".into(),
            deep_research: true,
        };
        let request = api.build_query_request(&query).unwrap();
        assert_eq!(request.url().path(), "/knowledge/query");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let body: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["deep_research"], true);
        assert_eq!(body["query"], "who sells trail shoes?");
    }

    #[test]
    fn health_request_is_a_plain_get() {
        let api = client("http://localhost:8000/api", Some("secret"));
        let request = api.build_health_request().unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.url().path(), "/api/health");
        assert!(request.body().is_none());
        assert_eq!(
            request.headers().get("Accept").and_then(|h| h.to_str().ok()).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn variants_payload_decodes() {
        let variants: Vec<GeneratedVariant> = serde_json::from_value(json!([{
            "variant_id": "v1",
            "geo_target": "US",
            "keyword": "trail shoes",
            "element_updates": { "top": "Own every trail" },
            "audience_segment": "weekend hikers",
            "predicted_performance": 0.72,
            "rationale": "stronger verb"
        }]))
        .unwrap();
        assert_eq!(variants[0].element_updates["top"], "Own every trail");
        assert_eq!(variants[0].predicted_performance, 0.72);
    }

    #[test]
    fn list_payload_decodes() {
        let payload: PageResponse<Value> =
            serde_json::from_value(json!({ "items": [{ "id": 1 }, { "id": 2 }], "total": 45 }))
                .unwrap();
        assert_eq!(payload.items.len(), 2);
        assert_eq!(payload.total, 45);
    }
}

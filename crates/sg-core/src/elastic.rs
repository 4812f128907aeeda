use anyhow::{anyhow, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Minimal Elasticsearch HTTP client: document lookup, search and health.
#[derive(Clone)]
pub struct ElasticClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl ElasticClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("ELASTICSEARCH_URL is empty"));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: trimmed.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
            http,
        })
    }

    /// Returns the `_source` of a stored document, or `None` when it does not exist.
    pub async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let resp = self
            .request(Method::GET, &format!("/{index}/_doc/{id}"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = read_json(resp).await?;
        Ok(body.get("_source").cloned())
    }

    pub async fn search(&self, index: &str, body: &Value) -> Result<Value> {
        let resp = self
            .request(Method::POST, &format!("/{index}/_search"))
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn check_ready(&self) -> Result<()> {
        let resp = self.request(Method::GET, "/_cluster/health").send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("elasticsearch error: {} - {}", status, body))
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder.header("Authorization", format!("ApiKey {key}"))
        } else {
            builder
        }
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("elasticsearch error: {} - {}", status, body));
    }
    let parsed: Value = serde_json::from_str(&body)?;
    Ok(parsed)
}

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use std::time::Duration;

/// Read-only client for an S3-compatible object store addressed as
/// `{endpoint}/{bucket}/{prefix}/{object_id}`.
#[derive(Clone)]
pub struct S3LikeClient {
    endpoint: String,
    bucket: String,
    key_prefix: String,
    bearer_token: Option<String>,
    http: reqwest::Client,
}

impl S3LikeClient {
    /// `timeout` bounds each object download end to end.
    pub fn new(
        endpoint: String,
        bucket: String,
        key_prefix: String,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("OBJECT_STORE_URL is empty"));
        }
        if bucket.trim().is_empty() {
            return Err(anyhow!("OBJECT_STORE_BUCKET is empty"));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            endpoint,
            bucket: bucket.trim().to_string(),
            key_prefix: key_prefix.trim_matches('/').to_string(),
            bearer_token: bearer_token.filter(|token| !token.trim().is_empty()),
            http,
        })
    }

    pub fn object_url(&self, object_id: &str) -> String {
        let object_id = object_id.trim_start_matches('/');
        if self.key_prefix.is_empty() {
            format!("{}/{}/{}", self.endpoint, self.bucket, object_id)
        } else {
            format!(
                "{}/{}/{}/{}",
                self.endpoint, self.bucket, self.key_prefix, object_id
            )
        }
    }

    /// Streams the object body in transport-sized chunks; nothing is buffered
    /// beyond the chunk currently being yielded.
    pub async fn get_object_stream(
        &self,
        object_id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let mut req = self.http.get(self.object_url(object_id));
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(anyhow!("object `{object_id}` not found"));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "object store error for `{object_id}`: {} - {}",
                status,
                body
            ));
        }
        Ok(resp.bytes_stream().map_err(anyhow::Error::from).boxed())
    }
}

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sg_core::elastic::ElasticClient;
use uuid::Uuid;

use crate::metadata::{AnalysisRecord, SOURCE_FIELDS};
use crate::model::{CountAndLastUpdated, MembershipQuery, SetDocument};

pub const LAST_UPDATED_FIELD: &str = "analysis.updated_at";
const ENUMERATE_PAGE_SIZE: usize = 500;

/// Read side of the search index.
#[async_trait]
pub trait IndexQuery: Send + Sync {
    async fn get_set_document(&self, set_id: Uuid) -> Result<Option<SetDocument>>;

    /// Member count and newest `analysis.updated_at` for the query.
    async fn count_and_last_updated(&self, query: &MembershipQuery) -> Result<CountAndLastUpdated>;

    /// All matching records, ordered by object id.
    async fn enumerate(&self, query: &MembershipQuery) -> Result<Vec<AnalysisRecord>>;

    /// Newest `analysis.updated_at` across the whole index, in epoch millis.
    async fn latest_update_millis(&self) -> Result<Option<i64>>;

    async fn check_ready(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct ElasticIndex {
    client: ElasticClient,
    file_index: String,
    sets_index: String,
}

impl ElasticIndex {
    pub fn new(client: ElasticClient, file_index: String, sets_index: String) -> Self {
        Self {
            client,
            file_index,
            sets_index,
        }
    }

    fn count_body(&self, query: &MembershipQuery) -> Value {
        json!({
            "query": query.to_query(&self.sets_index),
            "size": 0,
            "track_total_hits": true,
            "aggs": {
                "last_updated": { "max": { "field": LAST_UPDATED_FIELD } }
            }
        })
    }

    fn enumerate_body(&self, query: &MembershipQuery, search_after: Option<&Value>) -> Value {
        let mut body = json!({
            "query": query.to_query(&self.sets_index),
            "size": ENUMERATE_PAGE_SIZE,
            "sort": [{ "object_id": "asc" }],
            "_source": { "includes": SOURCE_FIELDS.as_slice() },
        });
        if let Some(cursor) = search_after {
            body["search_after"] = cursor.clone();
        }
        body
    }
}

#[async_trait]
impl IndexQuery for ElasticIndex {
    async fn get_set_document(&self, set_id: Uuid) -> Result<Option<SetDocument>> {
        let Some(source) = self
            .client
            .get_document(&self.sets_index, &set_id.to_string())
            .await?
        else {
            return Ok(None);
        };
        parse_set_document(set_id, &source).map(Some)
    }

    async fn count_and_last_updated(&self, query: &MembershipQuery) -> Result<CountAndLastUpdated> {
        let response = self
            .client
            .search(&self.file_index, &self.count_body(query))
            .await?;
        parse_count_and_last_updated(&response)
    }

    async fn enumerate(&self, query: &MembershipQuery) -> Result<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        let mut cursor: Option<Value> = None;
        loop {
            let body = self.enumerate_body(query, cursor.as_ref());
            let response = self.client.search(&self.file_index, &body).await?;
            let hits = response
                .pointer("/hits/hits")
                .and_then(|value| value.as_array())
                .ok_or_else(|| anyhow!("search response has no hits"))?;
            for hit in hits {
                let source = hit
                    .get("_source")
                    .ok_or_else(|| anyhow!("search hit has no _source"))?;
                let record = AnalysisRecord::from_source(source)
                    .context("failed to read analysis document")?;
                records.push(record);
            }
            if hits.len() < ENUMERATE_PAGE_SIZE {
                break;
            }
            cursor = hits.last().and_then(|hit| hit.get("sort")).cloned();
            if cursor.is_none() {
                break;
            }
        }
        Ok(records)
    }

    async fn latest_update_millis(&self) -> Result<Option<i64>> {
        let body = json!({
            "query": { "match_all": {} },
            "size": 0,
            "aggs": {
                "last_updated": { "max": { "field": LAST_UPDATED_FIELD } }
            }
        });
        let response = self.client.search(&self.file_index, &body).await?;
        Ok(response
            .pointer("/aggregations/last_updated/value")
            .and_then(|value| value.as_f64())
            .map(|millis| millis as i64))
    }

    async fn check_ready(&self) -> Result<()> {
        self.client.check_ready().await
    }
}

fn parse_set_document(set_id: Uuid, source: &Value) -> Result<SetDocument> {
    let sqon = source.get("sqon").cloned().unwrap_or(Value::Null);
    let size = source
        .get("size")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| anyhow!("set {set_id} has no size"))?;
    Ok(SetDocument { set_id, sqon, size })
}

fn parse_count_and_last_updated(response: &Value) -> Result<CountAndLastUpdated> {
    let count = response
        .pointer("/hits/total/value")
        .or_else(|| response.pointer("/hits/total"))
        .and_then(|value| value.as_i64())
        .ok_or_else(|| anyhow!("search response has no total hit count"))?;
    let aggregation = response.pointer("/aggregations/last_updated");
    let last_updated = aggregation
        .and_then(|agg| agg.get("value_as_string"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .or_else(|| {
            aggregation
                .and_then(|agg| agg.get("value"))
                .and_then(|value| value.as_f64())
                .map(|millis| (millis as i64).to_string())
        })
        .unwrap_or_default();
    Ok(CountAndLastUpdated {
        count,
        last_updated,
    })
}

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::index::IndexQuery;
use crate::metadata::AnalysisRecord;
use crate::model::{CountAndLastUpdated, MembershipQuery, SetDocument};
use crate::store::{ObjectStream, ObjectStore};

pub fn record(object_id: &str) -> AnalysisRecord {
    AnalysisRecord {
        object_id: object_id.to_string(),
        study_id: "STUDY-1".to_string(),
        first_published_at: "2021-06-01".to_string(),
        fasta_header_name: Some(format!("hCoV-19/{object_id}")),
        submitter_donor_id: format!("donor-{object_id}"),
        ..AnalysisRecord::default()
    }
}

#[derive(Clone, Default)]
pub struct FakeIndex {
    records: Vec<AnalysisRecord>,
    sets: HashMap<Uuid, SetDocument>,
    last_updated: String,
    latest_update_millis: Option<i64>,
    delay: Duration,
    enumerations: Arc<AtomicUsize>,
}

impl FakeIndex {
    pub fn with_objects(object_ids: &[&str], last_updated: &str) -> Self {
        Self {
            records: object_ids.iter().map(|id| record(id)).collect(),
            last_updated: last_updated.to_string(),
            ..Self::default()
        }
    }

    pub fn with_set(mut self, set: SetDocument) -> Self {
        self.sets.insert(set.set_id, set);
        self
    }

    pub fn with_latest_update(mut self, millis: i64) -> Self {
        self.latest_update_millis = Some(millis);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexQuery for FakeIndex {
    async fn get_set_document(&self, set_id: Uuid) -> Result<Option<SetDocument>> {
        Ok(self.sets.get(&set_id).cloned())
    }

    async fn count_and_last_updated(&self, _query: &MembershipQuery) -> Result<CountAndLastUpdated> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CountAndLastUpdated {
            count: self.records.len() as i64,
            last_updated: self.last_updated.clone(),
        })
    }

    async fn enumerate(&self, _query: &MembershipQuery) -> Result<Vec<AnalysisRecord>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.clone())
    }

    async fn latest_update_millis(&self) -> Result<Option<i64>> {
        Ok(self.latest_update_millis)
    }

    async fn check_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Serves objects in small chunks. Objects named in `failing` error after
/// their first chunk.
#[derive(Clone, Default)]
pub struct FakeStore {
    objects: HashMap<String, Vec<u8>>,
    failing: Vec<String>,
    chunk_delay: Duration,
}

impl FakeStore {
    pub fn with_fasta(object_ids: &[&str]) -> Self {
        let objects = object_ids
            .iter()
            .map(|id| (id.to_string(), format!(">{id}\nACGTACGTAC\nGTACGT\n").into_bytes()))
            .collect();
        Self {
            objects,
            ..Self::default()
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn failing_on(mut self, object_id: &str) -> Self {
        self.failing.push(object_id.to_string());
        self
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_object_stream(&self, object_id: &str) -> Result<ObjectStream> {
        let body = self
            .objects
            .get(object_id)
            .ok_or_else(|| anyhow!("object `{object_id}` not found"))?;
        let mut chunks: Vec<Result<Bytes>> = body
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if self.failing.iter().any(|id| id == object_id) {
            chunks.truncate(1);
            chunks.push(Err(anyhow!("connection reset while reading `{object_id}`")));
        }
        let delay = self.chunk_delay;
        if delay.is_zero() {
            return Ok(stream::iter(chunks).boxed());
        }
        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                chunk
            })
            .boxed())
    }
}

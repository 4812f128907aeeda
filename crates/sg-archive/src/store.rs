use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use sg_core::object_store::S3LikeClient;

pub type ObjectStream = BoxStream<'static, Result<Bytes>>;

/// Source of the sequence payload for each archived record.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object_stream(&self, object_id: &str) -> Result<ObjectStream>;
}

#[async_trait]
impl ObjectStore for S3LikeClient {
    async fn get_object_stream(&self, object_id: &str) -> Result<ObjectStream> {
        S3LikeClient::get_object_stream(self, object_id).await
    }
}

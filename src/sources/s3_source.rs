//! AWS S3 upstream driver.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{FetchedObject, SourceError, SourceResult, UpstreamSource};
use crate::models::context::RequestContext;
use crate::models::meta::Meta;
use crate::services::block_store::BlockStore;
use crate::services::faulting::{ByteSource, FaultingFile, data_path};

pub struct S3Source {
    client: Client,
    block_store: BlockStore,
    cache_dir: PathBuf,
}

impl S3Source {
    pub async fn new(region: &str, cache_dir: impl Into<PathBuf>, block_store: BlockStore) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
            block_store,
            cache_dir: cache_dir.into(),
        }
    }
}

#[async_trait]
impl UpstreamSource for S3Source {
    async fn fetch(&self, ctx: &RequestContext, uri: &str) -> SourceResult<FetchedObject> {
        let (bucket, key) = split_s3_uri(uri);
        info!(seq = ctx.seq, bucket, key, "fetching from S3");

        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_get_error)?;

        let size = resp.content_length().unwrap_or_default().max(0) as u64;
        let meta = Meta {
            expires: Utc::now(),
            last_modified: resp.last_modified().map(to_chrono).unwrap_or_else(Utc::now),
            size,
            content_type: resp
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
            etag: resp.e_tag().unwrap_or_default().to_string(),
        };

        let body: ByteSource = Box::pin(resp.body.into_async_read());
        let dst = data_path(&self.cache_dir, uri);
        let partition = self.block_store.partition(uri);
        let file = FaultingFile::new(Some(body), dst, size, partition)
            .await
            .map_err(|err| SourceError::Other(anyhow!(err)))?;
        let file = Arc::new(file);
        file.stream();

        Ok(FetchedObject { file, meta })
    }

    async fn head(&self, uri: &str) -> SourceResult<Meta> {
        let (bucket, key) = split_s3_uri(uri);
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_head_error)?;

        Ok(Meta {
            expires: Utc::now(),
            last_modified: resp.last_modified().map(to_chrono).unwrap_or_else(Utc::now),
            size: resp.content_length().unwrap_or_default().max(0) as u64,
            content_type: resp
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
            etag: resp.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn directory(&self, prefix: &str) -> SourceResult<Vec<String>> {
        let path = prefix.trim_start_matches('/');
        let Some(slash) = path.find('/') else {
            return Err(SourceError::Other(anyhow!("cannot list all buckets")));
        };
        let bucket = &path[..slash];
        let key_prefix = &path[slash + 1..];

        debug!(bucket, key_prefix, "listing bucket contents");
        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(key_prefix)
            .send()
            .await
            .map_err(|err| SourceError::Other(anyhow!(err)))?;

        let mut names = Vec::new();
        let mut subdirs = BTreeSet::new();
        for object in resp.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            if key == key_prefix {
                continue;
            }
            let Some(rest) = key.strip_prefix(key_prefix) else {
                continue;
            };
            // Entries below a further `/` fold into one synthetic subdir.
            match rest.find('/') {
                Some(idx) => {
                    subdirs.insert(key[..key_prefix.len() + idx + 1].to_string());
                }
                None => names.push(key.to_string()),
            }
        }
        names.extend(subdirs);
        Ok(names)
    }
}

/// Split `/bucket/key/parts` into bucket and key. A bare bucket maps to an
/// empty key.
fn split_s3_uri(uri: &str) -> (&str, &str) {
    let uri = uri.trim_start_matches('/');
    match uri.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (uri, ""),
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).unwrap_or_else(Utc::now)
}

fn map_get_error(err: SdkError<GetObjectError>) -> SourceError {
    match err {
        SdkError::ServiceError(service)
            if matches!(service.err(), GetObjectError::NoSuchKey(_)) =>
        {
            SourceError::NotFound
        }
        other => SourceError::Other(anyhow!(other)),
    }
}

fn map_head_error(err: SdkError<HeadObjectError>) -> SourceError {
    match err {
        SdkError::ServiceError(service)
            if matches!(service.err(), HeadObjectError::NotFound(_)) =>
        {
            SourceError::NotFound
        }
        other => SourceError::Other(anyhow!(other)),
    }
}

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, LAST_MODIFIED, USER_AGENT};
use reqwest::{StatusCode, Url};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{NamespacedStoreSettings, PrimaryStoreSettings};
use crate::error::BundlerError;
use crate::fetch::format_bytes;

pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;
const CONTENT_TYPE_ZIP: &str = "application/octet-stream";
const AZURE_API_VERSION: &str = "2021-08-06";
const PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// What a store reports about a stored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub last_modified: Option<DateTime<Utc>>,
}

/// Whole-object store: an uploaded key is either absent or complete.
pub trait ObjectStore: Send + Sync {
    fn upload(
        &self,
        key: &str,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), BundlerError>;

    /// `None` when the key is absent.
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError>;

    fn exists(&self, key: &str) -> Result<bool, BundlerError> {
        Ok(self.head(key)?.is_some())
    }
}

/// Block-blob primitives. Staged blocks stay invisible until committed.
pub trait BlockStore: Send + Sync {
    fn stage_block(&self, key: &str, block_id: &str, chunk: &[u8]) -> Result<(), BundlerError>;

    fn commit_block_list(
        &self,
        key: &str,
        block_ids: &[String],
        content_type: &str,
    ) -> Result<(), BundlerError>;

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError>;
}

/// Block id of the chunk starting at `offset`: base64 of its little-endian bytes.
pub fn block_id(offset: u64) -> String {
    STANDARD.encode((offset as i64).to_le_bytes())
}

/// Splits content into fixed-size blocks, stages them in order and commits
/// the full list once every block is staged.
pub struct ChunkedUploader<B> {
    store: B,
    chunk_size: usize,
}

impl<B: BlockStore> ChunkedUploader<B> {
    pub fn new(store: B) -> Self {
        Self::with_chunk_size(store, CHUNK_SIZE)
    }

    pub fn with_chunk_size(store: B, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn store(&self) -> &B {
        &self.store
    }
}

impl<B: BlockStore> ObjectStore for ChunkedUploader<B> {
    fn upload(
        &self,
        key: &str,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), BundlerError> {
        let mut block_ids = Vec::with_capacity(content.len().div_ceil(self.chunk_size));
        let mut offset = 0u64;
        for chunk in content.chunks(self.chunk_size) {
            cancel.check()?;
            let id = block_id(offset);
            self.store.stage_block(key, &id, chunk)?;
            debug!(key, block = %id, bytes = chunk.len(), "staged block");
            block_ids.push(id);
            offset += chunk.len() as u64;
        }
        cancel.check()?;
        self.store
            .commit_block_list(key, &block_ids, CONTENT_TYPE_ZIP)?;
        info!(key, blocks = block_ids.len(), size = %format_bytes(content.len() as u64), "upload committed");
        Ok(())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError> {
        self.store.head(key)
    }
}

/// Azure block blob container reached over REST with an optional SAS token.
pub struct AzureBlockStore {
    client: Client,
    container_url: String,
    sas_token: Option<String>,
}

impl AzureBlockStore {
    pub fn new(
        container_url: impl Into<String>,
        sas_token: Option<String>,
    ) -> Result<Self, BundlerError> {
        Ok(Self {
            client: build_client()?,
            container_url: container_url.into().trim_end_matches('/').to_string(),
            sas_token,
        })
    }

    pub fn from_settings(settings: &NamespacedStoreSettings) -> Result<Self, BundlerError> {
        Self::new(settings.base_url.clone(), settings.sas_token.clone())
    }

    fn blob_url(&self, key: &str) -> String {
        match &self.sas_token {
            Some(sas) => format!("{}/{}?{}", self.container_url, key, sas),
            None => format!("{}/{}", self.container_url, key),
        }
    }
}

impl BlockStore for AzureBlockStore {
    fn stage_block(&self, key: &str, block_id: &str, chunk: &[u8]) -> Result<(), BundlerError> {
        let response = self
            .client
            .put(self.blob_url(key))
            .query(&[("comp", "block"), ("blockid", block_id)])
            .header("x-ms-version", AZURE_API_VERSION)
            .body(chunk.to_vec())
            .send()
            .map_err(|err| BundlerError::UploadHttp(err.to_string()))?;
        handle_status(response).map(|_| ())
    }

    fn commit_block_list(
        &self,
        key: &str,
        block_ids: &[String],
        content_type: &str,
    ) -> Result<(), BundlerError> {
        let response = self
            .client
            .put(self.blob_url(key))
            .query(&[("comp", "blocklist")])
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-blob-content-type", content_type)
            .header(CONTENT_TYPE, "application/xml")
            .body(block_list_body(block_ids))
            .send()
            .map_err(|err| BundlerError::UploadHttp(err.to_string()))?;
        handle_status(response).map(|_| ())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError> {
        let response = self
            .client
            .head(self.blob_url(key))
            .header("x-ms-version", AZURE_API_VERSION)
            .send()
            .map_err(|err| BundlerError::UploadHttp(err.to_string()))?;
        meta_from_response(response)
    }
}

pub fn block_list_body(block_ids: &[String]) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        body.push_str("<Latest>");
        body.push_str(id);
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

/// S3 bucket reached with SigV4 presigned requests; one PUT per object.
pub struct S3ObjectStore {
    client: Client,
    bucket: Bucket,
    credentials: Credentials,
    prefix: String,
}

impl S3ObjectStore {
    pub fn new(
        client: Client,
        bucket: Bucket,
        credentials: Credentials,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket,
            credentials,
            prefix: prefix.into(),
        }
    }

    pub fn from_settings(settings: &PrimaryStoreSettings) -> Result<Self, BundlerError> {
        let endpoint = Url::parse(&settings.base_url)
            .map_err(|err| BundlerError::InvalidConfig(format!("primary_store.base_url: {err}")))?;
        let style = if settings.virtual_host {
            UrlStyle::VirtualHost
        } else {
            UrlStyle::Path
        };
        let bucket = Bucket::new(
            endpoint,
            style,
            settings.bucket.clone(),
            settings.region.clone(),
        )
        .map_err(|err| BundlerError::InvalidConfig(format!("primary_store: {err}")))?;
        let keys = &settings.credentials;
        let credentials = match &keys.session_token {
            Some(token) => Credentials::new_with_token(
                keys.access_key_id.clone(),
                keys.secret_access_key.clone(),
                token.clone(),
            ),
            None => Credentials::new(keys.access_key_id.clone(), keys.secret_access_key.clone()),
        };
        Ok(Self::new(
            build_client()?,
            bucket,
            credentials,
            settings.prefix.clone(),
        ))
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn put_url(&self, key: &str) -> Url {
        let key = self.object_key(key);
        self.bucket
            .put_object(Some(&self.credentials), &key)
            .sign(PRESIGN_TTL)
    }

    pub fn head_url(&self, key: &str) -> Url {
        let key = self.object_key(key);
        self.bucket
            .head_object(Some(&self.credentials), &key)
            .sign(PRESIGN_TTL)
    }
}

impl ObjectStore for S3ObjectStore {
    fn upload(
        &self,
        key: &str,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), BundlerError> {
        cancel.check()?;
        let response = self
            .client
            .put(self.put_url(key))
            .header(CONTENT_TYPE, CONTENT_TYPE_ZIP)
            .body(content.to_vec())
            .send()
            .map_err(|err| BundlerError::UploadHttp(err.to_string()))?;
        handle_status(response)?;
        info!(key, size = %format_bytes(content.len() as u64), "upload complete");
        Ok(())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError> {
        let response = self
            .client
            .head(self.head_url(key))
            .send()
            .map_err(|err| BundlerError::UploadHttp(err.to_string()))?;
        meta_from_response(response)
    }
}

fn build_client() -> Result<Client, BundlerError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("extract-bundler/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| BundlerError::InvalidConfig(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(30))
        .timeout(Option::<Duration>::None)
        .build()
        .map_err(|err| BundlerError::UploadHttp(err.to_string()))
}

fn handle_status(response: Response) -> Result<Response, BundlerError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "blob store request failed".to_string());
    Err(BundlerError::UploadStatus { status, message })
}

fn meta_from_response(response: Response) -> Result<Option<ObjectMeta>, BundlerError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = handle_status(response)?;
    let last_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            parse_http_date(value)
                .inspect_err(|_| warn!(value, "unparseable Last-Modified header"))
                .ok()
        });
    Ok(Some(ObjectMeta { last_modified }))
}

/// Parses an HTTP date such as `Wed, 05 Jun 2024 07:00:00 GMT`.
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc2822(value).map(|date| date.with_timezone(&Utc))
}

//! Object storage for model artifacts and loan batches.
//!
//! The pipeline only needs to fetch a named artifact, push one back and list
//! keys under a prefix, so any key/value blob store will do. Two backends are
//! provided: a local directory and an S3-compatible bucket reached over HTTP.

use crate::error::{Result, ScoringError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Key/value blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the content stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `content` under `key`, replacing any previous content.
    async fn put(&self, key: &str, content: Vec<u8>) -> Result<()>;

    /// Sorted keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Strip the leading slash some callers put on keys.
pub fn normalize_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// Key used when pushing: normalized, with spaces replaced by dashes.
pub fn push_key(key: &str) -> String {
    normalize_key(key).replace(' ', "-")
}

/// Relative filesystem path for a key. Keys that would leave the directory
/// they are resolved against are rejected.
fn key_path(key: &str) -> Result<PathBuf> {
    let key = normalize_key(key);
    let path = Path::new(key);
    let invalid = key.is_empty() || path.components().any(|c| !matches!(c, Component::Normal(_)));
    if invalid {
        return Err(ScoringError::Storage {
            key: key.to_string(),
            reason: "key must be a relative path without `.` or `..` segments".to_string(),
        });
    }
    Ok(path.to_path_buf())
}

/// Store backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(key_path(key)?))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ScoringError::ArtifactNotFound {
                key: normalize_key(key).to_string(),
            }),
            Err(e) => Err(ScoringError::Storage {
                key: normalize_key(key).to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, content: Vec<u8>) -> Result<()> {
        let path = self.path_for(&push_key(key))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize_key(prefix);
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// S3-compatible bucket addressed by a base URL such as
/// `https://<bucket>.s3.amazonaws.com`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    base_url: Url,
    client: Client,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim_end_matches('/'))
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ScoringError::Storage {
                key: raw.clone(),
                reason: "bucket URL must be an absolute http(s) URL".to_string(),
            })?;

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ScoringError::http(base_url.as_str(), e))?;
        Ok(Self { base_url, client })
    }

    /// Object URL with every key segment percent-encoded
    fn url_for(&self, key: &str) -> Result<Url> {
        let key = normalize_key(key);
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ScoringError::Storage {
                key: key.to_string(),
                reason: "bucket URL cannot take a path".to_string(),
            })?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }

    fn status_error(key: &str, status: StatusCode, body: String) -> ScoringError {
        if status == StatusCode::NOT_FOUND {
            ScoringError::ArtifactNotFound {
                key: normalize_key(key).to_string(),
            }
        } else {
            ScoringError::Storage {
                key: normalize_key(key).to_string(),
                reason: format!("{status}: {body}"),
            }
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.url_for(key)?;
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ScoringError::http(url.as_str(), e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::status_error(key, status, body));
        }
        let bytes = resp.bytes().await.map_err(|e| ScoringError::http(url.as_str(), e))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, content: Vec<u8>) -> Result<()> {
        let key = push_key(key);
        let url = self.url_for(&key)?;
        let resp = self
            .client
            .put(url.clone())
            .body(content)
            .send()
            .await
            .map_err(|e| ScoringError::http(url.as_str(), e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::status_error(&key, status, body));
        }
        Ok(())
    }

    /// Follows continuation tokens until the listing is complete.
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = self.url_for("")?;
        let prefix = normalize_key(prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = token.as_deref() {
                query.push(("continuation-token", token));
            }
            let resp = self
                .client
                .get(url.clone())
                .query(&query)
                .send()
                .await
                .map_err(|e| ScoringError::http(url.as_str(), e))?;
            let status = resp.status();
            let body = resp.text().await.map_err(|e| ScoringError::http(url.as_str(), e))?;
            if !status.is_success() {
                return Err(Self::status_error(prefix, status, body));
            }

            let page = parse_listing(&body);
            debug!(prefix = %prefix, keys = page.keys.len(), truncated = page.truncated, "Listing page");
            keys.extend(page.keys);
            if !page.truncated {
                break;
            }
            match page.next_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                _ => {
                    return Err(ScoringError::malformed(
                        url.as_str(),
                        "truncated listing without a new continuation token",
                    ))
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// One page of an S3 `ListBucketResult` document
#[derive(Debug, Default, PartialEq)]
struct ListingPage {
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_listing(body: &str) -> ListingPage {
    ListingPage {
        keys: tag_values(body, "Key"),
        truncated: tag_values(body, "IsTruncated")
            .first()
            .is_some_and(|v| v.trim() == "true"),
        next_token: tag_values(body, "NextContinuationToken").into_iter().next(),
    }
}

/// Unescaped text of every `<tag>...</tag>` element
fn tag_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let mut values = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else {
            break;
        };
        values.push(
            rest[..end]
                .replace("&lt;", "<")
                .replace("&gt;", ">")
                .replace("&quot;", "\"")
                .replace("&apos;", "'")
                .replace("&amp;", "&"),
        );
        rest = &rest[end + close.len()..];
    }
    values
}

/// Fetches artifacts from a store, keeping a transient local copy of each.
#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ObjectStore>,
    tmp_localdir: Option<PathBuf>,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            tmp_localdir: None,
        }
    }

    /// Write pulled artifacts under `dir/<key>` as well as returning them.
    pub fn with_local_copies(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_localdir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Local path a pulled artifact is copied to, if local copies are enabled.
    pub fn local_path(&self, key: &str) -> Result<Option<PathBuf>> {
        match &self.tmp_localdir {
            Some(dir) => Ok(Some(dir.join(key_path(key)?))),
            None => Ok(None),
        }
    }

    /// Fetch the raw bytes of an artifact.
    pub async fn pull(&self, key: &str) -> Result<Vec<u8>> {
        let local = self.local_path(key)?;
        let bytes = self.store.get(key).await?;

        match local {
            Some(local) => {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&local, &bytes).await?;
                info!(key = %key, local = %local.display(), bytes = bytes.len(), "Pulled artifact");
            }
            None => info!(key = %key, bytes = bytes.len(), "Pulled artifact"),
        }

        Ok(bytes)
    }

    /// Fetch and decode a JSON artifact.
    pub async fn pull_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.pull(key).await?;
        serde_json::from_slice(&bytes).map_err(|e| ScoringError::ArtifactDecode {
            key: normalize_key(key).to_string(),
            reason: e.to_string(),
        })
    }

    /// Upload a local file. The key defaults to the file name.
    pub async fn push_file(&self, path: impl AsRef<Path>, key: Option<&str>) -> Result<String> {
        let path = path.as_ref();
        let key = match key {
            Some(k) => push_key(k),
            None => path
                .file_name()
                .map(|n| push_key(&n.to_string_lossy()))
                .ok_or_else(|| ScoringError::Storage {
                    key: path.display().to_string(),
                    reason: "no key given and path has no file name".to_string(),
                })?,
        };

        let content = tokio::fs::read(path).await?;
        self.store.put(&key, content).await?;
        info!(path = %path.display(), key = %key, "Pushed file");
        Ok(key)
    }

    /// Upload in-memory content under `key`.
    pub async fn push_bytes(&self, key: &str, content: Vec<u8>) -> Result<String> {
        let key = push_key(key);
        let len = content.len();
        self.store.put(&key, content).await?;
        info!(key = %key, bytes = len, "Pushed artifact");
        Ok(key)
    }

    /// Keys under `prefix`.
    pub async fn ls(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.store.list(prefix).await?;
        debug!(prefix = %prefix, count = keys.len(), "Listed artifacts");
        Ok(keys)
    }
}

//! `RemoteTree` — the HTTP-backed tree holding the authoritative copy of
//! every file.
//!
//! The wire protocol itself (negotiate/session/auth) is out of scope; this
//! module only needs a content endpoint that speaks plain HTTP verbs
//! against `remote_prefix` + a percent-encoded path, the same shape the
//! sync processor already assumes when it issues PUT/POST/DELETE.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{TreeError, TreeResult};
use crate::file::{File, FileMeta};
use crate::tree::Tree;

/// One entry of a directory listing, as returned by the remote's listing
/// endpoint. The exact wire format is unspecified (negotiate and wire
/// encoding are out of scope); a JSON array is assumed here as the
/// concretization, noted in DESIGN.md.
#[derive(Debug, Deserialize)]
struct RemoteEntry {
    name: String,
    is_directory: bool,
    size: u64,
    #[serde(rename = "lastModified")]
    last_modified: i64,
}

/// Metadata-only response from a `HEAD`/`stat` call against the remote.
#[derive(Debug, Deserialize)]
struct RemoteStat {
    size: u64,
    #[serde(rename = "lastModified")]
    last_modified: i64,
    #[serde(default)]
    is_directory: bool,
}

pub struct RemoteTree {
    client: reqwest::Client,
    prefix: String,
}

impl RemoteTree {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), prefix: prefix.into() }
    }

    pub fn with_client(client: reqwest::Client, prefix: impl Into<String>) -> Self {
        Self { client, prefix: prefix.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.prefix.trim_end_matches('/'), crate::path::remote_encode(path))
    }

    async fn check_status(path: &str, resp: reqwest::Response) -> TreeResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status.as_u16() == 404 {
            return Err(TreeError::NotFound(path.to_string()));
        }
        let message = resp.text().await.unwrap_or_default();
        Err(TreeError::Remote { status: status.as_u16(), message })
    }

    /// Query metadata for `path` without downloading its body. The caching
    /// protocol needs the remote's current `last_modified` to detect a
    /// rollback without fetching the whole file.
    pub async fn stat(&self, path: &str) -> TreeResult<FileMeta> {
        let resp = self
            .client
            .head(self.url(path))
            .send()
            .await
            .map_err(TreeError::Http)?;
        let resp = Self::check_status(path, resp).await?;
        let stat: RemoteStat = match resp.headers().get("x-rq-stat") {
            Some(_) => resp.json().await.map_err(TreeError::Http)?,
            None => RemoteStat {
                size: resp.content_length().unwrap_or(0),
                last_modified: resp
                    .headers()
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| httpdate::parse_http_date(v).ok())
                    .map(|t| {
                        t.duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_millis() as i64)
                            .unwrap_or(0)
                    })
                    .unwrap_or(0),
                is_directory: false,
            },
        };
        Ok(FileMeta {
            path: path.to_string(),
            is_file: !stat.is_directory,
            is_directory: stat.is_directory,
            is_read_only: false,
            size: stat.size,
            allocation_size: stat.size,
            last_modified: stat.last_modified,
            last_changed: stat.last_modified,
            created: stat.last_modified,
            last_accessed: stat.last_modified,
        })
    }

    /// Download the full body of `path`, streamed into `sink`.
    pub async fn fetch_resource(&self, path: &str) -> TreeResult<Bytes> {
        let resp = self.client.get(self.url(path)).send().await.map_err(TreeError::Http)?;
        let resp = Self::check_status(path, resp).await?;
        resp.bytes().await.map_err(TreeError::Http)
    }

    /// Upload `body` to `path` using `method` (the processor's verb
    /// inversion is applied by the caller before reaching this method).
    pub async fn put_or_post(
        &self,
        path: &str,
        method: reqwest::Method,
        body: Bytes,
    ) -> TreeResult<()> {
        let content_type = mime_guess::from_path(path).first_or_octet_stream();
        let resp = self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::CONTENT_TYPE, content_type.as_ref())
            .body(body)
            .send()
            .await
            .map_err(TreeError::Http)?;
        Self::check_status(path, resp).await?;
        Ok(())
    }

    /// Issue the remote side of a MOVE, transported as a `POST` carrying
    /// a WebDAV-style `Destination` header (decision recorded in
    /// DESIGN.md; the wire representation is otherwise unspecified).
    pub async fn move_resource(&self, old: &str, new: &str) -> TreeResult<()> {
        let resp = self
            .client
            .request(reqwest::Method::POST, self.url(old))
            .header("Destination", self.url(new))
            .header("X-RQ-Method", "MOVE")
            .send()
            .await
            .map_err(TreeError::Http)?;
        Self::check_status(old, resp).await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> TreeResult<()> {
        let resp = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .map_err(TreeError::Http)?;
        Self::check_status(path, resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Tree for RemoteTree {
    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    async fn open(&self, path: &str) -> TreeResult<Box<dyn File>> {
        let meta = self.stat(path).await?;
        Ok(Box::new(RemoteFile { meta, body: None }))
    }

    async fn list(&self, dir: &str) -> TreeResult<Vec<Box<dyn File>>> {
        let url = format!(
            "{}{}/",
            self.prefix.trim_end_matches('/'),
            crate::path::remote_encode(dir).trim_end_matches('/')
        );
        let resp = self.client.get(url).send().await.map_err(TreeError::Http)?;
        let resp = Self::check_status(dir, resp).await?;
        let entries: Vec<RemoteEntry> = resp.json().await.map_err(TreeError::Http)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let path = crate::path::join(dir, &entry.name);
                let meta = FileMeta {
                    path,
                    is_file: !entry.is_directory,
                    is_directory: entry.is_directory,
                    is_read_only: false,
                    size: entry.size,
                    allocation_size: entry.size,
                    last_modified: entry.last_modified,
                    last_changed: entry.last_modified,
                    created: entry.last_modified,
                    last_accessed: entry.last_modified,
                };
                Box::new(RemoteFile { meta, body: None }) as Box<dyn File>
            })
            .collect())
    }

    async fn create_file(&self, path: &str) -> TreeResult<()> {
        self.put_or_post(path, reqwest::Method::PUT, Bytes::new()).await
    }

    async fn create_directory(&self, path: &str) -> TreeResult<()> {
        let resp = self
            .client
            .request(reqwest::Method::from_bytes(b"MKCOL").unwrap(), self.url(path))
            .send()
            .await
            .map_err(TreeError::Http)?;
        Self::check_status(path, resp).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> TreeResult<()> {
        self.remove(path).await
    }

    async fn delete_directory(&self, path: &str) -> TreeResult<()> {
        self.remove(path).await
    }

    async fn rename(&self, old: &str, new: &str) -> TreeResult<()> {
        self.move_resource(old, new).await
    }

    async fn disconnect(&self) -> TreeResult<()> {
        Ok(())
    }
}

/// A handle representing a remote resource. `read`/`write` are not
/// supported directly — the caching protocol always materializes a local
/// copy first via [`RemoteTree::fetch_resource`] and uploads whole bodies
/// via [`RemoteTree::put_or_post`], rather than treating the remote as a
/// randomly-addressable byte stream.
pub struct RemoteFile {
    meta: FileMeta,
    body: Option<Bytes>,
}

impl RemoteFile {
    /// Rebuild a handle from previously-fetched metadata, without a round
    /// trip to the remote. Used by the RQ layer's directory-listing cache.
    pub(crate) fn from_meta(meta: FileMeta) -> Self {
        Self { meta, body: None }
    }
}

#[async_trait]
impl File for RemoteFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    async fn read(&mut self, buf: &mut [u8], pos: u64) -> TreeResult<usize> {
        let body = match &self.body {
            Some(b) => b,
            None => return Err(TreeError::NotSupported),
        };
        let pos = pos as usize;
        if pos >= body.len() {
            return Ok(0);
        }
        let n = buf.len().min(body.len() - pos);
        buf[..n].copy_from_slice(&body[pos..pos + n]);
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8], _pos: u64) -> TreeResult<usize> {
        Err(TreeError::NotSupported)
    }

    async fn set_length(&mut self, _len: u64) -> TreeResult<()> {
        Err(TreeError::NotSupported)
    }

    async fn delete(&mut self) -> TreeResult<()> {
        Err(TreeError::NotSupported)
    }

    async fn flush(&mut self) -> TreeResult<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> TreeResult<()> {
        Ok(())
    }
}

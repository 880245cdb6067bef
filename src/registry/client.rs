//! `RegistryClient`: the stateless OCI/Docker v2 distribution protocol client.

use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::registry::auth::Auth;
use crate::registry::manifest::{accept_header, parse_manifest_body, ManifestDocument};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RegistryClient {
    /// Used for token exchange, manifest and config GETs: capped at
    /// `CONTROL_TIMEOUT` for the whole request.
    http: Client,
    /// Used for blob streaming: no whole-request timeout, since a blob can
    /// legitimately take far longer than 10s to transfer. Connect timeout
    /// still applies; stalls are caught by the caller's inactivity timer.
    blob_http: Client,
    auth: Auth,
    source: SourceConfig,
}

/// The result of a manifest GET: raw body, content type, and resolved digest.
pub struct ManifestResponse {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

/// Outcome of opening a blob stream: whether the server honoured the
/// requested `Range`, and the byte stream itself.
pub struct BlobStream {
    pub resumed: bool,
    pub stream: std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
}

impl RegistryClient {
    pub fn new(source: SourceConfig, skip_tls: bool) -> Result<Self> {
        let mut control_builder = Client::builder().timeout(CONTROL_TIMEOUT);
        let mut blob_builder = Client::builder().connect_timeout(CONTROL_TIMEOUT);
        if skip_tls {
            control_builder = control_builder.danger_accept_invalid_certs(true);
            blob_builder = blob_builder.danger_accept_invalid_certs(true);
        }
        let http = control_builder
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        let blob_http = blob_builder
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

        let auth = Auth::new(http.clone(), source.clone());
        Ok(Self { http, blob_http, auth, source })
    }

    /// GET the manifest for `repository`/`reference`, negotiating content
    /// type across manifest-list, OCI index and v2 manifest in one request.
    pub async fn get_manifest(&self, repository: &str, reference: &str) -> Result<ManifestResponse> {
        let credential = self.auth.resolve_token(repository).await?;
        let url = format!("{}/v2/{}/manifests/{}", self.source.host, repository, reference);

        let mut request = self.http.get(&url).header("Accept", accept_header());
        request = credential.apply(request);

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("manifest not found: {repository}:{reference}")));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!("manifest GET rejected with {status}")));
        }
        if !status.is_success() {
            return Err(classify_status(status, "manifest GET"));
        }

        let media_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let digest_header = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?.to_vec();
        let digest = digest_header.unwrap_or_else(|| crate::digest::compute(&bytes));

        Ok(ManifestResponse { bytes, media_type, digest })
    }

    /// Parse a manifest response body and, if it names a platform-specific
    /// child, select the one matching `platform`.
    pub fn select_platform(
        &self,
        body: &[u8],
        media_type: &str,
        platform: &crate::coord::Platform,
    ) -> Result<Option<String>> {
        match parse_manifest_body(body, media_type)? {
            ManifestDocument::Concrete(_) => Ok(None),
            ManifestDocument::List(entries) => {
                crate::registry::manifest::select_platform(&entries, platform).map(Some)
            }
        }
    }

    /// GET the small JSON image config blob.
    pub async fn get_config(&self, repository: &str, digest: &str) -> Result<Vec<u8>> {
        let credential = self.auth.resolve_token(repository).await?;
        let url = format!("{}/v2/{}/blobs/{}", self.source.host, repository, digest);

        let mut request = self.http.get(&url);
        request = credential.apply(request);

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("config blob not found: {digest}")));
        }
        if !status.is_success() {
            return Err(classify_status(status, "config GET"));
        }

        let bytes = response.bytes().await?.to_vec();
        crate::digest::verify(&bytes, digest)?;
        Ok(bytes)
    }

    /// Open a streaming body for a blob, optionally resuming from `offset`.
    ///
    /// When `offset > 0` a `Range: bytes=<offset>-` header is sent. If the
    /// server answers anything but `206 Partial Content`, `resumed` is
    /// `false` and the caller must discard any partial file and restart
    /// the blob from byte 0.
    ///
    /// A `Range` request can outrun the file on disk, most often when the
    /// blob's record was never flipped to `Done` for bytes that are in fact
    /// fully written: a range starting at the blob's length has nothing left
    /// to serve, and the server answers `416`. That isn't a protocol error,
    /// it's a resume whose offset needs to fall back to zero; re-issue the
    /// request without `Range` rather than fail the task.
    pub async fn stream_blob(&self, repository: &str, digest: &str, offset: u64) -> Result<BlobStream> {
        let credential = self.auth.resolve_token(repository).await?;
        let url = format!("{}/v2/{}/blobs/{}", self.source.host, repository, digest);

        let mut request = credential.apply(self.blob_http.get(&url));
        if offset > 0 {
            request = request.header("Range", format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let credential = self.auth.resolve_token(repository).await?;
            let response = credential.apply(self.blob_http.get(&url)).send().await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(Error::NotFound(format!("blob not found: {digest}")));
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Auth(format!("blob GET rejected with {status}")));
            }
            if !status.is_success() {
                return Err(classify_status(status, "blob GET"));
            }
            return Ok(BlobStream { resumed: false, stream: Box::pin(response.bytes_stream()) });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("blob not found: {digest}")));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!("blob GET rejected with {status}")));
        }
        if !status.is_success() {
            return Err(classify_status(status, "blob GET"));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        Ok(BlobStream {
            resumed,
            stream: Box::pin(response.bytes_stream()),
        })
    }
}

fn classify_status(status: StatusCode, context: &str) -> Error {
    if status.is_server_error() {
        Error::Transport(format!("{context} failed with {status}"))
    } else {
        Error::ProtocolViolation(format!("{context} failed with unexpected status {status}"))
    }
}

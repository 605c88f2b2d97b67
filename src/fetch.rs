//! Conditional HTTP fetches against the origin or a peer sidecar.
//!
//! A [`RequestFactory`] captures everything needed to open the same request
//! repeatedly: the endpoint, the media types accepted, optional Basic-Auth
//! credentials and an optional prior digest for `If-None-Match`.  The same
//! factory serves the ranged requests issued during delta reconstruction.

use std::io;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE, IF_NONE_MATCH, RANGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::codec::{CodecError, RangeRequestFactory};

const GZIP: &str = "gzip";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed")]
    Http {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response {status} from {url}")]
    UnexpectedStatus { url: Url, status: StatusCode },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Basic-Auth credentials for origin requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Shared HTTP client; the timeouts configured here are the only bound on
/// a fetch that stops making progress.
#[derive(Debug, Clone)]
pub struct FetchClient {
    http: reqwest::Client,
}

impl FetchClient {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn factory(&self, endpoint: Url) -> RequestFactory {
        RequestFactory {
            http: self.http.clone(),
            endpoint,
            accept: None,
            auth: None,
            etag: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestFactory {
    http: reqwest::Client,
    endpoint: Url,
    accept: Option<String>,
    auth: Option<Credentials>,
    etag: Option<String>,
}

impl RequestFactory {
    pub fn accept(mut self, media_types: &[&str]) -> Self {
        self.accept = Some(media_types.join(", "));
        self
    }

    pub fn auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }

    /// Send `If-None-Match` with the quoted digest.
    pub fn if_none_match(mut self, digest: Option<String>) -> Self {
        self.etag = digest;
        self
    }

    pub async fn open(&self) -> Result<Request, FetchError> {
        let mut builder = self
            .http
            .get(self.endpoint.clone())
            .header(ACCEPT_ENCODING, GZIP);
        if let Some(etag) = &self.etag {
            builder = builder.header(IF_NONE_MATCH, format!("\"{etag}\""));
        }
        self.send(builder).await
    }

    async fn open_range(&self, range: &Range<u64>) -> Result<Request, FetchError> {
        let builder = self
            .http
            .get(self.endpoint.clone())
            .header(RANGE, format!("bytes={}-{}", range.start, range.end - 1));
        self.send(builder).await
    }

    async fn send(&self, mut builder: reqwest::RequestBuilder) -> Result<Request, FetchError> {
        if let Some(accept) = &self.accept {
            builder = builder.header(ACCEPT, accept);
        }
        if let Some(auth) = &self.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = builder.send().await.map_err(|source| FetchError::Http {
            url: self.endpoint.clone(),
            source,
        })?;
        Ok(Request { response })
    }
}

#[async_trait]
impl RangeRequestFactory for RequestFactory {
    async fn fetch_range(
        &self,
        range: Range<u64>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, CodecError> {
        let len = range.end - range.start;
        let fetched = async {
            let request = self.open_range(&range).await?;
            match request.status() {
                StatusCode::PARTIAL_CONTENT => request.copy_slice(out, 0, len).await,
                // Range ignored, the whole file is streaming past.
                StatusCode::OK => Ok(request
                    .copy_slice(out, range.start, len)
                    .await?
                    .min(len)),
                status => Err(FetchError::UnexpectedStatus {
                    url: self.endpoint.clone(),
                    status,
                }),
            }
        };
        fetched.await.map_err(|e| CodecError::Range(Box::new(e)))
    }
}

/// An open response.  Bodies sent with `Content-Encoding: gzip` are
/// decompressed transparently.
#[derive(Debug)]
pub struct Request {
    response: reqwest::Response,
}

impl Request {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
    }

    /// Stream body bytes `skip..skip + take` into `writer`.
    ///
    /// Returns how many body bytes followed `skip`, which exceeds `take`
    /// when the body is longer than asked for.
    pub async fn copy_slice<W>(self, writer: &mut W, skip: u64, take: u64) -> Result<u64, FetchError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let end = skip.saturating_add(take);
        let mut stream = self.response.bytes_stream();
        let mut pos = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let chunk_start = pos;
            pos += chunk.len() as u64;
            let lo = skip.clamp(chunk_start, pos);
            let hi = end.clamp(chunk_start, pos);
            if lo < hi {
                let slice = &chunk[(lo - chunk_start) as usize..(hi - chunk_start) as usize];
                writer.write_all(slice).await?;
            }
        }
        Ok(pos.saturating_sub(skip))
    }

    /// Stream the body into `writer`, handing every chunk to `tap` first.
    pub async fn copy_to<W, T>(self, writer: &mut W, mut tap: T) -> Result<u64, FetchError>
    where
        W: AsyncWrite + Unpin,
        T: FnMut(&[u8]),
    {
        let mut stream = self.response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tap(&chunk);
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(total)
    }
}

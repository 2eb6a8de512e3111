use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::{CONTENT_TYPE, DATE, ETAG, HeaderMap, HeaderName, LAST_MODIFIED};
use reqwest::{Client, Proxy, RequestBuilder, Response};
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;

use crate::config::HttpConfig;
use crate::pki::errors::{PkiError, PkiResult};

/// Proxy URL per scheme (`http`, `https`).
pub type ProxyMap = BTreeMap<String, String>;

/// Change markers reported by a remote source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    pub etag: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl Probe {
    /// Read the entity tag and the modification date. `Last-Modified` wins
    /// over `Date` when a server sends both.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let date = text(LAST_MODIFIED)
            .or_else(|| text(DATE))
            .and_then(|value| parse_http_date(&value));
        Self {
            etag: text(ETAG),
            date,
        }
    }

    /// Whether the remote copy differs from the last one seen.
    ///
    /// A source that reports neither marker cannot be compared and always
    /// counts as changed.
    pub fn differs_from(&self, etag: Option<&str>, date: Option<DateTime<Utc>>) -> bool {
        if self.etag.is_none() && self.date.is_none() {
            return true;
        }
        let etag_changed = self.etag.as_deref().is_some_and(|e| Some(e) != etag);
        let date_changed = self.date.is_some_and(|d| Some(d) != date);
        etag_changed || date_changed
    }
}

/// HTTP dates are RFC 2822 with a `GMT` zone.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// A downloaded body, kept in memory up to the configured limit and
/// spooled to a temporary file above it. The file is removed on drop.
#[derive(Debug)]
pub enum Body {
    Memory(Vec<u8>),
    Spooled { path: TempPath, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Memory(data) => data.len() as u64,
            Body::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self, Body::Spooled { .. })
    }

    /// The whole body. Decoding needs it in one piece, so a spooled body is
    /// read back here; its size is bounded by `max_body_size`.
    pub async fn bytes(&self) -> PkiResult<Cow<'_, [u8]>> {
        match self {
            Body::Memory(data) => Ok(Cow::Borrowed(data)),
            Body::Spooled { path, .. } => Ok(Cow::Owned(tokio::fs::read(path).await?)),
        }
    }
}

/// Collects a body chunk by chunk. It moves to a temporary file once it
/// outgrows `max_memory_size` and is refused past `max_body_size`.
struct Spooler<'a> {
    url: &'a str,
    max_memory_size: usize,
    max_body_size: u64,
    buffer: Vec<u8>,
    spool: Option<(File, TempPath)>,
    len: u64,
}

impl<'a> Spooler<'a> {
    fn new(url: &'a str, max_memory_size: usize, max_body_size: u64) -> Self {
        Self {
            url,
            max_memory_size,
            max_body_size,
            buffer: Vec::new(),
            spool: None,
            len: 0,
        }
    }

    fn too_large(&self) -> PkiError {
        PkiError::connection(
            self.url,
            format!("body exceeds {} bytes", self.max_body_size),
        )
    }

    async fn push(&mut self, chunk: &[u8]) -> PkiResult<()> {
        self.len += chunk.len() as u64;
        if self.len > self.max_body_size {
            return Err(self.too_large());
        }

        if let Some((file, _)) = self.spool.as_mut() {
            file.write_all(chunk).await?;
        } else if self.buffer.len() + chunk.len() > self.max_memory_size {
            debug!(
                "Body of {} exceeds {} bytes, spooling to disk",
                self.url, self.max_memory_size
            );
            let (mut file, path) = spool_file().await?;
            file.write_all(&self.buffer).await?;
            file.write_all(chunk).await?;
            self.buffer = Vec::new();
            self.spool = Some((file, path));
        } else {
            self.buffer.extend_from_slice(chunk);
        }
        Ok(())
    }

    async fn finish(self) -> PkiResult<Body> {
        Ok(match self.spool {
            Some((mut file, path)) => {
                file.flush().await?;
                Body::Spooled {
                    path,
                    len: self.len,
                }
            }
            None => Body::Memory(self.buffer),
        })
    }
}

async fn spool_file() -> PkiResult<(File, TempPath)> {
    let file = tokio::task::spawn_blocking(NamedTempFile::new)
        .await
        .map_err(std::io::Error::other)??;
    let (file, path) = file.into_parts();
    Ok((File::from_std(file), path))
}

/// Result of a full retrieval.
#[derive(Debug)]
pub struct Fetched {
    pub url: String,
    pub content_type: Option<String>,
    pub probe: Probe,
    pub body: Body,
}

/// The two requests the fetch protocol needs.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Header-only request.
    async fn probe(&self, url: &str, proxy: Option<ProxyMap>) -> PkiResult<Probe>;

    /// Full retrieval. Non-success statuses fail with `UrlConnection`.
    async fn fetch(&self, url: &str, proxy: Option<ProxyMap>) -> PkiResult<Fetched>;
}

/// [`HttpTransport`] over reqwest, with one client per proxy setting.
pub struct ReqwestTransport {
    timeout: Duration,
    user_agent: String,
    max_memory_size: usize,
    max_body_size: u64,
    clients: DashMap<String, Client>,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: config.user_agent.clone(),
            max_memory_size: config.max_memory_size,
            max_body_size: config.max_body_size,
            clients: DashMap::new(),
        }
    }

    fn client(&self, proxy: Option<&ProxyMap>) -> PkiResult<Client> {
        let key = proxy
            .map(|map| {
                map.iter()
                    .map(|(scheme, url)| format!("{scheme}={url}"))
                    .collect::<Vec<_>>()
                    .join(";")
            })
            .unwrap_or_default();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str());
        match proxy {
            Some(map) => {
                let invalid = |_| PkiError::Settings("invalid proxy url".to_string());
                if let Some(url) = map.get("http") {
                    builder = builder.proxy(Proxy::http(url.as_str()).map_err(invalid)?);
                }
                if let Some(url) = map.get("https") {
                    builder = builder.proxy(Proxy::https(url.as_str()).map_err(invalid)?);
                }
            }
            None => builder = builder.no_proxy(),
        }
        let client = builder
            .build()
            .map_err(|e| PkiError::Settings(format!("failed to build http client: {e}")))?;

        self.clients.insert(key, client.clone());
        Ok(client)
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> PkiResult<Response> {
        let response = match timeout(self.timeout, request.send()).await {
            Ok(result) => result.map_err(|e| PkiError::connection(url, e))?,
            Err(_) => return Err(PkiError::connection(url, "request timed out")),
        };

        if !response.status().is_success() {
            return Err(PkiError::connection(
                url,
                format!("HTTP status {}", response.status()),
            ));
        }
        Ok(response)
    }

    async fn read_body(&self, url: &str, mut response: Response) -> PkiResult<Body> {
        let mut spooler = Spooler::new(url, self.max_memory_size, self.max_body_size);
        if response
            .content_length()
            .is_some_and(|declared| declared > self.max_body_size)
        {
            return Err(spooler.too_large());
        }

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PkiError::connection(url, e))?
        {
            spooler.push(&chunk).await?;
        }
        spooler.finish().await
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn probe(&self, url: &str, proxy: Option<ProxyMap>) -> PkiResult<Probe> {
        debug!("Probing {}", url);
        let client = self.client(proxy.as_ref())?;
        let response = self.send(url, client.head(url)).await?;
        Ok(Probe::from_headers(response.headers()))
    }

    async fn fetch(&self, url: &str, proxy: Option<ProxyMap>) -> PkiResult<Fetched> {
        debug!("Fetching {}", url);
        let client = self.client(proxy.as_ref())?;
        let response = self.send(url, client.get(url)).await?;

        let probe = Probe::from_headers(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = self.read_body(url, response).await?;
        debug!("Fetched {} bytes from {}", body.len(), url);

        Ok(Fetched {
            url: url.to_string(),
            content_type,
            probe,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::decoder::{ContentType, Decoded, decode_as};
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_probe_prefers_last_modified() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(DATE, HeaderValue::from_static("Sun, 18 Oct 2026 10:00:00 GMT"));
        headers.insert(
            LAST_MODIFIED,
            HeaderValue::from_static("Thu, 01 Oct 2026 08:30:00 GMT"),
        );

        let probe = Probe::from_headers(&headers);
        assert_eq!(probe.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            probe.date,
            Some(Utc.with_ymd_and_hms(2026, 10, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_probe_ignores_unparsable_date() {
        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_static("yesterday"));
        assert_eq!(Probe::from_headers(&headers), Probe::default());
    }

    #[test]
    fn test_change_detection() {
        let date = Utc.with_ymd_and_hms(2026, 10, 1, 8, 30, 0).unwrap();
        let probe = Probe {
            etag: Some("v1".into()),
            date: Some(date),
        };

        assert!(!probe.differs_from(Some("v1"), Some(date)));
        assert!(probe.differs_from(Some("v0"), Some(date)));
        assert!(probe.differs_from(Some("v1"), None));
        assert!(probe.differs_from(None, None));

        let etag_only = Probe {
            etag: Some("v1".into()),
            date: None,
        };
        assert!(!etag_only.differs_from(Some("v1"), Some(date)));

        assert!(Probe::default().differs_from(Some("v1"), Some(date)));
    }

    #[tokio::test]
    async fn test_large_body_is_spooled() {
        const CRL5_DER: &[u8] = include_bytes!("../../../test_certs/crl5.der");

        let mut spooler = Spooler::new("http://pki.example.test/inter.crl", 64, 1 << 20);
        for chunk in CRL5_DER.chunks(50) {
            spooler.push(chunk).await.unwrap();
        }
        let body = spooler.finish().await.unwrap();

        assert!(body.is_spooled());
        assert_eq!(body.len(), CRL5_DER.len() as u64);
        let bytes = body.bytes().await.unwrap();
        assert_eq!(bytes.as_ref(), CRL5_DER);
        let Decoded::Crl(crl) = decode_as(&bytes, ContentType::Crl).unwrap() else {
            panic!("expected a revocation list");
        };
        assert_eq!(crl.crl_number.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_small_body_stays_in_memory() {
        let mut spooler = Spooler::new("http://pki.example.test/a.crl", 64, 1024);
        spooler.push(b"small").await.unwrap();
        let body = spooler.finish().await.unwrap();

        assert!(!body.is_spooled());
        assert_eq!(body.bytes().await.unwrap().as_ref(), b"small");
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused() {
        let mut spooler = Spooler::new("http://pki.example.test/huge.crl", 8, 32);
        spooler.push(&[0u8; 20]).await.unwrap();

        let result = spooler.push(&[0u8; 20]).await;
        assert!(matches!(
            result,
            Err(PkiError::UrlConnection { ref url, .. }) if url == "http://pki.example.test/huge.crl"
        ));
    }
}

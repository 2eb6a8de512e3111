use tracing::{debug, info, warn};
use url::Url;

use crate::pki::decoder::{ContentType, Decoded, decode_as};
use crate::pki::errors::{Disposition, PkiError, PkiResult};

use super::transport::{Fetched, HttpTransport, ProxyMap};

/// A decoded object together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub url: String,
    pub decoded: Decoded,
    pub size: u64,
}

/// Only absolute http(s) URLs with a host are fetchable.
pub fn validate_url(url: &str) -> PkiResult<Url> {
    let parsed = Url::parse(url.trim()).map_err(|_| PkiError::UrlInvalid(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(parsed),
        _ => Err(PkiError::UrlInvalid(url.to_string())),
    }
}

/// The content type of a fetched body.
///
/// An allow-listed `Content-Type` header is taken as is. Servers often send
/// `application/octet-stream`, so otherwise the type is guessed from the
/// extension of the URL path.
pub fn resolve_content_type(fetched: &Fetched) -> PkiResult<ContentType> {
    if let Some(header) = fetched.content_type.as_deref()
        && let Ok(content_type) = ContentType::from_mime(header)
    {
        return Ok(content_type);
    }
    ContentType::guess(&fetched.url).ok_or_else(|| {
        warn!(
            "Cannot tell the content type of {} (declared {:?})",
            fetched.url, fetched.content_type
        );
        PkiError::ContentTypeInvalid(fetched.content_type.clone())
    })
}

/// Decode a fetched body according to its resolved content type.
pub async fn decode_fetched(fetched: &Fetched) -> PkiResult<Decoded> {
    let content_type = resolve_content_type(fetched)?;
    let bytes = fetched.body.bytes().await?;
    decode_as(&bytes, content_type)
}

/// Retrieve and decode a single URL.
pub async fn get_from_url(
    transport: &dyn HttpTransport,
    url: &str,
    proxy: Option<ProxyMap>,
) -> PkiResult<Downloaded> {
    validate_url(url)?;
    let fetched = transport.fetch(url, proxy).await?;
    let decoded = decode_fetched(&fetched).await?;
    debug!("Decoded {} from {}", decoded.kind(), url);
    Ok(Downloaded {
        url: fetched.url,
        decoded,
        size: fetched.body.len(),
    })
}

/// Try `urls` in order and return the first success.
///
/// Connection failures move on to the next URL; when every URL fails the
/// last connection error is returned. Any other failure stops the loop.
pub async fn get_from_url_list(
    transport: &dyn HttpTransport,
    urls: &[String],
    proxy: Option<ProxyMap>,
) -> PkiResult<Downloaded> {
    let mut last_error = None;
    for url in urls {
        match get_from_url(transport, url, proxy.clone()).await {
            Ok(downloaded) => {
                info!("Downloaded {} from {}", downloaded.decoded.kind(), url);
                return Ok(downloaded);
            }
            Err(e) => match e.disposition() {
                Disposition::NextSource => {
                    warn!("Source {} failed: {}", url, e);
                    last_error = Some(e);
                }
                Disposition::Abort => return Err(e),
            },
        }
    }
    Err(last_error.unwrap_or_else(|| PkiError::Settings("no urls to fetch from".to_string())))
}

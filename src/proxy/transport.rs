//! Origin round trips over a dialer
//!
//! Requests are buffered so a failed attempt can be replayed once. A second
//! failure becomes a synthesized 502 instead of an error. Responses come back
//! as soon as their head arrives; the body stays a stream.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST,
};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::dialer::{format_host_port, Dialer};
use crate::error::{ProxyError, Result};

pub const REQUEST_ERROR_HEADER: &str = "x-request-error";

/// Response body handed back to clients: an origin stream or a buffered body
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Scheme, host and port of an absolute request URI
pub fn target_of(uri: &Uri) -> Result<(bool, String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest("Missing host in URI".to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string();

    let https = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    Ok((https, host, port))
}

/// The request as sent to the origin: origin-form URI and normalized headers
pub fn outbound_request(req: &Request<Bytes>) -> Result<Request<Full<Bytes>>> {
    let uri = req.uri();
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let mut outbound = Request::new(Full::new(req.body().clone()));
    *outbound.method_mut() = req.method().clone();
    *outbound.uri_mut() = path
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid path {}: {}", path, e)))?;
    *outbound.version_mut() = Version::HTTP_11;

    let headers = outbound.headers_mut();
    *headers = req.headers().clone();
    strip_hop_by_hop(headers);
    headers.remove("x-forwarded-for");
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

    if !headers.contains_key(HOST) {
        if let Some(authority) = uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
            headers.insert(HOST, value);
        }
    }

    Ok(outbound)
}

/// 502 carrying `err` in `X-Request-Error`; the client connection closes after it
pub fn bad_gateway(err: &ProxyError) -> Response<Bytes> {
    let detail: String = err
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect();

    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&detail) {
        headers.insert(REQUEST_ERROR_HEADER, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

async fn exchange<IO>(io: IO, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::Transport(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Origin connection ended: {}", e);
        }
    });

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::Transport(format!("Request failed: {}", e)))?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed_unsync()))
}

/// HTTP(S) client over any [`Dialer`]
pub struct Transport {
    dialer: Arc<dyn Dialer>,
    tls: TlsConnector,
}

impl Transport {
    pub fn new(dialer: Arc<dyn Dialer>, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            dialer,
            tls: TlsConnector::from(tls_config),
        }
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    /// One attempt: dial, optionally wrap in TLS, exchange
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn round_trip(&self, req: &Request<Bytes>) -> Result<Response<ProxyBody>> {
        let (https, host, port) = target_of(req.uri())?;
        let outbound = outbound_request(req)?;

        let conn = self.dialer.dial(&format_host_port(&host, port)).await?;
        if !https {
            return exchange(conn, outbound).await;
        }

        let name = ServerName::try_from(host.clone())
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid server name {}: {}", host, e)))?;
        let tls = self
            .tls
            .connect(name, conn)
            .await
            .map_err(|e| ProxyError::Transport(format!("TLS handshake with {} failed: {}", host, e)))?;
        exchange(tls, outbound).await
    }

    /// Round trip with one retry; never fails
    pub async fn send(&self, req: &Request<Bytes>) -> Response<ProxyBody> {
        let first = match self.round_trip(req).await {
            Ok(response) => return response,
            Err(e) => e,
        };
        debug!(uri = %req.uri(), error = %first, "Retrying request");

        match self.round_trip(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(uri = %req.uri(), error = %e, "Round trip failed twice");
                bad_gateway(&e).map(full)
            }
        }
    }
}

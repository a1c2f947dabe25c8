//! Per-request proxy logic
//!
//! CONNECT requests become blind tunnels through the upstream pool. Every
//! other request is resolved against the active rule set, forwarded (or
//! redirected), and its response offered to the body rewriters.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::HOST;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tracing::{debug, info, instrument};

use crate::context::ProxyContext;
use crate::dialer::{format_host_port, parse_host_port, Dialer};
use crate::error::{ProxyError, Result};
use crate::proxy::engine::{redirect_response, request_url, resolve_request, resolve_response, Route};
use crate::proxy::transport::{bad_gateway, full, ProxyBody};
use crate::proxy::tunnel::TunnelHandler;

/// Scheme a listener attributes to the requests it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request bodies are buffered for the retry; larger ones are refused with 413
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Plain-text response for errors raised before any upstream exchange
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

fn authority_of<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

/// Absolute URI for `req` under `scheme`, taking the authority from the
/// request line or else the Host header
fn absolute_uri<B>(scheme: Scheme, req: &Request<B>) -> Result<Uri> {
    let authority = authority_of(req)
        .ok_or_else(|| ProxyError::InvalidRequest("Missing Host header".to_string()))?;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path)
        .build()
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid request target: {}", e)))
}

/// `host:port` for a CONNECT target; the port defaults to 443
fn connect_address(authority: &str) -> Result<String> {
    let (host, port) = parse_host_port(authority)
        .or_else(|_| parse_host_port(&format!("{}:443", authority)))
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid CONNECT target: {}", e)))?;
    Ok(format_host_port(&host, port))
}

pub struct ProxyHandler {
    ctx: Arc<ProxyContext>,
    scheme: Scheme,
    max_request_body: usize,
}

impl ProxyHandler {
    pub fn new(ctx: Arc<ProxyContext>, scheme: Scheme) -> Self {
        Self {
            ctx,
            scheme,
            max_request_body: MAX_REQUEST_BODY_BYTES,
        }
    }

    pub fn with_max_request_body(mut self, bytes: usize) -> Self {
        self.max_request_body = bytes;
        self
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        self.handle_http(req).await
    }

    async fn handle_connect<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>> {
        let authority = authority_of(&req)
            .ok_or_else(|| ProxyError::InvalidRequest("CONNECT without a target".to_string()))?;
        let address = connect_address(&authority)?;

        // The client only sees 200 once the upstream leg exists.
        let upstream = match self.ctx.pool().dial(&address).await {
            Ok(conn) => conn,
            Err(e) => {
                info!(target = %address, error = %e, "CONNECT dial failed");
                return Ok(bad_gateway(&ProxyError::Dial(e)).map(full));
            }
        };
        debug!(target = %address, "CONNECT tunnel established");

        let on_upgrade: OnUpgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let (up, down) =
                        TunnelHandler::copy_bidirectional(TokioIo::new(upgraded), upstream).await;
                    debug!(target = %address, up, down, "CONNECT tunnel closed");
                }
                Err(e) => debug!(target = %address, error = %e, "CONNECT upgrade failed"),
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(full(Bytes::new()))?)
    }

    async fn handle_http<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let uri = absolute_uri(self.scheme, &req)?;
        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        let body = match Limited::new(body, self.max_request_body).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                return Err(ProxyError::BodyTooLarge {
                    limit: self.max_request_body,
                });
            }
            Err(e) => {
                return Err(ProxyError::InvalidRequest(format!(
                    "Failed to read request body: {}",
                    e
                )));
            }
        };
        let mut req = Request::from_parts(parts, body);

        let rules = self.ctx.rules();
        let transport = match resolve_request(&rules, &mut req) {
            Route::Redirect(target) => {
                debug!(location = %target, "Redirecting");
                return Ok(redirect_response(&target).map(full));
            }
            Route::Remote => self.ctx.remote(),
            Route::Local => self.ctx.local(&rules),
        };

        let response = transport.send(&req).await;
        let response = match request_url(&req) {
            Some(url) => resolve_response(&rules, &url, response).await,
            None => response,
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DialerPool;
    use crate::rules::RuleSet;
    use crate::shutdown::ExitSignal;
    use crate::tls::CertificateMinter;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context() -> Arc<ProxyContext> {
        Arc::new(ProxyContext::new(
            Arc::new(CertificateMinter::embedded().unwrap()),
            crate::tls::insecure_client_config().unwrap(),
            ExitSignal::new(),
        ))
    }

    /// Origin that answers every connection with `response` and counts hits
    async fn origin(response: &'static str) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                            return;
                        }
                        head.push(byte[0]);
                    }
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (port, hits)
    }

    fn request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_of(response: Response<ProxyBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_absolute_uri_from_host_header() {
        let req = Request::builder()
            .uri("/path?q=1")
            .header(HOST, "example.com:8443")
            .body(())
            .unwrap();
        let uri = absolute_uri(Scheme::Https, &req).unwrap();
        assert_eq!(uri.to_string(), "https://example.com:8443/path?q=1");
    }

    #[test]
    fn test_absolute_uri_prefers_request_line() {
        let req = Request::builder()
            .uri("http://a.example/x")
            .header(HOST, "b.example")
            .body(())
            .unwrap();
        let uri = absolute_uri(Scheme::Http, &req).unwrap();
        assert_eq!(uri.to_string(), "http://a.example/x");
    }

    #[test]
    fn test_connect_address_defaults_to_443() {
        assert_eq!(connect_address("example.com:8443").unwrap(), "example.com:8443");
        assert_eq!(connect_address("example.com").unwrap(), "example.com:443");
        assert_eq!(connect_address("[::1]").unwrap(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_request() {
        let handler = ProxyHandler::new(context(), Scheme::Http);
        let err = handler.handle(request("/only-a-path")).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_request_body_refused() {
        let (port, hits) = origin("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let handler = ProxyHandler::new(context(), Scheme::Http).with_max_request_body(16);

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://127.0.0.1:{}/upload", port))
            .body(Full::new(Bytes::from(vec![b'a'; 17])))
            .unwrap();
        let err = handler.handle(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::BodyTooLarge { limit: 16 }));
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redirect_rule_answers_without_dialing() {
        let (port, hits) = origin("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let ctx = context();
        ctx.set_rules(
            RuleSet::from_json(
                br#"{"srules": [{"type": 1, "compilers": [
                    {"host": "127.0.0.1", "url": ".*", "match": ["s@/old@/new@"]}
                ]}]}"#,
            )
            .unwrap(),
        );
        let handler = ProxyHandler::new(ctx, Scheme::Http);

        let uri = format!("http://127.0.0.1:{}/old", port);
        let response = handler.handle(request(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[hyper::header::LOCATION],
            format!("http://127.0.0.1:{}/new", port)
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_html_response_rewritten() {
        let (port, _) = origin(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;
        let ctx = context();
        ctx.set_rules(
            RuleSet::from_json(
                br#"{"limits": {"max_response_content_len": 4096},
                    "srules": [{"type": 2, "compilers": [
                        {"host": "127.0.0.1", "url": ".*", "match": ["s/world/proxy/"]}
                    ]}]}"#,
            )
            .unwrap(),
        );
        let handler = ProxyHandler::new(ctx, Scheme::Http);

        let response = handler
            .handle(request(&format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[hyper::header::CONTENT_LENGTH], "11");
        assert!(response
            .headers()
            .contains_key(hyper::header::CONTENT_SECURITY_POLICY));
        assert_eq!(body_of(response).await, Bytes::from_static(b"hello proxy"));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = ProxyHandler::new(context(), Scheme::Http);
        let response = handler
            .handle(request(&format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response
            .headers()
            .contains_key(crate::proxy::transport::REQUEST_ERROR_HEADER));
    }

    #[tokio::test]
    async fn test_connect_dial_failure_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let direct: Arc<dyn Dialer> = Arc::new(crate::dialer::DirectDialer::default());
        let ctx = Arc::new(ProxyContext::with_dialers(
            Arc::new(DialerPool::new(direct.clone())),
            direct,
            Arc::new(CertificateMinter::embedded().unwrap()),
            crate::tls::insecure_client_config().unwrap(),
            ExitSignal::new(),
        ));
        let handler = ProxyHandler::new(ctx, Scheme::Http);

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri(format!("127.0.0.1:{}", port))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handler.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}

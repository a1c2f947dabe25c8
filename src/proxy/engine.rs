//! Rule resolution around a round trip
//!
//! Requests are checked, in order, against fast-redirect, redirect and
//! rewrite rules before they are sent. Responses that declare a small enough
//! length are then buffered and offered to the HTML or JavaScript rewrite
//! rules. Everything else streams through untouched.

use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Limited};
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
    CONTENT_TYPE, LOCATION,
};
use hyper::{Request, Response, StatusCode, Uri};
use percent_encoding::percent_decode;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ProxyError;
use crate::proxy::transport::{bad_gateway, full, ProxyBody};
use crate::rules::{RuleKind, RuleSet};

/// Policy sent with every rewritten page so injected inline scripts can run
pub const RELAXED_CSP: &str = "default-src * blob: data: 'unsafe-inline' 'unsafe-eval';";

const CSP_HEADERS: [&str; 3] = [
    "content-security-policy",
    "x-webkit-csp",
    "x-content-security-policy",
];

const JAVASCRIPT_TYPES: [&str; 3] = [
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
];

/// Where a request goes after rule resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answer with a redirect instead of dialing
    Redirect(Url),
    /// Send through the upstream pool
    Remote,
    /// Send through the transport chosen by the rule set's local flag
    Local,
}

/// Absolute URL of a request whose URI already carries scheme and authority
pub fn request_url<B>(req: &Request<B>) -> Option<Url> {
    Url::parse(&req.uri().to_string()).ok()
}

fn same_authority(a: &Url, b: &Url) -> bool {
    let host_a = a.host_str().unwrap_or_default();
    let host_b = b.host_str().unwrap_or_default();
    host_a.eq_ignore_ascii_case(host_b) && a.port_or_known_default() == b.port_or_known_default()
}

fn redirect_target(rules: &RuleSet, kind: RuleKind, url: &Url, decode: bool) -> Option<Url> {
    let output = rules.replace(kind, url, url.as_str().as_bytes()).ok()?;
    let target = if decode {
        match percent_decode(&output).decode_utf8() {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => String::from_utf8_lossy(&output).into_owned(),
        }
    } else {
        String::from_utf8_lossy(&output).into_owned()
    };

    match Url::parse(&target) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(%url, %kind, target = %target, error = %e, "Rule produced an unparsable URL");
            None
        }
    }
}

/// Apply the URL rules to `req`, rewriting its URI in place when allowed
pub fn resolve_request<B>(rules: &RuleSet, req: &mut Request<B>) -> Route {
    let Some(url) = request_url(req) else {
        return Route::Local;
    };

    for (kind, decode) in [
        (RuleKind::FastRedirectUrl, true),
        (RuleKind::RedirectUrl, false),
        (RuleKind::RewriteUrl, false),
    ] {
        let Some(target) = redirect_target(rules, kind, &url, decode) else {
            continue;
        };

        return match kind {
            RuleKind::FastRedirectUrl | RuleKind::RedirectUrl => {
                if url.as_str().eq_ignore_ascii_case(target.as_str()) {
                    debug!(%url, "Redirect rule kept the URL, sending remote");
                    Route::Remote
                } else {
                    info!(%url, %target, "Redirecting request");
                    Route::Redirect(target)
                }
            }
            RuleKind::RewriteUrl => {
                if !same_authority(&url, &target) {
                    error!(%url, %target, "Rejected rewrite that changes the host");
                    return Route::Local;
                }
                match target.as_str().parse::<Uri>() {
                    Ok(uri) => {
                        info!(%url, %target, "Rewriting request");
                        *req.uri_mut() = uri;
                        Route::Remote
                    }
                    Err(e) => {
                        warn!(%target, error = %e, "Rewritten URL is not a valid URI");
                        Route::Local
                    }
                }
            }
            RuleKind::RewriteHtml | RuleKind::RewriteJs => Route::Local,
        };
    }

    Route::Local
}

/// 302 pointing at `target`; the connection closes afterwards
pub fn redirect_response(target: &Url) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    if let Ok(location) = HeaderValue::from_str(target.as_str()) {
        headers.insert(LOCATION, location);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn declared_length<B>(response: &Response<B>) -> Option<i64> {
    response
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Body size to buffer when `response` is eligible for rewriting
fn rewrite_window<B>(rules: &RuleSet, response: &Response<B>) -> Option<u64> {
    match declared_length(response) {
        Some(len) if len > 0 && len <= rules.max_rewrite_body_bytes() => Some(len as u64),
        _ => None,
    }
}

fn content_rule<B>(response: &Response<B>) -> Option<RuleKind> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)?
        .to_str()
        .ok()?
        .to_lowercase();

    if content_type.contains("text/html") {
        Some(RuleKind::RewriteHtml)
    } else if JAVASCRIPT_TYPES.iter().any(|t| content_type.contains(t)) {
        Some(RuleKind::RewriteJs)
    } else {
        None
    }
}

fn is_gzip<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Decompress `body`, or `None` once the output passes `limit` bytes
fn gunzip(body: &[u8], limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut decoded = Vec::with_capacity(body.len() * 2);
    GzDecoder::new(body)
        .take(limit.saturating_add(1))
        .read_to_end(&mut decoded)?;
    if decoded.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(decoded))
}

/// Replace every CSP header with the relaxed policy
pub fn relax_csp<B>(response: &mut Response<B>) {
    let headers = response.headers_mut();
    for name in CSP_HEADERS {
        headers.remove(name);
    }
    let policy = HeaderValue::from_static(RELAXED_CSP);
    headers.insert(CONTENT_SECURITY_POLICY, policy.clone());
    headers.insert("x-webkit-csp", policy.clone());
    headers.insert("x-content-security-policy", policy);
}

/// Offer an origin response to the content rules for `url`
///
/// Only bodies inside the rewrite window are read; any other response is
/// handed back with its body still streaming.
pub async fn resolve_response(
    rules: &RuleSet,
    url: &Url,
    response: Response<ProxyBody>,
) -> Response<ProxyBody> {
    let Some(window) = rewrite_window(rules, &response) else {
        return response;
    };
    if content_rule(&response).is_none() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let body = match Limited::new(body, window as usize).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(%url, error = %e, "Failed to read response body");
            let err = ProxyError::Transport(format!("Failed to read response: {}", e));
            return bad_gateway(&err).map(full);
        }
    };

    rewrite_buffered(rules, url, Response::from_parts(parts, body)).map(full)
}

/// Run the content rules over a fully read response
///
/// Anything that is not rewritten is returned exactly as received.
pub fn rewrite_buffered(rules: &RuleSet, url: &Url, mut response: Response<Bytes>) -> Response<Bytes> {
    if rewrite_window(rules, &response).is_none() {
        return response;
    }

    let Some(kind) = content_rule(&response) else {
        return response;
    };

    let gzip = is_gzip(&response);
    let rewritten = if gzip {
        let limit = rules.max_rewrite_body_bytes().max(0) as u64;
        match gunzip(response.body(), limit) {
            Ok(Some(plain)) => rules.replace(kind, url, &plain),
            Ok(None) => {
                warn!(%url, limit, "Decompressed body exceeds rewrite limit");
                return response;
            }
            Err(e) => {
                warn!(%url, error = %e, "Failed to decompress response body");
                return response;
            }
        }
    } else {
        rules.replace(kind, url, response.body())
    };

    let Ok(body) = rewritten else {
        return response;
    };

    info!(
        %url,
        %kind,
        old_size = response.body().len(),
        new_size = body.len(),
        "Rewrote response body"
    );

    let headers = response.headers_mut();
    if gzip {
        headers.remove(CONTENT_ENCODING);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    *response.body_mut() = Bytes::from(body);
    relax_csp(&mut response);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http_body_util::StreamBody;
    use hyper::body::Frame;
    use std::io::Write;
    use std::time::Duration;

    fn rules(json: &str) -> RuleSet {
        RuleSet::from_json(json.as_bytes()).unwrap()
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    fn html(body: &str) -> Response<Bytes> {
        Response::builder()
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header(CONTENT_LENGTH, body.len())
            .header(CONTENT_SECURITY_POLICY, "script-src 'self'")
            .body(Bytes::from(body.to_string()))
            .unwrap()
    }

    const HTML_RULES: &str = r#"{
        "limits": {"max_response_content_len": 1000},
        "srules": [{"type": 2, "compilers": [
            {"host": ".example.com", "url": ".*", "match": ["s@</body>@<script>hi()</script></body>@"]}
        ]}, {"type": 3, "compilers": [
            {"host": ".", "url": "\\.js$", "match": ["s@^@/*x*/@"]}
        ]}]
    }"#;

    #[test]
    fn test_no_rules_route_local() {
        let set = RuleSet::empty();
        let mut req = get("http://example.com/");
        assert_eq!(resolve_request(&set, &mut req), Route::Local);
    }

    #[test]
    fn test_redirect_rule() {
        let set = rules(
            r#"{"srules": [{"type": 1, "compilers": [
                {"host": "old.com", "url": ".*", "match": ["s@old\\.com@new.com@"]}
            ]}]}"#,
        );
        let mut req = get("http://old.com/page");
        let route = resolve_request(&set, &mut req);
        assert_eq!(route, Route::Redirect(Url::parse("http://new.com/page").unwrap()));

        let Route::Redirect(target) = route else { unreachable!() };
        let resp = redirect_response(&target);
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[LOCATION], "http://new.com/page");
        assert_eq!(resp.headers()[CONTENT_LENGTH], "0");
        assert_eq!(resp.headers()[CONNECTION], "close");
    }

    #[test]
    fn test_redirect_to_same_url_routes_remote() {
        let set = rules(
            r#"{"srules": [{"type": 1, "compilers": [
                {"host": ".", "url": ".*", "match": ["s@HTTP@http@i"]}
            ]}]}"#,
        );
        let mut req = get("http://example.com/");
        assert_eq!(resolve_request(&set, &mut req), Route::Remote);
    }

    #[test]
    fn test_fast_redirect_percent_decodes() {
        let set = rules(
            r#"{"srules": [{"type": 4, "compilers": [
                {"host": "jump.com", "url": "to=", "match": ["s@^.*to=(.*)$@$1@"]}
            ]}]}"#,
        );
        let mut req = get("http://jump.com/go?to=https%3A%2F%2Fdest.org%2Fa%3Fb%3Dc");
        assert_eq!(
            resolve_request(&set, &mut req),
            Route::Redirect(Url::parse("https://dest.org/a?b=c").unwrap())
        );
    }

    #[test]
    fn test_fast_redirect_checked_before_redirect() {
        let set = rules(
            r#"{"srules": [
                {"type": 1, "compilers": [{"host": ".", "url": ".*", "match": ["s@a\\.com@slow.com@"]}]},
                {"type": 4, "compilers": [{"host": ".", "url": ".*", "match": ["s@a\\.com@fast.com@"]}]}
            ]}"#,
        );
        let mut req = get("http://a.com/");
        assert_eq!(
            resolve_request(&set, &mut req),
            Route::Redirect(Url::parse("http://fast.com/").unwrap())
        );
    }

    #[test]
    fn test_rewrite_same_host_mutates_request() {
        let set = rules(
            r#"{"srules": [{"type": 0, "compilers": [
                {"host": "example.com", "url": "/old", "match": ["s@/old@/new@"]}
            ]}]}"#,
        );
        let mut req = get("http://example.com/old?q=1");
        assert_eq!(resolve_request(&set, &mut req), Route::Remote);
        assert_eq!(req.uri().to_string(), "http://example.com/new?q=1");
    }

    #[test]
    fn test_rewrite_cross_host_rejected() {
        let set = rules(
            r#"{"srules": [{"type": 0, "compilers": [
                {"host": "example.com", "url": ".*", "match": ["s@example\\.com@evil.com@"]}
            ]}]}"#,
        );
        let mut req = get("http://example.com/path");
        assert_eq!(resolve_request(&set, &mut req), Route::Local);
        assert_eq!(req.uri().to_string(), "http://example.com/path");
    }

    #[test]
    fn test_rewrite_port_change_rejected() {
        let set = rules(
            r#"{"srules": [{"type": 0, "compilers": [
                {"host": "example.com", "url": ".*", "match": ["s@example\\.com/@example.com:8080/@"]}
            ]}]}"#,
        );
        let mut req = get("http://example.com/");
        assert_eq!(resolve_request(&set, &mut req), Route::Local);
    }

    #[test]
    fn test_html_rewrite_updates_length_and_csp() {
        let set = rules(HTML_RULES);
        let body = format!("<html><body>{}</body></html>", "x".repeat(94));
        assert_eq!(body.len(), 120);

        let url = Url::parse("https://www.example.com/").unwrap();
        let resp = rewrite_buffered(&set, &url, html(&body));

        let expected = body.replace("</body>", "<script>hi()</script></body>");
        assert_eq!(resp.body(), expected.as_bytes());
        assert_eq!(resp.headers()[CONTENT_LENGTH], expected.len().to_string().as_str());
        assert_eq!(resp.headers()[CONTENT_SECURITY_POLICY], RELAXED_CSP);
        assert_eq!(resp.headers()["x-webkit-csp"], RELAXED_CSP);
        assert_eq!(resp.headers()["x-content-security-policy"], RELAXED_CSP);
    }

    #[test]
    fn test_oversized_response_untouched() {
        let set = rules(HTML_RULES);
        let body = format!("<body>{}</body>", "x".repeat(2000));
        let url = Url::parse("https://www.example.com/").unwrap();
        let resp = rewrite_buffered(&set, &url, html(&body));

        assert_eq!(resp.body(), body.as_bytes());
        assert_eq!(resp.headers()[CONTENT_SECURITY_POLICY], "script-src 'self'");
    }

    #[test]
    fn test_unknown_length_and_empty_untouched() {
        let set = rules(HTML_RULES);
        let url = Url::parse("https://www.example.com/").unwrap();

        let mut chunked = html("<body></body>");
        chunked.headers_mut().remove(CONTENT_LENGTH);
        assert_eq!(rewrite_buffered(&set, &url, chunked).body(), "<body></body>".as_bytes());

        let mut empty = html("<body></body>");
        empty.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert_eq!(rewrite_buffered(&set, &url, empty).body(), "<body></body>".as_bytes());
    }

    #[test]
    fn test_no_match_keeps_headers() {
        let set = rules(HTML_RULES);
        let url = Url::parse("https://other.org/").unwrap();
        let resp = rewrite_buffered(&set, &url, html("<body></body>"));
        assert_eq!(resp.body(), "<body></body>".as_bytes());
        assert_eq!(resp.headers()[CONTENT_SECURITY_POLICY], "script-src 'self'");
    }

    #[test]
    fn test_javascript_rewrite() {
        let set = rules(HTML_RULES);
        let url = Url::parse("http://cdn.net/app.js").unwrap();
        let resp = Response::builder()
            .header(CONTENT_TYPE, "application/javascript")
            .header(CONTENT_LENGTH, 5)
            .body(Bytes::from_static(b"run()"))
            .unwrap();

        let resp = rewrite_buffered(&set, &url, resp);
        assert_eq!(resp.body(), "/*x*/run()".as_bytes());
        assert_eq!(resp.headers()[CONTENT_LENGTH], "10");
    }

    #[test]
    fn test_gzip_rewrite_decompresses() {
        let set = rules(HTML_RULES);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<body></body>").unwrap();
        let compressed = encoder.finish().unwrap();

        let resp = Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_LENGTH, compressed.len())
            .body(Bytes::from(compressed))
            .unwrap();

        let url = Url::parse("http://example.com/").unwrap();
        let resp = rewrite_buffered(&set, &url, resp);
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(resp.body(), "<body><script>hi()</script></body>".as_bytes());
    }

    #[test]
    fn test_corrupt_gzip_returned_unmodified() {
        let set = rules(HTML_RULES);
        let resp = Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_LENGTH, 4)
            .body(Bytes::from_static(b"nope"))
            .unwrap();

        let url = Url::parse("http://example.com/").unwrap();
        let resp = rewrite_buffered(&set, &url, resp);
        assert_eq!(resp.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(resp.body(), "nope".as_bytes());
    }

    fn gzip(body: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_gzip_expanding_past_limit_returned_unmodified() {
        let set = rules(HTML_RULES);
        let mut plain = b"<body>".to_vec();
        plain.extend(std::iter::repeat(b'x').take(64 * 1024));
        plain.extend_from_slice(b"</body>");
        let compressed = gzip(&plain);
        assert!(compressed.len() < 1000);

        let resp = Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_LENGTH, compressed.len())
            .body(Bytes::from(compressed.clone()))
            .unwrap();

        let url = Url::parse("http://example.com/").unwrap();
        let resp = rewrite_buffered(&set, &url, resp);
        assert_eq!(resp.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(resp.body().as_ref(), compressed.as_slice());
    }

    #[tokio::test]
    async fn test_response_without_length_keeps_streaming() {
        let set = rules(HTML_RULES);
        let url = Url::parse("https://www.example.com/").unwrap();
        let endless = StreamBody::new(futures::stream::pending::<
            std::result::Result<Frame<Bytes>, hyper::Error>,
        >());
        let resp = Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .body(endless.boxed_unsync())
            .unwrap();

        let resp = tokio::time::timeout(Duration::from_secs(1), resolve_response(&set, &url, resp))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(CONTENT_SECURITY_POLICY).is_none());
    }

    #[tokio::test]
    async fn test_response_inside_window_is_read_and_rewritten() {
        let set = rules(HTML_RULES);
        let url = Url::parse("https://www.example.com/").unwrap();
        let resp = Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_LENGTH, 13)
            .body(full("<body></body>"))
            .unwrap();

        let resp = resolve_response(&set, &url, resp).await;
        assert_eq!(resp.headers()[CONTENT_SECURITY_POLICY], RELAXED_CSP);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"<body><script>hi()</script></body>"));
    }
}

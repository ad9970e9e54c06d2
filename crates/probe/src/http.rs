//! HTTP probe: one request with auth, query merging and a hard timeout.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use url::Url;

use beacon_core::HttpAuth;

use crate::result::{elapsed_ms, ProbeResult};
use crate::spec::HttpProbe;

/// Reasons a request could not even be built.
#[derive(Debug, thiserror::Error)]
pub enum RequestBuildError {
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid HTTP method: {0}")]
    Method(String),

    #[error("Invalid header {0}")]
    Header(String),

    #[error("Invalid body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Execute an HTTP probe with `client`.
///
/// The caller picks the client so the redirect policy matches
/// `probe.follow_redirects`.
pub async fn execute(client: &reqwest::Client, probe: &HttpProbe) -> ProbeResult {
    let start = Instant::now();

    let request = match build_request(client, probe) {
        Ok(r) => r,
        Err(e) => return ProbeResult::failure(e.to_string(), elapsed_ms(start)),
    };

    let outcome = tokio::time::timeout(probe.timeout, async {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok::<_, reqwest::Error>((status, text))
    })
    .await;

    let latency_ms = elapsed_ms(start);
    let result = match outcome {
        Err(_) => ProbeResult::failure("HTTP timeout", latency_ms),
        Ok(Err(e)) => ProbeResult::failure(describe_error(&e), latency_ms),
        Ok(Ok((status, text))) => ProbeResult {
            status_code: Some(status),
            latency_ms,
            response: Some(parse_body(text)),
            error: None,
        },
    };

    result.expect_status(probe.expected_status)
}

pub(crate) fn build_request(
    client: &reqwest::Client,
    probe: &HttpProbe,
) -> Result<reqwest::RequestBuilder, RequestBuildError> {
    let url = merge_query(&probe.url, &probe.query)?;

    let method = reqwest::Method::from_bytes(probe.method.to_uppercase().as_bytes())
        .map_err(|_| RequestBuildError::Method(probe.method.clone()))?;

    let body = match &probe.body {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(serde_json::to_vec(value)?),
    };

    let headers = build_headers(probe, body.is_some())?;

    let mut request = client.request(method, url).headers(headers);
    if let Some(bytes) = body {
        request = request.body(bytes);
    }
    Ok(request)
}

/// Merge query parameters into the URL, replacing existing keys.
pub(crate) fn merge_query(
    raw: &str,
    query: &std::collections::BTreeMap<String, String>,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw)?;
    if query.is_empty() {
        return Ok(url);
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !query.contains_key(k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

fn build_headers(probe: &HttpProbe, has_body: bool) -> Result<HeaderMap, RequestBuildError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &probe.headers {
        insert_header(&mut headers, name, value)?;
    }

    match &probe.auth {
        Some(HttpAuth::Bearer { token }) => {
            insert_header(&mut headers, AUTHORIZATION.as_str(), &format!("Bearer {token}"))?;
        }
        Some(HttpAuth::Basic { username, password }) => {
            let encoded = STANDARD.encode(format!("{username}:{password}"));
            insert_header(&mut headers, AUTHORIZATION.as_str(), &format!("Basic {encoded}"))?;
        }
        Some(HttpAuth::Header { name, value }) => {
            insert_header(&mut headers, name, value)?;
        }
        None => {}
    }

    if has_body && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    Ok(headers)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), RequestBuildError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| RequestBuildError::Header(format!("name: {name}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| RequestBuildError::Header(format!("value for {name}")))?;
    headers.insert(name, value);
    Ok(())
}

/// JSON when the body parses, raw text otherwise.
fn parse_body(text: String) -> serde_json::Value {
    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
}

fn describe_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        return "HTTP timeout".to_string();
    }
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        message = format!("{message}: {inner}");
        source = inner.source();
    }
    message
}

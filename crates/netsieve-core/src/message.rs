//! Reconstructed requests and responses.
//!
//! Turns carved [`RawMessage`]s into [`ParsedRequest`] and [`ResponsePart`]
//! values, and holds the URL helpers rule matching works on.

use serde::{Deserialize, Serialize};

use crate::flow::{FlowId, Transport};
use crate::parser::{parse_request_start, parse_status_start, RawMessage};

/// A reconstructed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRequest {
    /// Flow the request was carved from; `None` for structured call sources.
    pub flow: Option<FlowId>,
    /// Instrumentation point the request came from.
    pub transport: Transport,
    /// Request method, as sent.
    pub method: String,
    /// Full URL: scheme, host and request target.
    pub url: String,
    /// Value rules are matched against; see [`canonical_url`].
    pub canonical: String,
    /// Header lines after the request line.
    pub headers: String,
    /// Request body, subject to the collection policy.
    pub body: Option<Vec<u8>>,
    /// Request `Content-Type`, if declared.
    pub content_type: Option<String>,
    /// Call-site snapshot supplied by the adapter.
    pub snapshot: Option<String>,
    /// Resolved host name for DNS flows.
    pub dns_host: Option<String>,
    /// Resolved addresses for DNS flows.
    pub dns_addresses: Vec<String>,
}

impl ParsedRequest {
    /// Creates a request with no headers, body or DNS data.
    pub fn new(transport: Transport, method: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            flow: None,
            transport,
            method: method.into(),
            canonical: canonical_url(&url),
            url,
            headers: String::new(),
            body: None,
            content_type: None,
            snapshot: None,
            dns_host: None,
            dns_addresses: Vec::new(),
        }
    }

    /// Builds a request from a carved message observed on `flow`.
    ///
    /// Fails with a reason when the request line is unusable or no host can
    /// be resolved from the `Host` header or an absolute-form target.
    pub fn from_message(flow: FlowId, message: &RawMessage) -> Result<Self, String> {
        let (method, target) = parse_request_start(message.start_line())?;
        let url = request_url(flow.scheme(), target, message.header("host"))?;

        let mut request = Self::new(flow.transport(), method, url);
        request.flow = Some(flow);
        request.headers = message.header_text();
        request.body = message.body.clone();
        request.content_type = message.header("content-type").map(str::to_string);
        Ok(request)
    }

    /// Returns the de-duplication key: the DNS host if present, else the
    /// canonical URL. `None` when neither is usable.
    pub fn dedup_key(&self) -> Option<&str> {
        match self.dns_host.as_deref() {
            Some(host) if !host.is_empty() => Some(host),
            _ if !self.canonical.is_empty() => Some(&self.canonical),
            _ => None,
        }
    }
}

/// Response half of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePart {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub status_message: String,
    /// Header lines after the status line.
    pub headers: String,
    /// Response body, subject to the collection policy.
    pub body: Option<Vec<u8>>,
    /// `<content-type>[; encoding=<content-encoding>]`.
    pub content_descriptor: Option<String>,
}

impl ResponsePart {
    /// Builds a response from a carved message.
    pub fn from_message(message: &RawMessage) -> Result<Self, String> {
        let (status, reason) = parse_status_start(message.start_line())?;
        Ok(Self {
            status,
            status_message: reason.to_string(),
            headers: message.header_text(),
            body: message.body.clone(),
            content_descriptor: content_descriptor(
                message.header("content-type"),
                message.header("content-encoding"),
            ),
        })
    }

    /// MIME type without parameters, if known.
    pub fn mime_type(&self) -> Option<&str> {
        self.content_descriptor
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
    }
}

/// A request merged with its correlated response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRecord {
    /// The request half.
    pub request: ParsedRequest,
    /// The response half.
    pub response: ResponsePart,
}

/// Formats a content descriptor from content type and encoding.
pub fn content_descriptor(content_type: Option<&str>, encoding: Option<&str>) -> Option<String> {
    let content_type = content_type.map(str::trim).filter(|ct| !ct.is_empty());
    let encoding = encoding.map(str::trim).filter(|enc| !enc.is_empty());
    match (content_type, encoding) {
        (Some(ct), Some(enc)) => Some(format!("{ct}; encoding={enc}")),
        (Some(ct), None) => Some(ct.to_string()),
        (None, Some(enc)) => Some(format!("; encoding={enc}")),
        (None, None) => None,
    }
}

/// Keeps at most `max` bytes of a body when `collect` is set.
pub fn collect_body(body: Option<Vec<u8>>, collect: bool, max: usize) -> Option<Vec<u8>> {
    if !collect {
        return None;
    }
    body.map(|mut bytes| {
        bytes.truncate(max);
        bytes
    })
}

// =============================================================================
// URL Helpers
// =============================================================================

fn request_url(scheme: &str, target: &str, host_header: Option<&str>) -> Result<String, String> {
    if has_scheme(target) {
        return Ok(target.to_string());
    }

    let host = host_header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| "request has no Host header".to_string())?;

    if target == "*" {
        return Ok(format!("{scheme}://{host}"));
    }
    if !target.starts_with('/') {
        return Err(format!("unsupported request target {target:?}"));
    }
    Ok(format!("{scheme}://{host}{target}"))
}

fn has_scheme(value: &str) -> bool {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

struct UrlParts<'a> {
    scheme: &'a str,
    host: &'a str,
    port: Option<&'a str>,
    path: &'a str,
}

fn split_url(url: &str) -> Option<UrlParts<'_>> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.') {
        return None;
    }

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);

    let (host, port) = if host_port.starts_with('[') {
        // IPv6 literal
        match host_port.find(']') {
            Some(end) => {
                let port = host_port[end + 1..].strip_prefix(':');
                (&host_port[..=end], port)
            }
            None => (host_port, None),
        }
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => (host, Some(port)),
            _ => (host_port, None),
        }
    };

    Some(UrlParts {
        scheme,
        host,
        port: port.filter(|p| !p.is_empty()),
        path,
    })
}

fn default_port(scheme: &str) -> Option<&'static str> {
    match scheme {
        "http" => Some("80"),
        "https" => Some("443"),
        _ => None,
    }
}

/// Canonical value used for rule matching and de-duplication.
///
/// Scheme and host are lower-cased, a default port is dropped, the path is
/// percent-decoded, and query and fragment are removed. An empty path
/// becomes `/`. Values that are not absolute URLs only lose their query.
pub fn canonical_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();

    let Some(parts) = split_url(without_query) else {
        return percent_decode(without_query);
    };

    let scheme = parts.scheme.to_ascii_lowercase();
    let host = parts.host.to_ascii_lowercase();
    let path = if parts.path.is_empty() {
        "/".to_string()
    } else {
        percent_decode(parts.path)
    };

    match parts.port {
        Some(port) if default_port(&scheme) != Some(port) => {
            format!("{scheme}://{host}:{port}{path}")
        }
        _ => format!("{scheme}://{host}{path}"),
    }
}

/// Lower-cased host component of `value`, or the whole value lower-cased
/// when it is not an absolute URL.
pub fn host_of(value: &str) -> String {
    match split_url(value) {
        Some(parts) if !parts.host.is_empty() => parts.host.to_ascii_lowercase(),
        _ => value.to_ascii_lowercase(),
    }
}

/// Decodes `%XX` escapes and `+`.
///
/// Returns the input unchanged when an escape is malformed or the decoded
/// bytes are not valid UTF-8.
pub fn percent_decode(s: &str) -> String {
    if !s.contains(['%', '+']) {
        return s.to_string();
    }

    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let byte = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match byte {
                    Some(byte) => decoded.push(byte),
                    None => return s.to_string(),
                }
                i += 3;
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(decoded).unwrap_or_else(|_| s.to_string())
}

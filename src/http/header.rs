//! Request and response headers

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProtocolError;

/// A single header field.
///
/// `raw` holds the line exactly as it was parsed so that an unmodified
/// field is written back byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    #[serde(skip)]
    raw: Option<String>,
}

impl HeaderField {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            raw: None,
        }
    }

    /// Parse a `name: value` line (without line terminator)
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold
            return Err(ProtocolError::MalformedHeader(line.to_string()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(ProtocolError::MalformedHeader(line.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            value: value.trim_matches(|c| c == ' ' || c == '\t').to_string(),
            raw: Some(line.to_string()),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match &self.raw {
            Some(raw) => out.extend_from_slice(raw.as_bytes()),
            None => {
                out.extend_from_slice(self.name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(self.value.as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
    }
}

pub(crate) fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Ordered multimap of header fields with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    fields: Vec<HeaderField>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for a header name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    /// All values for a header name, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether a comma-separated header contains a token (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn append(&mut self, name: &str, value: &str) {
        self.fields.push(HeaderField::new(name, value));
    }

    pub(crate) fn push_field(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    /// Replace every value of `name` with a single value, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                let existing_name = self.fields[pos].name.clone();
                self.fields[pos] = HeaderField::new(&existing_name, value);
                let mut idx = 0;
                self.fields.retain(|f| {
                    let keep = idx <= pos || !f.name.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    /// Remove every value of `name`, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|f| (f.name.as_str(), f.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for field in &self.fields {
            field.write_to(out);
        }
    }

    /// Parsed `Content-Length`, rejecting conflicting duplicates
    pub fn content_length(&self) -> Result<Option<usize>, ProtocolError> {
        let mut found: Option<usize> = None;
        for value in self.get_all("content-length") {
            for part in value.split(',') {
                let part = part.trim();
                let parsed: usize = part
                    .parse()
                    .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()))?;
                match found {
                    Some(existing) if existing != parsed => {
                        return Err(ProtocolError::InvalidContentLength(value.to_string()));
                    }
                    _ => found = Some(parsed),
                }
            }
        }
        Ok(found)
    }

    /// Whether the final transfer coding is chunked.
    /// Returns `None` when no Transfer-Encoding header is present.
    pub fn chunked_transfer(&self) -> Option<bool> {
        let last = self
            .get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .last()?;
        Some(last.eq_ignore_ascii_case("chunked"))
    }
}

/// URL scheme of a request target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Resolved absolute target of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl Target {
    /// `scheme://host:port`, the site key used by the history tree
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }
}

/// Where a request arrived from, used to resolve origin-form targets
#[derive(Debug, Clone)]
pub struct TargetContext {
    pub scheme: Scheme,
    /// Host and port of the CONNECT tunnel the request arrived in
    pub tunnel: Option<(String, u16)>,
}

impl TargetContext {
    pub fn plain() -> Self {
        Self {
            scheme: Scheme::Http,
            tunnel: None,
        }
    }

    pub fn tunnel(host: &str, port: u16) -> Self {
        Self {
            scheme: Scheme::Https,
            tunnel: Some((host.to_string(), port)),
        }
    }
}

/// HTTP request header: request line plus fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub method: String,
    /// Request target exactly as written on the request line
    pub target: String,
    pub version: String,
    pub headers: HeaderMap,
    /// Resolved absolute URI
    pub uri: Url,
}

impl RequestHeader {
    /// Build a request for an absolute URL, e.g. for scan traffic
    pub fn new(method: &str, url: &str) -> Result<Self, ProtocolError> {
        let uri = Url::parse(url).map_err(|_| ProtocolError::InvalidTarget(url.to_string()))?;
        let mut headers = HeaderMap::new();
        if let Some(host) = uri.host_str() {
            let host_value = match uri.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            headers.append("Host", &host_value);
        }
        Ok(Self {
            method: method.to_uppercase(),
            target: origin_form(&uri),
            version: "HTTP/1.1".to_string(),
            headers,
            uri,
        })
    }

    /// Parse a request line and resolve its target
    pub(crate) fn parse_start_line(
        line: &str,
        headers: HeaderMap,
        ctx: &TargetContext,
    ) -> Result<Self, ProtocolError> {
        let mut parts = line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => return Err(ProtocolError::MalformedStartLine(line.to_string())),
        };
        if method.is_empty()
            || !method.bytes().all(is_token_char)
            || target.is_empty()
            || !is_http_version(version)
        {
            return Err(ProtocolError::MalformedStartLine(line.to_string()));
        }

        let uri = resolve_target(method, target, &headers, ctx)?;
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
            uri,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Resolved target components
    pub fn resolved(&self) -> Target {
        let scheme = if self.uri.scheme() == "https" {
            Scheme::Https
        } else {
            Scheme::Http
        };
        Target {
            scheme,
            host: self.uri.host_str().unwrap_or_default().to_string(),
            port: self.uri.port().unwrap_or_else(|| scheme.default_port()),
            path: self.uri.path().to_string(),
            query: self.uri.query().map(|q| q.to_string()),
        }
    }

    /// Replace the URI and keep the request line in the form it had
    pub fn set_uri(&mut self, uri: Url) {
        if self.target.starts_with('/') || self.target == "*" {
            self.target = origin_form(&uri);
        } else {
            self.target = uri.to_string();
        }
        self.uri = uri;
    }

    /// Whether the client asked to keep the connection open
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("connection", "keep-alive");
        }
        true
    }

    pub fn is_upgrade(&self) -> bool {
        self.headers.has_token("connection", "upgrade") && self.headers.contains("upgrade")
    }

    /// Copy suitable for sending to the origin: origin-form target,
    /// proxy-only fields stripped and a Host field present.
    pub fn for_upstream(&self) -> RequestHeader {
        let mut header = self.clone();
        if !header.target.starts_with('/') && header.target != "*" {
            header.target = origin_form(&header.uri);
        }
        header.headers.remove("proxy-connection");
        header.headers.remove("proxy-authorization");
        // The body is already buffered and goes out with the head
        if header.headers.has_token("expect", "100-continue") {
            header.headers.remove("expect");
        }
        if !header.headers.contains("host") {
            let target = header.resolved();
            let host = if target.port == target.scheme.default_port() {
                target.host
            } else {
                target.authority()
            };
            header.headers.append("Host", &host);
        }
        header
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// HTTP response header: status line plus fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub version: String,
    pub status: u16,
    /// `None` when the status line had no reason phrase separator
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHeader {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: Some(reason.to_string()),
            headers: HeaderMap::new(),
        }
    }

    pub(crate) fn parse_start_line(line: &str, headers: HeaderMap) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedStartLine(line.to_string());
        let (version, rest) = line.split_once(' ').ok_or_else(malformed)?;
        if !is_http_version(version) {
            return Err(malformed());
        }
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, Some(reason.to_string())),
            None => (rest, None),
        };
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let status: u16 = code.parse().map_err(|_| malformed())?;
        Ok(Self {
            version: version.to_string(),
            status,
            reason,
            headers,
        })
    }

    /// 1xx other than 101; a final response follows on the same stream
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Whether this response can never carry a body
    pub fn is_bodiless(&self, request_method: &str) -> bool {
        request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
            || (request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&self.status))
    }

    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("connection", "keep-alive");
        }
        true
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(format!("{:03}", self.status).as_bytes());
        if let Some(reason) = &self.reason {
            out.push(b' ');
            out.extend_from_slice(reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

fn is_http_version(v: &str) -> bool {
    v.len() == 8
        && v.starts_with("HTTP/")
        && v.as_bytes()[5].is_ascii_digit()
        && v.as_bytes()[6] == b'.'
        && v.as_bytes()[7].is_ascii_digit()
}

fn origin_form(uri: &Url) -> String {
    match uri.query() {
        Some(q) => format!("{}?{}", uri.path(), q),
        None => uri.path().to_string(),
    }
}

fn resolve_target(
    method: &str,
    target: &str,
    headers: &HeaderMap,
    ctx: &TargetContext,
) -> Result<Url, ProtocolError> {
    let invalid = || ProtocolError::InvalidTarget(target.to_string());

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(target, 443).ok_or_else(invalid)?;
        return Url::parse(&format!("https://{}/", format_authority(&host, port))).map_err(|_| invalid());
    }

    if target.starts_with("http://") || target.starts_with("https://") {
        return Url::parse(target).map_err(|_| invalid());
    }

    if !target.starts_with('/') && target != "*" {
        return Err(invalid());
    }

    let authority = match &ctx.tunnel {
        Some((host, port)) => format_authority(host, *port),
        None => headers.get("host").ok_or_else(invalid)?.to_string(),
    };
    let path = if target == "*" { "/" } else { target };
    Url::parse(&format!("{}://{}{}", ctx.scheme.as_str(), authority, path)).map_err(|_| invalid())
}

/// `host:port`, bracketing IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host:port` (IPv6 literals in brackets) into parts
pub fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive_and_keeps_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        headers.append("Content-Type", "text/html");

        assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(headers.get_all("set-cookie").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_set_replaces_all_and_keeps_position() {
        let mut headers = HeaderMap::new();
        headers.append("A", "1");
        headers.append("X", "old");
        headers.append("B", "2");
        headers.append("x", "older");
        headers.set("X", "new");

        let fields: Vec<_> = headers.iter().collect();
        assert_eq!(fields, vec![("A", "1"), ("X", "new"), ("B", "2")]);
    }

    #[test]
    fn test_conflicting_content_length_rejected() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Length", "5");
        headers.append("Content-Length", "6");
        assert!(headers.content_length().is_err());

        let mut same = HeaderMap::new();
        same.append("Content-Length", "5, 5");
        assert_eq!(same.content_length().unwrap(), Some(5));
    }

    #[test]
    fn test_resolve_origin_form_in_tunnel() {
        let header = RequestHeader::parse_start_line(
            "GET /a?b=1 HTTP/1.1",
            HeaderMap::new(),
            &TargetContext::tunnel("example.com", 443),
        )
        .unwrap();
        let target = header.resolved();
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/a");
        assert_eq!(target.query.as_deref(), Some("b=1"));
    }

    #[test]
    fn test_for_upstream_rewrites_absolute_form() {
        let mut headers = HeaderMap::new();
        headers.append("Proxy-Connection", "keep-alive");
        headers.append("Expect", "100-continue");
        let header = RequestHeader::parse_start_line(
            "GET http://example.com:8080/x?y=2 HTTP/1.1",
            headers,
            &TargetContext::plain(),
        )
        .unwrap();
        let upstream = header.for_upstream();
        assert_eq!(upstream.target, "/x?y=2");
        assert!(!upstream.headers.contains("proxy-connection"));
        assert!(!upstream.headers.contains("expect"));
        assert_eq!(upstream.headers.get("host"), Some("example.com:8080"));
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("example.com:443", 80), Some(("example.com".into(), 443)));
        assert_eq!(split_authority("example.com", 443), Some(("example.com".into(), 443)));
        assert_eq!(split_authority("[::1]:8443", 443), Some(("::1".into(), 8443)));
        assert_eq!(split_authority(":443", 443), None);
    }
}

//! Places in a request an attack value can be substituted into

use serde::Serialize;
use url::form_urlencoded;

use crate::http::{HttpMessage, Initiator};

/// Request headers attacked when present
const ATTACKABLE_HEADERS: &[&str] = &["User-Agent", "Referer", "X-Forwarded-For"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionLocation {
    Query,
    FormBody,
    Cookie,
    Header,
}

impl InjectionLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionLocation::Query => "query",
            InjectionLocation::FormBody => "body",
            InjectionLocation::Cookie => "cookie",
            InjectionLocation::Header => "header",
        }
    }
}

/// One named parameter of a request and the value it had
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InjectionPoint {
    pub location: InjectionLocation,
    pub name: String,
    pub original: String,
    /// Position among parameters with the same location, so repeated
    /// names are attacked separately
    pub index: usize,
}

impl InjectionPoint {
    /// Fresh active-scan copy of `base` with this point set to `value`
    pub fn apply(&self, base: &HttpMessage, value: &str) -> HttpMessage {
        let mut message = base.fresh_copy(Initiator::ActiveScan);
        match self.location {
            InjectionLocation::Query => {
                let mut uri = message.request_header.uri.clone();
                let pairs = replace_pair(uri.query().unwrap_or_default(), self.index, value);
                uri.set_query(Some(&pairs));
                message.request_header.set_uri(uri);
            }
            InjectionLocation::FormBody => {
                let body = message.request_body.text();
                let pairs = replace_pair(&body, self.index, value);
                message.set_request_body(pairs);
            }
            InjectionLocation::Cookie => {
                if let Some(cookie) = message.request_header.headers.get("cookie") {
                    let rewritten = replace_cookie(cookie, self.index, value);
                    message.request_header.headers.set("Cookie", &rewritten);
                }
            }
            InjectionLocation::Header => {
                message.request_header.headers.set(&self.name, value);
            }
        }
        message
    }
}

/// Every injection point of a recorded request, in request order
pub fn injection_points(message: &HttpMessage) -> Vec<InjectionPoint> {
    let mut points = Vec::new();

    if let Some(query) = message.request_header.uri.query() {
        points.extend(pairs_of(query, InjectionLocation::Query));
    }

    if is_form(message) {
        points.extend(pairs_of(&message.request_body.text(), InjectionLocation::FormBody));
    }

    if let Some(cookie) = message.request_header.headers.get("cookie") {
        for (index, (name, value)) in cookie_pairs(cookie).enumerate() {
            points.push(InjectionPoint {
                location: InjectionLocation::Cookie,
                name: name.to_string(),
                original: value.to_string(),
                index,
            });
        }
    }

    for (index, header) in ATTACKABLE_HEADERS.iter().enumerate() {
        if let Some(value) = message.request_header.headers.get(header) {
            points.push(InjectionPoint {
                location: InjectionLocation::Header,
                name: header.to_string(),
                original: value.to_string(),
                index,
            });
        }
    }

    points
}

fn is_form(message: &HttpMessage) -> bool {
    !message.request_body.is_empty()
        && message
            .request_header
            .headers
            .get("content-type")
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false)
}

fn pairs_of(encoded: &str, location: InjectionLocation) -> Vec<InjectionPoint> {
    form_urlencoded::parse(encoded.as_bytes())
        .enumerate()
        .map(|(index, (name, value))| InjectionPoint {
            location,
            name: name.into_owned(),
            original: value.into_owned(),
            index,
        })
        .collect()
}

fn replace_pair(encoded: &str, index: usize, value: &str) -> String {
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (i, (name, original)) in form_urlencoded::parse(encoded.as_bytes()).enumerate() {
        if i == index {
            out.append_pair(&name, value);
        } else {
            out.append_pair(&name, &original);
        }
    }
    out.finish()
}

fn cookie_pairs(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

fn replace_cookie(header: &str, index: usize, value: &str) -> String {
    cookie_pairs(header)
        .enumerate()
        .map(|(i, (name, original))| {
            let v = if i == index { value } else { original };
            format!("{}={}", name, v)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, RequestHeader};

    fn message(method: &str, url: &str) -> HttpMessage {
        HttpMessage::new(RequestHeader::new(method, url).unwrap(), Body::empty(), Initiator::Proxy)
    }

    #[test]
    fn test_query_points_rewrite_only_their_parameter() {
        let base = message("GET", "http://example.com/search?q=shoes&page=2");
        let points = injection_points(&base);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, "q");
        assert_eq!(points[0].original, "shoes");

        let attacked = points[0].apply(&base, "<x>");
        assert_eq!(attacked.url(), "http://example.com/search?q=%3Cx%3E&page=2");
        assert_eq!(attacked.initiator, Initiator::ActiveScan);
        assert_eq!(attacked.request_header.target, "/search?q=%3Cx%3E&page=2");
        // Base is untouched
        assert_eq!(base.url(), "http://example.com/search?q=shoes&page=2");
    }

    #[test]
    fn test_form_body_rewrite_updates_length() {
        let mut base = message("POST", "http://example.com/login");
        base.request_header
            .headers
            .append("Content-Type", "application/x-www-form-urlencoded");
        base.set_request_body("user=bob&pass=secret");

        let points = injection_points(&base);
        let pass = points.iter().find(|p| p.name == "pass").unwrap();
        assert_eq!(pass.location, InjectionLocation::FormBody);

        let attacked = pass.apply(&base, "' OR 1=1");
        assert_eq!(attacked.request_body.text(), "user=bob&pass=%27+OR+1%3D1");
        assert_eq!(
            attacked.request_header.headers.get("content-length"),
            Some(attacked.request_body.len().to_string().as_str())
        );
    }

    #[test]
    fn test_cookie_and_header_points() {
        let mut base = message("GET", "http://example.com/");
        base.request_header.headers.append("Cookie", "session=abc; theme=dark");
        base.request_header.headers.append("User-Agent", "curl/8");

        let points = injection_points(&base);
        let locations: Vec<_> = points.iter().map(|p| (p.location, p.name.as_str())).collect();
        assert_eq!(
            locations,
            vec![
                (InjectionLocation::Cookie, "session"),
                (InjectionLocation::Cookie, "theme"),
                (InjectionLocation::Header, "User-Agent"),
            ]
        );

        let attacked = points[1].apply(&base, "light");
        assert_eq!(attacked.request_header.headers.get("cookie"), Some("session=abc; theme=light"));

        let attacked = points[2].apply(&base, "probe");
        assert_eq!(attacked.request_header.headers.get("user-agent"), Some("probe"));
    }

    #[test]
    fn test_repeated_names_are_separate_points() {
        let base = message("GET", "http://example.com/?id=1&id=2");
        let points = injection_points(&base);
        assert_eq!(points.len(), 2);

        let attacked = points[1].apply(&base, "9");
        assert_eq!(attacked.url(), "http://example.com/?id=1&id=9");
    }
}

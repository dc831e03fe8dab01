//! Security headers analysis

use crate::error::ScanRuleError;
use crate::http::HttpMessage;
use crate::scanner::alerts::{Alert, Confidence, Risk};
use crate::scanner::passive::PassiveScanRule;

pub const SECURITY_HEADERS_RULE_ID: u32 = 10020;

/// Rule for checking security headers
pub struct SecurityHeadersRule {
    enabled: bool,
}

impl SecurityHeadersRule {
    pub fn new() -> Self {
        Self { enabled: true }
    }
}

impl PassiveScanRule for SecurityHeadersRule {
    fn id(&self) -> u32 {
        SECURITY_HEADERS_RULE_ID
    }

    fn name(&self) -> &str {
        "Security Headers"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn scan(&self, message: &HttpMessage) -> Result<Vec<Alert>, ScanRuleError> {
        let Some(response) = &message.response_header else {
            return Ok(Vec::new());
        };
        // Only documents the browser renders are interesting
        let is_html = response
            .headers
            .get("content-type")
            .map_or(false, |ct| ct.to_ascii_lowercase().contains("text/html"));
        if !is_html {
            return Ok(Vec::new());
        }

        let mut alerts = Vec::new();
        let https = message.request_header.uri.scheme() == "https";

        let security_headers = [
            ("X-Content-Type-Options", "Missing X-Content-Type-Options Header",
             "The X-Content-Type-Options header is not set. This could allow MIME type sniffing attacks.",
             Risk::Low, 693),
            ("X-Frame-Options", "Missing Anti-clickjacking Header",
             "Neither X-Frame-Options nor a CSP frame-ancestors directive is set. This could allow clickjacking attacks.",
             Risk::Medium, 1021),
            ("Content-Security-Policy", "Missing Content-Security-Policy Header",
             "The Content-Security-Policy header is not set. This could allow XSS and data injection attacks.",
             Risk::Medium, 693),
            ("Strict-Transport-Security", "Missing Strict-Transport-Security Header",
             "The HSTS header is not set. This could allow protocol downgrade attacks.",
             Risk::Low, 319),
        ];

        let csp = response.headers.get("content-security-policy");
        for (header, name, description, risk, cwe) in security_headers {
            if response.headers.contains(header) {
                continue;
            }
            if header == "Strict-Transport-Security" && !https {
                continue;
            }
            if header == "X-Frame-Options" && csp.map_or(false, |c| c.contains("frame-ancestors")) {
                continue;
            }
            alerts.push(
                Alert::new(self.id(), name, risk, Confidence::Medium)
                    .for_message(message)
                    .with_param(header)
                    .with_description(description)
                    .with_solution(&format!("Add the {} header to responses.", header))
                    .with_cwe(cwe)
                    .with_wasc(15),
            );
        }

        // Check for insecure CSP
        if let Some(csp) = csp {
            for keyword in ["unsafe-inline", "unsafe-eval"] {
                if csp.contains(keyword) {
                    alerts.push(
                        Alert::new(self.id(), &format!("CSP Contains {}", keyword), Risk::Medium, Confidence::High)
                            .for_message(message)
                            .with_param(&format!("Content-Security-Policy:{}", keyword))
                            .with_description("The Content-Security-Policy weakens XSS protection.")
                            .with_evidence(csp)
                            .with_solution("Use nonces or hashes instead of unsafe CSP keywords.")
                            .with_cwe(79),
                    );
                }
            }
        }

        Ok(alerts)
    }
}

impl Default for SecurityHeadersRule {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{synthetic_response, Body, Initiator, RequestHeader};

    fn html_message(url: &str, headers: &[(&str, &str)]) -> HttpMessage {
        let mut msg = HttpMessage::new(RequestHeader::new("GET", url).unwrap(), Body::empty(), Initiator::Proxy);
        let (mut resp, body) = synthetic_response(200, "OK", "<html></html>");
        resp.headers.set("Content-Type", "text/html; charset=utf-8");
        for (name, value) in headers {
            resp.headers.append(name, value);
        }
        msg.set_response(resp, body);
        msg
    }

    #[test]
    fn test_missing_headers_reported_per_header() {
        let msg = html_message("http://example.com/", &[("X-Frame-Options", "DENY")]);
        let alerts = SecurityHeadersRule::new().scan(&msg).unwrap();
        let params: Vec<&str> = alerts.iter().map(|a| a.param.as_str()).collect();
        assert_eq!(params, vec!["X-Content-Type-Options", "Content-Security-Policy"]);
        assert!(alerts.iter().all(|a| a.uri == "http://example.com/"));
    }

    #[test]
    fn test_unsafe_csp_and_hsts_on_https() {
        let msg = html_message(
            "https://example.com/",
            &[
                ("X-Content-Type-Options", "nosniff"),
                ("Content-Security-Policy", "default-src 'self' 'unsafe-inline'; frame-ancestors 'none'"),
            ],
        );
        let alerts = SecurityHeadersRule::new().scan(&msg).unwrap();
        let names: Vec<&str> = alerts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Missing Strict-Transport-Security Header", "CSP Contains unsafe-inline"]);
    }
}
